mod http;
mod reader;

pub use http::HttpStream;
pub use reader::{BlockingReader, StreamReader};
pub(crate) use reader::read_timeout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NagareResult;

/// Descriptive fields a plugin fills in before the stream is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub id: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub title: Option<String>,
}

/// A playable stream. Opening an HLS stream starts this pipeline:
///
/// ┌───────────────────────┐                ┌────────────────────┐
/// │                       │    Segment 1   │                    │
/// │                       ├────────────────►                    ├───┐
/// │                       │                │                    │   │fetch
/// │                       │    Segment 2   │                    ◄───┘
/// │   Playlist Reload#1   ├────────────────►     Dispatcher     │
/// │                       │                │                    ├───┐
/// │                       │    Segment 3   │   [Semaphore(N)]   │   │fetch
/// │                       ├────────────────►                    ◄───┘
/// │                       │                │                    │
/// └───────────────────────┘                └─────────┬──────────┘
///                                                    │ slots (in order)
/// ┌───────────────────────┐                ┌─────────▼──────────┐
/// │                       │       ...      │                    │
/// │   Playlist Reload#N   ├───────────────►│       Writer       ├──► Buffer ──► Reader
/// │                       │                │                    │
/// └───────────────────────┘                └────────────────────┘
#[async_trait]
pub trait Stream: Send + Sync {
    /// Short type name such as `hls` or `http`.
    fn shortname(&self) -> &'static str;

    fn url(&self) -> String;

    fn metadata(&self) -> &StreamMetadata;

    /// Starts the background tasks and returns the reading end.
    async fn open(&self) -> NagareResult<StreamReader>;
}
