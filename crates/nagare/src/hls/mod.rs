pub mod filter;
pub mod key;
pub mod m3u8;
pub mod options;
pub mod reloader;
mod stream;
pub mod variant;
pub mod worker;
pub mod writer;

pub use filter::{IgnoreNamesFilter, SegmentFilter, UriContainsFilter};
pub use m3u8::{parse_playlist, MediaPlaylist, MultivariantPlaylist, Playlist, Segment};
pub use options::{HlsOptions, ReloadTime};
pub use reloader::{ReloaderState, StateHandle};
pub use stream::HlsStream;
