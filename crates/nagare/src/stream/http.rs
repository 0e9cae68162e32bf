use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{read_timeout, Stream, StreamMetadata, StreamReader};
use crate::{
    buffer::Buffer,
    error::{NagareError, NagareResult},
    http::{check_content_length, RequestOverlay},
    session::Session,
};

const DEFAULT_BUFFER_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Progressive download of a single HTTP resource.
pub struct HttpStream {
    session: Session,
    url: String,
    overlay: RequestOverlay,
    metadata: StreamMetadata,
}

impl HttpStream {
    pub fn new(session: &Session, url: impl Into<String>) -> Self {
        Self {
            session: session.clone(),
            url: url.into(),
            overlay: RequestOverlay::default(),
            metadata: StreamMetadata::default(),
        }
    }

    pub fn with_overlay(mut self, overlay: RequestOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn with_metadata(mut self, metadata: StreamMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
impl Stream for HttpStream {
    fn shortname(&self) -> &'static str {
        "http"
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    async fn open(&self) -> NagareResult<StreamReader> {
        let options = self.session.options();
        let buffer_size = options
            .get("ringbuffer-size")
            .as_u64()
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        let close_timeout = options
            .get("hls-close-timeout")
            .as_duration()
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT);

        let cancel = CancellationToken::new();
        let response = self
            .session
            .http()
            .get(self.url.as_str())
            .overlay(self.overlay.clone())
            .exception(NagareError::stream)
            .cancel(cancel.clone())
            .send_streamed()
            .await?;

        let buffer = Arc::new(Buffer::new(usize::try_from(buffer_size).unwrap_or(usize::MAX)));
        let worker = {
            let buffer = buffer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let url = response.url().clone();
                let expected = response.content_length();
                let mut received = 0u64;
                let mut chunks = Box::pin(response.bytes_stream());

                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => break,
                        chunk = chunks.next() => chunk,
                    };
                    match chunk {
                        Some(Ok(data)) => {
                            received += data.len() as u64;
                            if buffer.write(data).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::error!("Failed to read {url}: {e}");
                            buffer.abort(NagareError::transport(e));
                            return;
                        }
                        None => {
                            if let Err(e) = check_content_length(&url, expected, received) {
                                buffer.abort(e);
                                return;
                            }
                            break;
                        }
                    }
                }
                buffer.close();
            })
        };

        Ok(StreamReader::new(
            buffer,
            cancel,
            vec![worker],
            close_timeout,
            read_timeout(&options),
        ))
    }
}
