use std::{io, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{io::AsyncRead, runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::Buffer,
    error::{NagareError, NagareResult},
    options::Options,
};

const READ_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// `stream-timeout` of the session; zero disables the timeout.
pub(crate) fn read_timeout(options: &Options) -> Option<Duration> {
    match options.get("stream-timeout") {
        value if value.is_absent() => Some(DEFAULT_READ_TIMEOUT),
        value => value.as_duration().filter(|d| !d.is_zero()),
    }
}

/// Reading end of an opened stream.
///
/// Dropping the reader cancels the stream without waiting for its tasks.
pub struct StreamReader {
    buffer: Arc<Buffer>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    close_timeout: Duration,
    read_timeout: Option<Duration>,
}

impl StreamReader {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        cancel: CancellationToken,
        workers: Vec<JoinHandle<()>>,
        close_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            buffer,
            cancel,
            workers,
            close_timeout,
            read_timeout,
        }
    }

    /// Reads up to `n` bytes. An empty chunk means the stream ended.
    pub async fn read(&self, n: usize) -> NagareResult<Bytes> {
        match self.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.buffer.read(n))
                .await
                .map_err(|_| NagareError::ReadTimeout)?,
            None => self.buffer.read(n).await,
        }
    }

    pub async fn read_to_end(&self) -> NagareResult<Vec<u8>> {
        let mut output = Vec::new();
        loop {
            let data = self.read(READ_CHUNK_SIZE).await?;
            if data.is_empty() {
                return Ok(output);
            }
            output.extend_from_slice(&data);
        }
    }

    /// Stops the stream. Tasks still running after the close timeout are
    /// aborted. Later reads drain what is left, then return EOF.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.buffer.close();

        for mut worker in self.workers.drain(..).rev() {
            if tokio::time::timeout(self.close_timeout, &mut worker)
                .await
                .is_err()
            {
                log::warn!("Stream task did not stop within {:?}", self.close_timeout);
                worker.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Adapts the reader to [`AsyncRead`], e.g. for `tokio::io::copy`.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin + 'static {
        let chunks = futures::stream::unfold(self, |reader| async move {
            match reader.read(READ_CHUNK_SIZE).await {
                Ok(data) if data.is_empty() => None,
                Ok(data) => Some((Ok(data), reader)),
                Err(e) => Some((Err(io::Error::other(e)), reader)),
            }
        });
        tokio_util::io::StreamReader::new(Box::pin(chunks))
    }

    /// Adapts the reader to [`std::io::Read`] for use outside the runtime,
    /// such as a thread feeding a child process.
    pub fn into_blocking(self, handle: Handle) -> BlockingReader {
        BlockingReader {
            reader: self,
            handle,
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.buffer.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Blocking adapter returned by [`StreamReader::into_blocking`]. Must not be
/// used from inside the runtime.
pub struct BlockingReader {
    reader: StreamReader,
    handle: Handle,
}

impl io::Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = self
            .handle
            .block_on(self.reader.read(buf.len()))
            .map_err(io::Error::other)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}
