use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{NagareError, NagareResult};

#[derive(Default)]
struct BufferState {
    chunks: VecDeque<Bytes>,
    len: usize,
    closed: bool,
    error: Option<NagareError>,
}

/// Byte queue with a capacity in bytes, shared by one writer and one reader.
///
/// Writes block while the queue is full. After [`Buffer::close`] writes are
/// rejected and reads drain the queued bytes before returning an empty chunk
/// (EOF), or the error passed to [`Buffer::abort`].
pub struct Buffer {
    state: Mutex<BufferState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes queued and not yet read.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Queues all of `data`, filling free space as it appears.
    pub async fn write(&self, mut data: Bytes) -> NagareResult<()> {
        while !data.is_empty() {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(NagareError::BufferClosed);
                }

                let free = self.capacity.saturating_sub(state.len);
                if free > 0 {
                    let chunk = data.split_to(free.min(data.len()));
                    state.len += chunk.len();
                    state.chunks.push_back(chunk);
                    drop(state);
                    self.readable.notify_waiters();
                    continue;
                }
            }

            notified.await;
        }
        Ok(())
    }

    /// Returns up to `n` bytes, waiting while the buffer is empty and open.
    ///
    /// An empty result means EOF.
    pub async fn read(&self, n: usize) -> NagareResult<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.len > 0 {
                    let data = take(&mut state, n);
                    drop(state);
                    self.writable.notify_waiters();
                    return Ok(data);
                }
                if state.closed {
                    return match state.error.take() {
                        Some(error) => Err(error),
                        None => Ok(Bytes::new()),
                    };
                }
            }

            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Closes the buffer; the reader gets `error` once the queued bytes are
    /// drained.
    pub fn abort(&self, error: NagareError) {
        {
            let mut state = self.state.lock();
            if !state.closed {
                state.error = Some(error);
            }
            state.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

fn take(state: &mut BufferState, n: usize) -> Bytes {
    let mut parts = Vec::new();
    let mut remaining = n;
    while remaining > 0 {
        let Some(chunk) = state.chunks.front_mut() else {
            break;
        };
        let part = if chunk.len() > remaining {
            chunk.split_to(remaining)
        } else {
            let whole = std::mem::take(chunk);
            state.chunks.pop_front();
            whole
        };
        remaining -= part.len();
        parts.push(part);
    }
    state.len -= n - remaining;

    if parts.len() == 1 {
        parts.swap_remove(0)
    } else {
        Bytes::from(parts.concat())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_read_across_chunks() -> NagareResult<()> {
        let buffer = Buffer::new(1024);
        buffer.write(Bytes::from_static(b"abc")).await?;
        buffer.write(Bytes::from_static(b"defg")).await?;

        assert_eq!(&buffer.read(2).await?[..], b"ab");
        assert_eq!(&buffer.read(4).await?[..], b"cdef");
        assert_eq!(buffer.len(), 1);
        assert_eq!(&buffer.read(10).await?[..], b"g");
        Ok(())
    }

    #[tokio::test]
    async fn test_back_pressure() -> NagareResult<()> {
        let buffer = Arc::new(Buffer::new(4));
        let writer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.write(Bytes::from_static(b"0123456789")).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.len(), 4);
        assert!(!writer.is_finished());

        let mut output = Vec::new();
        while output.len() < 10 {
            output.extend_from_slice(&buffer.read(3).await?);
            assert!(buffer.len() <= 4);
        }
        assert_eq!(output, b"0123456789");
        assert!(writer.await.unwrap().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() -> NagareResult<()> {
        let buffer = Buffer::new(16);
        buffer.write(Bytes::from_static(b"tail")).await?;
        buffer.close();

        assert!(matches!(
            buffer.write(Bytes::from_static(b"x")).await,
            Err(NagareError::BufferClosed)
        ));
        assert_eq!(&buffer.read(16).await?[..], b"tail");
        assert!(buffer.read(16).await?.is_empty());
        assert!(buffer.read(16).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_wakes_reader() {
        let buffer = Arc::new(Buffer::new(16));
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read(8).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let data = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake up")
            .unwrap()
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_abort() -> NagareResult<()> {
        let buffer = Buffer::new(16);
        buffer.write(Bytes::from_static(b"ok")).await?;
        buffer.abort(NagareError::Protocol("gone".to_string()));

        assert_eq!(&buffer.read(16).await?[..], b"ok");
        assert!(matches!(buffer.read(16).await, Err(NagareError::Protocol(_))));
        assert!(buffer.read(16).await?.is_empty());
        Ok(())
    }
}
