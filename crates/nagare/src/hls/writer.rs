use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    m3u8::Map,
    reloader::{ReloaderState, SharedFailure, StateHandle},
    worker::{Slot, SlotOutcome},
};
use crate::buffer::Buffer;

/// Awaits output slots in queue order and writes their payloads into the
/// buffer.
pub struct SegmentWriter {
    buffer: Arc<Buffer>,
    state: StateHandle,
    failure: SharedFailure,
    cancel: CancellationToken,
}

impl SegmentWriter {
    pub fn new(
        buffer: Arc<Buffer>,
        state: StateHandle,
        failure: SharedFailure,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            state,
            failure,
            cancel,
        }
    }

    pub async fn run(self, mut slots: mpsc::Receiver<Slot>) {
        let mut current_map: Option<Map> = None;
        let mut written = 0usize;

        loop {
            let slot = tokio::select! {
                _ = self.cancel.cancelled() => break,
                slot = slots.recv() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = slot => match result {
                    Ok(result) => result,
                    // worker went away without reporting
                    Err(_) => continue,
                },
            };

            match result.outcome {
                SlotOutcome::Payload(data) => {
                    if let Some((map, map_data)) = result.map {
                        if current_map.as_ref() != Some(&map) {
                            log::debug!("Writing initialization section {}", map.uri);
                            if self.buffer.write(map_data).await.is_err() {
                                break;
                            }
                            current_map = Some(map);
                        }
                    }

                    written += data.len();
                    if self.buffer.write(data).await.is_err() {
                        break;
                    }
                    log::debug!("Segment {} complete", result.num);
                }
                SlotOutcome::Skipped => log::debug!("Segment {} skipped", result.num),
                SlotOutcome::Failed(e) => {
                    log::error!("Failed to fetch segment {}: {e}", result.num);
                }
            }
        }

        let failure = self.failure.lock().take();
        match failure {
            Some(error) if !self.cancel.is_cancelled() => self.buffer.abort(error),
            _ => self.buffer.close(),
        }
        log::debug!("Writer finished after {written} bytes");
        self.state.advance(ReloaderState::Terminal);
    }
}
