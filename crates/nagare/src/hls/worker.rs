use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use reqwest::header::RANGE;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use url::Url;

use super::{
    filter::SegmentFilter,
    key::{decrypt_aes128, key_iv, KeyCache},
    m3u8::{KeyMethod, Map, Segment},
};
use crate::{
    error::{NagareError, NagareResult},
    http::HttpSession,
    util::ByteRange,
};

pub enum SlotOutcome {
    Payload(Bytes),
    /// Dropped by a segment filter.
    Skipped,
    /// Every attempt failed.
    Failed(NagareError),
}

/// What a worker hands back for one segment.
pub struct SlotResult {
    pub num: u64,
    /// Initialization section of the segment, with its bytes.
    pub map: Option<(Map, Bytes)>,
    pub outcome: SlotOutcome,
}

/// Receiving end of an output slot. Slots are queued in playlist order, so
/// awaiting them one by one restores that order.
pub type Slot = oneshot::Receiver<SlotResult>;

/// Downloads and decrypts single segments.
pub struct SegmentFetcher {
    http: HttpSession,
    keys: KeyCache,
    maps: Mutex<HashMap<Map, Bytes>>,
    attempts: u32,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SegmentFetcher {
    pub fn new(
        http: HttpSession,
        key_uri: Option<String>,
        attempts: u32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            keys: KeyCache::new(http.clone(), key_uri),
            http,
            maps: Mutex::new(HashMap::new()),
            attempts: attempts.max(1),
            timeout,
            cancel,
        }
    }

    async fn get(&self, uri: &Url, byte_range: Option<ByteRange>) -> NagareResult<Bytes> {
        let mut request = self
            .http
            .get(uri.as_str())
            .exception(NagareError::stream)
            .retries(self.attempts - 1)
            .timeout(self.timeout)
            .cancel(self.cancel.clone());
        if let Some(range) = byte_range {
            if range.is_empty() {
                return Ok(Bytes::new());
            }
            let range = range.to_http_range().ok_or_else(|| {
                NagareError::Protocol(format!("byte range of {uri} overflows"))
            })?;
            request = request.header(RANGE, &range);
        }
        Ok(request.send().await?.into_bytes())
    }

    /// Fetches an initialization section, once per (URI, range).
    pub async fn fetch_map(&self, map: &Map) -> NagareResult<Bytes> {
        let mut maps = self.maps.lock().await;
        if let Some(data) = maps.get(map) {
            return Ok(data.clone());
        }

        log::debug!("Fetching initialization section {}", map.uri);
        let data = self.get(&map.uri, map.byte_range).await?;
        maps.insert(map.clone(), data.clone());
        Ok(data)
    }

    pub async fn fetch(&self, segment: &Segment) -> NagareResult<Bytes> {
        let data = self.get(&segment.uri, segment.byte_range).await?;
        match &segment.key {
            Some(key) if key.method == KeyMethod::Aes128 => {
                let key_bytes = self.keys.get(key, self.attempts - 1, &self.cancel).await?;
                decrypt_aes128(&key_bytes, &key_iv(key, segment.num), data)
            }
            Some(key) => Err(NagareError::UnsupportedCipher(key.method.to_string())),
            None => Ok(data),
        }
    }

    async fn fetch_slot(&self, segment: Segment) -> SlotResult {
        let map = match &segment.map {
            Some(map) => match self.fetch_map(map).await {
                Ok(data) => Some((map.clone(), data)),
                Err(e) => {
                    return SlotResult {
                        num: segment.num,
                        map: None,
                        outcome: SlotOutcome::Failed(e),
                    }
                }
            },
            None => None,
        };

        let outcome = match self.fetch(&segment).await {
            Ok(data) => SlotOutcome::Payload(data),
            Err(e) => SlotOutcome::Failed(e),
        };
        SlotResult {
            num: segment.num,
            map,
            outcome,
        }
    }
}

/// Hands queued segments to a bounded number of fetch tasks.
pub struct Dispatcher {
    fetcher: Arc<SegmentFetcher>,
    filters: Vec<Arc<dyn SegmentFilter>>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        fetcher: Arc<SegmentFetcher>,
        filters: Vec<Arc<dyn SegmentFilter>>,
        threads: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            filters,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    fn is_filtered(&self, segment: &Segment) -> bool {
        self.filters.iter().any(|f| f.should_filter(segment))
    }

    pub async fn run(self, mut segments: mpsc::Receiver<Segment>, slots: mpsc::Sender<Slot>) {
        log::info!(
            "Start downloading with {} thread(s).",
            self.permits.available_permits()
        );

        loop {
            let segment = tokio::select! {
                _ = self.cancel.cancelled() => break,
                segment = segments.recv() => match segment {
                    Some(segment) => segment,
                    None => break,
                },
            };

            // The slot is queued before the fetch starts, which fixes its
            // position in the output.
            let (sender, receiver) = oneshot::channel();
            let queued = tokio::select! {
                _ = self.cancel.cancelled() => break,
                queued = slots.send(receiver) => queued,
            };
            if queued.is_err() {
                break;
            }

            if self.is_filtered(&segment) {
                log::debug!("Skipping filtered segment {} ({})", segment.num, segment.uri);
                _ = sender.send(SlotResult {
                    num: segment.num,
                    map: None,
                    outcome: SlotOutcome::Skipped,
                });
                continue;
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fetcher = self.fetcher.clone();
            self.tracker.spawn(async move {
                log::debug!("Fetching segment {} ({})", segment.num, segment.uri);
                let result = fetcher.fetch_slot(segment).await;
                drop(permit);
                _ = sender.send(result);
            });
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}
