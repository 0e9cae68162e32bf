use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    m3u8::{parse_playlist, MediaPlaylist, Playlist, Segment},
    options::{HlsOptions, ReloadTime},
};
use crate::{
    error::{NagareError, NagareResult},
    http::{backoff_delay, HttpSession, RequestOverlay},
};

const FALLBACK_TARGET_DURATION: f64 = 6.0;
const RELOAD_FAILURE_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReloaderState {
    Initializing,
    Live,
    /// The playlist ended and every segment has been queued.
    Ended,
    /// Every queued segment has been written.
    Terminal,
}

/// Shared view of the reloader state. Transitions only move forward.
#[derive(Clone)]
pub struct StateHandle {
    sender: Arc<watch::Sender<ReloaderState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ReloaderState::Initializing);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn get(&self) -> ReloaderState {
        *self.sender.borrow()
    }

    /// Moves to `next` unless the state is already at or past it.
    pub fn advance(&self, next: ReloaderState) -> bool {
        self.sender.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ReloaderState> {
        self.sender.subscribe()
    }
}

/// Error that ended the reloader, picked up by the writer once the queue is
/// drained.
pub type SharedFailure = Arc<Mutex<Option<NagareError>>>;

/// Polls a media playlist and queues the segments it has not seen yet.
pub struct PlaylistReloader {
    http: HttpSession,
    url: Url,
    overlay: RequestOverlay,
    options: HlsOptions,
    state: StateHandle,
    failure: SharedFailure,
    cancel: CancellationToken,

    last_sequence: Option<u64>,
    pending: VecDeque<Segment>,
    queued_duration: f64,
    dropped: u64,
    playlist_end: bool,
    duration_reached: bool,
    reload_time: Duration,
}

impl PlaylistReloader {
    pub fn new(
        http: HttpSession,
        url: Url,
        options: HlsOptions,
        state: StateHandle,
        failure: SharedFailure,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            url,
            overlay: RequestOverlay::default(),
            options,
            state,
            failure,
            cancel,
            last_sequence: None,
            pending: VecDeque::new(),
            queued_duration: 0.0,
            dropped: 0,
            playlist_end: false,
            duration_reached: false,
            reload_time: Duration::from_secs_f64(FALLBACK_TARGET_DURATION),
        }
    }

    /// Headers and query parameters sent with every playlist request.
    pub fn with_overlay(mut self, overlay: RequestOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    /// Number of pending segments dropped because they left the playlist
    /// window before a worker could take them.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    async fn fetch_playlist(&self, retries: u32) -> NagareResult<MediaPlaylist> {
        let response = self
            .http
            .get(self.url.as_str())
            .overlay(self.overlay.clone())
            .exception(NagareError::stream)
            .retries(retries)
            .cancel(self.cancel.clone())
            .send()
            .await?;

        match parse_playlist(response.bytes(), response.url())? {
            Playlist::Media(playlist) => Ok(playlist),
            Playlist::Multivariant(_) => Err(NagareError::Protocol(
                "multivariant playlists must be resolved before opening a stream".to_string(),
            )),
        }
    }

    pub async fn run(mut self, queue: mpsc::Sender<Segment>) {
        match self.reload(&queue).await {
            Ok(()) => log::info!("Playlist ended"),
            Err(NagareError::Cancelled) => log::debug!("Playlist reloader cancelled"),
            Err(e) => {
                log::error!("Failed to reload playlist: {e}");
                *self.failure.lock() = Some(e);
            }
        }
        if self.dropped > 0 {
            log::warn!("{} segment(s) were dropped in total", self.dropped);
        }
        self.state.advance(ReloaderState::Ended);
        // dropping the queue lets the dispatcher finish
    }

    async fn reload(&mut self, queue: &mpsc::Sender<Segment>) -> NagareResult<()> {
        let mut before_load = Instant::now();
        let playlist = self
            .fetch_playlist(self.options.reload_attempts.saturating_sub(1))
            .await?;
        self.process(playlist);
        self.state.advance(ReloaderState::Live);

        let mut failures = 0;
        loop {
            if self.playlist_end || self.duration_reached {
                return self.flush(queue).await;
            }

            self.feed_until(queue, before_load + self.next_reload(failures)).await?;

            before_load = Instant::now();
            match self.fetch_playlist(0).await {
                Ok(playlist) => {
                    failures = 0;
                    self.process(playlist);
                }
                Err(NagareError::Cancelled) => return Err(NagareError::Cancelled),
                Err(e) => {
                    failures += 1;
                    if failures >= self.options.reload_attempts {
                        return Err(e);
                    }
                    log::warn!(
                        "Failed to reload playlist ({failures}/{}): {e}, retrying in {:?}",
                        self.options.reload_attempts,
                        self.next_reload(failures)
                    );
                }
            }
        }
    }

    /// Wait before the next reload. After failed reloads the wait backs off
    /// exponentially, capped by the interval of the last successful one.
    fn next_reload(&self, failures: u32) -> Duration {
        match failures {
            0 => self.reload_time,
            n => backoff_delay(n, RELOAD_FAILURE_BACKOFF, self.reload_time),
        }
    }

    /// Hands pending segments to the queue as it frees up, until `deadline`.
    async fn feed_until(
        &mut self,
        queue: &mpsc::Sender<Segment>,
        deadline: Instant,
    ) -> NagareResult<()> {
        let cancel = self.cancel.clone();
        loop {
            while let Some(segment) = self.pending.pop_front() {
                match queue.try_send(segment) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(segment)) => {
                        self.pending.push_front(segment);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(NagareError::Cancelled)
                    }
                }
            }

            if self.pending.is_empty() {
                return tokio::select! {
                    _ = cancel.cancelled() => Err(NagareError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Ok(()),
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(NagareError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                permit = queue.reserve() => {
                    let permit = permit.map_err(|_| NagareError::Cancelled)?;
                    if let Some(segment) = self.pending.pop_front() {
                        permit.send(segment);
                    }
                }
            }
        }
    }

    async fn flush(&mut self, queue: &mpsc::Sender<Segment>) -> NagareResult<()> {
        let cancel = self.cancel.clone();
        while let Some(segment) = self.pending.pop_front() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(NagareError::Cancelled),
                sent = queue.send(segment) => sent.map_err(|_| NagareError::Cancelled)?,
            }
        }
        Ok(())
    }

    fn process(&mut self, playlist: MediaPlaylist) {
        if let Some(first) = playlist.segments.first().map(|s| s.num) {
            let before = self.pending.len();
            self.pending.retain(|segment| segment.num >= first);
            let dropped = (before - self.pending.len()) as u64;
            if dropped > 0 {
                self.dropped += dropped;
                log::warn!(
                    "Dropped {dropped} segment(s) that left the playlist window before they could be downloaded"
                );
            }
        }

        // the start position applies until a segment has been queued
        let start = match self.last_sequence {
            None => self.start_index(&playlist),
            Some(last) => playlist
                .segments
                .iter()
                .position(|s| s.num > last)
                .unwrap_or(playlist.segments.len()),
        };

        if let (Some(last), Some(next)) = (self.last_sequence, playlist.segments.get(start)) {
            if next.num > last + 1 {
                log::warn!(
                    "Skipped segments {}-{}: they left the playlist window between reloads",
                    last + 1,
                    next.num - 1
                );
            }
        }

        let mut changed = false;
        for segment in playlist.segments.iter().skip(start) {
            if let Some(limit) = self.options.duration {
                if self.queued_duration >= limit.as_secs_f64() {
                    log::info!("Stopping stream early after {:?}", limit);
                    self.duration_reached = true;
                    break;
                }
            }
            self.queued_duration += segment.duration;
            self.last_sequence = Some(segment.num);
            self.pending.push_back(segment.clone());
            changed = true;
        }

        self.playlist_end = playlist.end_list;
        self.reload_time = self.reload_time(&playlist, changed);
        log::debug!(
            "Reloaded playlist: last sequence {:?}, next reload in {:?}",
            self.last_sequence,
            self.reload_time
        );
    }

    fn start_index(&self, playlist: &MediaPlaylist) -> usize {
        let segments = &playlist.segments;
        let offset = match self.options.start_offset {
            offset if offset > 0.0 => offset,
            _ => playlist.start_offset.unwrap_or(0.0),
        };

        if playlist.end_list || self.options.live_restart {
            if offset <= 0.0 {
                return 0;
            }
            let mut elapsed = 0.0;
            for (index, segment) in segments.iter().enumerate() {
                if elapsed + segment.duration > offset {
                    return index;
                }
                elapsed += segment.duration;
            }
            return segments.len();
        }

        if offset > 0.0 {
            let mut elapsed = 0.0;
            for (index, segment) in segments.iter().enumerate().rev() {
                elapsed += segment.duration;
                if elapsed >= offset {
                    return index;
                }
            }
            return 0;
        }

        segments.len().saturating_sub(self.options.live_edge.max(1))
    }

    fn reload_time(&self, playlist: &MediaPlaylist, changed: bool) -> Duration {
        let target = playlist
            .target_duration
            .filter(|t| *t > 0.0)
            .unwrap_or(FALLBACK_TARGET_DURATION);

        let secs = match self.options.reload_time {
            ReloadTime::Fixed(interval) => return interval,
            _ if !changed => target / 2.0,
            ReloadTime::Default => target,
            ReloadTime::Segment => playlist.segments.last().map_or(target, |s| s.duration),
            ReloadTime::LiveEdge => playlist
                .segments
                .iter()
                .rev()
                .take(self.options.live_edge.max(1))
                .map(|s| s.duration)
                .sum(),
        };
        Duration::try_from_secs_f64(secs.clamp(target / 2.0, target))
            .unwrap_or(Duration::from_secs_f64(FALLBACK_TARGET_DURATION))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(first: u64, count: u64, end_list: bool) -> MediaPlaylist {
        let mut text = format!("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{first}\n");
        for num in first..first + count {
            text.push_str(&format!("#EXTINF:{},\nsegment{num}.ts\n", 1 + num % 4));
        }
        if end_list {
            text.push_str("#EXT-X-ENDLIST\n");
        }
        let url = Url::parse("https://example.com/live.m3u8").unwrap();
        match parse_playlist(text.as_bytes(), &url).unwrap() {
            Playlist::Media(playlist) => playlist,
            Playlist::Multivariant(_) => unreachable!(),
        }
    }

    fn reloader(options: HlsOptions) -> PlaylistReloader {
        PlaylistReloader::new(
            HttpSession::new().unwrap(),
            Url::parse("https://example.com/live.m3u8").unwrap(),
            options,
            StateHandle::new(),
            SharedFailure::default(),
            CancellationToken::new(),
        )
    }

    fn pending(reloader: &PlaylistReloader) -> Vec<u64> {
        reloader.pending.iter().map(|s| s.num).collect()
    }

    #[test]
    fn test_state_is_monotonic() {
        let state = StateHandle::new();
        assert!(state.advance(ReloaderState::Live));
        assert!(state.advance(ReloaderState::Terminal));
        assert!(!state.advance(ReloaderState::Ended));
        assert_eq!(state.get(), ReloaderState::Terminal);
    }

    #[test]
    fn test_live_edge_start() {
        let mut reloader = reloader(HlsOptions::default());
        reloader.process(playlist(100, 10, false));
        assert_eq!(pending(&reloader), vec![107, 108, 109]);

        reloader.process(playlist(102, 10, false));
        assert_eq!(pending(&reloader), vec![107, 108, 109, 110, 111]);
    }

    #[test]
    fn test_live_edge_after_empty_playlist() {
        let mut reloader = reloader(HlsOptions::default());
        reloader.process(playlist(100, 0, false));
        assert!(pending(&reloader).is_empty());

        reloader.process(playlist(100, 10, false));
        assert_eq!(pending(&reloader), vec![107, 108, 109]);

        reloader.process(playlist(101, 10, false));
        assert_eq!(pending(&reloader), vec![107, 108, 109, 110]);
    }

    #[test]
    fn test_ended_playlist_starts_at_beginning() {
        let mut reloader = reloader(HlsOptions::default());
        reloader.process(playlist(0, 5, true));
        assert_eq!(pending(&reloader), vec![0, 1, 2, 3, 4]);
        assert!(reloader.playlist_end);
    }

    #[test]
    fn test_start_offset() {
        // durations: 1, 2, 3, 4, 1, ...
        let mut reloader = reloader(HlsOptions {
            start_offset: 3.5,
            ..Default::default()
        });
        reloader.process(playlist(0, 5, true));
        assert_eq!(pending(&reloader), vec![2, 3, 4]);

        let mut live = self::reloader(HlsOptions {
            start_offset: 5.0,
            ..Default::default()
        });
        live.process(playlist(0, 5, false));
        assert_eq!(pending(&live), vec![3, 4]);
    }

    #[test]
    fn test_duration_limit() {
        let mut reloader = reloader(HlsOptions {
            duration: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        reloader.process(playlist(0, 5, true));
        assert_eq!(pending(&reloader), vec![0, 1]);
        assert!(reloader.duration_reached);
    }

    #[test]
    fn test_stale_segments_are_dropped() {
        let mut reloader = reloader(HlsOptions::default());
        reloader.process(playlist(100, 10, false));
        reloader.process(playlist(109, 10, false));
        assert_eq!(reloader.dropped(), 2);
        assert_eq!(pending(&reloader).first(), Some(&109));
    }

    #[test]
    fn test_reload_time() {
        let mut reloader = reloader(HlsOptions::default());
        let playlist = playlist(0, 4, false);
        assert_eq!(reloader.reload_time(&playlist, true), Duration::from_secs(4));
        assert_eq!(reloader.reload_time(&playlist, false), Duration::from_secs(2));

        // last segment is 4s long
        reloader.options.reload_time = ReloadTime::Segment;
        assert_eq!(reloader.reload_time(&playlist, true), Duration::from_secs(4));

        // 2 + 3 + 4, clamped to the target duration
        reloader.options.reload_time = ReloadTime::LiveEdge;
        assert_eq!(reloader.reload_time(&playlist, true), Duration::from_secs(4));

        reloader.options.reload_time = ReloadTime::Fixed(Duration::from_millis(250));
        assert_eq!(reloader.reload_time(&playlist, false), Duration::from_millis(250));
    }

    #[test]
    fn test_reload_failure_backoff() {
        let mut reloader = reloader(HlsOptions::default());
        reloader.process(playlist(0, 4, false));
        assert_eq!(reloader.next_reload(0), Duration::from_secs(4));

        let delays: Vec<_> = (1..=5).map(|n| reloader.next_reload(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        // failures leave the playlist interval alone
        assert_eq!(reloader.next_reload(0), Duration::from_secs(4));
    }
}
