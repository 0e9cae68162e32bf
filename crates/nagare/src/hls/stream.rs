use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    filter::{IgnoreNamesFilter, SegmentFilter},
    m3u8::{Media, Variant},
    options::HlsOptions,
    reloader::{PlaylistReloader, SharedFailure, StateHandle},
    worker::{Dispatcher, SegmentFetcher},
    writer::SegmentWriter,
};
use crate::{
    buffer::Buffer,
    error::NagareResult,
    http::RequestOverlay,
    session::Session,
    stream::{Stream, StreamMetadata, StreamReader},
};

/// A live or on-demand HLS media playlist.
#[derive(Clone)]
pub struct HlsStream {
    session: Session,
    url: Url,
    metadata: StreamMetadata,
    overlay: RequestOverlay,
    filters: Vec<Arc<dyn SegmentFilter>>,
    variant: Option<Variant>,
    audio: Vec<Media>,
    start_offset: Option<f64>,
    duration: Option<Duration>,
    force_restart: bool,
}

impl HlsStream {
    pub fn new(session: &Session, url: Url) -> Self {
        Self {
            session: session.clone(),
            url,
            metadata: StreamMetadata::default(),
            overlay: RequestOverlay::default(),
            filters: Vec::new(),
            variant: None,
            audio: Vec::new(),
            start_offset: None,
            duration: None,
            force_restart: false,
        }
    }

    /// Resolves a multivariant playlist into one named stream per variant.
    /// A media playlist yields no streams.
    pub async fn parse_variant_playlist(
        session: &Session,
        url: &str,
    ) -> NagareResult<Vec<(String, HlsStream)>> {
        super::variant::parse_variant_playlist(session, url, RequestOverlay::default()).await
    }

    pub fn with_metadata(mut self, metadata: StreamMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_overlay(mut self, overlay: RequestOverlay) -> Self {
        self.overlay = overlay;
        self
    }

    pub fn with_filter(mut self, filter: impl SegmentFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn with_start_offset(mut self, seconds: f64) -> Self {
        self.start_offset = Some(seconds);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Starts live playlists at the first segment instead of the live edge.
    pub fn force_restart(mut self) -> Self {
        self.force_restart = true;
        self
    }

    pub(crate) fn with_variant(mut self, variant: Variant, audio: Vec<Media>) -> Self {
        self.variant = Some(variant);
        self.audio = audio;
        self
    }

    pub fn variant(&self) -> Option<&Variant> {
        self.variant.as_ref()
    }

    /// Audio renditions selected for this variant.
    pub fn audio(&self) -> &[Media] {
        &self.audio
    }

    fn options(&self) -> NagareResult<HlsOptions> {
        let mut options = HlsOptions::from_options(&self.session.options())?;
        if let Some(start_offset) = self.start_offset {
            options.start_offset = start_offset.max(0.0);
        }
        if self.duration.is_some() {
            options.duration = self.duration;
        }
        if self.force_restart {
            options.live_restart = true;
        }
        Ok(options)
    }
}

#[async_trait]
impl Stream for HlsStream {
    fn shortname(&self) -> &'static str {
        "hls"
    }

    fn url(&self) -> String {
        self.url.to_string()
    }

    fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    async fn open(&self) -> NagareResult<StreamReader> {
        let options = self.options()?;
        let http = self.session.http().clone();
        let cancel = CancellationToken::new();
        let buffer = Arc::new(Buffer::new(options.queue_threshold));
        let state = StateHandle::new();
        let failure = SharedFailure::default();

        let mut filters = Vec::new();
        if let Some(filter) = IgnoreNamesFilter::new(&options.ignore_names)? {
            filters.push(Arc::new(filter) as Arc<dyn SegmentFilter>);
        }
        filters.extend(self.filters.iter().cloned());

        let (segment_sender, segment_receiver) = mpsc::channel(options.segment_threads);
        let (slot_sender, slot_receiver) = mpsc::channel(options.segment_threads + 1);

        log::info!("Opening HLS stream {}", self.url);
        let reloader = PlaylistReloader::new(
            http.clone(),
            self.url.clone(),
            options.clone(),
            state.clone(),
            failure.clone(),
            cancel.clone(),
        )
        .with_overlay(self.overlay.clone());
        let fetcher = Arc::new(SegmentFetcher::new(
            http,
            options.key_uri.clone(),
            options.segment_attempts,
            options.segment_timeout,
            cancel.clone(),
        ));
        let dispatcher = Dispatcher::new(fetcher, filters, options.segment_threads, cancel.clone());
        let writer = SegmentWriter::new(buffer.clone(), state, failure, cancel.clone());

        let workers = vec![
            tokio::spawn(reloader.run(segment_sender)),
            tokio::spawn(dispatcher.run(segment_receiver, slot_sender)),
            tokio::spawn(writer.run(slot_receiver)),
        ];

        Ok(StreamReader::new(
            buffer,
            cancel,
            workers,
            options.close_timeout,
            options.read_timeout,
        ))
    }
}
