use std::time::Duration;

use crate::{
    error::{NagareError, NagareResult},
    options::Options,
    stream::read_timeout,
};

/// How long the reloader waits between two playlist fetches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReloadTime {
    /// Target duration of the playlist.
    Default,
    /// Duration of the last segment.
    Segment,
    /// Sum of the durations of the live edge segments.
    LiveEdge,
    /// Fixed interval, never clamped.
    Fixed(Duration),
}

impl ReloadTime {
    fn fixed(secs: f64) -> NagareResult<Self> {
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|interval| !interval.is_zero())
            .map(ReloadTime::Fixed)
            .ok_or_else(|| NagareError::Config(format!("Invalid hls-playlist-reload-time: {secs}")))
    }
}

impl std::str::FromStr for ReloadTime {
    type Err = NagareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(ReloadTime::Default),
            "segment" => Ok(ReloadTime::Segment),
            "live-edge" | "live_edge" => Ok(ReloadTime::LiveEdge),
            other => match other.parse::<f64>() {
                Ok(secs) => ReloadTime::fixed(secs),
                Err(_) => Err(NagareError::Config(format!(
                    "Invalid hls-playlist-reload-time: {s}"
                ))),
            },
        }
    }
}

/// Typed snapshot of the `hls-*` session options, taken when a stream opens.
#[derive(Debug, Clone)]
pub struct HlsOptions {
    pub live_edge: usize,
    pub live_restart: bool,
    pub queue_threshold: usize,
    pub segment_attempts: u32,
    pub segment_threads: usize,
    pub segment_timeout: Duration,
    pub ignore_names: Vec<String>,
    pub key_uri: Option<String>,
    pub reload_attempts: u32,
    pub reload_time: ReloadTime,
    pub start_offset: f64,
    pub duration: Option<Duration>,
    pub audio_select: Vec<String>,
    pub close_timeout: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            live_edge: 3,
            live_restart: false,
            queue_threshold: 16 * 1024 * 1024,
            segment_attempts: 3,
            segment_threads: 1,
            segment_timeout: Duration::from_secs(10),
            ignore_names: Vec::new(),
            key_uri: None,
            reload_attempts: 3,
            reload_time: ReloadTime::Default,
            start_offset: 0.0,
            duration: None,
            audio_select: Vec::new(),
            close_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl HlsOptions {
    pub fn from_options(options: &Options) -> NagareResult<Self> {
        let defaults = Self::default();

        let reload_time = match options.get("hls-playlist-reload-time") {
            value if value.is_absent() => ReloadTime::Default,
            value => match value.as_f64() {
                Some(secs) => ReloadTime::fixed(secs)?,
                _ => value
                    .as_str()
                    .map(str::parse::<ReloadTime>)
                    .transpose()?
                    .unwrap_or(ReloadTime::Default),
            },
        };

        Ok(Self {
            live_edge: options
                .get("hls-live-edge")
                .as_u64()
                .map_or(defaults.live_edge, |v| usize::try_from(v).unwrap_or(usize::MAX).max(1)),
            live_restart: options
                .get("hls-live-restart")
                .as_bool()
                .unwrap_or(defaults.live_restart),
            queue_threshold: options
                .get("hls-segment-queue-threshold")
                .as_u64()
                .map_or(defaults.queue_threshold, |v| {
                    usize::try_from(v).unwrap_or(usize::MAX).max(1)
                }),
            segment_attempts: options
                .get("hls-segment-attempts")
                .as_u64()
                .map_or(defaults.segment_attempts, |v| {
                    u32::try_from(v).unwrap_or(u32::MAX).max(1)
                }),
            segment_threads: options
                .get("hls-segment-threads")
                .as_u64()
                .map_or(defaults.segment_threads, |v| {
                    usize::try_from(v).unwrap_or(usize::MAX).clamp(1, 10)
                }),
            segment_timeout: options
                .get("hls-segment-timeout")
                .as_duration()
                .unwrap_or(defaults.segment_timeout),
            ignore_names: options
                .get("hls-segment-ignore-names")
                .as_list()
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
            key_uri: options
                .get("hls-segment-key-uri")
                .as_str()
                .map(str::to_string),
            reload_attempts: options
                .get("hls-playlist-reload-attempts")
                .as_u64()
                .map_or(defaults.reload_attempts, |v| {
                    u32::try_from(v).unwrap_or(u32::MAX).max(1)
                }),
            reload_time,
            start_offset: options
                .get("hls-start-offset")
                .as_f64()
                .unwrap_or(defaults.start_offset)
                .max(0.0),
            duration: options
                .get("hls-duration")
                .as_duration()
                .filter(|d| !d.is_zero()),
            audio_select: options
                .get("hls-audio-select")
                .as_list()
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
            close_timeout: options
                .get("hls-close-timeout")
                .as_duration()
                .unwrap_or(defaults.close_timeout),
            read_timeout: read_timeout(options),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;

    #[test]
    fn test_reload_time() {
        assert_eq!("default".parse::<ReloadTime>().unwrap(), ReloadTime::Default);
        assert_eq!("Segment".parse::<ReloadTime>().unwrap(), ReloadTime::Segment);
        assert_eq!("live-edge".parse::<ReloadTime>().unwrap(), ReloadTime::LiveEdge);
        assert_eq!(
            "2.5".parse::<ReloadTime>().unwrap(),
            ReloadTime::Fixed(Duration::from_millis(2500))
        );
        assert!("0".parse::<ReloadTime>().is_err());
        assert!("1e30".parse::<ReloadTime>().is_err());
        assert!("-1".parse::<ReloadTime>().is_err());
        assert!("soon".parse::<ReloadTime>().is_err());
    }

    #[test]
    fn test_from_options() {
        let mut options = Options::new([
            ("hls-live-edge", OptionValue::from(5)),
            ("hls-segment-threads", OptionValue::from(32)),
            ("hls-playlist-reload-time", OptionValue::from("segment")),
        ]);
        options.set("hls_duration", 30.0);

        let hls = HlsOptions::from_options(&options).unwrap();
        assert_eq!(hls.live_edge, 5);
        assert_eq!(hls.segment_threads, 10);
        assert_eq!(hls.reload_time, ReloadTime::Segment);
        assert_eq!(hls.duration, Some(Duration::from_secs(30)));
        assert_eq!(hls.segment_attempts, 3);
        assert_eq!(hls.read_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_numeric_reload_time() {
        let mut options = Options::default();
        options.set("hls-playlist-reload-time", 4);
        let hls = HlsOptions::from_options(&options).unwrap();
        assert_eq!(hls.reload_time, ReloadTime::Fixed(Duration::from_secs(4)));
    }

    #[test]
    fn test_out_of_range_counts_saturate() {
        let options = Options::new([
            ("hls-segment-attempts", OptionValue::from(u64::MAX)),
            ("hls-playlist-reload-attempts", OptionValue::from(1u64 << 32)),
            ("hls-live-edge", OptionValue::from(0)),
        ]);
        let hls = HlsOptions::from_options(&options).unwrap();
        assert_eq!(hls.segment_attempts, u32::MAX);
        assert_eq!(hls.reload_attempts, u32::MAX);
        assert_eq!(hls.live_edge, 1);

        let mut options = Options::default();
        options.set("hls-playlist-reload-time", 1e30);
        assert!(HlsOptions::from_options(&options).is_err());
    }
}
