use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use url::Url;

use super::{Plugin, PluginContext, PluginMatcher, Streams, LOW_PRIORITY, NORMAL_PRIORITY};
use crate::{
    error::{NagareError, NagareResult},
    hls::HlsStream,
    stream::Stream,
};

/// Plays any HLS playlist given directly, either as `hls://<url>` /
/// `hlsvariant://<url>` or as a plain URL ending in `.m3u8`.
///
/// Parameters may follow the URL separated by whitespace:
/// `hls://example.com/live.m3u8 start_offset=30 duration=600 force_restart=true`.
pub struct HlsPlugin;

#[derive(Debug, Default, PartialEq)]
struct HlsParams {
    start_offset: Option<f64>,
    duration: Option<Duration>,
    force_restart: bool,
}

fn parse_params(raw: Option<&str>) -> NagareResult<HlsParams> {
    let mut params = HlsParams::default();
    let Some(raw) = raw else {
        return Ok(params);
    };

    let values: HashMap<&str, &str> = raw
        .split_whitespace()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k, v.trim_matches(|c| c == '"' || c == '\'')))
                .ok_or_else(|| NagareError::Config(format!("Invalid HLS parameter: {pair}")))
        })
        .collect::<NagareResult<_>>()?;

    for (key, value) in values {
        let invalid = || NagareError::Config(format!("Invalid value of HLS parameter {key}: {value}"));
        match key {
            "start_offset" => params.start_offset = Some(value.parse().map_err(|_| invalid())?),
            "duration" => {
                let secs: f64 = value.parse().map_err(|_| invalid())?;
                params.duration = Some(Duration::try_from_secs_f64(secs).map_err(|_| invalid())?);
            }
            "force_restart" => {
                params.force_restart = match value.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "1" => true,
                    "false" | "no" | "0" => false,
                    _ => return Err(invalid()),
                }
            }
            other => log::warn!("Ignoring unknown HLS parameter {other}"),
        }
    }
    Ok(params)
}

/// Prepends `https://` to scheme-less URLs.
fn playlist_url(raw: &str) -> NagareResult<Url> {
    if raw.contains("://") {
        Ok(Url::parse(raw)?)
    } else {
        Ok(Url::parse(&format!("https://{raw}"))?)
    }
}

impl HlsParams {
    fn apply(&self, mut stream: HlsStream) -> HlsStream {
        if let Some(start_offset) = self.start_offset {
            stream = stream.with_start_offset(start_offset);
        }
        if let Some(duration) = self.duration {
            stream = stream.with_duration(duration);
        }
        if self.force_restart {
            stream = stream.force_restart();
        }
        stream
    }
}

#[async_trait]
impl Plugin for HlsPlugin {
    fn name(&self) -> &'static str {
        "hls"
    }

    fn matchers(&self) -> Vec<PluginMatcher> {
        vec![
            PluginMatcher::new(r"^hls(?:variant)?://(?P<url>\S+)(?:\s+(?P<params>.+))?$")
                .named("prefix")
                .priority(NORMAL_PRIORITY),
            PluginMatcher::new(
                r"^(?P<url>[^\s?#]+\.m3u8(?:[?#]\S*)?)(?:\s+(?P<params>.+))?$",
            )
            .named("suffix")
            .priority(LOW_PRIORITY),
        ]
    }

    async fn streams(&self, context: &PluginContext) -> NagareResult<Streams> {
        let raw = context
            .capture("url")
            .ok_or_else(|| NagareError::NoStreams(context.url.clone()))?;
        let url = playlist_url(raw)?;
        let params = parse_params(context.capture("params"))?;
        log::debug!("HLS playlist URL: {url}, params: {params:?}");

        let variants = HlsStream::parse_variant_playlist(&context.session, url.as_str()).await?;
        if variants.is_empty() {
            let stream = params.apply(HlsStream::new(&context.session, url));
            return Ok(vec![("live".to_string(), Arc::new(stream) as Arc<dyn Stream>)]);
        }

        Ok(variants
            .into_iter()
            .map(|(name, stream)| (name, Arc::new(params.apply(stream)) as Arc<dyn Stream>))
            .collect())
    }
}
