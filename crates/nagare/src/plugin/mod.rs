mod hls;
pub mod weight;

pub use hls::HlsPlugin;
pub use weight::{compare_streams, stream_weight, WeightKind};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use regex::Regex;

use crate::{
    argument::Arguments,
    error::{NagareError, NagareResult},
    options::{OptionValue, Options},
    session::Session,
    stream::Stream,
};

pub const NO_PRIORITY: u32 = 0;
pub const LOW_PRIORITY: u32 = 10;
pub const NORMAL_PRIORITY: u32 = 20;
pub const HIGH_PRIORITY: u32 = 30;

/// Named streams returned by a plugin.
pub type Streams = Vec<(String, Arc<dyn Stream>)>;

/// URL pattern a plugin handles.
#[derive(Debug, Clone)]
pub struct PluginMatcher {
    pub pattern: &'static str,
    pub name: Option<&'static str>,
    pub priority: u32,
}

impl PluginMatcher {
    pub const fn new(pattern: &'static str) -> Self {
        Self {
            pattern,
            name: None,
            priority: NORMAL_PRIORITY,
        }
    }

    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub const fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Everything a plugin gets to resolve one URL.
pub struct PluginContext {
    pub session: Session,
    pub url: String,
    /// Name of the matcher that accepted the URL.
    pub matcher: Option<&'static str>,
    pub captures: HashMap<String, String>,
    pub options: Options,
}

impl PluginContext {
    pub fn capture(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }

    pub fn option(&self, key: &str) -> OptionValue {
        self.options.get(key)
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn matchers(&self) -> Vec<PluginMatcher>;

    fn arguments(&self) -> Arguments {
        Arguments::default()
    }

    async fn streams(&self, context: &PluginContext) -> NagareResult<Streams>;
}

pub(crate) struct CompiledMatcher {
    regex: Regex,
    name: Option<&'static str>,
    priority: u32,
}

/// A registered plugin with its matchers compiled.
pub(crate) struct RegisteredPlugin {
    pub(crate) plugin: Arc<dyn Plugin>,
    matchers: Vec<CompiledMatcher>,
}

/// Result of matching a URL against a registered plugin.
pub(crate) struct PluginMatch {
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) matcher: Option<&'static str>,
    pub(crate) priority: u32,
    pub(crate) captures: HashMap<String, String>,
}

impl RegisteredPlugin {
    pub(crate) fn new(plugin: Arc<dyn Plugin>) -> NagareResult<Self> {
        let matchers = plugin
            .matchers()
            .into_iter()
            .map(|matcher| {
                Ok(CompiledMatcher {
                    regex: Regex::new(matcher.pattern).map_err(|e| {
                        NagareError::Config(format!(
                            "Invalid URL pattern of plugin {}: {e}",
                            plugin.name()
                        ))
                    })?,
                    name: matcher.name,
                    priority: matcher.priority,
                })
            })
            .collect::<NagareResult<Vec<_>>>()?;
        Ok(Self { plugin, matchers })
    }

    /// The first matcher accepting `url` with a priority above
    /// [`NO_PRIORITY`].
    pub(crate) fn matches(&self, url: &str) -> Option<PluginMatch> {
        self.matchers
            .iter()
            .filter(|m| m.priority > NO_PRIORITY)
            .find_map(|matcher| {
                let captures = matcher.regex.captures(url)?;
                let captures = matcher
                    .regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect();
                Some(PluginMatch {
                    plugin: self.plugin.clone(),
                    matcher: matcher.name,
                    priority: matcher.priority,
                    captures,
                })
            })
    }
}

/// Sorts streams from worst to best and appends the `worst` and `best`
/// synonyms. Streams without a quality weight only count when no stream has
/// one.
pub fn sort_streams(mut streams: Streams) -> Streams {
    streams.sort_by(|(a, _), (b, _)| compare_streams(a, b));

    let weighted: Vec<&(String, Arc<dyn Stream>)> = streams
        .iter()
        .filter(|(name, _)| stream_weight(name).1 != WeightKind::None)
        .collect();
    let candidates = if weighted.is_empty() {
        streams.iter().collect()
    } else {
        weighted
    };

    let synonyms: Vec<(String, Arc<dyn Stream>)> = match (candidates.first(), candidates.last())
    {
        (Some((_, worst)), Some((_, best))) => vec![
            ("worst".to_string(), worst.clone()),
            ("best".to_string(), best.clone()),
        ],
        _ => Vec::new(),
    };
    let synonyms: Vec<_> = synonyms
        .into_iter()
        .filter(|(synonym, _)| !streams.iter().any(|(name, _)| name == synonym))
        .collect();
    streams.extend(synonyms);
    streams
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamMetadata, StreamReader};

    struct NamedStream(&'static str, StreamMetadata);

    #[async_trait]
    impl Stream for NamedStream {
        fn shortname(&self) -> &'static str {
            "test"
        }

        fn url(&self) -> String {
            self.0.to_string()
        }

        fn metadata(&self) -> &StreamMetadata {
            &self.1
        }

        async fn open(&self) -> NagareResult<StreamReader> {
            Err(NagareError::NoStreams(self.0.to_string()))
        }
    }

    fn streams(names: &[&'static str]) -> Streams {
        names
            .iter()
            .map(|&name| {
                (
                    name.to_string(),
                    Arc::new(NamedStream(name, StreamMetadata::default())) as Arc<dyn Stream>,
                )
            })
            .collect()
    }

    #[test]
    fn test_sort_streams() {
        let sorted = sort_streams(streams(&["720p", "audio_only", "1080p60", "360p"]));
        let names: Vec<_> = sorted.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(
            names,
            vec!["audio_only", "360p", "720p", "1080p60", "worst", "best"]
        );

        let best = &sorted.iter().find(|(name, _)| name == "best").unwrap().1;
        assert_eq!(best.url(), "1080p60");
        let worst = &sorted.iter().find(|(name, _)| name == "worst").unwrap().1;
        assert_eq!(worst.url(), "360p");
    }

    #[test]
    fn test_unweighted_streams() {
        let sorted = sort_streams(streams(&["live"]));
        let urls: Vec<_> = sorted.iter().map(|(name, s)| (name.as_str(), s.url())).collect();
        assert_eq!(
            urls,
            vec![
                ("live", "live".to_string()),
                ("worst", "live".to_string()),
                ("best", "live".to_string())
            ]
        );
    }

    struct Dummy;

    #[async_trait]
    impl Plugin for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }

        fn matchers(&self) -> Vec<PluginMatcher> {
            vec![
                PluginMatcher::new(r"^https://disabled\.example\.com/").priority(NO_PRIORITY),
                PluginMatcher::new(r"^https://example\.com/(?P<channel>\w+)$").named("channel"),
            ]
        }

        async fn streams(&self, _context: &PluginContext) -> NagareResult<Streams> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_matchers() {
        let plugin = RegisteredPlugin::new(Arc::new(Dummy)).unwrap();
        let matched = plugin.matches("https://example.com/abc").unwrap();
        assert_eq!(matched.matcher, Some("channel"));
        assert_eq!(matched.priority, NORMAL_PRIORITY);
        assert_eq!(matched.captures.get("channel").map(String::as_str), Some("abc"));

        assert!(plugin.matches("https://disabled.example.com/abc").is_none());
        assert!(plugin.matches("https://other.example.com/abc").is_none());
    }
}
