use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    argument::{parse_key_values, Arguments},
    error::{NagareError, NagareResult},
    http::{HttpConfig, HttpSession, TlsAdapter, DEFAULT_TIMEOUT},
    options::{OptionGetter, OptionHooks, OptionSetter, OptionValue, Options},
    plugin::{sort_streams, HlsPlugin, Plugin, PluginContext, PluginMatch, RegisteredPlugin, Streams},
    DEFAULT_USER_AGENT,
};

fn session_defaults() -> Vec<(&'static str, OptionValue)> {
    vec![
        ("http-proxy", OptionValue::Absent),
        ("https-proxy", OptionValue::Absent),
        ("http-headers", OptionValue::Map(BTreeMap::new())),
        ("http-cookies", OptionValue::Map(BTreeMap::new())),
        ("http-query-params", OptionValue::Map(BTreeMap::new())),
        ("http-timeout", OptionValue::from(DEFAULT_TIMEOUT.as_secs_f64())),
        ("http-ssl-verify", OptionValue::from(true)),
        ("http-disable-dh", OptionValue::from(false)),
        ("http-seclevel1", OptionValue::from(false)),
        ("ipv4", OptionValue::from(false)),
        ("ipv6", OptionValue::from(false)),
        ("user-agent", OptionValue::from(DEFAULT_USER_AGENT)),
        ("hls-live-edge", OptionValue::from(3)),
        ("hls-live-restart", OptionValue::from(false)),
        ("hls-segment-queue-threshold", OptionValue::from(16 * 1024 * 1024)),
        ("hls-segment-attempts", OptionValue::from(3)),
        ("hls-segment-threads", OptionValue::from(1)),
        ("hls-segment-timeout", OptionValue::from(10.0)),
        ("hls-segment-ignore-names", OptionValue::List(Vec::new())),
        ("hls-segment-key-uri", OptionValue::Absent),
        ("hls-playlist-reload-attempts", OptionValue::from(3)),
        ("hls-playlist-reload-time", OptionValue::from("default")),
        ("hls-start-offset", OptionValue::from(0.0)),
        ("hls-duration", OptionValue::Absent),
        ("hls-audio-select", OptionValue::List(Vec::new())),
        ("hls-close-timeout", OptionValue::from(5.0)),
        ("ringbuffer-size", OptionValue::from(16 * 1024 * 1024)),
        ("stream-timeout", OptionValue::from(60.0)),
    ]
}

fn get_https_proxy(options: &Options, key: &str) -> OptionValue {
    match options.get_explicit(key) {
        OptionValue::Absent => options.get_explicit("http-proxy"),
        value => value,
    }
}

fn set_http_proxy(options: &mut Options, key: &str, value: OptionValue) {
    options.set_explicit(key, value.clone());
    options.set_explicit("https-proxy", value);
}

fn set_merged_map(options: &mut Options, key: &str, value: OptionValue) {
    let update = match value {
        OptionValue::Map(map) => map,
        OptionValue::Str(raw) => match parse_key_values(&raw) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Ignoring invalid value of {key}: {e}");
                return;
            }
        },
        OptionValue::Absent => {
            options.set_explicit(key, OptionValue::Map(BTreeMap::new()));
            return;
        }
        other => {
            log::warn!("Ignoring invalid value of {key}: {other}");
            return;
        }
    };
    let mut merged = options.get_explicit(key).as_map().cloned().unwrap_or_default();
    merged.extend(update);
    options.set_explicit(key, OptionValue::Map(merged));
}

fn set_address_family(options: &mut Options, key: &str, value: OptionValue) {
    if value.as_bool() == Some(true) {
        let other = if key == "ipv4" { "ipv6" } else { "ipv4" };
        options.set_explicit(other, false);
    }
    options.set_explicit(key, value);
}

fn set_segment_threads(options: &mut Options, key: &str, value: OptionValue) {
    let value = match value.as_i64() {
        Some(threads) => OptionValue::Int(threads.clamp(1, 10)),
        None => value,
    };
    options.set_explicit(key, value);
}

static SESSION_OPTION_HOOKS: OptionHooks = OptionHooks {
    getters: &[("https-proxy", get_https_proxy as OptionGetter)],
    setters: &[
        ("http-proxy", set_http_proxy as OptionSetter),
        ("http-headers", set_merged_map as OptionSetter),
        ("http-cookies", set_merged_map as OptionSetter),
        ("http-query-params", set_merged_map as OptionSetter),
        ("ipv4", set_address_family as OptionSetter),
        ("ipv6", set_address_family as OptionSetter),
        ("hls-segment-threads", set_segment_threads as OptionSetter),
    ],
};

/// Whether changing `key` requires rebuilding the HTTP clients.
fn affects_http(key: &str) -> bool {
    key.starts_with("http-") || matches!(key, "https-proxy" | "user-agent" | "ipv4" | "ipv6")
}

fn http_config(options: &Options) -> NagareResult<HttpConfig> {
    let defaults = HttpConfig::default();

    let mut headers = HeaderMap::new();
    for (name, value) in options.get("http-headers").as_map().into_iter().flatten() {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| NagareError::Config(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| NagareError::Config(format!("Invalid value of header {name}: {e}")))?;
        headers.insert(header, value);
    }

    let local_address = if options.get("ipv4").as_bool() == Some(true) {
        Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    } else if options.get("ipv6").as_bool() == Some(true) {
        Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    } else {
        None
    };

    Ok(HttpConfig {
        headers,
        params: options
            .get("http-query-params")
            .as_map()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
        cookies: options
            .get("http-cookies")
            .as_map()
            .cloned()
            .unwrap_or_default(),
        http_proxy: options.get("http-proxy").as_str().map(str::to_string),
        https_proxy: options.get("https-proxy").as_str().map(str::to_string),
        timeout: options
            .get("http-timeout")
            .as_duration()
            .unwrap_or(defaults.timeout),
        verify: options.get("http-ssl-verify").as_bool().unwrap_or(true),
        user_agent: options
            .get("user-agent")
            .as_str()
            .map_or(defaults.user_agent, str::to_string),
        local_address,
    })
}

fn tls_adapter(options: &Options) -> TlsAdapter {
    if options.get("http-seclevel1").as_bool() == Some(true) {
        TlsAdapter::SecLevel1
    } else if options.get("http-disable-dh").as_bool() == Some(true) {
        TlsAdapter::NoDh
    } else {
        TlsAdapter::Default
    }
}

struct SessionInner {
    options: RwLock<Options>,
    http: HttpSession,
    plugins: RwLock<Vec<RegisteredPlugin>>,
    plugin_options: RwLock<HashMap<String, Options>>,
}

/// Entry point of the library: session options, the shared HTTP session and
/// the plugin registry. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// A session with default options and the built-in HLS plugin.
    pub fn new() -> NagareResult<Self> {
        let options = Options::with_hooks(session_defaults(), &SESSION_OPTION_HOOKS);
        let http = HttpSession::with_config(http_config(&options)?)?;
        let session = Self {
            inner: Arc::new(SessionInner {
                options: RwLock::new(options),
                http,
                plugins: RwLock::new(Vec::new()),
                plugin_options: RwLock::new(HashMap::new()),
            }),
        };
        session.register_plugin(Arc::new(HlsPlugin))?;
        Ok(session)
    }

    pub fn http(&self) -> &HttpSession {
        &self.inner.http
    }

    /// Snapshot of the session options.
    pub fn options(&self) -> Options {
        self.inner.options.read().clone()
    }

    pub fn get_option(&self, key: &str) -> OptionValue {
        self.inner.options.read().get(key)
    }

    /// Sets a session option. HTTP related options reconfigure the HTTP
    /// session immediately.
    pub fn set_option(&self, key: &str, value: impl Into<OptionValue>) -> NagareResult<()> {
        let key = crate::options::normalize_key(key);
        let options = {
            let mut options = self.inner.options.write();
            options.set(&key, value);
            options.clone()
        };
        if !affects_http(&key) {
            return Ok(());
        }

        self.inner.http.configure(http_config(&options)?)?;
        if matches!(key.as_str(), "http-disable-dh" | "http-seclevel1") {
            let adapter = tls_adapter(&options);
            log::debug!("Using TLS adapter {adapter:?}");
            self.inner.http.mount("https://", adapter)?;
        }
        Ok(())
    }

    pub fn set_plugin_option(&self, plugin: &str, key: &str, value: impl Into<OptionValue>) {
        self.inner
            .plugin_options
            .write()
            .entry(plugin.to_string())
            .or_default()
            .set(key, value);
    }

    pub fn get_plugin_option(&self, plugin: &str, key: &str) -> OptionValue {
        self.inner
            .plugin_options
            .read()
            .get(plugin)
            .map(|options| options.get(key))
            .unwrap_or_default()
    }

    /// Registers a plugin, replacing any plugin of the same name.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> NagareResult<()> {
        let registered = RegisteredPlugin::new(plugin)?;
        let mut plugins = self.inner.plugins.write();
        plugins.retain(|p| p.plugin.name() != registered.plugin.name());
        plugins.push(registered);
        Ok(())
    }

    /// Arguments of every registered plugin, by plugin name.
    pub fn plugin_arguments(&self) -> Vec<(&'static str, Arguments)> {
        self.inner
            .plugins
            .read()
            .iter()
            .map(|p| (p.plugin.name(), p.plugin.arguments()))
            .collect()
    }

    fn find_plugin(&self, url: &str) -> Option<PluginMatch> {
        let plugins = self.inner.plugins.read();
        let mut best: Option<PluginMatch> = None;
        for matched in plugins.iter().filter_map(|p| p.matches(url)) {
            if best.as_ref().map_or(true, |b| matched.priority > b.priority) {
                best = Some(matched);
            }
        }
        best
    }

    /// Builds a plugin's options from its argument defaults and the values set
    /// with [`Session::set_plugin_option`], then checks `required` and
    /// `requires` constraints.
    fn plugin_options(&self, plugin: &dyn Plugin) -> NagareResult<Options> {
        let name = plugin.name();
        let arguments = plugin.arguments();
        let mut options = Options::new(
            arguments
                .iter()
                .map(|argument| (argument.dest(), argument.default().clone())),
        );
        if let Some(user) = self.inner.plugin_options.read().get(name) {
            for (key, value) in user.iter() {
                options.set(key, value.clone());
            }
        }

        for argument in arguments.iter() {
            let value = options.get(&argument.dest());
            if value.is_absent() {
                if argument.required() {
                    return Err(NagareError::Config(format!(
                        "Missing required argument {}",
                        argument.argument_name(name)
                    )));
                }
                continue;
            }

            let shown = if argument.sensitive() {
                "********".to_string()
            } else {
                value.to_string()
            };
            log::debug!("Plugin option {}={shown}", argument.argument_name(name));

            for required in arguments.requires(argument.name())? {
                if options.get(&required.dest()).is_absent() {
                    return Err(NagareError::Config(format!(
                        "{} requires {}",
                        argument.argument_name(name),
                        required.argument_name(name)
                    )));
                }
            }
        }
        Ok(options)
    }

    /// Finds the plugin for `url` and returns its streams sorted from worst to
    /// best, followed by the `worst` and `best` synonyms.
    pub async fn resolve_url(&self, url: &str) -> NagareResult<Streams> {
        let url = url.trim();
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("https://{url}")
        };

        let matched = self
            .find_plugin(&url)
            .ok_or_else(|| NagareError::NoPlugin(url.clone()))?;
        log::info!("Found matching plugin {} for URL {url}", matched.plugin.name());

        let context = PluginContext {
            session: self.clone(),
            options: self.plugin_options(matched.plugin.as_ref())?,
            url: url.clone(),
            matcher: matched.matcher,
            captures: matched.captures,
        };
        let streams = match matched.plugin.streams(&context).await {
            Ok(streams) => streams,
            Err(NagareError::Auth(reason)) => return Err(NagareError::NoStreams(reason)),
            Err(e) => return Err(e),
        };
        if streams.is_empty() {
            return Err(NagareError::NoStreams(url));
        }
        Ok(sort_streams(streams))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        argument::Argument,
        plugin::{PluginMatcher, HIGH_PRIORITY},
        stream::HttpStream,
    };

    #[test]
    fn test_proxy_options() -> NagareResult<()> {
        let session = Session::new()?;
        assert!(session.get_option("https-proxy").is_absent());

        session.set_option("http-proxy", "http://127.0.0.1:8080")?;
        assert_eq!(
            session.get_option("https_proxy").as_str(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(
            session.http().config().https_proxy.as_deref(),
            Some("http://127.0.0.1:8080")
        );
        Ok(())
    }

    #[test]
    fn test_merged_maps() -> NagareResult<()> {
        let session = Session::new()?;
        session.set_option("http-headers", "X-A=1;X-B=2")?;
        session.set_option("http-headers", "X-B=3")?;

        let headers = session.get_option("http-headers");
        let headers = headers.as_map().unwrap();
        assert_eq!(headers.get("X-A").map(String::as_str), Some("1"));
        assert_eq!(headers.get("X-B").map(String::as_str), Some("3"));
        assert_eq!(session.http().config().headers.get("x-b").unwrap(), "3");
        Ok(())
    }

    #[test]
    fn test_exclusive_address_family() -> NagareResult<()> {
        let session = Session::new()?;
        session.set_option("ipv4", true)?;
        session.set_option("ipv6", true)?;
        assert_eq!(session.get_option("ipv4").as_bool(), Some(false));
        assert_eq!(
            session.http().config().local_address,
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        );
        Ok(())
    }

    #[test]
    fn test_segment_threads_clamped() -> NagareResult<()> {
        let session = Session::new()?;
        session.set_option("hls-segment-threads", 64)?;
        assert_eq!(session.get_option("hls-segment-threads").as_u64(), Some(10));
        session.set_option("hls_segment_threads", 0)?;
        assert_eq!(session.get_option("hls-segment-threads").as_u64(), Some(1));
        Ok(())
    }

    struct Channel;

    #[async_trait]
    impl Plugin for Channel {
        fn name(&self) -> &'static str {
            "channel"
        }

        fn matchers(&self) -> Vec<PluginMatcher> {
            vec![PluginMatcher::new(r"^https://channel\.example\.com/(?P<id>\w+)\.m3u8$")
                .priority(HIGH_PRIORITY)]
        }

        fn arguments(&self) -> Arguments {
            Arguments::new([
                Argument::new("email").requires(["password"]).build(),
                Argument::new("password").sensitive().build(),
                Argument::new("quality").default("720p").build(),
            ])
        }

        async fn streams(&self, context: &PluginContext) -> NagareResult<Streams> {
            match context.capture("id") {
                Some("private") => Err(NagareError::Auth("login required".to_string())),
                Some("empty") => Ok(Vec::new()),
                _ => {
                    let quality = context.option("quality").to_string();
                    let stream = HttpStream::new(&context.session, context.url.clone());
                    Ok(vec![(quality, Arc::new(stream) as Arc<dyn crate::Stream>)])
                }
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_url() -> NagareResult<()> {
        let session = Session::new()?;
        session.register_plugin(Arc::new(Channel))?;

        let streams = session
            .resolve_url("channel.example.com/abc.m3u8")
            .await?;
        let names: Vec<_> = streams.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["720p", "worst", "best"]);
        assert_eq!(streams[0].1.shortname(), "http");

        assert!(matches!(
            session.resolve_url("https://unknown.example.com/").await,
            Err(NagareError::NoPlugin(_))
        ));
        assert!(matches!(
            session.resolve_url("https://channel.example.com/private.m3u8").await,
            Err(NagareError::NoStreams(reason)) if reason == "login required"
        ));
        assert!(matches!(
            session.resolve_url("https://channel.example.com/empty.m3u8").await,
            Err(NagareError::NoStreams(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_plugin_requires() -> NagareResult<()> {
        let session = Session::new()?;
        session.register_plugin(Arc::new(Channel))?;
        session.set_plugin_option("channel", "email", "user@example.com");

        match session.resolve_url("https://channel.example.com/abc.m3u8").await {
            Err(NagareError::Config(message)) => {
                assert_eq!(message, "--channel-email requires --channel-password")
            }
            _ => panic!("expected a configuration error"),
        }

        session.set_plugin_option("channel", "password", "hunter2");
        session.set_plugin_option("channel", "quality", "1080p");
        let streams = session.resolve_url("https://channel.example.com/abc.m3u8").await?;
        assert_eq!(streams[0].0, "1080p");
        assert_eq!(
            session.get_plugin_option("channel", "password").as_str(),
            Some("hunter2")
        );
        Ok(())
    }
}
