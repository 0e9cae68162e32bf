mod request;
mod response;
mod tls;

pub(crate) use request::backoff_delay;
pub(crate) use response::check_content_length;
pub use request::{RequestBuilder, RequestOverlay, DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_MAX_BACKOFF};
pub use response::{parse_json, parse_xml, HttpResponse};
pub use tls::TlsAdapter;

use std::{collections::BTreeMap, net::IpAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use reqwest::{header::HeaderMap, Client, Method, Proxy};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use url::Url;

use crate::{error::NagareResult, DEFAULT_USER_AGENT};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Session-wide request defaults.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub cookies: BTreeMap<String, String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub verify: bool,
    pub user_agent: String,
    pub local_address: Option<IpAddr>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            params: Vec::new(),
            cookies: BTreeMap::new(),
            http_proxy: None,
            https_proxy: None,
            timeout: DEFAULT_TIMEOUT,
            verify: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            local_address: None,
        }
    }
}

struct Mount {
    prefix: String,
    adapter: TlsAdapter,
    client: Client,
}

struct HttpSessionInner {
    cookies_store: Arc<CookieStoreMutex>,
    config: RwLock<HttpConfig>,
    mounts: RwLock<Vec<Mount>>,
}

/// Shared HTTP client state: one client per mounted URL prefix and a cookie
/// jar common to all of them.
#[derive(Clone)]
pub struct HttpSession {
    inner: Arc<HttpSessionInner>,
}

impl HttpSession {
    pub fn new() -> NagareResult<Self> {
        Self::with_config(HttpConfig::default())
    }

    pub fn with_config(config: HttpConfig) -> NagareResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let mut mounts = Vec::new();
        for prefix in ["https://", "http://"] {
            mounts.push(Mount {
                prefix: prefix.to_string(),
                adapter: TlsAdapter::Default,
                client: build_client(&config, TlsAdapter::Default, &cookies_store, None)?,
            });
        }

        Ok(Self {
            inner: Arc::new(HttpSessionInner {
                cookies_store,
                config: RwLock::new(config),
                mounts: RwLock::new(mounts),
            }),
        })
    }

    pub fn config(&self) -> HttpConfig {
        self.inner.config.read().clone()
    }

    /// Replaces the session defaults and rebuilds every mounted client.
    pub fn configure(&self, config: HttpConfig) -> NagareResult<()> {
        let mut mounts = self.inner.mounts.write();
        for mount in mounts.iter_mut() {
            mount.client = build_client(&config, mount.adapter, &self.inner.cookies_store, None)?;
        }
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Uses `adapter` for every URL starting with `prefix`. The longest
    /// matching prefix wins.
    pub fn mount(&self, prefix: &str, adapter: TlsAdapter) -> NagareResult<()> {
        let client = build_client(&self.config(), adapter, &self.inner.cookies_store, None)?;
        let mut mounts = self.inner.mounts.write();
        match mounts.iter_mut().find(|m| m.prefix == prefix) {
            Some(mount) => {
                mount.adapter = adapter;
                mount.client = client;
            }
            None => mounts.push(Mount {
                prefix: prefix.to_string(),
                adapter,
                client,
            }),
        }
        mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    pub fn adapter_for(&self, url: &Url) -> TlsAdapter {
        let mounts = self.inner.mounts.read();
        find_mount(&mounts, url).map_or(TlsAdapter::Default, |m| m.adapter)
    }

    pub(crate) fn client_for(&self, url: &Url) -> Client {
        let mounts = self.inner.mounts.read();
        match find_mount(&mounts, url) {
            Some(mount) => mount.client.clone(),
            // both scheme prefixes are always mounted
            None => mounts[mounts.len() - 1].client.clone(),
        }
    }

    pub(crate) fn client_with_proxy(&self, url: &Url, proxy: &str) -> NagareResult<Client> {
        build_client(
            &self.config(),
            self.adapter_for(url),
            &self.inner.cookies_store,
            Some(proxy),
        )
    }

    pub fn cookie_store(&self) -> Arc<CookieStoreMutex> {
        self.inner.cookies_store.clone()
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: &Url) {
        if let Ok(mut store) = self.inner.cookies_store.lock() {
            for cookie in cookies {
                _ = store.parse(&cookie, url);
            }
        }
    }

    pub(crate) fn stored_cookies(&self, url: &Url) -> Vec<String> {
        match self.inner.cookies_store.lock() {
            Ok(store) => store
                .get_request_values(url)
                .map(|(name, value)| format!("{name}={value}"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url.into())
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Follows redirects without reading the body and returns the final URL.
    pub async fn resolve_url(&self, url: &str) -> NagareResult<Url> {
        let response = self.get(url).send_streamed().await?;
        Ok(response.url().clone())
    }
}

fn find_mount<'a>(mounts: &'a [Mount], url: &Url) -> Option<&'a Mount> {
    mounts.iter().find(|m| url.as_str().starts_with(&m.prefix))
}

fn build_client(
    config: &HttpConfig,
    adapter: TlsAdapter,
    cookies_store: &Arc<CookieStoreMutex>,
    proxy: Option<&str>,
) -> NagareResult<Client> {
    let mut builder = Client::builder()
        .cookie_provider(cookies_store.clone())
        .default_headers(config.headers.clone())
        .user_agent(config.user_agent.clone())
        .timeout(config.timeout)
        .local_address(config.local_address);

    match proxy {
        Some(proxy) => builder = builder.proxy(Proxy::all(proxy)?),
        None => {
            if let Some(proxy) = &config.http_proxy {
                builder = builder.proxy(Proxy::http(proxy)?);
            }
            if let Some(proxy) = &config.https_proxy {
                builder = builder.proxy(Proxy::https(proxy)?);
            }
        }
    }

    builder = if config.verify {
        builder.use_preconfigured_tls(adapter.client_config()?)
    } else {
        builder.use_rustls_tls().danger_accept_invalid_certs(true)
    };

    Ok(builder.build()?)
}
