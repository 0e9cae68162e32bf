use std::{future::Future, time::Duration};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, COOKIE},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{response::HttpResponse, HttpSession};
use crate::{
    error::{ErrorConstructor, NagareError, NagareResult},
    validate::{Schema, Value},
};

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(300);
pub const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// `min(max, base * 2^(attempt - 1))`
pub(crate) fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Headers and query parameters layered over the session defaults for a
/// single request.
#[derive(Debug, Clone, Default)]
pub struct RequestOverlay {
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
enum RequestBody {
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
    Raw(Bytes),
}

pub struct RequestBuilder {
    session: HttpSession,
    method: Method,
    url: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    body: Option<RequestBody>,
    auth: Option<(String, Option<String>)>,
    proxy: Option<String>,
    overlay: Option<RequestOverlay>,
    acceptable_status: Vec<StatusCode>,
    raise_for_status: bool,
    encoding: Option<String>,
    exception: ErrorConstructor,
    timeout: Option<Duration>,
    retries: u32,
    retry_backoff: Duration,
    retry_max_backoff: Duration,
    cancel: Option<CancellationToken>,
    error: Option<NagareError>,
}

impl RequestBuilder {
    pub(crate) fn new(session: HttpSession, method: Method, url: String) -> Self {
        Self {
            session,
            method,
            url,
            headers: HeaderMap::new(),
            params: Vec::new(),
            cookies: Vec::new(),
            body: None,
            auth: None,
            proxy: None,
            overlay: None,
            acceptable_status: Vec::new(),
            raise_for_status: true,
            encoding: None,
            exception: NagareError::plugin,
            timeout: None,
            retries: 0,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            retry_max_backoff: DEFAULT_RETRY_MAX_BACKOFF,
            cancel: None,
            error: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(e) => {
                self.error = Some(NagareError::Config(format!(
                    "Invalid value for header {name}: {e}"
                )));
            }
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn params<K: Into<String>, V: Into<String>>(
        mut self,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn cookies<K: Into<String>, V: Into<String>>(
        mut self,
        cookies: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.cookies
            .extend(cookies.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn form<K: Into<String>, V: Into<String>>(
        mut self,
        data: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.body = Some(RequestBody::Form(
            data.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> Self {
        match serde_json::to_value(json) {
            Ok(value) => self.body = Some(RequestBody::Json(value)),
            Err(e) => self.error = Some(e.into()),
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.auth = Some((username.into(), password));
        self
    }

    /// Sends this request through `proxy` instead of the session proxies.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn overlay(mut self, overlay: RequestOverlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Statuses that never raise, even with `raise_for_status`.
    pub fn acceptable_status(mut self, status: impl IntoIterator<Item = StatusCode>) -> Self {
        self.acceptable_status.extend(status);
        self
    }

    pub fn raise_for_status(mut self, raise: bool) -> Self {
        self.raise_for_status = raise;
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    pub fn exception(mut self, exception: ErrorConstructor) -> Self {
        self.exception = exception;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Extra attempts after the first one.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn retry_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.retry_max_backoff = max_backoff;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn prepare(&mut self) -> NagareResult<Url> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        Ok(Url::parse(&self.url)?)
    }

    fn build(&self, url: &Url) -> NagareResult<reqwest::RequestBuilder> {
        let config = self.session.config();
        let client = match &self.proxy {
            Some(proxy) => self.session.client_with_proxy(url, proxy)?,
            None => self.session.client_for(url),
        };

        let mut request = client
            .request(self.method.clone(), url.clone())
            .timeout(self.timeout.unwrap_or(config.timeout));

        let mut headers = HeaderMap::new();
        let mut params = config.params.clone();
        if let Some(overlay) = &self.overlay {
            headers.extend(overlay.headers.clone());
            params.extend(overlay.params.iter().cloned());
        }
        headers.extend(self.headers.clone());
        params.extend(self.params.iter().cloned());
        if !params.is_empty() {
            request = request.query(&params);
        }

        let mut cookies: Vec<(String, String)> = config.cookies.into_iter().collect();
        cookies.extend(self.cookies.iter().cloned());
        if !cookies.is_empty() && !headers.contains_key(COOKIE) {
            let mut pairs = self.session.stored_cookies(url);
            pairs.extend(cookies.into_iter().map(|(k, v)| format!("{k}={v}")));
            let value = HeaderValue::from_str(&pairs.join("; "))
                .map_err(|e| NagareError::Config(format!("Invalid cookie value: {e}")))?;
            headers.insert(COOKIE, value);
        }
        request = request.headers(headers);

        request = match &self.body {
            Some(RequestBody::Form(data)) => request.form(data),
            Some(RequestBody::Json(json)) => request.json(json),
            Some(RequestBody::Raw(bytes)) => request.body(bytes.clone()),
            None => request,
        };
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, password.as_ref());
        }
        Ok(request)
    }

    fn check_status(&self, response: reqwest::Response) -> NagareResult<reqwest::Response> {
        let status = response.status();
        if self.raise_for_status
            && (status.is_client_error() || status.is_server_error())
            && !self.acceptable_status.contains(&status)
        {
            return Err(NagareError::HttpStatus {
                url: response.url().to_string(),
                status,
            });
        }
        Ok(response)
    }

    async fn cancellable<T>(&self, future: impl Future<Output = NagareResult<T>>) -> NagareResult<T> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(NagareError::Cancelled),
                result = future => result,
            },
            None => future.await,
        }
    }

    async fn retry<T, F, Fut>(&self, url: &Url, mut attempt: F) -> NagareResult<T>
    where
        F: FnMut(reqwest::RequestBuilder) -> Fut,
        Fut: Future<Output = NagareResult<T>>,
    {
        let mut failures = 0;
        loop {
            let request = self.build(url)?;
            match self.cancellable(attempt(request)).await {
                Ok(value) => return Ok(value),
                Err(NagareError::Cancelled) => return Err(NagareError::Cancelled),
                Err(err) if failures < self.retries => {
                    failures += 1;
                    let delay = backoff_delay(failures, self.retry_backoff, self.retry_max_backoff);
                    log::debug!("Request to {url} failed: {err}, retrying in {delay:?}");
                    self.cancellable(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(err) => {
                    return Err((self.exception)(
                        format!("Unable to open URL: {url} ({err})"),
                        Box::new(err),
                    ))
                }
            }
        }
    }

    /// Sends the request and reads the whole body.
    pub async fn send(mut self) -> NagareResult<HttpResponse> {
        let url = self.prepare()?;
        let this = &self;
        self.retry(&url, |request| async move {
            let response = request.send().await.map_err(NagareError::transport)?;
            let response = this.check_status(response)?;
            HttpResponse::read(response, this.encoding.clone(), &this.method).await
        })
        .await
    }

    /// Sends the request and returns before the body is read.
    pub async fn send_streamed(mut self) -> NagareResult<reqwest::Response> {
        let url = self.prepare()?;
        let this = &self;
        self.retry(&url, |request| async move {
            let response = request.send().await.map_err(NagareError::transport)?;
            this.check_status(response)
        })
        .await
    }

    pub async fn json_response<T: DeserializeOwned>(self) -> NagareResult<T> {
        self.send().await?.json()
    }

    /// Sends the request and validates the response text against `schema`.
    pub async fn validate(self, schema: &Schema) -> NagareResult<Value> {
        let exception = self.exception;
        let response = self.send().await?;
        schema
            .validate_with(&response.value(), "response text")
            .map_err(|e| exception(format!("Unable to validate response text: {e}"), Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(300);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(300));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(600));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(1200));
        assert_eq!(backoff_delay(10, base, max), max);
        assert_eq!(backoff_delay(1000, base, max), max);
    }
}
