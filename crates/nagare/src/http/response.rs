use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{
    error::{NagareError, NagareResult},
    validate::{Value, XmlElement},
};

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    encoding: Option<String>,
}

impl HttpResponse {
    pub(crate) async fn read(
        response: reqwest::Response,
        encoding: Option<String>,
        method: &Method,
    ) -> NagareResult<Self> {
        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        let expected = if *method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            None
        } else {
            response.content_length()
        };

        let body = response.bytes().await.map_err(NagareError::transport)?;
        check_content_length(&url, expected, body.len() as u64)?;

        Ok(Self {
            status,
            url,
            headers,
            body,
            encoding,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    fn charset(&self) -> Option<String> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type.split(';').find_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            key.eq_ignore_ascii_case("charset")
                .then(|| value.trim_matches('"').to_string())
        })
    }

    /// Body decoded with the explicit encoding, else the declared charset,
    /// else UTF-8.
    pub fn text(&self) -> String {
        let encoding = self
            .encoding
            .clone()
            .or_else(|| self.charset())
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> NagareResult<T> {
        match self.encoding {
            Some(_) => Ok(serde_json::from_str(&self.text())?),
            None => parse_json(&self.body),
        }
    }

    pub fn xml(&self) -> NagareResult<XmlElement> {
        parse_xml(&self.text())
    }

    pub fn value(&self) -> Value {
        Value::Str(self.text())
    }
}

pub(crate) fn check_content_length(url: &Url, expected: Option<u64>, actual: u64) -> NagareResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(NagareError::IncompleteRead {
            url: url.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Parses JSON from raw bytes, skipping a UTF-8 byte order mark.
pub fn parse_json<T: DeserializeOwned>(data: &[u8]) -> NagareResult<T> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    Ok(serde_json::from_slice(data)?)
}

pub fn parse_xml(data: &str) -> NagareResult<XmlElement> {
    XmlElement::parse(data).map_err(|e| NagareError::Plugin {
        message: format!("Unable to parse XML: {e}"),
        source: None,
    })
}
