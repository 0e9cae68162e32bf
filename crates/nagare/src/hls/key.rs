use std::collections::HashMap;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::m3u8::{Key, KeyMethod};
use crate::{
    error::{NagareError, NagareResult},
    http::HttpSession,
};

/// Rewrites a key URI through a template such as
/// `https://keys.example.com{path}?{query}`.
///
/// Supported placeholders: `{url}`, `{scheme}`, `{netloc}`, `{path}`,
/// `{query}`.
pub fn rewrite_key_uri(template: &str, uri: &Url) -> NagareResult<Url> {
    let netloc = match (uri.host_str(), uri.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    let rewritten = template
        .replace("{url}", uri.as_str())
        .replace("{scheme}", uri.scheme())
        .replace("{netloc}", &netloc)
        .replace("{path}", uri.path())
        .replace("{query}", uri.query().unwrap_or_default());
    Ok(uri.join(&rewritten)?)
}

/// IV of a segment: the explicit one, otherwise the media sequence number as
/// a big-endian 128-bit integer.
pub fn key_iv(key: &Key, num: u64) -> [u8; 16] {
    key.iv.unwrap_or_else(|| (num as u128).to_be_bytes())
}

/// Decrypts AES-128-CBC with PKCS#7 padding in place.
pub fn decrypt_aes128(key: &[u8; 16], iv: &[u8; 16], data: Bytes) -> NagareResult<Bytes> {
    let mut buffer = BytesMut::from(&data[..]);
    let length = cbc::Decryptor::<aes::Aes128>::new(key.into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| NagareError::UnpadError)?
        .len();
    buffer.truncate(length);
    Ok(buffer.freeze())
}

/// Resolved key bytes, cached per (URI, method) for the lifetime of a stream.
pub struct KeyCache {
    http: HttpSession,
    uri_template: Option<String>,
    keys: Mutex<HashMap<(Url, KeyMethod), [u8; 16]>>,
}

impl KeyCache {
    pub fn new(http: HttpSession, uri_template: Option<String>) -> Self {
        Self {
            http,
            uri_template,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(
        &self,
        key: &Key,
        retries: u32,
        cancel: &CancellationToken,
    ) -> NagareResult<[u8; 16]> {
        if key.method != KeyMethod::Aes128 {
            return Err(NagareError::UnsupportedCipher(key.method.to_string()));
        }
        let uri = key
            .uri
            .clone()
            .ok_or_else(|| NagareError::Protocol("AES-128 key without URI".to_string()))?;

        // Holding the lock across the fetch keeps concurrent workers from
        // requesting the same key twice.
        let mut keys = self.keys.lock().await;
        let cache_key = (uri, key.method.clone());
        if let Some(bytes) = keys.get(&cache_key) {
            return Ok(*bytes);
        }

        let uri = match &self.uri_template {
            Some(template) => rewrite_key_uri(template, &cache_key.0)?,
            None => cache_key.0.clone(),
        };
        log::debug!("Fetching key {uri}");
        let body = self
            .http
            .get(uri.as_str())
            .exception(NagareError::stream)
            .retries(retries)
            .cancel(cancel.clone())
            .send()
            .await?
            .into_bytes();
        let bytes: [u8; 16] = body
            .to_vec()
            .try_into()
            .map_err(NagareError::InvalidAes128Key)?;

        keys.insert(cache_key, bytes);
        Ok(bytes)
    }
}
