use std::sync::Arc;

use rustls::{crypto::CryptoProvider, ClientConfig, RootCertStore};

use crate::error::{NagareError, NagareResult};

/// TLS policy mounted on a URL prefix of an [`HttpSession`](super::HttpSession).
///
/// The ring provider of rustls ships neither SHA-1 MAC nor finite-field DHE
/// suites, so all three adapters currently build the same suite list. They
/// only diverge under a provider that offers such suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TlsAdapter {
    /// Provider suites without SHA-1 MACs.
    #[default]
    Default,
    /// Like `Default`, additionally without Diffie-Hellman key exchange.
    NoDh,
    /// Every suite the provider offers, for servers stuck on legacy setups.
    SecLevel1,
}

impl TlsAdapter {
    pub fn allows(&self, suite: &str) -> bool {
        match self {
            TlsAdapter::Default => !is_sha1(suite),
            TlsAdapter::NoDh => !is_sha1(suite) && !is_dh(suite),
            TlsAdapter::SecLevel1 => true,
        }
    }

    pub fn client_config(&self) -> NagareResult<ClientConfig> {
        let provider = rustls::crypto::ring::default_provider();
        let cipher_suites = provider
            .cipher_suites
            .iter()
            .copied()
            .filter(|suite| self.allows(&format!("{:?}", suite.suite())))
            .collect();
        let provider = CryptoProvider {
            cipher_suites,
            ..provider
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            log::debug!("Failed to load a native certificate: {error}");
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {added} native root certificates ({ignored} ignored)");

        let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| NagareError::Config(format!("TLS configuration: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn is_sha1(suite: &str) -> bool {
    suite.ends_with("_SHA")
}

fn is_dh(suite: &str) -> bool {
    suite.contains("_DHE_") || suite.contains("_DH_")
}
