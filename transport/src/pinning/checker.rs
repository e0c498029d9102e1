use std::collections::HashSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;

use crate::error::{HttpError, Result};
use crate::pinning::pin::{PinAlgorithm, PinEncoder, SpkiPinEncoder};
use crate::pinning::store::PinningConfiguration;

/// A certificate that survived chain cleaning: its subject name for
/// diagnostics and the raw SubjectPublicKeyInfo bytes for digesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCert {
    pub subject: String,
    pub spki: Vec<u8>,
}

/// Validates a presented certificate chain for a host and hands back the
/// cleaned chain. The concrete trust mechanism is swappable; verification
/// logic never changes with it.
pub trait ChainCleaner: Send + Sync {
    fn clean(
        &self,
        chain: &[CertificateDer<'static>],
        host: &str,
    ) -> std::result::Result<Vec<ValidatedCert>, String>;
}

/// Default cleaner: validates against the webpki (Mozilla) root set and
/// extracts subject/SPKI from the presented chain, leaf first.
pub struct WebpkiChainCleaner {
    verifier: Arc<WebPkiServerVerifier>,
}

impl WebpkiChainCleaner {
    pub fn new() -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let verifier = WebPkiServerVerifier::builder(Arc::new(root_store))
            .build()
            .map_err(|e| HttpError::Config(format!("Failed to build trust verifier: {}", e)))?;

        Ok(Self { verifier })
    }
}

impl ChainCleaner for WebpkiChainCleaner {
    fn clean(
        &self,
        chain: &[CertificateDer<'static>],
        host: &str,
    ) -> std::result::Result<Vec<ValidatedCert>, String> {
        use rustls::client::danger::ServerCertVerifier;

        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or_else(|| "Empty certificate chain".to_string())?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| format!("Invalid server name {:?}: {}", host, e))?;

        self.verifier
            .verify_server_cert(end_entity, intermediates, &server_name, &[], UnixTime::now())
            .map_err(|e| e.to_string())?;

        chain.iter().map(|der| describe(der.as_ref())).collect()
    }
}

fn describe(der: &[u8]) -> std::result::Result<ValidatedCert, String> {
    use x509_parser::prelude::*;

    let (_, certificate) =
        X509Certificate::from_der(der).map_err(|e| format!("Failed to parse certificate: {}", e))?;

    Ok(ValidatedCert {
        subject: certificate.subject().to_string(),
        spki: certificate.public_key().raw.to_vec(),
    })
}

/// Verifies a TLS session's certificate chain against the configured pins.
pub struct CertificateChecker {
    config: PinningConfiguration,
    cleaner: Arc<dyn ChainCleaner>,
    encoder: Arc<dyn PinEncoder>,
}

impl CertificateChecker {
    pub fn new(config: PinningConfiguration, cleaner: Arc<dyn ChainCleaner>) -> Self {
        Self {
            config,
            cleaner,
            encoder: Arc::new(SpkiPinEncoder),
        }
    }

    #[cfg(test)]
    fn with_encoder(
        config: PinningConfiguration,
        cleaner: Arc<dyn ChainCleaner>,
        encoder: Arc<dyn PinEncoder>,
    ) -> Self {
        Self {
            config,
            cleaner,
            encoder,
        }
    }

    /// Check the chain presented for `host`. Hosts without configured pins
    /// pass immediately; everything else must match at least one pin or the
    /// request aborts.
    pub fn check(&self, host: &str, chain: &[CertificateDer<'static>]) -> Result<()> {
        let Some(pins) = self.config.resolve(host) else {
            tracing::debug!(
                "No certificate pins configured for {}. Skipping pinning verification.",
                host
            );
            return Ok(());
        };

        let cleaned = self.cleaner.clean(chain, host).map_err(|e| {
            HttpError::Pinning(format!(
                "Failed to validate certificate chain for host {}: {}",
                host, e
            ))
        })?;

        let algorithms: HashSet<PinAlgorithm> = pins.iter().map(|p| p.algorithm()).collect();

        for certificate in &cleaned {
            for algorithm in &algorithms {
                let candidate = self.encoder.encode(*algorithm, &certificate.spki);
                let matched = pins
                    .iter()
                    .any(|pin| pin.algorithm() == *algorithm && pin.digest() == candidate.as_slice());
                if matched {
                    tracing::debug!(
                        "Certificate pin matched for {} ({})",
                        host,
                        algorithm.label()
                    );
                    return Ok(());
                }
            }
        }

        if let Some(listener) = self.config.failure_listener() {
            listener(host, &cleaned);
        }

        Err(HttpError::Pinning(self.failure_message(host, &cleaned, &algorithms)))
    }

    /// One `subject - algorithm/base64` line per chain certificate so the
    /// operator can add the correct pin.
    fn failure_message(
        &self,
        host: &str,
        chain: &[ValidatedCert],
        algorithms: &HashSet<PinAlgorithm>,
    ) -> String {
        let algorithm = if algorithms.contains(&PinAlgorithm::Sha256) {
            PinAlgorithm::Sha256
        } else {
            PinAlgorithm::Sha1
        };

        let mut message = format!(
            "Certificate pinning verification failed for host: {}. Chain:\n",
            host
        );
        for certificate in chain {
            let fingerprint = BASE64.encode(self.encoder.encode(algorithm, &certificate.spki));
            message.push_str(&format!(
                "{} - {}/{}\n",
                certificate.subject,
                algorithm.label(),
                fingerprint
            ));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinning::pin::CertificatePin;
    use crate::pinning::PinningConfigurationBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Cleaner returning a fixed chain, or an error.
    struct FixedChainCleaner {
        chain: std::result::Result<Vec<ValidatedCert>, String>,
        calls: AtomicUsize,
    }

    impl FixedChainCleaner {
        fn ok(chain: Vec<ValidatedCert>) -> Arc<Self> {
            Arc::new(Self {
                chain: Ok(chain),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                chain: Err(message.to_string()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ChainCleaner for FixedChainCleaner {
        fn clean(
            &self,
            _chain: &[CertificateDer<'static>],
            _host: &str,
        ) -> std::result::Result<Vec<ValidatedCert>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.chain.clone()
        }
    }

    /// Encoder returning the SPKI bytes unchanged, so tests control digests.
    struct IdentityEncoder;

    impl PinEncoder for IdentityEncoder {
        fn encode(&self, _algorithm: PinAlgorithm, spki: &[u8]) -> Vec<u8> {
            spki.to_vec()
        }
    }

    fn cert(subject: &str, spki: &[u8]) -> ValidatedCert {
        ValidatedCert {
            subject: subject.to_string(),
            spki: spki.to_vec(),
        }
    }

    fn sha256_pin(digest: [u8; 32]) -> String {
        format!("sha256/{}", BASE64.encode(digest))
    }

    fn checker_with(
        config: PinningConfiguration,
        cleaner: Arc<FixedChainCleaner>,
    ) -> CertificateChecker {
        CertificateChecker::with_encoder(config, cleaner, Arc::new(IdentityEncoder))
    }

    #[test]
    fn host_without_pins_skips_cleaning_entirely() {
        let cleaner = FixedChainCleaner::ok(vec![]);
        let config = PinningConfigurationBuilder::default()
            .add_pin("not-my-host.com", &sha256_pin([0; 32]))
            .build();
        let checker = checker_with(config, cleaner.clone());

        checker.check("my-url.com", &[]).unwrap();
        assert_eq!(cleaner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn matching_leaf_pin_succeeds_without_invoking_listener() {
        let digest = [7u8; 32];
        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked_in_listener = invoked.clone();

        let config = PinningConfigurationBuilder::default()
            .add_pin("my-url.com", &sha256_pin(digest))
            .failure_listener(move |_, _| {
                invoked_in_listener.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        let cleaner = FixedChainCleaner::ok(vec![cert("CN=leaf", &digest)]);
        let checker = checker_with(config, cleaner);

        checker.check("my-url.com", &[]).unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_match_invokes_listener_once_and_lists_full_chain() {
        let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_listener = seen.clone();

        let config = PinningConfigurationBuilder::default()
            .add_pin("my-url.com", &sha256_pin([9; 32]))
            .failure_listener(move |host, chain| {
                seen_in_listener
                    .lock()
                    .unwrap()
                    .push((host.to_string(), chain.len()));
            })
            .build();

        let cleaner = FixedChainCleaner::ok(vec![
            cert("CN=cert1", &[0, 1, 2, 3]),
            cert("CN=cert2", &[4, 5, 6, 7]),
        ]);
        let checker = checker_with(config, cleaner);

        let err = checker.check("my-url.com", &[]).unwrap_err();
        let message = err.to_string();

        assert!(message
            .contains("Certificate pinning verification failed for host: my-url.com. Chain:"));
        assert!(message.contains(&format!("CN=cert1 - sha256/{}", BASE64.encode([0, 1, 2, 3]))));
        assert!(message.contains(&format!("CN=cert2 - sha256/{}", BASE64.encode([4, 5, 6, 7]))));
        // Lines appear in chain order.
        let cert1_at = message.find("CN=cert1").unwrap();
        let cert2_at = message.find("CN=cert2").unwrap();
        assert!(cert1_at < cert2_at);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("my-url.com".to_string(), 2)]);
    }

    #[test]
    fn intermediate_match_is_sufficient() {
        let digest = [3u8; 32];
        let config = PinningConfigurationBuilder::default()
            .add_pin("my-url.com", &sha256_pin(digest))
            .build();

        let cleaner = FixedChainCleaner::ok(vec![
            cert("CN=leaf", &[1; 32]),
            cert("CN=intermediate", &digest),
        ]);
        let checker = checker_with(config, cleaner);

        checker.check("my-url.com", &[]).unwrap();
    }

    #[test]
    fn cleaning_failure_is_a_pinning_error() {
        let config = PinningConfigurationBuilder::default()
            .add_pin("my-url.com", &sha256_pin([0; 32]))
            .build();
        let cleaner = FixedChainCleaner::failing("chain is not trusted");
        let checker = checker_with(config, cleaner);

        let err = checker.check("my-url.com", &[]).unwrap_err();
        assert!(matches!(err, HttpError::Pinning(_)));
        assert!(err.to_string().contains("chain is not trusted"));
    }

    #[test]
    fn sha1_pins_match_under_their_own_algorithm() {
        let pin_digest = [5u8; 20];
        let config = PinningConfigurationBuilder::default()
            .add_pin(
                "my-url.com",
                &format!("sha1/{}", BASE64.encode(pin_digest)),
            )
            .build();

        assert_eq!(
            config.resolve("my-url.com").unwrap().iter().next().unwrap(),
            &CertificatePin::new(PinAlgorithm::Sha1, pin_digest.to_vec()).unwrap()
        );

        let cleaner = FixedChainCleaner::ok(vec![cert("CN=leaf", &pin_digest)]);
        let checker = checker_with(config, cleaner);
        checker.check("my-url.com", &[]).unwrap();
    }
}
