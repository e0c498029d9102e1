use std::collections::HashSet;
use std::sync::Arc;

use crate::error::HttpError;
use crate::pinning::checker::ValidatedCert;
use crate::pinning::pin::{CertificatePin, PinAlgorithm, PinEncoder, SpkiPinEncoder};

pub type FailureListener = Arc<dyn Fn(&str, &[ValidatedCert]) + Send + Sync>;

/// Immutable per-host pin configuration, built once at SDK start.
///
/// Host patterns come in three forms: an exact host, `*.suffix` (exactly one
/// extra label) and `**.suffix` (zero or more extra labels). All patterns
/// matching a host contribute their pins.
#[derive(Clone)]
pub struct PinningConfiguration {
    // Insertion-ordered; empty pin sets are never stored.
    pins: Vec<(String, HashSet<CertificatePin>)>,
    failure_listener: Option<FailureListener>,
}

impl PinningConfiguration {
    pub fn builder() -> PinningConfigurationBuilder {
        PinningConfigurationBuilder::default()
    }

    /// Union of the pin sets of every pattern matching `host`, or `None` when
    /// no pattern matches at all.
    pub fn resolve(&self, host: &str) -> Option<HashSet<CertificatePin>> {
        let mut matched = false;
        let mut result = HashSet::new();

        for (pattern, pins) in &self.pins {
            if host_matches(pattern, host) {
                matched = true;
                result.extend(pins.iter().cloned());
            }
        }

        matched.then_some(result)
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub(crate) fn failure_listener(&self) -> Option<&FailureListener> {
        self.failure_listener.as_ref()
    }
}

impl std::fmt::Debug for PinningConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinningConfiguration")
            .field("patterns", &self.pins.iter().map(|(h, _)| h).collect::<Vec<_>>())
            .field("failure_listener", &self.failure_listener.is_some())
            .finish()
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("**.") {
        // Zero or more leading labels.
        host == suffix || host.ends_with(&format!(".{}", suffix))
    } else if let Some(suffix) = pattern.strip_prefix("*.") {
        // Exactly one leading label.
        match host.strip_suffix(&format!(".{}", suffix)) {
            Some(prefix) => !prefix.is_empty() && !prefix.contains('.'),
            None => false,
        }
    } else {
        pattern == host
    }
}

/// Builder for `PinningConfiguration`. Invalid entries are logged and skipped
/// so one bad pin cannot take down SDK initialization.
#[derive(Default)]
pub struct PinningConfigurationBuilder {
    pins: Vec<(String, HashSet<CertificatePin>)>,
    failure_listener: Option<FailureListener>,
}

impl PinningConfigurationBuilder {
    /// Add a pin in `"[algorithm]/[base64-hash]"` notation for a host pattern.
    pub fn add_pin(mut self, host: &str, pin: &str) -> Self {
        if host.trim().is_empty() {
            tracing::error!("Host cannot be empty. Ignoring pin entry");
            return self;
        }

        match CertificatePin::parse(pin) {
            Ok(parsed) => self.entry(host).insert(parsed),
            Err(e) => {
                tracing::error!("Ignoring pin entry for host {}: {}", host, e);
                return self;
            }
        };
        self
    }

    /// Derive one SHA-256 pin per certificate found in a PEM bundle.
    pub fn add_pins_from_pem(mut self, host: &str, pem: &str) -> Self {
        if host.trim().is_empty() {
            tracing::error!("Host cannot be empty. Ignoring pin entry");
            return self;
        }

        let certificates = match crate::tls::load_certificates(pem) {
            Ok(certificates) => certificates,
            Err(e) => {
                tracing::error!("No pins derived from PEM data for host {}: {}", host, e);
                return self;
            }
        };

        let encoder = SpkiPinEncoder;
        let mut derived = Vec::new();
        for certificate in &certificates {
            match spki_of(certificate.as_ref()) {
                Ok(spki) => {
                    let digest = encoder.encode(PinAlgorithm::Sha256, &spki);
                    // SHA-256 output always has the right length.
                    if let Ok(pin) = CertificatePin::new(PinAlgorithm::Sha256, digest) {
                        derived.push(pin);
                    }
                }
                Err(e) => {
                    tracing::error!("Skipping unparseable certificate for host {}: {}", host, e);
                }
            }
        }

        if derived.is_empty() {
            tracing::error!("No pins found in PEM data. Ignoring entry for host {}", host);
            return self;
        }

        let entry = self.entry(host);
        entry.extend(derived);
        self
    }

    /// Listener invoked with `(host, cleaned chain)` when pin verification
    /// fails, synchronously, before the failure is raised.
    pub fn failure_listener(
        mut self,
        listener: impl Fn(&str, &[ValidatedCert]) + Send + Sync + 'static,
    ) -> Self {
        self.failure_listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> PinningConfiguration {
        PinningConfiguration {
            pins: self
                .pins
                .into_iter()
                .filter(|(_, pins)| !pins.is_empty())
                .collect(),
            failure_listener: self.failure_listener,
        }
    }

    fn entry(&mut self, host: &str) -> &mut HashSet<CertificatePin> {
        if let Some(index) = self.pins.iter().position(|(h, _)| h == host) {
            return &mut self.pins[index].1;
        }
        self.pins.push((host.to_string(), HashSet::new()));
        let last = self.pins.len() - 1;
        &mut self.pins[last].1
    }
}

fn spki_of(der: &[u8]) -> std::result::Result<Vec<u8>, HttpError> {
    use x509_parser::prelude::*;

    let (_, certificate) = X509Certificate::from_der(der)
        .map_err(|e| HttpError::Config(format!("Failed to parse certificate: {}", e)))?;
    Ok(certificate.public_key().raw.to_vec())
}
