//! Certificate pinning
//!
//! Pinning is opt-in per host: a host with no configured pins skips
//! verification entirely. Pins are digests of a certificate's encoded public
//! key (SubjectPublicKeyInfo), so rotating a certificate while keeping its key
//! does not break pinned clients.

mod checker;
mod pin;
mod store;

pub use checker::{CertificateChecker, ChainCleaner, ValidatedCert, WebpkiChainCleaner};
pub use pin::{CertificatePin, PinAlgorithm, PinEncoder, SpkiPinEncoder};
pub use store::{PinningConfiguration, PinningConfigurationBuilder};
