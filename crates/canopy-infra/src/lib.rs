//! Infrastructure components for Canopy
//!
//! - [`pki`]: CA and leaf certificate generation, reload and chain checks
//! - [`certificates`]: the certificate authority manager that persists
//!   certificates as secrets and reports their checksums
//! - [`kubeconfig`]: client kubeconfig derivation from a signed leaf

#![deny(missing_docs)]

pub mod certificates;
pub mod kubeconfig;
pub mod pki;

pub use certificates::{
    Certificate, CertificateManager, CertificateSecretConfig, KubeconfigRequest,
};
pub use pki::{CertificateInfo, CertificateType, KeyUsage, PkiError, SigningKey};
