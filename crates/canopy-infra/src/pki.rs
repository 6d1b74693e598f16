//! Certificate generation and inspection
//!
//! Canopy runs its own small PKI per instance: a self-signed CA for the
//! data store peers, one for the front-end API, and leaves signed by them.
//! Keys and certificates only ever leave this module as PEM strings, which
//! is also how they are persisted, so a reload sees exactly the bytes that
//! were generated.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity period for CA certificates
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for leaf certificates
pub const CERT_VALIDITY_YEARS: i64 = 1;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair could not be generated or loaded
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate could not be built or signed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// PEM or DER input could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// A SAN is not a valid DNS name
    #[error("invalid DNS name '{name}': {message}")]
    InvalidDnsName {
        /// The offending name
        name: String,
        /// Parser message
        message: String,
    },

    /// Kubeconfig could not be rendered or parsed
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Leaf signature does not verify against the CA key
    #[error("certificate {subject} is not signed by CA {ca}")]
    NotSignedBy {
        /// Leaf subject CN
        subject: String,
        /// CA subject CN
        ca: String,
    },
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Role of a certificate in the chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CertificateType {
    /// Self-signed certificate authority
    Ca,
    /// TLS server leaf
    Server,
    /// TLS client leaf
    Client,
    /// Leaf used for both sides of mutual TLS between cluster members
    Peer,
}

impl CertificateType {
    /// True for leaves, which need a signing CA
    pub fn is_leaf(self) -> bool {
        !matches!(self, CertificateType::Ca)
    }

    /// Key usages stamped on certificates of this type
    pub fn key_usages(self) -> Vec<KeyUsage> {
        match self {
            CertificateType::Ca => vec![
                KeyUsage::CertSign,
                KeyUsage::CrlSign,
                KeyUsage::DigitalSignature,
            ],
            CertificateType::Server => vec![
                KeyUsage::DigitalSignature,
                KeyUsage::KeyEncipherment,
                KeyUsage::ServerAuth,
            ],
            CertificateType::Client => vec![
                KeyUsage::DigitalSignature,
                KeyUsage::KeyEncipherment,
                KeyUsage::ClientAuth,
            ],
            CertificateType::Peer => vec![
                KeyUsage::DigitalSignature,
                KeyUsage::KeyEncipherment,
                KeyUsage::ServerAuth,
                KeyUsage::ClientAuth,
            ],
        }
    }
}

/// Key usage and extended key usage flags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    /// digitalSignature
    DigitalSignature,
    /// keyEncipherment
    KeyEncipherment,
    /// keyCertSign
    CertSign,
    /// cRLSign
    CrlSign,
    /// extended: serverAuth
    ServerAuth,
    /// extended: clientAuth
    ClientAuth,
}

fn apply_key_usages(params: &mut CertificateParams, usages: &[KeyUsage]) {
    for usage in usages {
        match usage {
            KeyUsage::DigitalSignature => params.key_usages.push(KeyUsagePurpose::DigitalSignature),
            KeyUsage::KeyEncipherment => params.key_usages.push(KeyUsagePurpose::KeyEncipherment),
            KeyUsage::CertSign => params.key_usages.push(KeyUsagePurpose::KeyCertSign),
            KeyUsage::CrlSign => params.key_usages.push(KeyUsagePurpose::CrlSign),
            KeyUsage::ServerAuth => params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth),
            KeyUsage::ClientAuth => params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ClientAuth),
        }
    }
}

/// Subject and SANs of a certificate to generate
#[derive(Clone, Debug, Default)]
pub struct SubjectParams {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations (client certs map these to groups)
    pub organizations: Vec<String>,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
}

fn build_params(subject: &SubjectParams, years: i64) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(subject.common_name.clone()),
    );
    for org in &subject.organizations {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    let (not_before, not_after) = compute_validity(years);
    params.not_before = not_before;
    params.not_after = not_after;

    let mut sans = Vec::with_capacity(subject.dns_names.len() + subject.ip_addresses.len());
    for name in &subject.dns_names {
        let dns = Ia5String::try_from(name.clone()).map_err(|e| PkiError::InvalidDnsName {
            name: name.clone(),
            message: e.to_string(),
        })?;
        sans.push(SanType::DnsName(dns));
    }
    sans.extend(subject.ip_addresses.iter().copied().map(SanType::IpAddress));
    params.subject_alt_names = sans;

    Ok(params)
}

/// PEM-encoded certificate and private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PemPair {
    /// Certificate PEM
    pub certificate_pem: String,
    /// PKCS#8 private key PEM
    pub private_key_pem: String,
}

/// Generate a self-signed CA
pub fn generate_ca(subject: &SubjectParams) -> Result<PemPair> {
    let mut params = build_params(subject, CA_VALIDITY_YEARS)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    apply_key_usages(&mut params, &CertificateType::Ca.key_usages());

    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
    })?;
    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
    })?;

    Ok(PemPair {
        certificate_pem: cert.pem(),
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Generate a leaf of `certificate_type` signed by the given CA
pub fn generate_signed(
    subject: &SubjectParams,
    certificate_type: CertificateType,
    ca: &PemPair,
) -> Result<PemPair> {
    let mut params = build_params(subject, CERT_VALIDITY_YEARS)?;
    params.is_ca = IsCa::NoCa;
    apply_key_usages(&mut params, &certificate_type.key_usages());

    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
    })?;

    let ca_key = load_key_pair(&ca.private_key_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&ca.certificate_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!(
            "failed to sign {}: {}",
            subject.common_name, e
        ))
    })?;

    Ok(PemPair {
        certificate_pem: cert.pem(),
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Token signing key pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKey {
    /// PKCS#8 private key PEM
    pub private_key_pem: String,
    /// SubjectPublicKeyInfo PEM
    pub public_key_pem: String,
}

/// Generate a key pair for signing service account tokens
pub fn generate_signing_key() -> Result<SigningKey> {
    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate signing key: {}", e))
    })?;
    Ok(SigningKey {
        private_key_pem: key_pair.serialize_pem(),
        public_key_pem: key_pair.public_key_pem(),
    })
}

/// Rebuild a signing key from its stored private key
pub fn load_signing_key(private_key_pem: &str) -> Result<SigningKey> {
    let key_pair = load_key_pair(private_key_pem)?;
    Ok(SigningKey {
        private_key_pem: private_key_pem.to_string(),
        public_key_pem: key_pair.public_key_pem(),
    })
}

/// Parse and validate a stored private key
pub fn load_key_pair(key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::ParseError(format!("failed to load private key: {}", e)))
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn first_common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Fields of a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// Issuer common name
    pub issuer_common_name: String,
    /// basicConstraints CA flag
    pub is_ca: bool,
    /// DNS SANs
    pub dns_names: Vec<String>,
    /// IP SANs
    pub ip_addresses: Vec<IpAddr>,
    /// Start of validity (Unix timestamp)
    pub not_before: i64,
    /// End of validity (Unix timestamp)
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse certificate info from PEM
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .is_some_and(|bc| bc.value.ca);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            common_name: first_common_name(cert.subject()),
            issuer_common_name: first_common_name(cert.issuer()),
            is_ca,
            dns_names,
            ip_addresses,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// Verify that `leaf_pem` carries a valid signature from the CA in `ca_pem`
pub fn verify_signed_by(leaf_pem: &str, ca_pem: &str) -> Result<()> {
    let leaf_der = parse_pem(leaf_pem)?;
    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse leaf: {}", e)))?;
    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA: {}", e)))?;

    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|_| PkiError::NotSignedBy {
            subject: first_common_name(leaf.subject()),
            ca: first_common_name(ca.subject()),
        })
}
