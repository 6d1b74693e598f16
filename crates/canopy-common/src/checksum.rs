//! Content checksums for rolling restarts
//!
//! Every secret and config map a workload mounts is hashed, and the hashes
//! land on the pod template as `checksum/<key>` annotations. When content
//! changes the annotation changes, and the workload controller rolls the pods.
//!
//! The full SHA-256 is kept. A collision would suppress a restart of a
//! stateful workload.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{Context, SHA256};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};

use crate::CHECKSUM_ANNOTATION_PREFIX;

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// SHA-256 of raw content as lowercase hex
pub fn checksum(content: &[u8]) -> String {
    let mut ctx = Context::new(&SHA256);
    ctx.update(content);
    to_hex(ctx.finish().as_ref())
}

/// Length-framed canonical encoding of labeled maps
///
/// Each field is prefixed with its byte length, so `{"ab": "c"}` and
/// `{"a": "bc"}` never encode the same.
struct Canonical {
    ctx: Context,
}

impl Canonical {
    fn new(kind: &str) -> Self {
        let mut c = Self {
            ctx: Context::new(&SHA256),
        };
        c.field(kind.as_bytes());
        c
    }

    fn field(&mut self, bytes: &[u8]) {
        self.ctx.update(&(bytes.len() as u64).to_be_bytes());
        self.ctx.update(bytes);
    }

    fn section<'a>(&mut self, name: &str, entries: impl Iterator<Item = (&'a str, &'a [u8])>) {
        self.field(name.as_bytes());
        for (k, v) in entries {
            self.field(k.as_bytes());
            self.field(v);
        }
    }

    fn finish(self) -> String {
        to_hex(self.ctx.finish().as_ref())
    }
}

/// Checksum over a secret's type and data
///
/// `data` and `stringData` are hashed in key order.
pub fn checksum_secret(secret: &Secret) -> String {
    let mut c = Canonical::new("Secret");
    c.field(secret.type_.as_deref().unwrap_or("Opaque").as_bytes());
    if let Some(data) = &secret.data {
        c.section("data", data.iter().map(|(k, v)| (k.as_str(), v.0.as_slice())));
    }
    if let Some(data) = &secret.string_data {
        c.section(
            "stringData",
            data.iter().map(|(k, v)| (k.as_str(), v.as_bytes())),
        );
    }
    c.finish()
}

/// Checksum over a config map's data and binaryData
pub fn checksum_config_map(config_map: &ConfigMap) -> String {
    let mut c = Canonical::new("ConfigMap");
    if let Some(data) = &config_map.data {
        c.section("data", data.iter().map(|(k, v)| (k.as_str(), v.as_bytes())));
    }
    if let Some(data) = &config_map.binary_data {
        c.section(
            "binaryData",
            data.iter().map(|(k, v)| (k.as_str(), v.0.as_slice())),
        );
    }
    c.finish()
}

/// Logical artifact key to content hash, for one workload role
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumMap {
    entries: BTreeMap<String, String>,
}

impl ChecksumMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hash for an artifact, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, hash: impl Into<String>) {
        self.entries.insert(key.into(), hash.into());
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, key: impl Into<String>, hash: impl Into<String>) -> Self {
        self.insert(key, hash);
        self
    }

    /// Hash recorded for an artifact
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of tracked artifacts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pod-template annotations, `checksum/<key>` to hash
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (format!("{}{}", CHECKSUM_ANNOTATION_PREFIX, k), v.clone()))
            .collect()
    }
}

impl Extend<(String, String)> for ChecksumMap {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        self.entries.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret(entries: &[(&str, &[u8])]) -> Secret {
        Secret {
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn checksum_is_full_sha256() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum(b"abc").len(), 64);
    }

    #[test]
    fn checksum_is_deterministic_and_sensitive() {
        assert_eq!(checksum(b"tls.crt"), checksum(b"tls.crt"));
        assert_ne!(checksum(b"tls.crt"), checksum(b"tls.crt "));
    }

    #[test]
    fn secret_checksum_ignores_metadata() {
        let mut a = secret(&[("tls.crt", b"cert"), ("tls.key", b"key")]);
        let b = secret(&[("tls.key", b"key"), ("tls.crt", b"cert")]);
        a.metadata.resource_version = Some("42".to_string());
        assert_eq!(checksum_secret(&a), checksum_secret(&b));
    }

    #[test]
    fn secret_checksum_frames_entries() {
        let a = secret(&[("ab", b"c")]);
        let b = secret(&[("a", b"bc")]);
        assert_ne!(checksum_secret(&a), checksum_secret(&b));
    }

    #[test]
    fn secret_type_is_hashed() {
        let a = secret(&[("ca.crt", b"cert")]);
        let mut b = a.clone();
        b.type_ = Some("Opaque".to_string());
        assert_ne!(checksum_secret(&a), checksum_secret(&b));
    }

    #[test]
    fn config_map_checksum_tracks_data() {
        let mut cm = ConfigMap {
            data: Some(BTreeMap::from([(
                "audit-policy.yaml".to_string(),
                "rules: []".to_string(),
            )])),
            ..Default::default()
        };
        let before = checksum_config_map(&cm);
        cm.data
            .as_mut()
            .unwrap()
            .insert("audit-policy.yaml".to_string(), "rules: [x]".to_string());
        assert_ne!(before, checksum_config_map(&cm));
    }

    #[test]
    fn annotations_are_prefixed() {
        let map = ChecksumMap::new()
            .with("etcd-server-tls", "abc")
            .with("etcd-ca", "def");
        let annotations = map.annotations();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations["checksum/etcd-ca"], "def");
        assert_eq!(annotations["checksum/etcd-server-tls"], "abc");
    }
}
