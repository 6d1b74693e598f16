//! S3-compatible REST client
//!
//! Speaks the subset of the S3 API that bucket lifecycle management needs,
//! signed with AWS Signature Version 4. AWS S3, GCS (through its XML
//! interoperability API with HMAC keys) and Alibaba OSS all accept it.
//! Buckets are addressed virtual-hosted style unless `path_style` is set.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::hmac;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use tracing::{debug, trace};

use canopy_common::checksum::{checksum, to_hex};

use super::{ObjectPage, ObjectStorage, StorageError};

const SIGNING_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const MAX_KEYS: &str = "1000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for an S3-compatible endpoint
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Endpoint host, e.g. `s3.us-east-1.amazonaws.com`
    pub endpoint: String,
    /// Signing region
    pub region: String,
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Send a `LocationConstraint` when creating buckets
    pub location_constraint: bool,
    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`
    pub path_style: bool,
    /// Use plain HTTP (local endpoints only)
    pub insecure: bool,
}

/// HTTP client for an S3-compatible endpoint
pub struct S3Client {
    http: reqwest::Client,
    config: S3Config,
}

struct Reply {
    status: StatusCode,
    body: String,
}

impl S3Client {
    /// Build a client with request and connect timeouts
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Transport {
                operation: "client setup".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    /// The endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn target(&self, bucket: &str, key: Option<&str>) -> (String, String) {
        let object = key
            .map(|k| format!("/{}", uri_encode(k, false)))
            .unwrap_or_default();
        if self.config.path_style {
            (
                self.config.endpoint.clone(),
                format!("/{}{}", uri_encode(bucket, true), object),
            )
        } else {
            let path = if object.is_empty() { "/".to_string() } else { object };
            (format!("{}.{}", bucket, self.config.endpoint), path)
        }
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<Reply, StorageError> {
        let (host, path) = self.target(bucket, key);
        let query: BTreeMap<String, String> = query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        let canonical_query = canonical_query(&query);

        let payload_hash = checksum(&body);
        let headers = sign(
            &self.config,
            &SigningInput {
                method: method.as_str(),
                host: &host,
                path: &path,
                canonical_query: &canonical_query,
                payload_hash: &payload_hash,
            },
            Utc::now(),
        );

        let scheme = if self.config.insecure { "http" } else { "https" };
        let url = if canonical_query.is_empty() {
            format!("{scheme}://{host}{path}")
        } else {
            format!("{scheme}://{host}{path}?{canonical_query}")
        };
        trace!(operation, %url, "object storage request");

        let mut request = self.http.request(method, &url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| StorageError::Transport {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| StorageError::Transport {
            operation: operation.to_string(),
            message: e.to_string(),
        })?;
        debug!(operation, bucket, status = status.as_u16(), "object storage response");
        Ok(Reply { status, body })
    }
}

#[async_trait]
impl ObjectStorage for S3Client {
    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), StorageError> {
        let body = if self.config.location_constraint && region != "us-east-1" {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{region}</LocationConstraint>\
                 </CreateBucketConfiguration>"
            )
            .into_bytes()
        } else {
            Vec::new()
        };
        let reply = self
            .send("CreateBucket", Method::PUT, bucket, None, &[], body)
            .await?;
        if reply.status.is_success() {
            return Ok(());
        }
        match error_code(&reply.body).as_deref() {
            Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists") => {
                Err(StorageError::BucketAlreadyExists {
                    bucket: bucket.to_string(),
                })
            }
            _ => Err(service_error("CreateBucket", &reply)),
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let reply = self
            .send("DeleteBucket", Method::DELETE, bucket, None, &[], Vec::new())
            .await?;
        if reply.status.is_success() {
            return Ok(());
        }
        match error_code(&reply.body).as_deref() {
            Some("NoSuchBucket") => Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            Some("BucketNotEmpty") => Err(StorageError::BucketNotEmpty {
                bucket: bucket.to_string(),
            }),
            _ if reply.status == StatusCode::NOT_FOUND => Err(StorageError::BucketNotFound {
                bucket: bucket.to_string(),
            }),
            _ => Err(service_error("DeleteBucket", &reply)),
        }
    }

    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        let reply = self
            .send("HeadBucket", Method::HEAD, bucket, None, &[], Vec::new())
            .await?;
        match reply.status {
            s if s.is_success() => Ok(true),
            s if s == StatusCode::NOT_FOUND => Ok(false),
            _ => Err(service_error("HeadBucket", &reply)),
        }
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage, StorageError> {
        let mut query = vec![("list-type", "2"), ("max-keys", MAX_KEYS)];
        if let Some(token) = continuation.as_deref() {
            query.push(("continuation-token", token));
        }
        let reply = self
            .send("ListObjectsV2", Method::GET, bucket, None, &query, Vec::new())
            .await?;
        if !reply.status.is_success() {
            return match error_code(&reply.body).as_deref() {
                Some("NoSuchBucket") => Err(StorageError::BucketNotFound {
                    bucket: bucket.to_string(),
                }),
                _ => Err(service_error("ListObjectsV2", &reply)),
            };
        }
        parse_list_page(&reply.body)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let reply = self
            .send("DeleteObject", Method::DELETE, bucket, Some(key), &[], Vec::new())
            .await?;
        if reply.status.is_success() || reply.status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(service_error("DeleteObject", &reply))
    }
}

fn service_error(operation: &str, reply: &Reply) -> StorageError {
    StorageError::Service {
        operation: operation.to_string(),
        status: reply.status.as_u16(),
        code: error_code(&reply.body).unwrap_or_else(|| "Unknown".to_string()),
        message: xml_values(&reply.body, "Message")
            .into_iter()
            .next()
            .unwrap_or_default(),
    }
}

fn error_code(body: &str) -> Option<String> {
    xml_values(body, "Code").into_iter().next()
}

fn parse_list_page(body: &str) -> Result<ObjectPage, StorageError> {
    if !body.contains("<ListBucketResult") {
        return Err(StorageError::InvalidResponse {
            operation: "ListObjectsV2".to_string(),
            message: "missing ListBucketResult element".to_string(),
        });
    }
    let truncated = xml_values(body, "IsTruncated")
        .first()
        .is_some_and(|v| v == "true");
    let continuation = if truncated {
        let token = xml_values(body, "NextContinuationToken").into_iter().next();
        if token.is_none() {
            return Err(StorageError::InvalidResponse {
                operation: "ListObjectsV2".to_string(),
                message: "truncated listing without NextContinuationToken".to_string(),
            });
        }
        token
    } else {
        None
    };
    Ok(ObjectPage {
        keys: xml_values(body, "Key"),
        continuation,
    })
}

/// Text content of every `<tag>` element, entity-decoded
fn xml_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

/// Decode predefined and numeric character references in one pass
///
/// Unknown or malformed references are kept verbatim.
fn xml_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "amp" => Some('&'),
        _ => {
            let reference = entity.strip_prefix('#')?;
            let code = match reference.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => reference.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// RFC 3986 encoding as SigV4 requires it
///
/// Unreserved characters pass through. `/` is kept when encoding object
/// key paths and escaped everywhere else.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn canonical_query(encoded: &BTreeMap<String, String>) -> String {
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

struct SigningInput<'a> {
    method: &'a str,
    host: &'a str,
    path: &'a str,
    canonical_query: &'a str,
    payload_hash: &'a str,
}

/// Headers that authenticate one request
fn sign(
    config: &S3Config,
    input: &SigningInput<'_>,
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", config.region);
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        input.method,
        input.path,
        input.canonical_query,
        input.host,
        input.payload_hash,
        amz_date,
        signed_headers,
        input.payload_hash,
    );
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        checksum(canonical_request.as_bytes())
    );

    let key = signing_key(&config.secret_access_key, &date, &config.region, SERVICE);
    let signature = to_hex(hmac::sign(&key, string_to_sign.as_bytes()).as_ref());

    vec![
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", input.payload_hash.to_string()),
        (
            "authorization",
            format!(
                "{SIGNING_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                config.access_key_id
            ),
        ),
    ]
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> hmac::Key {
    let step = |key: &[u8], data: &str| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, key);
        hmac::sign(&key, data.as_bytes())
    };
    let k_date = step(format!("AWS4{secret}").as_bytes(), date);
    let k_region = step(k_date.as_ref(), region);
    let k_service = step(k_region.as_ref(), service);
    let k_signing = step(k_service.as_ref(), "aws4_request");
    hmac::Key::new(hmac::HMAC_SHA256, k_signing.as_ref())
}
