//! Object store adapters and the document key layout.
//!
//! Every stored revision of a document is one object:
//!
//! ```text
//! documents/{id}/v{version:010}.json
//! ```
//!
//! The zero-padded version makes lexical key order equal version order, so
//! the latest revision is the last key under `documents/{id}/`.
//!
//! # Adapters
//!
//! | Adapter | Create-only write |
//! |---------|-------------------|
//! | [`FsObjectStore`] | write a temp file, then `hard_link` it into place (fails if the key exists) |
//! | [`S3ObjectStore`] | `PUT` with `If-None-Match: *`; HTTP 412 means the key exists |
//!
//! # S3 authentication
//!
//! Requests are signed with AWS Signature Version 4 using `hmac` + `sha2`.
//! Credentials are read from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
//! and optionally `AWS_SESSION_TOKEN`. A custom `endpoint_url` (MinIO,
//! LocalStack) switches to path-style addressing.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use walkdir::WalkDir;

use memory_agent_core::store::{ObjectStore, PutOutcome};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::config::ObjectStoreConfig;

type HmacSha256 = Hmac<Sha256>;

/// Prefix under which all document revisions live.
pub const DOCUMENTS_PREFIX: &str = "documents/";

/// Key prefix holding every revision of one document.
pub fn document_prefix(document_id: &str) -> String {
    format!("{DOCUMENTS_PREFIX}{document_id}/")
}

/// Object key of one revision.
pub fn object_key(document_id: &str, version: u64) -> String {
    format!("{DOCUMENTS_PREFIX}{document_id}/v{version:010}.json")
}

/// Split a revision key into `(document_id, version)`.
pub fn parse_object_key(key: &str) -> Option<(&str, u64)> {
    let rest = key.strip_prefix(DOCUMENTS_PREFIX)?;
    let (id, file) = rest.split_once('/')?;
    let digits = file.strip_prefix('v')?.strip_suffix(".json")?;
    if id.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((id, digits.parse().ok()?))
}

fn io_error(action: &str, key: &str, err: std::io::Error) -> MemoryError {
    MemoryError::transient(format!("object store {action} '{key}': {err}"))
}

// ============ Filesystem ============

/// Object store rooted at a local directory. Keys map to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> MemoryResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(MemoryError::validation(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(key))
    }

    async fn write_temp(&self, path: &Path, key: &str, body: &[u8]) -> MemoryResult<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| MemoryError::internal(format!("object key without parent: {key}")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("mkdir", key, e))?;
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_error("write", key, e))?;
        Ok(tmp)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> MemoryResult<()> {
        let path = self.path_for(key)?;
        let tmp = self.write_temp(&path, key, &body).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", key, e))
    }

    async fn put_if_absent(&self, key: &str, body: Vec<u8>) -> MemoryResult<PutOutcome> {
        let path = self.path_for(key)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(PutOutcome::Exists);
        }
        let tmp = self.write_temp(&path, key, &body).await?;
        // hard_link fails atomically when the target exists.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(PutOutcome::Created),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(PutOutcome::Exists),
            Err(e) => Err(io_error("link", key, e)),
        }
    }

    async fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> MemoryResult<Vec<String>> {
        // Walk only the deepest directory the prefix names.
        let dir = match prefix.rfind('/') {
            Some(i) => self.root.join(&prefix[..i]),
            None => self.root.clone(),
        };
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> MemoryResult<Vec<String>> {
            let mut keys = Vec::new();
            if !dir.is_dir() {
                return Ok(keys);
            }
            for entry in WalkDir::new(&dir) {
                let entry = entry.map_err(|e| MemoryError::transient(format!("object store list: {e}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(".tmp-") {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| MemoryError::internal(format!("object store list task: {e}")))?
    }

    async fn delete(&self, key: &str) -> MemoryResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", key, e)),
        }
    }
}

// ============ S3 ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Object store over an S3 bucket via the REST API.
pub struct S3ObjectStore {
    client: reqwest::Client,
    creds: AwsCredentials,
    bucket: String,
    /// Prepended to every key; stripped again on list.
    prefix: String,
    region: String,
    endpoint_url: Option<String>,
}

impl S3ObjectStore {
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .context("object_store.bucket must be set for the s3 store")?;
        Ok(Self {
            client: reqwest::Client::new(),
            creds: AwsCredentials::from_env()?,
            bucket,
            prefix: config.prefix.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }

    /// `(scheme, host, path prefix)`; path-style for custom endpoints.
    fn location(&self) -> (String, String, String) {
        match &self.endpoint_url {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, format!("/{}", uri_encode(&self.bucket)))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                String::new(),
            ),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Build and sign a request. `key` of `None` addresses the bucket root.
    fn signed(
        &self,
        method: reqwest::Method,
        key: Option<&str>,
        query: &[(String, String)],
        body: &[u8],
        extra_headers: &[(&str, &str)],
    ) -> MemoryResult<reqwest::RequestBuilder> {
        let (scheme, host, base_path) = self.location();
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", base_path, encoded_key);

        let mut sorted_params = query.to_vec();
        sorted_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (name, value) in extra_headers {
            headers.push((name.to_ascii_lowercase(), value.to_string()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        Ok(builder)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> MemoryResult<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| MemoryError::transient(format!("S3 {what}: {e}")))
    }
}

/// Map an unexpected S3 status to an error. Throttling and server errors
/// are transient.
fn s3_status_error(what: &str, status: StatusCode, body: &str) -> MemoryError {
    let detail = format!(
        "S3 {what} failed (HTTP {status}): {}",
        body.chars().take(500).collect::<String>()
    );
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MemoryError::transient(detail)
    } else {
        MemoryError::internal(detail)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> MemoryResult<()> {
        let full = self.full_key(key);
        let builder = self.signed(reqwest::Method::PUT, Some(&full), &[], &body, &[])?;
        let resp = self.send(builder.body(body), "PutObject").await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(s3_status_error("PutObject", status, &text));
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, body: Vec<u8>) -> MemoryResult<PutOutcome> {
        let full = self.full_key(key);
        let builder = self.signed(
            reqwest::Method::PUT,
            Some(&full),
            &[],
            &body,
            &[("If-None-Match", "*")],
        )?;
        let resp = self.send(builder.body(body), "PutObject").await?;
        match resp.status() {
            s if s.is_success() => Ok(PutOutcome::Created),
            StatusCode::PRECONDITION_FAILED => Ok(PutOutcome::Exists),
            // A concurrent conditional write is still in flight; try again.
            StatusCode::CONFLICT => Err(MemoryError::transient(format!(
                "S3 conditional write conflict on '{key}'"
            ))),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(s3_status_error("PutObject", status, &text))
            }
        }
    }

    async fn get(&self, key: &str) -> MemoryResult<Option<Vec<u8>>> {
        let full = self.full_key(key);
        let builder = self.signed(reqwest::Method::GET, Some(&full), &[], b"", &[])?;
        let resp = self.send(builder, "GetObject").await?;
        match resp.status() {
            s if s.is_success() => {
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| MemoryError::transient(format!("S3 GetObject body: {e}")))?;
                Ok(Some(bytes.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(s3_status_error("GetObject", status, &text))
            }
        }
    }

    async fn list(&self, prefix: &str) -> MemoryResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), full_prefix.clone()),
            ];
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let builder = self.signed(reqwest::Method::GET, None, &query_params, b"", &[])?;
            let resp = self.send(builder, "ListObjectsV2").await?;
            let status = resp.status();
            let xml_body = resp
                .text()
                .await
                .map_err(|e| MemoryError::transient(format!("S3 ListObjectsV2 body: {e}")))?;
            if !status.is_success() {
                return Err(s3_status_error("ListObjectsV2", status, &xml_body));
            }

            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string)),
            );

            if is_truncated && next_token.is_some() {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> MemoryResult<()> {
        let full = self.full_key(key);
        let builder = self.signed(reqwest::Method::DELETE, Some(&full), &[], b"", &[])?;
        let resp = self.send(builder, "DeleteObject").await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(s3_status_error("DeleteObject", status, &text))
            }
        }
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> MemoryResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| MemoryError::internal(format!("hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> MemoryResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Keys, truncation flag, and continuation token of a `ListObjectsV2` page.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(xml_unescape(&key));
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
