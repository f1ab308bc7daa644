//! S3-compatible backend adapter.
//!
//! Handles AWS S3 and other S3-compatible stores (MinIO, Backblaze B2).
//! Uses reqwest with manual AWS Signature V4 signing so no SDK dependency
//! is needed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use stowage_core::{BackendAdapter, BackendError, ObjectInfo};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix inside the bucket; empty for the bucket root.
    pub prefix: String,
    pub region: String,
    /// Custom endpoint for S3-compatible APIs.
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub struct S3Adapter {
    config: S3Config,
    client: Client,
}

impl S3Adapter {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        if let Some(ep) = &self.config.endpoint {
            ep.trim_end_matches('/').to_string()
        } else {
            format!(
                "https://s3.{}.amazonaws.com/{}",
                self.config.region, self.config.bucket
            )
        }
    }

    /// Absolute key inside the bucket, under the configured prefix.
    fn full_key(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.config.prefix, key.trim_start_matches('/'))
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint(), encode_key(&self.full_key(key)))
    }

    /// Canonical URI path for signing: the endpoint's path plus the encoded
    /// object key.
    fn canonical_path(&self, key: &str) -> String {
        format!(
            "{}/{}",
            url_path(&self.endpoint()),
            encode_key(&self.full_key(key))
        )
    }

    /// Compute the x-amz-date/Authorization header pair for a request.
    fn auth_headers(
        &self,
        method: &str,
        path: &str,
        query: &str,
        body_hash: &str,
    ) -> (String, String) {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let host = url_host(&self.endpoint());

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), body_hash.to_string());
        headers.insert("x-amz-date".to_string(), date_time.clone());

        // Canonical request
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers, body_hash
        );

        // String to sign
        let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let credential_scope = format!("{}/{}/s3/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time, credential_scope, cr_hash
        );

        let signing_key =
            derive_signing_key(&self.config.secret_access_key, &date, &self.config.region);
        let mut mac = HmacSha256::new_from_slice(&signing_key).expect("HMAC key length ok");
        mac.update(string_to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let auth = format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        );
        (date_time, auth)
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<(Vec<ObjectInfo>, Option<String>), BackendError> {
        let empty_hash = body_hash(b"");
        // Query parameters in canonical (sorted) order.
        let mut query = String::new();
        if let Some(token) = continuation {
            query.push_str(&format!(
                "continuation-token={}&",
                urlencoding::encode(token)
            ));
        }
        query.push_str(&format!(
            "list-type=2&prefix={}",
            urlencoding::encode(&self.full_key(prefix))
        ));

        let path = url_path(&self.endpoint());
        let (date_time, auth) = self.auth_headers("GET", &format!("{path}/"), &query, &empty_hash);

        let url = format!("{}/?{}", self.endpoint(), query);
        let resp = self
            .client
            .get(&url)
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &empty_hash)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| request_error("LIST", prefix, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("LIST", prefix, status, &body));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| request_error("LIST", prefix, e))?;
        Ok(self.parse_list_page(&body))
    }

    /// Minimal XML extraction of `<Contents>` entries and the continuation
    /// token from a ListObjectsV2 response.
    fn parse_list_page(&self, xml: &str) -> (Vec<ObjectInfo>, Option<String>) {
        let strip = if self.config.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.config.prefix)
        };

        let mut objects = Vec::new();
        let mut remaining = xml;
        while let Some(start) = remaining.find("<Contents>") {
            remaining = &remaining[start + 10..];
            let end = match remaining.find("</Contents>") {
                Some(end) => end,
                None => break,
            };
            let block = &remaining[..end];
            remaining = &remaining[end + 11..];

            let key = match extract_tag(block, "Key") {
                Some(k) => xml_unescape(&k),
                None => continue,
            };
            let size = extract_tag(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let modified = extract_tag(block, "LastModified")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc));

            let relative = key.strip_prefix(&strip).unwrap_or(&key).to_string();
            objects.push(ObjectInfo {
                key: relative,
                size,
                modified,
            });
        }

        let token = if extract_tag(xml, "IsTruncated").as_deref() == Some("true") {
            extract_tag(xml, "NextContinuationToken").map(|t| xml_unescape(&t))
        } else {
            None
        };
        (objects, token)
    }
}

#[async_trait]
impl BackendAdapter for S3Adapter {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        let mut all = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let (mut page, next) = self.list_page(prefix, continuation.as_deref()).await?;
            all.append(&mut page);
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        debug!(prefix = %prefix, count = all.len(), "S3 list complete");
        Ok(all)
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, BackendError> {
        let empty_hash = body_hash(b"");
        let (date_time, auth) =
            self.auth_headers("HEAD", &self.canonical_path(key), "", &empty_hash);

        let resp = self
            .client
            .head(self.object_url(key))
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &empty_hash)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| request_error("HEAD", key, e))?;

        if !resp.status().is_success() {
            return Err(http_error("HEAD", key, resp.status(), ""));
        }

        let size = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let modified = resp
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            modified,
        })
    }

    async fn read(&self, key: &str) -> Result<Bytes, BackendError> {
        let empty_hash = body_hash(b"");
        let (date_time, auth) =
            self.auth_headers("GET", &self.canonical_path(key), "", &empty_hash);

        let resp = self
            .client
            .get(self.object_url(key))
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &empty_hash)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| request_error("GET", key, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("GET", key, status, &body));
        }

        resp.bytes().await.map_err(|e| request_error("GET", key, e))
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<(), BackendError> {
        let body_hash_str = body_hash(&data);
        let (date_time, auth) =
            self.auth_headers("PUT", &self.canonical_path(key), "", &body_hash_str);

        let resp = self
            .client
            .put(self.object_url(key))
            .header("Content-Type", "application/octet-stream")
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &body_hash_str)
            .header("Authorization", &auth)
            .body(data)
            .send()
            .await
            .map_err(|e| request_error("PUT", key, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("PUT", key, status, &body));
        }

        debug!(key = %key, "S3 write complete");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let empty_hash = body_hash(b"");
        let (date_time, auth) =
            self.auth_headers("DELETE", &self.canonical_path(key), "", &empty_hash);

        let resp = self
            .client
            .delete(self.object_url(key))
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &empty_hash)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| request_error("DELETE", key, e))?;

        // Delete is idempotent.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("DELETE", key, status, &body));
        }

        debug!(key = %key, "S3 delete complete");
        Ok(())
    }
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn http_error(op: &str, key: &str, status: StatusCode, body: &str) -> BackendError {
    match status.as_u16() {
        404 => BackendError::NotFound(key.to_string()),
        401 | 403 => BackendError::Permanent(format!("S3 {op} {key}: HTTP {status} - {body}")),
        408 | 429 => BackendError::Transient(format!("S3 {op} {key}: HTTP {status}")),
        s if s >= 500 => BackendError::Transient(format!("S3 {op} {key}: HTTP {status}")),
        _ => BackendError::Permanent(format!("S3 {op} {key}: HTTP {status} - {body}")),
    }
}

fn request_error(op: &str, key: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() {
        BackendError::Transient(format!("S3 {op} {key}: {err}"))
    } else {
        BackendError::Permanent(format!("S3 {op} {key}: {err}"))
    }
}

/// Encode an object key for use in a URL path, preserving `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Path portion of a URL with leading slash, empty for a bare host.
fn url_path(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match without_scheme.split_once('/') {
        Some((_, path)) => format!("/{path}"),
        None => String::new(),
    }
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(prefix: &str) -> S3Adapter {
        S3Adapter::new(S3Config {
            bucket: "media-archive".to_string(),
            prefix: prefix.to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: "AKIA123".to_string(),
            secret_access_key: "secret".to_string(),
        })
    }

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-abc</NextContinuationToken>
  <Contents>
    <Key>cold/photos/a.jpg</Key>
    <Size>4194304</Size>
    <LastModified>2026-08-01T12:00:00.000Z</LastModified>
  </Contents>
  <Contents>
    <Key>cold/docs/b &amp; c.pdf</Key>
    <Size>1024</Size>
    <LastModified>2026-08-02T09:30:00.000Z</LastModified>
  </Contents>
</ListBucketResult>"#;
        let (objects, token) = adapter("cold").parse_list_page(xml);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "photos/a.jpg");
        assert_eq!(objects[0].size, 4_194_304);
        assert!(objects[0].modified.is_some());
        assert_eq!(objects[1].key, "docs/b & c.pdf");
        assert_eq!(token, Some("token-abc".to_string()));
    }

    #[test]
    fn test_parse_list_page_final() {
        let xml = r#"<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>a.jpg</Key><Size>1</Size></Contents>
</ListBucketResult>"#;
        let (objects, token) = adapter("").parse_list_page(xml);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "a.jpg");
        assert!(token.is_none());
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(
            url_host("https://s3.us-east-1.amazonaws.com/bucket"),
            "s3.us-east-1.amazonaws.com"
        );
        assert_eq!(url_host("http://localhost:9000"), "localhost:9000");
        assert_eq!(url_path("https://s3.us-east-1.amazonaws.com/bucket"), "/bucket");
        assert_eq!(url_path("http://localhost:9000"), "");
    }

    #[test]
    fn test_encode_key_preserves_slashes() {
        assert_eq!(encode_key("photos/summer 2026/a.jpg"), "photos/summer%202026/a.jpg");
    }

    #[test]
    fn test_full_key_with_prefix() {
        assert_eq!(adapter("cold").full_key("a.jpg"), "cold/a.jpg");
        assert_eq!(adapter("").full_key("a.jpg"), "a.jpg");
    }

    #[test]
    fn test_hmac_sha256() {
        let result = hmac_sha256(b"secret", b"data");
        assert_eq!(result.len(), 32);
    }
}
