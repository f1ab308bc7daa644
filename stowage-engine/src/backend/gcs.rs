//! Google Cloud Storage backend adapter, speaking the JSON API directly
//! with a bearer token. Object listing pages through `nextPageToken`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use stowage_core::{BackendAdapter, BackendError, ObjectInfo};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

pub struct GcsAdapter {
    bucket: String,
    prefix: String,
    token: Option<String>,
    endpoint: String,
    client: Client,
}

/// Object resource from the JSON API. Sizes come back as decimal strings.
#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl GcsAdapter {
    pub fn new(
        bucket: String,
        prefix: String,
        token: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            bucket,
            prefix,
            token,
            endpoint: endpoint
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            client: Client::new(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key.trim_start_matches('/'))
        }
    }

    /// Object URL; GCS expects the whole key as a single encoded path
    /// segment, slashes included.
    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            self.bucket,
            urlencoding::encode(&self.full_key(key))
        )
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn object_info(&self, obj: GcsObject) -> ObjectInfo {
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let relative = obj.name.strip_prefix(&strip).unwrap_or(&obj.name).to_string();
        ObjectInfo {
            key: relative,
            size: obj.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            modified: obj
                .updated
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }
}

#[async_trait]
impl BackendAdapter for GcsAdapter {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, BackendError> {
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/storage/v1/b/{}/o?prefix={}",
                self.endpoint,
                self.bucket,
                urlencoding::encode(&self.full_key(prefix))
            );
            if let Some(ref token) = page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let resp = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .map_err(|e| request_error("LIST", prefix, e))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(http_error("LIST", prefix, status, &body));
            }

            let page: ListResponse = resp
                .json()
                .await
                .map_err(|e| request_error("LIST", prefix, e))?;
            all.extend(page.items.into_iter().map(|o| self.object_info(o)));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(prefix = %prefix, count = all.len(), "GCS list complete");
        Ok(all)
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, BackendError> {
        let resp = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(|e| request_error("STAT", key, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("STAT", key, status, &body));
        }
        let obj: GcsObject = resp
            .json()
            .await
            .map_err(|e| request_error("STAT", key, e))?;
        let mut info = self.object_info(obj);
        // Metadata lookups are by exact key; report it back unchanged.
        info.key = key.to_string();
        Ok(info)
    }

    async fn read(&self, key: &str) -> Result<Bytes, BackendError> {
        let url = format!("{}?alt=media", self.object_url(key));
        let resp = self
            .authorize(self.client.get(&url))
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
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.endpoint,
            self.bucket,
            urlencoding::encode(&self.full_key(key))
        );
        let resp = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| request_error("PUT", key, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("PUT", key, status, &body));
        }
        debug!(key = %key, "GCS write complete");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let resp = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(|e| request_error("DELETE", key, e))?;
        // Delete is idempotent.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(http_error("DELETE", key, status, &body));
        }
        debug!(key = %key, "GCS delete complete");
        Ok(())
    }
}

fn http_error(op: &str, key: &str, status: StatusCode, body: &str) -> BackendError {
    match status.as_u16() {
        404 => BackendError::NotFound(key.to_string()),
        401 | 403 => BackendError::Permanent(format!("GCS {op} {key}: HTTP {status} - {body}")),
        408 | 429 => BackendError::Transient(format!("GCS {op} {key}: HTTP {status}")),
        s if s >= 500 => BackendError::Transient(format!("GCS {op} {key}: HTTP {status}")),
        _ => BackendError::Permanent(format!("GCS {op} {key}: HTTP {status} - {body}")),
    }
}

fn request_error(op: &str, key: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() {
        BackendError::Transient(format!("GCS {op} {key}: {err}"))
    } else {
        BackendError::Permanent(format!("GCS {op} {key}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(prefix: &str) -> GcsAdapter {
        GcsAdapter::new(
            "media-archive".to_string(),
            prefix.to_string(),
            Some("token".to_string()),
            None,
        )
    }

    #[test]
    fn test_object_url_encodes_whole_key() {
        let url = adapter("cold").object_url("photos/a b.jpg");
        assert_eq!(
            url,
            "https://storage.googleapis.com/storage/v1/b/media-archive/o/cold%2Fphotos%2Fa%20b.jpg"
        );
    }

    #[test]
    fn test_list_response_parsing() {
        let json = r#"{
            "items": [
                {"name": "cold/photos/a.jpg", "size": "4194304", "updated": "2026-08-01T12:00:00Z"},
                {"name": "cold/b.bin"}
            ],
            "nextPageToken": "page-2"
        }"#;
        let resp: ListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.items.len(), 2);
        assert_eq!(resp.next_page_token, Some("page-2".to_string()));

        let a = adapter("cold");
        let first = a.object_info(resp.items.into_iter().next().unwrap());
        assert_eq!(first.key, "photos/a.jpg");
        assert_eq!(first.size, 4_194_304);
        assert!(first.modified.is_some());
    }

    #[test]
    fn test_empty_list_response() {
        let resp: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.items.is_empty());
        assert!(resp.next_page_token.is_none());
    }
}
