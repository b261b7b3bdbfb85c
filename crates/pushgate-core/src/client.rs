//! HTTP client for a pushgate server (used by `pushgate push`).

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{PushError, Result};
use crate::identity::PackageIdentity;
use crate::read_path::StatusReport;
use crate::server::API_KEY_HEADER;

/// Body of a 201 response.
#[derive(Clone, Debug, Deserialize)]
pub struct PushReceipt {
    pub id: String,
    pub version: String,
    pub sha256: String,
    pub integrity: String,
    pub size: u64,
    pub state: String,
}

#[derive(Debug)]
pub enum PushOutcome {
    Created(PushReceipt),
    Conflict(String),
    Failed { status: u16, code: String, message: String },
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Ready(Bytes),
    Pending,
    NotFound,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

pub struct PublishClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl PublishClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn package_url(&self, identity: &PackageIdentity) -> String {
        format!(
            "{}/api/v2/package/{}/{}",
            self.base_url,
            identity.id(),
            identity.version()
        )
    }

    /// PUT an archive. With `asserted`, the server checks it against the manifest.
    pub async fn push(&self, content: Vec<u8>, asserted: Option<&PackageIdentity>) -> Result<PushOutcome> {
        let url = match asserted {
            Some(identity) => self.package_url(identity),
            None => format!("{}/api/v2/package", self.base_url),
        };
        let mut request = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;
        if status == StatusCode::CREATED {
            return Ok(PushOutcome::Created(serde_json::from_slice(&body)?));
        }

        let (code, message) = match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(err) => (err.code, err.message),
            Err(_) => (
                "UNKNOWN".to_string(),
                String::from_utf8_lossy(&body).into_owned(),
            ),
        };
        if status == StatusCode::CONFLICT {
            return Ok(PushOutcome::Conflict(message));
        }
        Ok(PushOutcome::Failed {
            status: status.as_u16(),
            code,
            message,
        })
    }

    pub async fn status(&self, identity: &PackageIdentity) -> Result<Option<StatusReport>> {
        let url = format!("{}/status", self.package_url(identity));
        let response = self.http.get(&url).send().await.map_err(transport)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = response.bytes().await.map_err(transport)?;
                Ok(Some(serde_json::from_slice(&body)?))
            }
            s => Err(PushError::Transport(format!("GET {} returned {}", url, s))),
        }
    }

    pub async fn download(&self, identity: &PackageIdentity) -> Result<DownloadOutcome> {
        let url = self.package_url(identity);
        let response = self.http.get(&url).send().await.map_err(transport)?;
        match response.status() {
            StatusCode::OK => Ok(DownloadOutcome::Ready(response.bytes().await.map_err(transport)?)),
            StatusCode::ACCEPTED => Ok(DownloadOutcome::Pending),
            StatusCode::NOT_FOUND => Ok(DownloadOutcome::NotFound),
            s => Err(PushError::Transport(format!("GET {} returned {}", url, s))),
        }
    }
}

fn transport(e: reqwest::Error) -> PushError {
    PushError::Transport(e.to_string())
}
