//! Concrete `PypiClient`: the only Upstream Client implementation. Talks to
//! a PyPI-shaped index over a fixed wire contract.

use super::backoff_policy::retry_with_backoff;
use super::{ChangelogDelta, ClientError, ProjectMetadata, Result};
use crate::config::MirrorConfig;
use crate::hashing::sha256_bytes;
use crate::model::{Digests, Project, Release, ReleaseFile, Serial};
use futures::StreamExt;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct PypiClient {
    http: reqwest::Client,
    base: String,
    download_mirror: Option<String>,
    download_mirror_no_fallback: bool,
    max_attempts: u32,
}

impl PypiClient {
    pub fn from_config(cfg: &MirrorConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("pypi-mirror/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(cfg.timeout_secs));

        if let Some(proxy) = &cfg.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ClientError::InvalidProxy(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        // Otherwise reqwest honors HTTPS_PROXY/HTTP_PROXY/ALL_PROXY/NO_PROXY
        // from the environment by default.

        let http = builder
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base: cfg.master.trim_end_matches('/').to_string(),
            download_mirror: cfg.download_mirror.clone(),
            download_mirror_no_fallback: cfg.download_mirror_no_fallback,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    fn is_retryable(err: &ClientError) -> bool {
        !err.is_terminal()
    }

    /// `(current_serial, [(project, serial), ...])`. `serial == 0` asks for
    /// the complete project list.
    pub async fn changelog_since(&self, serial: Serial) -> Result<ChangelogDelta> {
        let url = format!("{}/changelog", self.base);
        let http = self.http.clone();
        let bytes = retry_with_backoff(self.max_attempts, Self::is_retryable, || {
            let http = http.clone();
            let url = url.clone();
            async move {
                let resp = http
                    .get(&url)
                    .query(&[("since", serial.to_string())])
                    .send()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))?;
                classify_status(&resp, "changelog")?;
                resp.bytes()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))
            }
        })
        .await?;

        let parsed: ChangelogResponse = serde_json::from_slice(&bytes).map_err(|e| ClientError::Parse {
            context: "changelog".into(),
            source: e,
        })?;

        Ok(ChangelogDelta {
            current_serial: parsed.current_serial,
            changed: parsed.changes.into_iter().map(|c| (c.project, c.serial)).collect(),
        })
    }

    /// `/pypi/<project>/json`.
    pub async fn fetch_project_metadata(
        &self,
        project: &str,
        expected_min_serial: Option<Serial>,
    ) -> Result<ProjectMetadata> {
        let url = format!("{}/pypi/{project}/json", self.base);
        let http = self.http.clone();
        let project_owned = project.to_string();
        let body = retry_with_backoff(self.max_attempts, Self::is_retryable, || {
            let http = http.clone();
            let url = url.clone();
            let project_owned = project_owned.clone();
            async move {
                let resp = http
                    .get(&url)
                    .header(header::ACCEPT, "application/json")
                    .send()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))?;
                if resp.status() == StatusCode::NOT_FOUND || resp.status() == StatusCode::GONE {
                    return Err(ClientError::NotFound(project_owned.clone()));
                }
                classify_status(&resp, &project_owned)?;
                let etag = resp
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = resp.bytes().await.map_err(|e| ClientError::Network(e.to_string()))?;
                Ok((etag, bytes))
            }
        })
        .await?;

        let (etag, bytes) = body;
        let parsed: WarehouseResponse = serde_json::from_slice(&bytes).map_err(|e| ClientError::Parse {
            context: project.to_string(),
            source: e,
        })?;
        let raw: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Parse {
                context: project.to_string(),
                source: e,
            })?;

        if let Some(expected) = expected_min_serial
            && parsed.last_serial < expected
        {
            return Err(ClientError::StaleMetadata {
                project: project.to_string(),
                expected,
                got: parsed.last_serial,
            });
        }

        let releases = build_releases(parsed.releases);
        let project_model = Project::from_upstream(&parsed.info.name, parsed.last_serial, releases);

        Ok(ProjectMetadata {
            project: project_model,
            etag,
            raw,
        })
    }

    /// `/simple/<project>/` with the JSON simple-index media type. Failure
    /// to get JSON back is fatal for the project (no HTML fallback).
    pub async fn fetch_simple_json(&self, project: &str) -> Result<Vec<u8>> {
        let url = format!("{}/simple/{project}/", self.base);
        let http = self.http.clone();
        let project_owned = project.to_string();
        retry_with_backoff(self.max_attempts, Self::is_retryable, || {
            let http = http.clone();
            let url = url.clone();
            let project_owned = project_owned.clone();
            async move {
                let resp = http
                    .get(&url)
                    .header(header::ACCEPT, "application/vnd.pypi.simple.v1+json")
                    .send()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(ClientError::NotFound(project_owned.clone()));
                }
                classify_status(&resp, &project_owned)?;
                let content_type = resp
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if !content_type.contains("json") {
                    return Err(ClientError::NonJsonSimpleIndex(project_owned.clone()));
                }
                resp.bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| ClientError::Network(e.to_string()))
            }
        })
        .await
    }

    /// Streams `url` to `destination`, hashing as bytes arrive. Tries
    /// `download-mirror` first when configured, falling back to `url`
    /// unless `download-mirror-no-fallback` is set.
    pub async fn stream_artifact(
        &self,
        url: &str,
        destination: &Path,
        expected_sha256: &str,
        expected_size: u64,
    ) -> Result<()> {
        let attempt_urls: Vec<String> = match &self.download_mirror {
            Some(mirror) => {
                let mirrored = rewrite_for_mirror(mirror, url);
                if self.download_mirror_no_fallback {
                    vec![mirrored]
                } else {
                    vec![mirrored, url.to_string()]
                }
            }
            None => vec![url.to_string()],
        };

        let mut last_err = None;
        for candidate in attempt_urls {
            match self
                .try_stream(&candidate, destination, expected_sha256, expected_size)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(ClientError::MaxRetriesExceeded(url.to_string())))
    }

    async fn try_stream(
        &self,
        url: &str,
        destination: &Path,
        expected_sha256: &str,
        expected_size: u64,
    ) -> Result<()> {
        let http = self.http.clone();
        let url_owned = url.to_string();
        retry_with_backoff(self.max_attempts, Self::is_retryable, || {
            let http = http.clone();
            let url_owned = url_owned.clone();
            let destination = destination.to_path_buf();
            let expected_sha256 = expected_sha256.to_string();
            async move {
                let resp = http
                    .get(&url_owned)
                    .send()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))?;
                classify_status(&resp, &url_owned)?;

                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = File::create(&destination).await?;
                let mut writer = BufWriter::new(file);
                let mut hasher = Sha256::new();
                let mut total = 0u64;
                let mut stream = resp.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| ClientError::Network(e.to_string()))?;
                    hasher.update(&chunk);
                    total += chunk.len() as u64;
                    writer.write_all(&chunk).await?;
                }
                writer.flush().await?;

                let actual = hex::encode(hasher.finalize());
                if total != expected_size {
                    let _ = tokio::fs::remove_file(&destination).await;
                    return Err(ClientError::SizeMismatch {
                        url: url_owned.clone(),
                        expected: expected_size,
                        actual: total,
                    });
                }
                if !actual.eq_ignore_ascii_case(&expected_sha256) {
                    let _ = tokio::fs::remove_file(&destination).await;
                    return Err(ClientError::ChecksumMismatch {
                        url: url_owned.clone(),
                        expected: expected_sha256.clone(),
                        actual,
                    });
                }
                Ok(())
            }
        })
        .await
    }
}

fn classify_status(resp: &reqwest::Response, context: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(ClientError::NotFound(context.to_string()));
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(ClientError::Network(format!("{context}: upstream returned {status}")));
    }
    Err(ClientError::Network(format!("{context}: unexpected status {status}")))
}

fn rewrite_for_mirror(mirror_base: &str, original_url: &str) -> String {
    let path = original_url
        .split_once("://")
        .and_then(|(_, rest)| rest.split_once('/'))
        .map(|(_, path)| path)
        .unwrap_or(original_url);
    format!("{}/{}", mirror_base.trim_end_matches('/'), path)
}

fn build_releases(raw: BTreeMap<String, Vec<WarehouseFile>>) -> BTreeMap<String, Release> {
    let mut releases = BTreeMap::new();
    for (version, files) in raw {
        if files.is_empty() {
            continue;
        }
        let upload_time = files.first().and_then(|f| f.upload_time_iso_8601.clone());
        let yanked = !files.is_empty() && files.iter().all(|f| f.yanked);
        let files = files
            .into_iter()
            .map(|f| ReleaseFile {
                url: f.url,
                filename: f.filename,
                packagetype: f.packagetype,
                requires_python: f.requires_python,
                size: f.size,
                digests: Digests {
                    sha256: f.digests.sha256,
                    md5: f.digests.md5,
                },
                yanked: f.yanked,
                upload_time: f.upload_time_iso_8601,
            })
            .collect();
        releases.insert(
            version.clone(),
            Release {
                version,
                upload_time,
                yanked,
                files,
            },
        );
    }
    releases
}

#[derive(Debug, Deserialize)]
struct ChangelogResponse {
    current_serial: Serial,
    changes: Vec<ChangelogEntry>,
}

#[derive(Debug, Deserialize)]
struct ChangelogEntry {
    project: String,
    serial: Serial,
}

#[derive(Debug, Deserialize)]
struct WarehouseResponse {
    info: WarehouseInfo,
    last_serial: Serial,
    releases: BTreeMap<String, Vec<WarehouseFile>>,
}

#[derive(Debug, Deserialize)]
struct WarehouseInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WarehouseFile {
    url: String,
    filename: String,
    packagetype: String,
    #[serde(default)]
    requires_python: Option<String>,
    size: u64,
    digests: WarehouseDigests,
    #[serde(default)]
    yanked: bool,
    #[serde(default)]
    upload_time_iso_8601: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WarehouseDigests {
    sha256: String,
    #[serde(default)]
    md5: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_for_mirror_preserves_path() {
        let rewritten = rewrite_for_mirror(
            "https://mirror.example/files",
            "https://files.pythonhosted.org/packages/bc/94/x.whl",
        );
        assert_eq!(rewritten, "https://mirror.example/files/packages/bc/94/x.whl");
    }

    #[test]
    fn build_releases_skips_empty_version() {
        let mut raw = BTreeMap::new();
        raw.insert("1.0.0".to_string(), Vec::new());
        let releases = build_releases(raw);
        assert!(releases.is_empty());
    }

    #[test]
    fn sha256_helper_matches_known_digest() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
