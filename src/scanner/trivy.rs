use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{ScannerConfig, Secret};
use crate::error::ScanError;
use crate::model::{Artifact, ScanResult, Severity, Vulnerability};

const SCANNER_VERSION_HEADER: &str = "x-scanner-version";

/// HTTP client for a Trivy-style scan service.
///
/// Sends `POST {url}/api/v1/scan` with `{"image": "<reference>"}` and reads a
/// Trivy JSON report back.
pub struct TrivyClient {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<Secret>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ScanRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Option<Vec<TrivyTarget>>,
}

#[derive(Deserialize)]
struct TrivyTarget {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "PkgName", default)]
    package: String,
    #[serde(rename = "InstalledVersion", default)]
    installed_version: String,
    #[serde(rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(rename = "Severity")]
    severity: Option<String>,
    #[serde(rename = "Title")]
    title: Option<String>,
}

impl TrivyClient {
    pub fn new(config: &ScannerConfig) -> Result<Self, ScanError> {
        let endpoint = Url::parse(&config.url)
            .and_then(|base| base.join("api/v1/scan"))
            .map_err(|e| ScanError::Engine(format!("invalid scanner URL: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ScanError::Engine(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
            timeout: config.timeout(),
        })
    }

    fn transport_error(&self, reference: &str, err: reqwest::Error) -> ScanError {
        if err.is_timeout() {
            ScanError::Timeout {
                reference: reference.to_string(),
                after: self.timeout,
            }
        } else {
            ScanError::Engine(format!("request to scanner failed: {err}"))
        }
    }
}

#[async_trait]
impl super::ScanClient for TrivyClient {
    fn name(&self) -> &'static str {
        "Trivy"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn scan(&self, artifact: &Artifact) -> Result<ScanResult, ScanError> {
        let reference = artifact.pull_reference.as_str();
        debug!(reference, "submitting scan");

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .json(&ScanRequest { image: reference });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(reference, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, reference, &body));
        }

        let scanner_version = response
            .headers()
            .get(SCANNER_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let report: TrivyReport = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(reference, e)
            } else {
                ScanError::Engine(format!("undecodable scan report: {e}"))
            }
        })?;

        let result = ScanResult::new(artifact, flatten_report(report));
        Ok(match scanner_version {
            Some(version) => result.with_scanner_version(version),
            None => result,
        })
    }
}

fn flatten_report(report: TrivyReport) -> Vec<Vulnerability> {
    report
        .results
        .unwrap_or_default()
        .into_iter()
        .flat_map(|target| target.vulnerabilities.unwrap_or_default())
        .map(|v| Vulnerability {
            id: v.id,
            package: v.package,
            installed_version: v.installed_version,
            fixed_version: v.fixed_version.filter(|f| !f.is_empty()),
            severity: v
                .severity
                .as_deref()
                .map_or(Severity::Unknown, Severity::from_label),
            title: v.title,
        })
        .collect()
}

fn status_error(status: StatusCode, reference: &str, body: &str) -> ScanError {
    let detail = body.trim();
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", truncate(detail, 200))
    };

    match status {
        StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ScanError::TargetUnreachable(format!("{reference} ({detail})"))
        }
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => ScanError::Engine(format!(
            "scanner gave up on {reference} ({detail})"
        )),
        _ => ScanError::Engine(format!("scanner returned {detail} for {reference}")),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
