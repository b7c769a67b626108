use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Artifact;

/// Severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parses a scanner severity label such as `HIGH` or `critical`.
    ///
    /// Falls back to [`parse_cvss_score`] for numeric values, and to
    /// [`Severity::Unknown`] for anything else.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" | "negligible" => Severity::Low,
            other => parse_cvss_score(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a numeric CVSS base score onto a severity level.
pub fn parse_cvss_score(score: &str) -> Severity {
    match score.trim().parse::<f32>() {
        Ok(s) if s >= 9.0 => Severity::Critical,
        Ok(s) if s >= 7.0 => Severity::High,
        Ok(s) if s >= 4.0 => Severity::Medium,
        Ok(s) if s > 0.0 => Severity::Low,
        _ => Severity::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub package: String,
    pub installed_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub unknown: usize,
}

/// Outcome of scanning one artifact. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub digest: String,
    pub pull_reference: String,
    pub vulnerabilities: Vec<Vulnerability>,
    pub scanned_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner_version: Option<String>,
}

impl ScanResult {
    pub fn new(artifact: &Artifact, vulnerabilities: Vec<Vulnerability>) -> Self {
        Self {
            digest: artifact.digest.clone(),
            pull_reference: artifact.pull_reference.clone(),
            vulnerabilities,
            scanned_at: Utc::now(),
            scanner_version: None,
        }
    }

    pub fn with_scanner_version(mut self, version: impl Into<String>) -> Self {
        self.scanner_version = Some(version.into());
        self
    }

    pub fn vulnerability_count(&self) -> usize {
        self.vulnerabilities.len()
    }

    pub fn severity_counts(&self) -> SeverityCounts {
        let mut counts = SeverityCounts::default();
        for vuln in &self.vulnerabilities {
            match vuln.severity {
                Severity::Critical => counts.critical += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
                Severity::Unknown => counts.unknown += 1,
            }
        }
        counts
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.vulnerabilities.iter().map(|v| v.severity).max()
    }
}
