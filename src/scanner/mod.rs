//! Vulnerability scanner clients.
//!
//! This module provides the [`ScanClient`] trait and [`TrivyClient`], an HTTP
//! client for a Trivy-style scan service.
//!
//! # Example
//!
//! ```no_run
//! use regscan::config::ScannerConfig;
//! use regscan::scanner::{ScanClient, TrivyClient};
//! use regscan::Artifact;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ScannerConfig {
//!         url: "http://trivy.local:8080".to_string(),
//!         ..ScannerConfig::default()
//!     };
//!     let scanner = TrivyClient::new(&config)?;
//!     let artifact = Artifact::new(
//!         "library",
//!         "sha256:4b7e0a1f",
//!         "harbor.local/library/nginx:1.25",
//!     )?;
//!
//!     let result = scanner.scan(&artifact).await?;
//!     println!("{}: {} vulnerabilities", artifact.pull_reference, result.vulnerability_count());
//!     Ok(())
//! }
//! ```

mod trivy;

pub use trivy::TrivyClient;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::ScanError;
use crate::model::{Artifact, ScanResult};

/// Submits images to an external scanner.
///
/// A scan is slow and is the only call in the loop with a multi-minute budget;
/// [`timeout`](Self::timeout) reports that budget so the orchestrator can
/// enforce it around the call as well.
#[async_trait]
pub trait ScanClient: Send + Sync {
    /// Returns the human-readable name of this scanner.
    fn name(&self) -> &'static str;

    /// Upper bound for a single [`scan`](Self::scan) call.
    fn timeout(&self) -> Duration;

    /// Scans `artifact.pull_reference`; the result carries `artifact.digest`.
    ///
    /// # Errors
    ///
    /// [`ScanError::Timeout`] when the budget is exceeded,
    /// [`ScanError::TargetUnreachable`] when the scanner cannot fetch the
    /// image, [`ScanError::Engine`] for any other scanner failure.
    async fn scan(&self, artifact: &Artifact) -> Result<ScanResult, ScanError>;
}
