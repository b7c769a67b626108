//! Core data types for registry inventory and scan results.
//!
//! - [`Project`] - A registry project (namespace of repositories)
//! - [`Artifact`] - One scannable image, identified by content digest
//! - [`Vulnerability`] - A single finding reported by the scanner
//! - [`Severity`] - Ordered severity levels
//! - [`ScanResult`] - Outcome of scanning one artifact
//!
//! # Example
//!
//! ```
//! use regscan::{Artifact, ScanResult};
//!
//! let artifact = Artifact::new(
//!     "library",
//!     "sha256:4b7e0a1f",
//!     "harbor.local/library/nginx:1.25",
//! )
//! .unwrap();
//! let result = ScanResult::new(&artifact, Vec::new());
//!
//! assert_eq!(result.digest, "sha256:4b7e0a1f");
//! assert_eq!(result.vulnerability_count(), 0);
//! ```

mod artifact;
mod report;

pub use artifact::*;
pub use report::*;
