//! Registry inventory.
//!
//! This module provides the [`RegistryInventory`] trait, the read-only view of
//! the registry that the orchestrator polls, and [`HarborRegistry`], its
//! implementation for the Harbor v2 REST API.

mod harbor;

pub use harbor::HarborRegistry;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::model::{Artifact, Project};

/// Read-only listing of projects and their artifacts.
///
/// Implementations must be idempotent and side-effect free, and must bound
/// every request with a timeout so a hung registry cannot stall a poll cycle.
///
/// # Example
///
/// ```no_run
/// use regscan::registry::{HarborRegistry, RegistryInventory};
/// use regscan::config::RegistryConfig;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = RegistryConfig {
///         url: "https://harbor.example.com".to_string(),
///         ..RegistryConfig::default()
///     };
///     let registry = HarborRegistry::new(&config)?;
///
///     for project in registry.list_projects().await? {
///         let artifacts = registry.list_artifacts(&project).await?;
///         println!("{}: {} artifacts", project.name, artifacts.len());
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait RegistryInventory: Send + Sync {
    /// Returns the human-readable name of this registry backend.
    fn name(&self) -> &'static str;

    /// Lists every project visible to the configured credentials.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unavailable`] on transport failures or timeouts,
    /// [`RegistryError::Auth`] when credentials are rejected.
    async fn list_projects(&self) -> Result<Vec<Project>, RegistryError>;

    /// Lists the artifacts of one project, one entry per pull reference.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unavailable`] on transport failures or timeouts,
    /// [`RegistryError::ProjectNotFound`] if the project no longer exists.
    async fn list_artifacts(&self, project: &Project) -> Result<Vec<Artifact>, RegistryError>;
}
