pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod scanner;

pub use cache::{ContentCache, MemoryContentCache, RedisContentCache};
pub use config::Config;
pub use error::{Error, Result};
pub use model::{Artifact, Project, ScanResult, Severity, Vulnerability};
pub use orchestrator::{CycleReport, OrchestratorSettings, OrchestratorState, ScanOrchestrator};
pub use publisher::{AmqpPublisher, JobPublisher, MemoryPublisher, RetryingPublisher};
pub use registry::{HarborRegistry, RegistryInventory};
pub use scanner::{ScanClient, TrivyClient};
