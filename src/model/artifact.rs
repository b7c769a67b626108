use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project_id: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.project_id = Some(id);
        self
    }
}

/// One scannable image.
///
/// Two artifacts with the same `digest` are the same content, even when they
/// were reached through different tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub project_name: String,
    pub digest: String,
    pub pull_reference: String,
}

/// Reasons an artifact description was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidArtifact {
    #[error("artifact has an empty project name")]
    EmptyProject,

    #[error("malformed digest `{0}` (expected algo:hex)")]
    MalformedDigest(String),

    #[error("artifact has an empty pull reference")]
    EmptyReference,
}

impl Artifact {
    pub fn new(
        project_name: impl Into<String>,
        digest: impl Into<String>,
        pull_reference: impl Into<String>,
    ) -> Result<Self, InvalidArtifact> {
        let project_name = project_name.into();
        let digest = digest.into();
        let pull_reference = pull_reference.into();

        if project_name.trim().is_empty() {
            return Err(InvalidArtifact::EmptyProject);
        }
        if !is_valid_digest(&digest) {
            return Err(InvalidArtifact::MalformedDigest(digest));
        }
        if pull_reference.trim().is_empty() {
            return Err(InvalidArtifact::EmptyReference);
        }

        Ok(Self {
            project_name,
            digest,
            pull_reference,
        })
    }
}

/// Checks the `algo:hex` shape of a content digest.
pub fn is_valid_digest(digest: &str) -> bool {
    let Some((algo, hex)) = digest.split_once(':') else {
        return false;
    };

    !algo.is_empty()
        && algo
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        && !hex.is_empty()
        && hex.chars().all(|c| c.is_ascii_hexdigit())
}
