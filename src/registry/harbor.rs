use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{RegistryConfig, Secret};
use crate::error::RegistryError;
use crate::model::{Artifact, Project};

/// Hard stop for pagination against a misbehaving server.
const MAX_PAGES: u32 = 10_000;

/// Harbor v2 API client.
pub struct HarborRegistry {
    client: reqwest::Client,
    base: Url,
    host: String,
    username: String,
    password: Option<Secret>,
    page_size: u32,
}

#[derive(Deserialize)]
struct HarborProject {
    name: String,
    project_id: Option<u64>,
}

#[derive(Deserialize)]
struct HarborRepository {
    name: String,
}

#[derive(Deserialize)]
struct HarborArtifact {
    digest: String,
    tags: Option<Vec<HarborTag>>,
}

#[derive(Deserialize)]
struct HarborTag {
    name: String,
}

impl HarborRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let base = Url::parse(&config.url)
            .map_err(|e| RegistryError::Unavailable(format!("invalid registry URL: {e}")))?;
        let host = registry_host(&base)
            .ok_or_else(|| RegistryError::Unavailable("registry URL has no host".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            host,
            username: config.username.clone(),
            password: config.password.clone(),
            page_size: config.page_size.max(1),
        })
    }

    /// Builds `{base}/api/v2.0/{segments...}`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut path = self.base.path().trim_end_matches('/').to_string();
        path.push_str("/api/v2.0");
        for segment in segments {
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }

        let mut url = self.base.clone();
        url.set_path(&path);
        url.set_query(None);
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        project: Option<&str>,
    ) -> Result<T, RegistryError> {
        debug!(url = %url, "registry request");

        let response = self
            .client
            .get(url.clone())
            .basic_auth(&self.username, self.password.as_ref().map(Secret::expose))
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url.path(), project));
        }

        response.json().await.map_err(|e| {
            RegistryError::Unavailable(format!("undecodable response from {}: {e}", url.path()))
        })
    }

    /// Fetches every page of a listing endpoint.
    async fn get_paged<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        extra_query: &[(&str, &str)],
        project: Option<&str>,
    ) -> Result<Vec<T>, RegistryError> {
        let page_size = self.page_size.to_string();
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let mut url = self.endpoint(segments);
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("page_size", &page_size)
                .extend_pairs(extra_query);

            let batch: Vec<T> = self.get_json(url, project).await?;
            let short_page = batch.len() < self.page_size as usize;
            items.extend(batch);
            if short_page {
                break;
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl super::RegistryInventory for HarborRegistry {
    fn name(&self) -> &'static str {
        "Harbor"
    }

    async fn list_projects(&self) -> Result<Vec<Project>, RegistryError> {
        let projects: Vec<HarborProject> = self.get_paged(&["projects"], &[], None).await?;

        Ok(projects
            .into_iter()
            .filter(|p| !p.name.trim().is_empty())
            .map(|p| {
                let project = Project::new(p.name);
                match p.project_id {
                    Some(id) => project.with_id(id),
                    None => project,
                }
            })
            .collect())
    }

    async fn list_artifacts(&self, project: &Project) -> Result<Vec<Artifact>, RegistryError> {
        let name = project.name.as_str();
        let repositories: Vec<HarborRepository> = self
            .get_paged(&["projects", name, "repositories"], &[], Some(name))
            .await?;

        let mut artifacts = Vec::new();
        for repository in repositories {
            let segment = repository_segment(name, &repository.name);
            let listing: Vec<HarborArtifact> = match self
                .get_paged(
                    &["projects", name, "repositories", &segment, "artifacts"],
                    &[("with_tag", "true")],
                    Some(name),
                )
                .await
            {
                Ok(listing) => listing,
                // Repository deleted between the two listings.
                Err(RegistryError::ProjectNotFound(_)) => {
                    warn!(
                        project = name,
                        repository = %repository.name,
                        "repository disappeared, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            artifacts.extend(artifacts_from_listing(
                &self.host,
                name,
                &repository.name,
                listing,
            ));
        }

        Ok(artifacts)
    }
}

/// `host[:port]` as it appears in pull references.
fn registry_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Repository path segment as Harbor expects it: project prefix removed and
/// nested `/` pre-encoded, so that the final URL carries `%252F`.
fn repository_segment(project: &str, repository: &str) -> String {
    let name = repository
        .strip_prefix(project)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(repository);
    name.replace('/', "%2F")
}

fn artifacts_from_listing(
    host: &str,
    project: &str,
    repository: &str,
    listing: Vec<HarborArtifact>,
) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    for item in listing {
        let tags: Vec<String> = item
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.name)
            .filter(|t| !t.is_empty())
            .collect();

        let references: Vec<String> = if tags.is_empty() {
            vec![format!("{host}/{repository}@{}", item.digest)]
        } else {
            tags.iter()
                .map(|tag| format!("{host}/{repository}:{tag}"))
                .collect()
        };

        for reference in references {
            match Artifact::new(project, item.digest.as_str(), reference) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    warn!(project, repository, error = %e, "skipping artifact");
                    break;
                }
            }
        }
    }

    artifacts
}

fn transport_error(url: &Url, err: reqwest::Error) -> RegistryError {
    if err.is_timeout() {
        RegistryError::Unavailable(format!("request to {} timed out", url.path()))
    } else {
        RegistryError::Unavailable(format!("request to {} failed: {err}", url.path()))
    }
}

fn status_error(status: StatusCode, path: &str, project: Option<&str>) -> RegistryError {
    match (status, project) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            RegistryError::Auth(format!("HTTP {status} from {path}"))
        }
        (StatusCode::NOT_FOUND, Some(project)) => {
            RegistryError::ProjectNotFound(project.to_string())
        }
        _ => RegistryError::Unavailable(format!("HTTP {status} from {path}")),
    }
}
