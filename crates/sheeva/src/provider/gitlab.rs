//! GitLab REST v4 provider.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    CreateSpec, ProjectSettings, RemoteSubresource, ResourceId, ResourceProvider, SubresourceKey,
    SubresourceKind, SubresourceParent, SubresourceSpec,
};
use crate::config::{FreezePeriod, ResourceKind, Schedule, Variable, Webhook};
use crate::error::{ProviderError, SheevaError};

const PER_PAGE: &str = "100";
const DEFAULT_BRANCH: &str = "master";

/// Connection options for [`GitLabProvider`].
#[derive(Debug)]
pub struct GitLabOptions {
    /// Instance URL, e.g. `https://gitlab.example.com`.
    pub base_url: String,
    pub token: SecretString,
    pub timeout: Duration,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
}

/// Provider backed by the GitLab REST v4 API.
pub struct GitLabProvider {
    client: Client,
    api: Url,
    token: SecretString,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
    #[serde(flatten)]
    hook: Webhook,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    id: u64,
    #[serde(flatten)]
    schedule: Schedule,
}

#[derive(Debug, Deserialize)]
struct FreezePeriodResponse {
    id: u64,
    #[serde(flatten)]
    period: FreezePeriod,
}

#[derive(Debug, Deserialize)]
struct ScheduleVariables {
    #[serde(default)]
    variables: Vec<Variable>,
}

fn kind_segment(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Group => "groups",
        ResourceKind::Project => "projects",
    }
}

fn collection_segment(kind: SubresourceKind) -> &'static str {
    match kind {
        SubresourceKind::Variable => "variables",
        SubresourceKind::Webhook => "hooks",
        SubresourceKind::Schedule => "pipeline_schedules",
        SubresourceKind::FreezePeriod => "freeze_periods",
    }
}

fn map_status(operation: &str, status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(operation.to_string()),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT if body.contains("has already been taken") => {
            ProviderError::AlreadyExists(operation.to_string())
        }
        _ => ProviderError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        },
    }
}

fn variable_body(variable: &Variable, scoped: bool) -> Value {
    let mut body = json!({
        "key": variable.key,
        "value": variable.value,
        "variable_type": variable.variable_type,
    });
    if scoped {
        body["protected"] = json!(variable.protected);
        body["masked"] = json!(variable.masked);
        body["environment_scope"] = json!(variable.environment);
    }
    body
}

fn payload(parent: SubresourceParent, spec: &SubresourceSpec) -> Result<Value, ProviderError> {
    let encode = |e: serde_json::Error| ProviderError::Decode(e.to_string());
    match spec {
        SubresourceSpec::Variable(v) => Ok(variable_body(
            v,
            !matches!(parent, SubresourceParent::Schedule { .. }),
        )),
        SubresourceSpec::Webhook(h) => serde_json::to_value(h).map_err(encode),
        SubresourceSpec::Schedule(s) => {
            let mut body = json!({
                "description": s.description,
                "ref": s.git_ref,
                "cron": s.cron,
                "active": s.active,
            });
            if let Some(tz) = &s.cron_timezone {
                body["cron_timezone"] = json!(tz);
            }
            Ok(body)
        }
        SubresourceSpec::FreezePeriod(f) => serde_json::to_value(f).map_err(encode),
    }
}

impl GitLabProvider {
    pub fn new(options: GitLabOptions) -> crate::error::Result<Self> {
        let mut api = Url::parse(&options.base_url)
            .map_err(|e| SheevaError::Settings(format!("Invalid GitLab URL '{}': {}", options.base_url, e)))?;
        api.path_segments_mut()
            .map_err(|_| SheevaError::Settings(format!("GitLab URL '{}' cannot be a base", options.base_url)))?
            .pop_if_empty()
            .extend(["api", "v4"]);

        let client = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(options.insecure)
            .build()
            .map_err(|e| SheevaError::Settings(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api,
            token: options.token,
        })
    }

    /// API URL with each segment percent-encoded, so a full path such as
    /// `team-a/be` stays a single segment.
    fn endpoint<I, S>(&self, segments: I) -> Result<Url, ProviderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.api.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Decode("API URL cannot be a base".to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn resource_url(&self, kind: ResourceKind, id: ResourceId, action: Option<&str>) -> Result<Url, ProviderError> {
        let id = id.to_string();
        let mut segments = vec![kind_segment(kind), id.as_str()];
        segments.extend(action);
        self.endpoint(segments)
    }

    fn collection_url(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Result<Url, ProviderError> {
        if !parent.supports(kind) {
            return Err(parent.unsupported(kind));
        }
        match parent {
            SubresourceParent::Group(id) => {
                self.endpoint(["groups", &id.to_string(), collection_segment(kind)])
            }
            SubresourceParent::Project(id) => {
                self.endpoint(["projects", &id.to_string(), collection_segment(kind)])
            }
            SubresourceParent::Schedule { project, schedule } => self.endpoint([
                "projects",
                &project.to_string(),
                "pipeline_schedules",
                &schedule.to_string(),
                "variables",
            ]),
        }
    }

    fn item_url(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
        key: &SubresourceKey,
    ) -> Result<Url, ProviderError> {
        let mut url = self.collection_url(parent, kind)?;
        match key {
            SubresourceKey::Variable { key, environment } => {
                url.path_segments_mut()
                    .map_err(|_| ProviderError::Decode("API URL cannot be a base".to_string()))?
                    .push(key);
                if !matches!(parent, SubresourceParent::Schedule { .. }) {
                    url.query_pairs_mut()
                        .append_pair("filter[environment_scope]", environment);
                }
            }
            SubresourceKey::Id(id) => {
                url.path_segments_mut()
                    .map_err(|_| ProviderError::Decode("API URL cannot be a base".to_string()))?
                    .push(&id.to_string());
            }
        }
        Ok(url)
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = request
            .header("PRIVATE-TOKEN", self.token.expose_secret())
            .send()
            .await?;

        let status = response.status();
        debug!(operation, status = status.as_u16(), url = %response.url(), "GitLab request");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(operation, status, body))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, ProviderError> {
        self.send(operation, request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(format!("{}: {}", operation, e)))
    }

    /// Collects every page of a list endpoint by following `x-next-page`.
    async fn paged<T: DeserializeOwned>(&self, operation: &str, url: Url) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut page_url = url.clone();
            page_url
                .query_pairs_mut()
                .append_pair("per_page", PER_PAGE)
                .append_pair("page", &page.to_string());

            let response = self.send(operation, self.client.get(page_url)).await?;
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u32>().ok());

            let batch: Vec<T> = response
                .json()
                .await
                .map_err(|e| ProviderError::Decode(format!("{}: {}", operation, e)))?;
            items.extend(batch);

            match next {
                Some(n) if n > page => page = n,
                _ => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl ResourceProvider for GitLabProvider {
    async fn lookup(
        &self,
        kind: ResourceKind,
        path: &str,
    ) -> Result<Option<ResourceId>, ProviderError> {
        let mut url = self.endpoint([kind_segment(kind), path])?;
        if kind == ResourceKind::Group {
            url.query_pairs_mut().append_pair("with_projects", "false");
        }

        match self.json::<IdResponse>("lookup", self.client.get(url)).await {
            Ok(found) => Ok(Some(found.id)),
            Err(ProviderError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        kind: ResourceKind,
        parent: Option<ResourceId>,
        spec: &CreateSpec,
    ) -> Result<ResourceId, ProviderError> {
        let mut body = json!({
            "name": spec.name,
            "path": spec.name,
            "description": spec.description,
        });
        if let Some(visibility) = &spec.visibility {
            body["visibility"] = json!(visibility);
        }
        match kind {
            ResourceKind::Group => {
                if let Some(parent) = parent {
                    body["parent_id"] = json!(parent);
                }
            }
            ResourceKind::Project => {
                body["namespace_id"] = json!(parent);
                body["initialize_with_readme"] = json!(true);
                body["default_branch"] = json!(DEFAULT_BRANCH);
            }
        }

        let url = self.endpoint([kind_segment(kind)])?;
        let created: IdResponse = self.json("create", self.client.post(url).json(&body)).await?;
        Ok(created.id)
    }

    async fn delete(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        let url = self.resource_url(kind, id, None)?;
        self.send("delete", self.client.delete(url)).await?;
        Ok(())
    }

    async fn archive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        let url = self.resource_url(kind, id, Some("archive"))?;
        self.send("archive", self.client.post(url)).await?;
        Ok(())
    }

    async fn unarchive(&self, kind: ResourceKind, id: ResourceId) -> Result<(), ProviderError> {
        let url = self.resource_url(kind, id, Some("unarchive"))?;
        match self.send("unarchive", self.client.post(url)).await {
            Ok(_) => Ok(()),
            // Instances without group archiving have no such endpoint.
            Err(ProviderError::NotFound(_)) if kind == ResourceKind::Group => {
                debug!(id, "Group unarchive endpoint unavailable, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn transfer(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        namespace: Option<&str>,
    ) -> Result<(), ProviderError> {
        let url = self.resource_url(kind, id, Some("transfer"))?;
        match (kind, namespace) {
            (ResourceKind::Project, Some(namespace)) => {
                self.send(
                    "transfer",
                    self.client.put(url).json(&json!({ "namespace": namespace })),
                )
                .await?;
            }
            (ResourceKind::Project, None) => {
                return Err(ProviderError::Unsupported(
                    "transfer of a project to the top level".to_string(),
                ));
            }
            (ResourceKind::Group, Some(namespace)) => {
                let target = self
                    .lookup(ResourceKind::Group, namespace)
                    .await?
                    .ok_or_else(|| ProviderError::NotFound(namespace.to_string()))?;
                self.send(
                    "transfer",
                    self.client.post(url).json(&json!({ "group_id": target })),
                )
                .await?;
            }
            // Without a group_id GitLab makes the group top-level.
            (ResourceKind::Group, None) => {
                self.send("transfer", self.client.post(url)).await?;
            }
        }
        Ok(())
    }

    async fn rename(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        name: &str,
    ) -> Result<(), ProviderError> {
        let url = self.resource_url(kind, id, None)?;
        self.send(
            "rename",
            self.client.put(url).json(&json!({ "name": name, "path": name })),
        )
        .await?;
        Ok(())
    }

    async fn edit_project_settings(
        &self,
        id: ResourceId,
        settings: &ProjectSettings,
    ) -> Result<(), ProviderError> {
        let url = self.resource_url(ResourceKind::Project, id, None)?;
        self.send("edit project settings", self.client.put(url).json(settings))
            .await?;
        Ok(())
    }

    async fn upload_avatar(
        &self,
        kind: ResourceKind,
        id: ResourceId,
        path: &Path,
    ) -> Result<(), ProviderError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "avatar".to_string());
        let form = multipart::Form::new().part("avatar", multipart::Part::bytes(bytes).file_name(file_name));

        let url = self.resource_url(kind, id, None)?;
        self.send("upload avatar", self.client.put(url).multipart(form))
            .await?;
        Ok(())
    }

    async fn list_subresources(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
    ) -> Result<Vec<RemoteSubresource>, ProviderError> {
        if let SubresourceParent::Schedule { project, schedule } = parent {
            if !parent.supports(kind) {
                return Err(parent.unsupported(kind));
            }
            let url = self.endpoint([
                "projects",
                &project.to_string(),
                "pipeline_schedules",
                &schedule.to_string(),
            ])?;
            let detail: ScheduleVariables = self
                .json("list schedule variables", self.client.get(url))
                .await?;
            return Ok(detail
                .variables
                .into_iter()
                .map(|v| RemoteSubresource {
                    key: SubresourceKey::variable(&v.key, &v.environment),
                    spec: SubresourceSpec::Variable(v),
                })
                .collect());
        }

        let url = self.collection_url(parent, kind)?;
        let operation = format!("list {}s", kind);
        let items = match kind {
            SubresourceKind::Variable => self
                .paged::<Variable>(&operation, url)
                .await?
                .into_iter()
                .map(|v| RemoteSubresource {
                    key: SubresourceKey::variable(&v.key, &v.environment),
                    spec: SubresourceSpec::Variable(v),
                })
                .collect(),
            SubresourceKind::Webhook => self
                .paged::<HookResponse>(&operation, url)
                .await?
                .into_iter()
                .map(|h| RemoteSubresource {
                    key: SubresourceKey::Id(h.id),
                    spec: SubresourceSpec::Webhook(h.hook),
                })
                .collect(),
            SubresourceKind::Schedule => self
                .paged::<ScheduleResponse>(&operation, url)
                .await?
                .into_iter()
                .map(|s| RemoteSubresource {
                    key: SubresourceKey::Id(s.id),
                    spec: SubresourceSpec::Schedule(s.schedule),
                })
                .collect(),
            SubresourceKind::FreezePeriod => self
                .paged::<FreezePeriodResponse>(&operation, url)
                .await?
                .into_iter()
                .map(|f| RemoteSubresource {
                    key: SubresourceKey::Id(f.id),
                    spec: SubresourceSpec::FreezePeriod(f.period),
                })
                .collect(),
        };
        Ok(items)
    }

    async fn create_subresource(
        &self,
        parent: SubresourceParent,
        spec: &SubresourceSpec,
    ) -> Result<SubresourceKey, ProviderError> {
        let url = self.collection_url(parent, spec.kind())?;
        let body = payload(parent, spec)?;
        let operation = format!("create {}", spec.kind());

        match spec {
            SubresourceSpec::Variable(v) => {
                self.send(&operation, self.client.post(url).json(&body))
                    .await?;
                Ok(SubresourceKey::variable(&v.key, &v.environment))
            }
            _ => {
                let created: IdResponse = self
                    .json(&operation, self.client.post(url).json(&body))
                    .await?;
                Ok(SubresourceKey::Id(created.id))
            }
        }
    }

    async fn update_subresource(
        &self,
        parent: SubresourceParent,
        key: &SubresourceKey,
        spec: &SubresourceSpec,
    ) -> Result<(), ProviderError> {
        let url = self.item_url(parent, spec.kind(), key)?;
        let body = payload(parent, spec)?;
        self.send(
            &format!("update {}", spec.kind()),
            self.client.put(url).json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_subresource(
        &self,
        parent: SubresourceParent,
        kind: SubresourceKind,
        key: &SubresourceKey,
    ) -> Result<(), ProviderError> {
        let url = self.item_url(parent, kind, key)?;
        self.send(&format!("delete {}", kind), self.client.delete(url))
            .await?;
        Ok(())
    }

    async fn list_group_projects(
        &self,
        group: ResourceId,
    ) -> Result<Vec<ResourceId>, ProviderError> {
        let url = self.resource_url(ResourceKind::Group, group, Some("projects"))?;
        let projects: Vec<IdResponse> = self.paged("list group projects", url).await?;
        Ok(projects.into_iter().map(|p| p.id).collect())
    }

    async fn list_subgroups(&self, group: ResourceId) -> Result<Vec<ResourceId>, ProviderError> {
        let url = self.resource_url(ResourceKind::Group, group, Some("subgroups"))?;
        let groups: Vec<IdResponse> = self.paged("list subgroups", url).await?;
        Ok(groups.into_iter().map(|g| g.id).collect())
    }
}
