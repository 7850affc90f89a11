//! GitLab REST client used as the monitor's status source

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{Pipeline, Project, User};
use crate::monitor::{FetchError, PipelineStatus, ProjectId, ProjectSnapshot, StatusFetcher};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Projects requested per page
const PROJECTS_PER_PAGE: &str = "100";
/// Upper bound on project pages followed per listing
const MAX_PROJECT_PAGES: u32 = 10;

/// Thin client over the GitLab v4 API
#[derive(Debug, Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitLabClient {
    /// Create a client for `base_url` (e.g. `https://gitlab.com`)
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ci-notifier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            http,
            api_base: format!("{}/api/v4", base_url.trim().trim_end_matches('/')),
            token: token.to_string(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// The user owning the token
    pub async fn current_user(&self) -> Result<User, FetchError> {
        let response = self.get("/user", &[]).await?;
        decode("/user", response).await
    }

    /// Whether the configured credentials are accepted
    pub async fn test_connection(&self) -> bool {
        match self.current_user().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connection test failed: {}", e);
                false
            }
        }
    }

    /// Projects the user is a member of, most recently active first
    pub async fn projects(&self) -> Result<Vec<Project>, FetchError> {
        let mut projects = Vec::new();
        let mut page = 1;

        loop {
            let page_param = page.to_string();
            let response = self
                .get(
                    "/projects",
                    &[
                        ("membership", "true"),
                        ("per_page", PROJECTS_PER_PAGE),
                        ("order_by", "last_activity_at"),
                        ("sort", "desc"),
                        ("page", page_param.as_str()),
                    ],
                )
                .await?;

            let next_page = response
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok());

            let batch: Vec<Project> = decode("/projects", response).await?;
            projects.extend(batch);

            match next_page {
                Some(next) if next > page && page < MAX_PROJECT_PAGES => page = next,
                Some(_) => {
                    debug!("Stopped project listing after {} pages", page);
                    break;
                }
                None => break,
            }
        }

        Ok(projects)
    }

    /// Most recently updated pipeline of a project, if it has any
    pub async fn latest_pipeline(&self, project_id: ProjectId) -> Result<Option<Pipeline>, FetchError> {
        let path = format!("/projects/{}/pipelines", project_id);
        let response = self
            .get(
                &path,
                &[("per_page", "1"), ("order_by", "updated_at"), ("sort", "desc")],
            )
            .await?;
        let pipelines: Vec<Pipeline> = decode(&path, response).await?;
        Ok(pipelines.into_iter().next())
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, FetchError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                endpoint: path.to_string(),
                source: Box::new(e),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response)
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: reqwest::Response) -> Result<T, FetchError> {
    response.json::<T>().await.map_err(|e| FetchError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn snapshot_for(project: &Project, pipeline: Option<Pipeline>) -> ProjectSnapshot {
    match pipeline {
        Some(pipeline) => ProjectSnapshot {
            id: project.id,
            name: project.name.clone(),
            status: pipeline.status,
            web_url: pipeline.web_url.unwrap_or_else(|| project.web_url.clone()),
            observed_at: Utc::now(),
            pipeline_id: Some(pipeline.id),
            ref_name: pipeline.ref_name,
        },
        None => ProjectSnapshot::new(
            project.id,
            project.name.clone(),
            PipelineStatus::Unknown,
            project.web_url.clone(),
        ),
    }
}

#[async_trait]
impl StatusFetcher for GitLabClient {
    async fn fetch_all(
        &self,
        project_ids: &BTreeSet<ProjectId>,
    ) -> Result<Vec<ProjectSnapshot>, FetchError> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }

        let selected: Vec<Project> = self
            .projects()
            .await?
            .into_iter()
            .filter(|p| project_ids.contains(&p.id))
            .collect();

        if selected.len() < project_ids.len() {
            debug!(
                "{} of {} selected projects are not accessible",
                project_ids.len() - selected.len(),
                project_ids.len()
            );
        }

        let lookups = selected.iter().map(|project| async move {
            (project, self.latest_pipeline(project.id).await)
        });

        let mut snapshots = Vec::with_capacity(selected.len());
        for (project, result) in join_all(lookups).await {
            match result {
                Ok(pipeline) => snapshots.push(snapshot_for(project, pipeline)),
                Err(e) => warn!("Failed to get pipeline for project {}: {}", project.id, e),
            }
        }

        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    const TOKEN: &str = "glpat-test-token-0000";

    fn client(server: &mockito::ServerGuard) -> GitLabClient {
        GitLabClient::new(&server.url(), TOKEN, Duration::from_secs(5)).unwrap()
    }

    fn ids(ids: &[u64]) -> BTreeSet<ProjectId> {
        ids.iter().map(|id| ProjectId(*id)).collect()
    }

    fn projects_body() -> String {
        json!([
            {"id": 1, "name": "api", "path_with_namespace": "acme/api", "web_url": "https://gitlab.test/acme/api"},
            {"id": 2, "name": "web", "path_with_namespace": "acme/web", "web_url": "https://gitlab.test/acme/web"},
            {"id": 3, "name": "docs", "path_with_namespace": "acme/docs", "web_url": "https://gitlab.test/acme/docs"}
        ])
        .to_string()
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = GitLabClient::new("https://gitlab.example.com/ ", TOKEN, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.api_base(), "https://gitlab.example.com/api/v4");
    }

    #[tokio::test]
    async fn test_empty_selection_makes_no_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let snapshots = client(&server).fetch_all(&BTreeSet::new()).await.unwrap();

        assert!(snapshots.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_projects() {
        let mut server = mockito::Server::new_async().await;
        let projects = server
            .mock("GET", "/api/v4/projects")
            .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("membership".into(), "true".into()),
                Matcher::UrlEncoded("per_page".into(), "100".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(projects_body())
            .create_async()
            .await;
        server
            .mock("GET", "/api/v4/projects/1/pipelines")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v4/projects/2/pipelines")
            .match_query(Matcher::UrlEncoded("order_by".into(), "updated_at".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([{
                    "id": 88,
                    "status": "success",
                    "ref": "main",
                    "web_url": "https://gitlab.test/acme/web/-/pipelines/88",
                    "updated_at": "2024-05-01T10:00:00.000Z"
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let snapshots = client(&server).fetch_all(&ids(&[1, 2])).await.unwrap();

        projects.assert_async().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, ProjectId(2));
        assert_eq!(snapshots[0].name, "web");
        assert_eq!(snapshots[0].status, PipelineStatus::Success);
        assert_eq!(snapshots[0].web_url, "https://gitlab.test/acme/web/-/pipelines/88");
        assert_eq!(snapshots[0].pipeline_id, Some(88));
        assert_eq!(snapshots[0].ref_name.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_project_without_pipelines_is_unknown() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(projects_body())
            .create_async()
            .await;
        server
            .mock("GET", "/api/v4/projects/3/pipelines")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let snapshots = client(&server).fetch_all(&ids(&[3])).await.unwrap();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, PipelineStatus::Unknown);
        assert_eq!(snapshots[0].web_url, "https://gitlab.test/acme/docs");
        assert_eq!(snapshots[0].pipeline_id, None);
    }

    #[tokio::test]
    async fn test_rejected_token_fails_the_batch() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"message":"401 Unauthorized"}"#)
            .create_async()
            .await;

        let err = client(&server).fetch_all(&ids(&[1])).await.unwrap_err();

        assert!(err.is_auth());
        assert!(err.to_string().contains("/projects"));
    }

    #[tokio::test]
    async fn test_project_listing_follows_next_page() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/projects")
            .match_query(Matcher::UrlEncoded("page".into(), "1".into()))
            .with_status(200)
            .with_header("x-next-page", "2")
            .with_body(
                json!([{"id": 1, "name": "api", "web_url": "https://gitlab.test/acme/api"}]).to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/api/v4/projects")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .with_status(200)
            .with_header("x-next-page", "")
            .with_body(
                json!([{"id": 2, "name": "web", "web_url": "https://gitlab.test/acme/web"}]).to_string(),
            )
            .create_async()
            .await;

        let projects = client(&server).projects().await.unwrap();

        let ids: Vec<ProjectId> = projects.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![ProjectId(1), ProjectId(2)]);
    }

    #[tokio::test]
    async fn test_current_user_and_connection_check() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", format!("Bearer {}", TOKEN).as_str())
            .with_status(200)
            .with_body(json!({"id": 9, "username": "octo", "name": "Octo Cat"}).to_string())
            .expect(2)
            .create_async()
            .await;

        let client = client(&server);
        let user = client.current_user().await.unwrap();
        assert_eq!(user.username, "octo");
        assert!(client.test_connection().await);
    }

    #[tokio::test]
    async fn test_connection_check_fails_on_bad_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v4/user")
            .with_status(401)
            .create_async()
            .await;

        assert!(!client(&server).test_connection().await);
    }
}
