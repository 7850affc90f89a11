//! GitLab REST v4 response types (only the fields we read)

use serde::{Deserialize, Serialize};

use crate::monitor::{PipelineStatus, ProjectId};

/// `GET /user`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub name: String,
}

/// Entry of `GET /projects`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub path_with_namespace: String,
    pub web_url: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Entry of `GET /projects/:id/pipelines`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    pub status: PipelineStatus,
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_pipeline() {
        let json = r#"{
            "id": 47,
            "iid": 12,
            "project_id": 1,
            "status": "waiting_for_resource",
            "source": "push",
            "ref": "main",
            "sha": "a91957a858320c0e17f3a0eca7cfacbff50ea29a",
            "web_url": "https://gitlab.example.com/acme/web/-/pipelines/47",
            "created_at": "2016-08-11T11:28:34.085Z",
            "updated_at": "2016-08-11T11:32:35.169Z"
        }"#;
        let pipeline: Pipeline = serde_json::from_str(json).unwrap();
        assert_eq!(pipeline.id, 47);
        assert_eq!(pipeline.status, PipelineStatus::Pending);
        assert_eq!(pipeline.ref_name.as_deref(), Some("main"));
        assert!(pipeline.web_url.is_some());
    }

    #[test]
    fn test_deserialize_project_minimal() {
        let json = r#"{"id": 3, "name": "web", "web_url": "https://gitlab.example.com/acme/web"}"#;
        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.id, ProjectId(3));
        assert!(project.default_branch.is_none());
    }
}
