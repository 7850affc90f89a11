//! GitLab REST API access

pub mod client;
pub mod types;

pub use client::{GitLabClient, DEFAULT_TIMEOUT};
pub use types::{Pipeline, Project, User};
