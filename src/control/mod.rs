//! Control socket between the CLI and a running `watch` process

pub mod client;
pub mod protocol;
pub mod server;

pub use client::send_request;
pub use protocol::{ControlRequest, ControlResponse};
pub use server::{run_listener, ControlContext, LogoutHook, SelectHook};

use std::path::PathBuf;

/// Runtime dir when the platform has one, temp dir otherwise
pub fn default_socket_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "ci-notifier")
        .and_then(|dirs| dirs.runtime_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(std::env::temp_dir)
        .join("ci-notifier.sock")
}
