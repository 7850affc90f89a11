//! Unix Domain Socket server answering control requests

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use super::protocol::{ControlRequest, ControlResponse, MAX_FRAME_LEN};
use crate::monitor::{Monitor, OverallHealth, ProjectId, UpdateCallback};

/// Invoked with the new project set before a `select` restarts polling
pub type SelectHook = Arc<dyn Fn(&[ProjectId]) -> Result<()> + Send + Sync>;

/// Invoked after a `logout` stopped and reset the monitor
pub type LogoutHook = Arc<dyn Fn() + Send + Sync>;

/// Everything a request handler needs to act on the monitor
#[derive(Clone)]
pub struct ControlContext {
    pub monitor: Arc<Mutex<Monitor>>,
    pub interval: Duration,
    pub on_update: UpdateCallback,
    pub on_select: Option<SelectHook>,
    pub on_logout: Option<LogoutHook>,
}

/// Bind the control socket, replacing a stale one
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("Failed to remove existing socket")?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind to socket: {}", socket_path.display()))
}

/// Bind `socket_path` and serve requests until the task is dropped
pub async fn run_listener(socket_path: &Path, ctx: ControlContext) -> Result<()> {
    let listener = bind(socket_path)?;
    tracing::info!("Control listener started at: {}", socket_path.display());
    serve(listener, ctx).await
}

/// Accept connections on an already bound listener
pub async fn serve(listener: UnixListener, ctx: ControlContext) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        tracing::warn!("Error handling connection: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, ctx: ControlContext) -> Result<()> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Message too large: {} bytes", len);
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .context("Failed to read message body")?;

    let response = match serde_json::from_slice::<ControlRequest>(&buf) {
        Ok(request) => {
            tracing::debug!("Control request: {:?}", request);
            handle_request(&ctx, request).await
        }
        Err(e) => ControlResponse::error(format!("Invalid request: {}", e)),
    };

    let body = serde_json::to_vec(&response).context("Failed to serialize response")?;
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .context("Failed to write response length")?;
    stream
        .write_all(&body)
        .await
        .context("Failed to write response")?;
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

/// Apply one request to the monitor
pub async fn handle_request(ctx: &ControlContext, request: ControlRequest) -> ControlResponse {
    let mut monitor = ctx.monitor.lock().await;

    match request {
        ControlRequest::Status => {
            let projects = monitor.latest();
            ControlResponse::Snapshot {
                state: monitor.state(),
                health: OverallHealth::from_snapshots(&projects),
                projects,
            }
        }
        ControlRequest::Select { project_ids } => {
            if let Some(hook) = &ctx.on_select {
                if let Err(e) = hook(&project_ids) {
                    tracing::warn!("Failed to persist project selection: {:#}", e);
                    return ControlResponse::error(format!("Failed to save selection: {:#}", e));
                }
            }

            monitor.start(project_ids, ctx.interval, Arc::clone(&ctx.on_update));
            let count = monitor.project_ids().map_or(0, |ids| ids.len());
            ControlResponse::ack(format!("Monitoring {} projects", count))
        }
        ControlRequest::Stop => {
            if monitor.is_running() {
                monitor.stop();
                ControlResponse::ack("Monitoring stopped")
            } else {
                ControlResponse::ack("Monitor is already idle")
            }
        }
        ControlRequest::Logout => {
            monitor.stop();
            monitor.reset();
            if let Some(hook) = &ctx.on_logout {
                hook();
            }
            ControlResponse::ack("Logged out; watcher is shutting down")
        }
    }
}
