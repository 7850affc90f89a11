use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ci_notifier::app::{Config, SavedState, StateWriter};
use ci_notifier::control::{
    self, ControlContext, ControlRequest, ControlResponse, LogoutHook, SelectHook,
};
use ci_notifier::gitlab::GitLabClient;
use ci_notifier::monitor::{
    Monitor, MonitorEvent, MonitorState, OverallHealth, ProjectId, ProjectSnapshot,
    UpdateCallback,
};
use ci_notifier::notify::{DesktopNotifier, FailureAlerts, Notification, NotificationSink};

/// CI Notifier - desktop notifications for GitLab CI/CD pipelines
#[derive(Parser)]
#[command(name = "ci-notifier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Config file (defaults to ~/.config/ci-notifier/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// GitLab instance URL
    #[arg(long, env = "GITLAB_URL", global = true)]
    url: Option<String>,

    /// GitLab personal access token
    #[arg(long, env = "GITLAB_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the selected projects and notify on status changes (default)
    Watch {
        /// Override the poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Verify a token and store it in the config file
    Login,
    /// Check that the configured credentials are accepted
    Check,
    /// List projects you are a member of
    Projects,
    /// Show the status reported by a running watcher
    Status,
    /// Choose which projects to monitor
    Select {
        /// Project IDs (see `ci-notifier projects`)
        ids: Vec<ProjectId>,
    },
    /// Stop polling in a running watcher
    Stop,
    /// Forget the stored token, project selection and pipeline states
    Logout,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ログ初期化
    init_logging(&cli.log_level)?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    let mut config = Config::load_from(&config_path)?;
    config.apply_overrides(cli.url.clone(), cli.token.clone());

    match cli.command {
        Some(Commands::Watch { interval }) => run_watch(config_path, config, interval),
        None => run_watch(config_path, config, None),
        Some(Commands::Login) => run_login(&config_path, config),
        Some(Commands::Check) => run_check(&config),
        Some(Commands::Projects) => run_projects(&config),
        Some(Commands::Status) => run_status(&config),
        Some(Commands::Select { ids }) => run_select(&config_path, config, ids),
        Some(Commands::Stop) => run_stop(&config),
        Some(Commands::Logout) => run_logout(&config_path, &config),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("CI Notifier starting");
    Ok(())
}

fn build_client(config: &Config) -> Result<GitLabClient> {
    config.validate()?;
    let client = GitLabClient::new(&config.gitlab.url, config.token()?, config.request_timeout())?;
    Ok(client)
}

fn run_watch(config_path: PathBuf, mut config: Config, interval: Option<u64>) -> Result<()> {
    if let Some(secs) = interval {
        config.monitor.poll_interval_secs = secs;
    }
    let client = build_client(&config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(watch(config_path, config, client))
}

async fn watch(config_path: PathBuf, config: Config, client: GitLabClient) -> Result<()> {
    let project_ids: BTreeSet<ProjectId> = config.projects.iter().copied().collect();
    if project_ids.is_empty() {
        warn!("No projects selected. Use `ci-notifier select <ids>` to choose some");
    }

    // 前回のステータスを復元（読めなければ空から始める）
    let state_path = SavedState::state_path()?;
    let mut saved = SavedState::load(&state_path).unwrap_or_else(|e| {
        warn!("Ignoring unreadable state file: {:#}", e);
        SavedState::default()
    });
    saved.retain(&project_ids);

    let notifier = Arc::new(DesktopNotifier::default());
    let mut monitor = Monitor::new(Arc::new(client), notifier.clone(), config.settings());
    monitor.restore_ledger(saved.last_pipeline_states.values().cloned());

    let saved = Arc::new(Mutex::new(saved));
    let writer = StateWriter::spawn(state_path.clone());
    let on_update = state_writer(Arc::clone(&saved), writer.clone());
    let logout = Arc::new(Notify::new());

    tokio::spawn(report_failures(
        monitor.subscribe(),
        notifier,
        config.gitlab.url.clone(),
        config.monitor.failure_alert_threshold,
    ));

    monitor.start(project_ids, config.poll_interval(), Arc::clone(&on_update));

    let monitor = Arc::new(tokio::sync::Mutex::new(monitor));
    let socket_path = config.socket_path();
    let ctx = ControlContext {
        monitor: Arc::clone(&monitor),
        interval: config.poll_interval(),
        on_update,
        on_select: Some(selection_saver(config_path, Arc::clone(&saved))),
        on_logout: Some(logout_trigger(Arc::clone(&saved), Arc::clone(&logout))),
    };

    let listener_path = socket_path.clone();
    let listener = tokio::spawn(async move {
        if let Err(e) = control::run_listener(&listener_path, ctx).await {
            error!("Control listener error: {:#}", e);
        }
    });

    info!("Watching pipelines on {} (Ctrl-C to quit)", config.gitlab.url);
    let logged_out = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            false
        }
        _ = logout.notified() => true,
    };

    info!("Shutting down");
    monitor.lock().await.stop();
    listener.abort();

    // 書き込みタスクを止めてから最終状態を反映する
    writer.close().await;
    if logged_out {
        if let Err(e) = SavedState::clear(&state_path) {
            warn!("Failed to remove state file: {:#}", e);
        }
    } else {
        let state = saved.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match tokio::task::spawn_blocking(move || state.save(&state_path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save state: {:#}", e),
            Err(e) => warn!("Failed to save state: {}", e),
        }
    }
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!("Failed to remove socket {}: {}", socket_path.display(), e);
        }
    }

    Ok(())
}

/// Log the overall health and hand every published cycle to the state writer
fn state_writer(saved: Arc<Mutex<SavedState>>, writer: StateWriter) -> UpdateCallback {
    Arc::new(move |snapshots: &[ProjectSnapshot]| {
        info!(
            "Overall status: {} ({} projects)",
            OverallHealth::from_snapshots(snapshots).as_str(),
            snapshots.len()
        );

        let mut state = saved.lock().unwrap_or_else(|e| e.into_inner());
        state.record(snapshots);
        writer.submit(state.clone());
    })
}

/// Persist a new project selection to the config and state files
fn selection_saver(config_path: PathBuf, saved: Arc<Mutex<SavedState>>) -> SelectHook {
    Arc::new(move |ids: &[ProjectId]| -> Result<()> {
        Config::save_projects(&config_path, ids)?;

        let selected: BTreeSet<ProjectId> = ids.iter().copied().collect();
        saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(&selected);
        info!("Selected {} projects", selected.len());
        Ok(())
    })
}

/// Forget the in-memory states and wake `watch` so it shuts down
fn logout_trigger(saved: Arc<Mutex<SavedState>>, logout: Arc<Notify>) -> LogoutHook {
    Arc::new(move || {
        *saved.lock().unwrap_or_else(|e| e.into_inner()) = SavedState::default();
        info!("Logout requested");
        logout.notify_one();
    })
}

async fn report_failures(
    mut events: broadcast::Receiver<MonitorEvent>,
    notifier: Arc<DesktopNotifier>,
    gitlab_url: String,
    threshold: u32,
) {
    let mut alerts = FailureAlerts::new(threshold);
    loop {
        match events.recv().await {
            Ok(MonitorEvent::CycleFailed {
                consecutive,
                auth_rejected,
                message,
            }) => {
                error!("Status check failed {} times in a row: {}", consecutive, message);

                // 連続失敗ごとに一度だけデスクトップにも出す
                if alerts.on_failure(consecutive, auth_rejected) {
                    let notification =
                        Notification::for_cycle_failure(auth_rejected, &message, &gitlab_url);
                    if let Err(e) = notifier.deliver(&notification).await {
                        warn!("Failed to show failure notification: {}", e);
                    }
                }
            }
            Ok(MonitorEvent::Updated(_)) => alerts.on_success(),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Failure reporter skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn run_login(config_path: &Path, mut config: Config) -> Result<()> {
    if config.gitlab.token.is_none() {
        config.gitlab.token = Some(prompt_token()?);
    }
    let client = build_client(&config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let user = runtime
        .block_on(client.current_user())
        .context("GitLab did not accept the token")?;

    config.save_to(config_path)?;
    println!(
        "Logged in to {} as {} ({})",
        config.gitlab.url, user.username, user.name
    );
    println!("Credentials saved to {}", config_path.display());
    Ok(())
}

fn prompt_token() -> Result<String> {
    eprint!("GitLab personal access token: ");
    let mut token = String::new();
    std::io::stdin()
        .read_line(&mut token)
        .context("Failed to read token")?;

    let token = token.trim().to_string();
    if token.is_empty() {
        anyhow::bail!("No token entered");
    }
    Ok(token)
}

fn run_check(config: &Config) -> Result<()> {
    let client = build_client(config)?;
    let runtime = tokio::runtime::Runtime::new()?;

    if runtime.block_on(client.test_connection()) {
        println!("Connection to {} OK", config.gitlab.url);
        Ok(())
    } else {
        anyhow::bail!("Could not authenticate against {}", config.gitlab.url)
    }
}

fn run_projects(config: &Config) -> Result<()> {
    let client = build_client(config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let projects = runtime.block_on(client.projects())?;

    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    let selected: BTreeSet<ProjectId> = config.projects.iter().copied().collect();
    for project in &projects {
        let marker = if selected.contains(&project.id) { "*" } else { " " };
        println!(
            "{} {:>10}  {:<40}  {}",
            marker,
            project.id,
            project.path_with_namespace,
            project.default_branch.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    match control::send_request(&config.socket_path(), &ControlRequest::Status)? {
        ControlResponse::Snapshot {
            state,
            health,
            projects,
        } => {
            let state = match state {
                MonitorState::Idle => "idle",
                MonitorState::Running => "running",
            };
            println!("Monitor: {} ({})", state, health.as_str());
            for project in &projects {
                println!(
                    "  {:>10}  {:<8}  {:<30}  {}",
                    project.id,
                    project.status.label(),
                    project.name,
                    project.web_url
                );
            }
            Ok(())
        }
        other => print_response(other),
    }
}

fn run_select(config_path: &Path, config: Config, ids: Vec<ProjectId>) -> Result<()> {
    let socket_path = config.socket_path();
    if socket_path.exists() {
        match control::send_request(&socket_path, &ControlRequest::Select { project_ids: ids.clone() }) {
            Ok(response) => return print_response(response),
            Err(e) => debug!("Watcher not reachable, updating config only: {:#}", e),
        }
    }

    // 上書き済みの config ではなくファイルの内容に選択だけを反映する
    let saved = Config::save_projects(config_path, &ids)?;
    println!("Selected {} projects (takes effect on next `watch`)", saved.projects.len());
    Ok(())
}

fn run_stop(config: &Config) -> Result<()> {
    let response = control::send_request(&config.socket_path(), &ControlRequest::Stop)?;
    print_response(response)
}

fn run_logout(config_path: &Path, config: &Config) -> Result<()> {
    let socket_path = config.socket_path();
    if socket_path.exists() {
        match control::send_request(&socket_path, &ControlRequest::Logout) {
            Ok(response) => print_response(response)?,
            Err(e) => debug!("Watcher not reachable: {:#}", e),
        }
    }

    Config::clear_credentials(config_path)?;
    SavedState::clear(&SavedState::state_path()?)?;
    println!("Removed stored token and project selection from {}", config_path.display());

    if std::env::var_os("GITLAB_TOKEN").is_some() {
        println!("GITLAB_TOKEN is still set in the environment");
    }
    Ok(())
}

fn print_response(response: ControlResponse) -> Result<()> {
    match response {
        ControlResponse::Ack { message } => {
            println!("{}", message);
            Ok(())
        }
        ControlResponse::Error { message } => anyhow::bail!(message),
        ControlResponse::Snapshot { .. } => anyhow::bail!("Unexpected snapshot response"),
    }
}
