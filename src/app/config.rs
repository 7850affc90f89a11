use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::monitor::{MonitorSettings, ProjectId};

/// GitLab接続設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    /// GitLabインスタンスのURL（/api/v4 は付けない）
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    /// Personal Access Token（read_api スコープ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

impl Default for GitLabConfig {
    fn default() -> Self {
        Self {
            url: default_gitlab_url(),
            token: None,
        }
    }
}

/// 監視設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// ポーリング間隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 同一プロジェクト・同一ステータスの通知を抑制する時間（秒）
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// デスクトップ通知を出すか
    #[serde(default = "default_notifications_enabled")]
    pub notifications_enabled: bool,
    /// HTTPリクエストのタイムアウト（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 連続失敗がこの回数に達したら警告する
    #[serde(default = "default_failure_alert_threshold")]
    pub failure_alert_threshold: u32,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    60
}

fn default_notifications_enabled() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

fn default_failure_alert_threshold() -> u32 {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            cooldown_secs: default_cooldown(),
            notifications_enabled: default_notifications_enabled(),
            request_timeout_secs: default_request_timeout(),
            failure_alert_threshold: default_failure_alert_threshold(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 監視対象のプロジェクトID
    #[serde(default)]
    pub projects: Vec<ProjectId>,
    /// 制御ソケットパス（未設定時はランタイムディレクトリ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// 指定パスから読み込み（存在しない場合はデフォルトを作成して保存）
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
            Ok(config)
        } else {
            // 初回起動時はデフォルト設定をファイルに保存
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                tracing::warn!("Failed to save default config: {}", e);
            }
            Ok(config)
        }
    }

    /// 設定ファイルパスを取得
    pub fn config_path() -> Result<PathBuf> {
        // ~/.config/ci-notifier/config.toml を使用
        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))?;
        Ok(base_dirs.home_dir().join(".config/ci-notifier/config.toml"))
    }

    /// 指定パスに保存（トークンを含むため所有者のみ読み書き可能にする）
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// 設定値の検証
    pub fn validate(&self) -> Result<()> {
        if self.gitlab.url.trim().is_empty() {
            anyhow::bail!("gitlab.url must not be empty");
        }
        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("monitor.poll_interval_secs must be greater than 0");
        }
        if self.monitor.failure_alert_threshold == 0 {
            anyhow::bail!("monitor.failure_alert_threshold must be greater than 0");
        }
        Ok(())
    }

    /// ファイル上の設定だけを読み直してプロジェクト選択を保存する
    ///
    /// 環境変数やコマンドライン引数による上書きはファイルに書き出さない。
    pub fn save_projects(path: &Path, ids: &[ProjectId]) -> Result<Self> {
        let mut config = Self::load_from(path)?;
        let mut seen = BTreeSet::new();
        config.projects = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        config.save_to(path)?;
        Ok(config)
    }

    /// トークンとプロジェクト選択を削除して保存（logout）
    pub fn clear_credentials(path: &Path) -> Result<Self> {
        let mut config = Self::load_from(path)?;
        config.gitlab.token = None;
        config.projects.clear();
        config.save_to(path)?;
        Ok(config)
    }

    /// コマンドライン/環境変数の値で上書き
    pub fn apply_overrides(&mut self, url: Option<String>, token: Option<String>) {
        if let Some(url) = url {
            self.gitlab.url = url;
        }
        if let Some(token) = token {
            self.gitlab.token = Some(token);
        }
    }

    /// トークンを取得（未設定ならエラー）
    pub fn token(&self) -> Result<&str> {
        self.gitlab
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("No GitLab token configured. Run `ci-notifier login` or set GITLAB_TOKEN")
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.request_timeout_secs)
    }

    /// 制御ソケットパス（設定値がなければ既定値）
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::control::default_socket_path)
    }

    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            cooldown: Duration::from_secs(self.monitor.cooldown_secs),
            notifications_enabled: self.monitor.notifications_enabled,
            failure_alert_threshold: self.monitor.failure_alert_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.projects.is_empty());
        assert_eq!(config.gitlab.url, "https://gitlab.com");
        assert!(config.gitlab.token.is_none());
        assert_eq!(config.monitor.poll_interval_secs, 30);
        assert_eq!(config.monitor.cooldown_secs, 60);
        assert!(config.monitor.notifications_enabled);
        assert_eq!(config.monitor.request_timeout_secs, 10);
        assert_eq!(config.monitor.failure_alert_threshold, 3);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
projects = [12, 34]

[gitlab]
url = "https://gitlab.example.com"
token = "glpat-abc"

[monitor]
poll_interval_secs = 15
"#,
        )
        .unwrap();
        assert_eq!(config.projects, vec![ProjectId(12), ProjectId(34)]);
        assert_eq!(config.token().unwrap(), "glpat-abc");
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.monitor.cooldown_secs, 60);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.projects = vec![ProjectId(7)];
        config.gitlab.token = Some("glpat-xyz".to_string());
        config.monitor.notifications_enabled = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.projects, vec![ProjectId(7)]);
        assert_eq!(loaded.gitlab.token.as_deref(), Some("glpat-xyz"));
        assert!(!loaded.monitor.notifications_enabled);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.monitor.poll_interval_secs, 30);
    }

    #[test]
    fn test_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "projects = [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.monitor.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        config.monitor.poll_interval_secs = 30;
        config.gitlab.url = "  ".to_string();
        assert!(config.validate().is_err());

        config.gitlab.url = "https://gitlab.com".to_string();
        config.monitor.failure_alert_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_alert_threshold"));
    }

    #[test]
    fn test_save_projects_keeps_overrides_out_of_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gitlab]\nurl = \"https://gitlab.example.com\"\n").unwrap();

        // main は上書き済みの設定を持っているが、保存には使わない
        let mut in_memory = Config::load_from(&path).unwrap();
        in_memory.apply_overrides(
            Some("https://other.example.com".to_string()),
            Some("glpat-from-env".to_string()),
        );

        let saved =
            Config::save_projects(&path, &[ProjectId(3), ProjectId(1), ProjectId(3)]).unwrap();
        assert_eq!(saved.projects, vec![ProjectId(3), ProjectId(1)]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("glpat-from-env"));
        assert!(!content.contains("other.example.com"));

        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.gitlab.token.is_none());
        assert_eq!(loaded.gitlab.url, "https://gitlab.example.com");
        assert_eq!(loaded.projects, vec![ProjectId(3), ProjectId(1)]);
    }

    #[test]
    fn test_clear_credentials() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.projects = vec![ProjectId(7), ProjectId(8)];
        config.gitlab.token = Some("glpat-xyz".to_string());
        config.monitor.cooldown_secs = 5;
        config.save_to(&path).unwrap();

        Config::clear_credentials(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("glpat-xyz"));
        let loaded = Config::load_from(&path).unwrap();
        assert!(loaded.gitlab.token.is_none());
        assert!(loaded.projects.is_empty());
        assert_eq!(loaded.monitor.cooldown_secs, 5);
    }

    #[test]
    fn test_overrides_and_missing_token() {
        let mut config = Config::default();
        assert!(config.token().is_err());

        config.apply_overrides(Some("https://git.internal".to_string()), Some("tok".to_string()));
        assert_eq!(config.gitlab.url, "https://git.internal");
        assert_eq!(config.token().unwrap(), "tok");

        config.apply_overrides(None, None);
        assert_eq!(config.gitlab.url, "https://git.internal");
    }

    #[test]
    fn test_settings() {
        let mut config = Config::default();
        config.monitor.cooldown_secs = 5;
        config.monitor.failure_alert_threshold = 1;
        let settings = config.settings();
        assert_eq!(settings.cooldown, Duration::from_secs(5));
        assert_eq!(settings.failure_alert_threshold, 1);
        assert!(settings.notifications_enabled);
    }
}
