use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::monitor::{ProjectId, ProjectSnapshot};

/// 再起動をまたいで保持する状態（state.json）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedState {
    /// プロジェクトごとの最後に観測したパイプライン
    #[serde(default)]
    pub last_pipeline_states: BTreeMap<ProjectId, ProjectSnapshot>,
}

impl SavedState {
    /// 状態ファイルのパス（プラットフォームのデータディレクトリ）
    pub fn state_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "ci-notifier")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;
        Ok(dirs.data_dir().join("state.json"))
    }

    /// 読み込み（ファイルがなければ空の状態）
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))
    }

    /// 一時ファイルに書いてからリネームする
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state directory")?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write state file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        Ok(())
    }

    /// 状態ファイルを削除（logout）
    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove state file: {}", path.display()))
            }
        }
    }

    /// サイクル結果を反映（観測できなかったプロジェクトは前回値を残す）
    pub fn record(&mut self, snapshots: &[ProjectSnapshot]) {
        for snapshot in snapshots {
            self.last_pipeline_states
                .insert(snapshot.id, snapshot.clone());
        }
    }

    /// 選択外のプロジェクトを削除
    pub fn retain(&mut self, project_ids: &BTreeSet<ProjectId>) {
        self.last_pipeline_states
            .retain(|id, _| project_ids.contains(id));
    }
}

/// state.json をブロッキングスレッドで書き込む
///
/// 未書き込みの状態は最新のものだけが残る。`close` 以降の書き込みは捨てる。
#[derive(Clone)]
pub struct StateWriter {
    pending: Arc<watch::Sender<Option<SavedState>>>,
    closed: Arc<Mutex<bool>>,
}

impl StateWriter {
    /// 書き込みタスクを起動（tokio ランタイム内で呼ぶこと）
    pub fn spawn(path: PathBuf) -> Self {
        let (pending, mut rx) = watch::channel(None::<SavedState>);
        let closed = Arc::new(Mutex::new(false));

        let task_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(state) = rx.borrow_and_update().clone() else {
                    continue;
                };

                let target = path.clone();
                let closed = Arc::clone(&task_closed);
                let result = tokio::task::spawn_blocking(move || {
                    // 書き込み中はロックを保持し、close と直列化する
                    let closed = closed.lock().unwrap_or_else(|e| e.into_inner());
                    if *closed {
                        return Ok(false);
                    }
                    state.save(&target).map(|()| true)
                })
                .await;

                match result {
                    Ok(Ok(true)) => tracing::debug!("State saved to {}", path.display()),
                    Ok(Ok(false)) => break,
                    Ok(Err(e)) => tracing::warn!("Failed to save state: {:#}", e),
                    Err(e) => tracing::warn!("State writer failed: {}", e),
                }
            }
        });

        Self {
            pending: Arc::new(pending),
            closed,
        }
    }

    /// 保存を依頼（待たない）
    pub fn submit(&self, state: SavedState) {
        self.pending.send_replace(Some(state));
    }

    /// 書き込み中のものを待ってから停止する
    pub async fn close(&self) {
        let closed = Arc::clone(&self.closed);
        let result = tokio::task::spawn_blocking(move || {
            *closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        })
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to close state writer: {}", e);
        }
    }
}
