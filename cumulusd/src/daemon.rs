use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cumulus_core::CloudClient;
use tokio::sync::mpsc;

use crate::control::ControlServer;
use crate::settings::{ROOT_NAME_KEY, SettingsStore};
use crate::sync::engine::SyncEngine;
use crate::sync::index::StateIndex;
use crate::sync::local_watcher::LocalWatcher;
use crate::sync::queue::TransferQueue;
use crate::sync::remote_watcher::RemoteWatcher;

const DEFAULT_SYNC_DIR_NAME: &str = "Cumulus";
const DEFAULT_API_URL: &str = "https://api.cumulus.cloud";
const DEFAULT_POLL_MS: u64 = 1500;
const DEFAULT_DEBOUNCE_MS: u64 = 2000;
const SOCKET_FILE: &str = "control.sock";
const SETTINGS_FILE: &str = "settings.json";
const LOCAL_STATE_DATABASE: &str = "local.db";
const REMOTE_STATE_DATABASE: &str = "remote.db";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub api_url: String,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_dir = std::env::var("CUMULUS_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_dir);
        let sync_root = std::env::var("CUMULUS_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let api_url =
            std::env::var("CUMULUS_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let socket_path = std::env::var("CUMULUS_SOCKET")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(SOCKET_FILE));
        let poll_interval =
            Duration::from_millis(read_u64_env("CUMULUS_POLL_MS", DEFAULT_POLL_MS));
        let debounce =
            Duration::from_millis(read_u64_env("CUMULUS_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS));
        let enable_local_watcher = read_bool_env("CUMULUS_ENABLE_LOCAL_WATCHER", true);

        Ok(Self {
            sync_root,
            api_url,
            data_dir,
            socket_path,
            poll_interval,
            debounce,
            enable_local_watcher,
        })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn local_db_path(&self) -> PathBuf {
        self.data_dir.join(LOCAL_STATE_DATABASE)
    }

    pub fn remote_db_path(&self) -> PathBuf {
        self.data_dir.join(REMOTE_STATE_DATABASE)
    }
}

/// Removes both state indexes and clears the bootstrap flag, so the next
/// start performs a fresh full bootstrap.
pub fn reset_state(config: &DaemonConfig) -> anyhow::Result<()> {
    for db_path in [config.local_db_path(), config.remote_db_path()] {
        for candidate in [
            db_path.clone(),
            db_path.with_extension("db-wal"),
            db_path.with_extension("db-shm"),
        ] {
            match std::fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", candidate.display()));
                }
            }
        }
    }
    let settings = SettingsStore::load(config.settings_path())?;
    settings.set_bootstrap_done(false)?;
    settings.set_watermark(0)?;
    Ok(())
}

/// Daemon lifetime: `Unauthenticated` until credentials are available,
/// `Bootstrapping` while the full indexes are built, `Steady` once both
/// watchers feed the reconciliation loop.
pub struct DaemonRuntime {
    config: DaemonConfig,
    settings: Arc<SettingsStore>,
}

impl DaemonRuntime {
    pub async fn bootstrap(mut config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;
        let settings = Arc::new(
            SettingsStore::load(config.settings_path()).context("failed to load settings")?,
        );
        // The sync root name is a user setting unless overridden by env.
        if std::env::var("CUMULUS_SYNC_DIR").is_err()
            && let Some(root_name) = settings
                .get(ROOT_NAME_KEY)
                .filter(|value| !value.is_empty())
            && let Some(home) = dirs::home_dir()
        {
            config.sync_root = home.join(root_name);
        }
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;
        Ok(Self { config, settings })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let control = ControlServer::bind(&self.config.socket_path, Arc::clone(&self.settings))
            .with_context(|| {
                format!("unable to bind control socket at {:?}", self.config.socket_path)
            })?;
        eprintln!(
            "[cumulusd] started: sync_root={}, api={}, local_watcher={}",
            self.config.sync_root.display(),
            self.config.api_url,
            if self.config.enable_local_watcher {
                "enabled"
            } else {
                "disabled"
            }
        );

        // Unauthenticated: credentials may arrive over the control socket
        // at any time.
        let client = tokio::select! {
            client = self.wait_for_session() => client,
            result = tokio::signal::ctrl_c() => {
                result.context("failed waiting for shutdown signal")?;
                eprintln!("[cumulusd] stopped before authentication");
                return Ok(());
            }
        };

        eprintln!("[cumulusd] authenticated, bootstrapping");
        let local = StateIndex::open(&self.config.local_db_path())
            .await
            .context("failed to open local state index")?;
        let remote = StateIndex::open(&self.config.remote_db_path())
            .await
            .context("failed to open remote state index")?;
        let (queue, mut queue_rx) =
            TransferQueue::new(client.clone(), self.config.sync_root.clone());
        let queue = queue.with_debounce(self.config.debounce);
        let mut engine = SyncEngine::new(
            client.clone(),
            local,
            remote,
            queue,
            Arc::clone(&self.settings),
            self.config.sync_root.clone(),
        );

        engine
            .full_remote_index()
            .await
            .context("full remote index failed")?;
        engine
            .full_local_index()
            .await
            .context("full local index failed")?;
        engine
            .reconcile_indexes()
            .await
            .context("index reconciliation failed")?;
        if !self.settings.bootstrap_done() {
            self.settings.set_watermark(now_unix())?;
            self.settings.set_bootstrap_done(true)?;
        }

        let (remote_watcher, mut remote_rx) = RemoteWatcher::start(
            client,
            self.settings.watermark(),
            self.config.poll_interval,
        );
        let (mut local_watcher, mut local_rx) = if self.config.enable_local_watcher {
            let (watcher, rx) = LocalWatcher::start(&self.config.sync_root);
            (Some(watcher), rx)
        } else {
            // Disabled: an immediately closed channel keeps the branch idle.
            let (_tx, rx) = mpsc::unbounded_channel();
            (None, rx)
        };
        eprintln!("[cumulusd] steady: watching for changes");

        loop {
            tokio::select! {
                Some(event) = local_rx.recv() => {
                    if let Err(err) = engine.handle_local_event(event).await {
                        eprintln!("[cumulusd] local event error: {err}");
                    }
                }
                Some(change) = remote_rx.recv() => {
                    if let Err(err) = engine.handle_remote_change(change).await {
                        eprintln!("[cumulusd] remote event error: {err}");
                    }
                }
                Some(signal) = queue_rx.recv() => {
                    if let Err(err) = engine.handle_queue_signal(signal).await {
                        eprintln!("[cumulusd] transfer error: {err}");
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("failed waiting for shutdown signal")?;
                    break;
                }
            }
        }

        // Watcher loops and debounce timers stop here; transfers already
        // handed to the network layer are not forcibly aborted.
        remote_watcher.stop();
        if let Some(watcher) = local_watcher.as_mut() {
            watcher.stop();
        }
        engine.stop_timers();
        control.stop();
        eprintln!("[cumulusd] stopped");
        Ok(())
    }

    async fn wait_for_session(&self) -> CloudClient {
        let mut announced = false;
        loop {
            let Some((login, password)) = self.settings.credentials() else {
                if !announced {
                    eprintln!(
                        "[cumulusd] unauthenticated: waiting for credentials on the control socket"
                    );
                    announced = true;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            };
            match CloudClient::authenticate(&self.config.api_url, &login, &password).await {
                Ok(client) => return client,
                Err(err) => {
                    eprintln!("[cumulusd] authentication failed: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
