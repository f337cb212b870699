use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cumulus_core::{ApiError, CloudClient};
use thiserror::Error;

use crate::settings::{SettingsError, SettingsStore};

use super::fingerprint::{file_digest, mtime_of};
use super::index::{DirEntry, FileEntry, IndexError, StateIndex};
use super::local_watcher::LocalEvent;
use super::paths::{
    PathError, ROOT_SENTINEL, is_hidden, join_relative, local_path_for, relative_from_tree,
    relative_path_of, split_parent,
};
use super::queue::{Direction, QueueSignal, TransferOutcome, TransferQueue};
use super::remote_watcher::RemoteChange;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndexStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

/// The reconciliation engine: sole writer to both state indexes. Consumes
/// events from both watchers, classifies each as "needs propagation" or
/// "already caused by the other side", and issues remote calls or local
/// filesystem mutations accordingly.
pub struct SyncEngine {
    client: CloudClient,
    local: StateIndex,
    remote: StateIndex,
    queue: TransferQueue,
    settings: Arc<SettingsStore>,
    sync_root: PathBuf,
    /// Write-through path → remote-id cache fronting the remote index and
    /// the `get_props` lookup; invalidated on directory create/delete/move.
    dir_ids: HashMap<String, String>,
}

impl SyncEngine {
    pub fn new(
        client: CloudClient,
        local: StateIndex,
        remote: StateIndex,
        queue: TransferQueue,
        settings: Arc<SettingsStore>,
        sync_root: PathBuf,
    ) -> Self {
        Self {
            client,
            local,
            remote,
            queue,
            settings,
            sync_root,
            dir_ids: HashMap::new(),
        }
    }

    /// Recursively lists every remote directory starting at the root,
    /// populating the remote index. Trashed entries and special/system
    /// containers are skipped.
    pub async fn full_remote_index(&mut self) -> Result<IndexStats, EngineError> {
        let root = self.client.get_props_by_path(ROOT_SENTINEL).await?;
        let mut stats = IndexStats::default();
        self.remote
            .upsert_dir(&DirEntry {
                path: ROOT_SENTINEL.to_string(),
                name: ROOT_SENTINEL.to_string(),
                mtime: root.mtime,
                hash: None,
                remote_id: Some(root.id.clone()),
            })
            .await?;
        self.dir_ids
            .insert(ROOT_SENTINEL.to_string(), root.id.clone());

        let mut stack = vec![root.id];
        while let Some(id) = stack.pop() {
            let listing = match self.client.list_dir(&id).await {
                Ok(listing) => listing,
                Err(err) => {
                    eprintln!("[cumulusd] error listing remote directory {id}: {err}");
                    continue;
                }
            };
            let dir_path = relative_from_tree(&listing.info.tree);
            for file in &listing.files {
                if file.is_trash {
                    continue;
                }
                self.remote
                    .upsert_file(&FileEntry {
                        dir_path: dir_path.clone(),
                        path: join_relative(&dir_path, &file.name),
                        name: file.name.clone(),
                        mtime: file.mtime,
                        hash: file.chksum.clone(),
                        remote_id: Some(file.id.clone()),
                    })
                    .await?;
                stats.files += 1;
                stats.bytes += file.size.unwrap_or(0);
            }
            for dir in &listing.dirs {
                if dir.is_trash || !dir.special_dir.is_empty() {
                    continue;
                }
                let path = join_relative(&dir_path, &dir.name);
                self.remote
                    .upsert_dir(&DirEntry {
                        path: path.clone(),
                        name: dir.name.clone(),
                        mtime: dir.mtime,
                        hash: None,
                        remote_id: Some(dir.id.clone()),
                    })
                    .await?;
                self.dir_ids.insert(path, dir.id.clone());
                stack.push(dir.id.clone());
                stats.dirs += 1;
            }
            self.remote.recompute_dir_hash(&dir_path).await?;
        }
        eprintln!(
            "[cumulusd] remote index: {} files, {} dirs",
            stats.files, stats.dirs
        );
        Ok(stats)
    }

    /// Walks the local tree once, fingerprinting every file and aggregating
    /// per-directory hashes exactly as the remote indexer does, so the two
    /// indexes are comparable. Empty directories are indexed directly;
    /// symlinks and hidden entries are skipped. Safe to re-run: unchanged
    /// trees produce identical rows.
    pub async fn full_local_index(&mut self) -> Result<IndexStats, EngineError> {
        let mut stats = IndexStats::default();
        let mut stack = vec![self.sync_root.clone()];
        while let Some(dir) = stack.pop() {
            let Some(dir_rel) = relative_path_of(&self.sync_root, &dir) else {
                continue;
            };
            for path in sorted_entries(&dir).await {
                let Some(rel) = relative_path_of(&self.sync_root, &path) else {
                    continue;
                };
                if is_hidden(&rel) {
                    continue;
                }
                let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                    continue;
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                if meta.is_dir() {
                    let (_, name) = split_parent(&rel);
                    let remote_id = self.local.dir_id(&rel).await?;
                    self.local
                        .upsert_dir(&DirEntry {
                            path: rel,
                            name,
                            mtime: mtime_of(&meta),
                            hash: None,
                            remote_id,
                        })
                        .await?;
                    stats.dirs += 1;
                    stack.push(path);
                } else if meta.is_file() {
                    let hash = match file_digest(&path).await {
                        Ok(hash) => hash,
                        Err(err) => {
                            // Vanished or unreadable between the walk and
                            // the read: no partial index write.
                            eprintln!("[cumulusd] skipping {}: {err}", path.display());
                            continue;
                        }
                    };
                    let (dir_path, name) = split_parent(&rel);
                    let remote_id = self.local.file_id(&rel).await?;
                    self.local
                        .upsert_file(&FileEntry {
                            dir_path,
                            path: rel,
                            name,
                            mtime: mtime_of(&meta),
                            hash: Some(hash),
                            remote_id,
                        })
                        .await?;
                    stats.files += 1;
                    stats.bytes += meta.len();
                }
            }
            if dir_rel != ROOT_SENTINEL {
                self.local.recompute_dir_hash(&dir_rel).await?;
            }
        }
        eprintln!(
            "[cumulusd] local index: {} files, {} dirs, {} bytes",
            stats.files, stats.dirs, stats.bytes
        );
        Ok(stats)
    }

    /// Compares the freshly built indexes and queues the work that makes
    /// the replicas converge: local-only entries go out, remote-only
    /// entries come in. Presence of a path in the opposite index is the
    /// sole "already in sync" signal.
    pub async fn reconcile_indexes(&mut self) -> Result<(), EngineError> {
        let mut uploads = 0u64;
        let mut downloads = 0u64;

        // Directories first, parents before children (path order).
        for dir in self.local.list_dirs().await? {
            if self.remote.dir_exists(&dir.path).await? {
                continue;
            }
            self.push_dir_to_remote(&dir.path).await?;
        }
        for dir in self.remote.list_dirs().await? {
            if dir.path == ROOT_SENTINEL || self.local.dir_exists(&dir.path).await? {
                continue;
            }
            let local = local_path_for(&self.sync_root, &dir.path)?;
            tokio::fs::create_dir_all(&local).await?;
            self.local
                .upsert_dir(&DirEntry {
                    path: dir.path,
                    name: dir.name,
                    mtime: dir.mtime,
                    hash: None,
                    remote_id: dir.remote_id,
                })
                .await?;
        }

        for file in self.local.list_files().await? {
            if self.remote.file_exists(&file.path).await? {
                continue;
            }
            let (dir_path, _) = split_parent(&file.path);
            let Some(dir_id) = self.resolve_dir_id(&dir_path).await? else {
                eprintln!("[cumulusd] cannot upload {}: unknown parent", file.path);
                continue;
            };
            self.queue.enqueue_upload(dir_id, file.path);
            uploads += 1;
        }
        for file in self.remote.list_files().await? {
            if self.local.file_exists(&file.path).await? {
                continue;
            }
            let Some(id) = file.remote_id else {
                continue;
            };
            self.queue.enqueue_download(id, file.path);
            downloads += 1;
        }

        if uploads > 0 || downloads > 0 {
            eprintln!("[cumulusd] reconcile: queued {uploads} uploads, {downloads} downloads");
        }
        Ok(())
    }

    pub async fn handle_queue_signal(&mut self, signal: QueueSignal) -> Result<(), EngineError> {
        match signal {
            QueueSignal::TimerFired { path } => {
                self.queue.begin(&path);
                Ok(())
            }
            QueueSignal::Done(outcome) => self.transfer_finished(outcome).await,
        }
    }

    pub fn stop_timers(&mut self) {
        self.queue.cancel_timers();
    }

    async fn transfer_finished(&mut self, outcome: TransferOutcome) -> Result<(), EngineError> {
        let TransferOutcome {
            path,
            direction,
            result,
            file_id,
        } = outcome;
        match result {
            Err(err) => {
                // Slot released below; the path stays inconsistent until
                // the next triggering event or bootstrap.
                eprintln!("[cumulusd] transfer failed for {path}: {err}");
            }
            Ok(remote_meta) => match direction {
                Direction::Upload => {
                    if let Some(uploaded) = remote_meta {
                        eprintln!("[cumulusd] uploaded {path}");
                        self.local.set_file_remote_id(&path, &uploaded.id).await?;
                        let (dir_path, name) = split_parent(&path);
                        let row = self.local.file_by_path(&path).await?;
                        let (mtime, hash) = row
                            .map(|row| (row.mtime, row.hash))
                            .unwrap_or((uploaded.mtime, uploaded.chksum.clone()));
                        self.remote
                            .upsert_file(&FileEntry {
                                dir_path: dir_path.clone(),
                                path: path.clone(),
                                name,
                                mtime,
                                hash: hash.or(uploaded.chksum),
                                remote_id: Some(uploaded.id),
                            })
                            .await?;
                        self.remote.recompute_dir_hash(&dir_path).await?;
                    }
                }
                Direction::Download => {
                    eprintln!("[cumulusd] downloaded {path}");
                    let local = local_path_for(&self.sync_root, &path)?;
                    match tokio::fs::metadata(&local).await {
                        Ok(meta) => match file_digest(&local).await {
                            Ok(hash) => {
                                let (dir_path, name) = split_parent(&path);
                                self.local
                                    .upsert_file(&FileEntry {
                                        dir_path: dir_path.clone(),
                                        path: path.clone(),
                                        name,
                                        mtime: mtime_of(&meta),
                                        hash: Some(hash),
                                        remote_id: file_id,
                                    })
                                    .await?;
                                self.local.recompute_dir_hash(&dir_path).await?;
                            }
                            Err(err) => {
                                eprintln!("[cumulusd] error fingerprinting {path}: {err}");
                            }
                        },
                        Err(err) => {
                            eprintln!("[cumulusd] downloaded file vanished {path}: {err}");
                        }
                    }
                }
            },
        }
        self.queue.finish(&path);
        Ok(())
    }

    /// Creates a remote directory mirroring a local one and records it in
    /// both indexes. Returns the new id, or `None` on a logged failure.
    async fn push_dir_to_remote(&mut self, rel: &str) -> Result<Option<String>, EngineError> {
        let (parent, name) = split_parent(rel);
        let Some(parent_id) = self.resolve_dir_id(&parent).await? else {
            eprintln!("[cumulusd] cannot create remote directory {rel}: unknown parent");
            return Ok(None);
        };
        match self.client.make_dir(&parent_id, &name).await {
            Ok(id) => {
                let mtime = self
                    .local
                    .dir_by_path(rel)
                    .await?
                    .map(|dir| dir.mtime)
                    .unwrap_or(0);
                self.local.set_dir_remote_id(rel, &id).await?;
                self.remote
                    .upsert_dir(&DirEntry {
                        path: rel.to_string(),
                        name,
                        mtime,
                        hash: None,
                        remote_id: Some(id.clone()),
                    })
                    .await?;
                self.dir_ids.insert(rel.to_string(), id.clone());
                Ok(Some(id))
            }
            Err(err) => {
                eprintln!("[cumulusd] error creating remote directory {rel}: {err}");
                Ok(None)
            }
        }
    }

    async fn resolve_dir_id(&mut self, dir_path: &str) -> Result<Option<String>, EngineError> {
        if let Some(id) = self.dir_ids.get(dir_path) {
            return Ok(Some(id.clone()));
        }
        if let Some(id) = self.remote.dir_id(dir_path).await? {
            self.dir_ids.insert(dir_path.to_string(), id.clone());
            return Ok(Some(id));
        }
        let remote_path = if dir_path == ROOT_SENTINEL {
            ROOT_SENTINEL.to_string()
        } else {
            format!("/{dir_path}")
        };
        match self.client.get_props_by_path(&remote_path).await {
            Ok(props) => {
                self.dir_ids.insert(dir_path.to_string(), props.id.clone());
                Ok(Some(props.id))
            }
            Err(err) => {
                eprintln!("[cumulusd] error resolving remote id for {dir_path}: {err}");
                Ok(None)
            }
        }
    }

    fn invalidate_dir_ids(&mut self, prefix: &str) {
        let descendant = format!("{prefix}/");
        self.dir_ids
            .retain(|path, _| path != prefix && !path.starts_with(&descendant));
    }
}

/// Directory entries in name order, so repeated walks index children in a
/// stable order.
async fn sorted_entries(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("[cumulusd] cannot read {}: {err}", dir.display());
            return entries;
        }
    };
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => entries.push(entry.path()),
            Ok(None) => break,
            Err(err) => {
                eprintln!("[cumulusd] error walking {}: {err}", dir.display());
                break;
            }
        }
    }
    entries.sort();
    entries
}

include!("engine_local.rs");
include!("engine_remote.rs");

#[cfg(test)]
#[path = "engine_tests/part1.rs"]
mod engine_tests_part1;
#[cfg(test)]
#[path = "engine_tests/part2.rs"]
mod engine_tests_part2;
#[cfg(test)]
#[path = "engine_tests/part3.rs"]
mod engine_tests_part3;
