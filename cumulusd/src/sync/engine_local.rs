impl SyncEngine {
    /// Entry point for filesystem watcher events in `Steady` state.
    pub async fn handle_local_event(&mut self, event: LocalEvent) -> Result<(), EngineError> {
        match event {
            LocalEvent::Added { path, is_dir: true } => self.local_dir_added(&path).await,
            LocalEvent::Added { path, .. } | LocalEvent::Modified { path } => {
                self.local_file_changed(&path).await
            }
            LocalEvent::Deleted { path, is_dir } => self.local_deleted(&path, is_dir).await,
            LocalEvent::Moved { from, to, is_dir } => self.local_moved(&from, &to, is_dir).await,
        }
    }

    async fn local_file_changed(&mut self, path: &std::path::Path) -> Result<(), EngineError> {
        let Some(rel) = relative_path_of(&self.sync_root, path) else {
            return Ok(());
        };
        if is_hidden(&rel) {
            return Ok(());
        }
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) => {
                // Gone between the notification and the stat: drop the event.
                eprintln!("[cumulusd] dropping event for {rel}: {err}");
                return Ok(());
            }
        };
        if meta.is_dir() {
            return Ok(());
        }
        let hash = match file_digest(path).await {
            Ok(hash) => hash,
            Err(err) => {
                eprintln!("[cumulusd] dropping event for {rel}: {err}");
                return Ok(());
            }
        };
        let (dir_path, name) = split_parent(&rel);
        let remote_id = self.local.file_id(&rel).await?;
        self.local
            .upsert_file(&FileEntry {
                dir_path: dir_path.clone(),
                path: rel.clone(),
                name,
                mtime: mtime_of(&meta),
                hash: Some(hash),
                remote_id,
            })
            .await?;
        self.local.recompute_dir_hash(&dir_path).await?;

        // The remote side already has this path: the write was produced by
        // a download, so it must not bounce back as an upload.
        if self.remote.file_exists(&rel).await? {
            return Ok(());
        }
        let Some(dir_id) = self.resolve_dir_id(&dir_path).await? else {
            eprintln!("[cumulusd] cannot upload {rel}: unknown parent directory");
            return Ok(());
        };
        eprintln!("[cumulusd] local file changed: {rel}");
        self.queue.enqueue_upload(dir_id, rel);
        Ok(())
    }

    async fn local_dir_added(&mut self, path: &std::path::Path) -> Result<(), EngineError> {
        let Some(rel) = relative_path_of(&self.sync_root, path) else {
            return Ok(());
        };
        if is_hidden(&rel) || rel == ROOT_SENTINEL {
            return Ok(());
        }
        let mtime = tokio::fs::metadata(path)
            .await
            .map(|meta| mtime_of(&meta))
            .unwrap_or(0);
        let (_, name) = split_parent(&rel);
        let remote_id = self.local.dir_id(&rel).await?;
        self.local
            .upsert_dir(&DirEntry {
                path: rel.clone(),
                name,
                mtime,
                hash: None,
                remote_id,
            })
            .await?;

        if !self.remote.dir_exists(&rel).await? {
            eprintln!("[cumulusd] local directory added: {rel}");
            self.push_dir_to_remote(&rel).await?;
        }
        // The directory may have arrived with contents already in place
        // (unpacked archive, tree moved in from outside the root).
        self.index_local_subtree(&rel).await
    }

    async fn local_deleted(
        &mut self,
        path: &std::path::Path,
        is_dir: bool,
    ) -> Result<(), EngineError> {
        let Some(rel) = relative_path_of(&self.sync_root, path) else {
            return Ok(());
        };
        if is_hidden(&rel) || rel == ROOT_SENTINEL {
            return Ok(());
        }
        if is_dir {
            if !self.local.dir_exists(&rel).await? {
                return Ok(());
            }
            eprintln!("[cumulusd] local directory deleted: {rel}");
            self.local.remove_dir_recursive(&rel).await?;
            let Some(id) = self.remote.dir_id(&rel).await? else {
                eprintln!("[cumulusd] directory {rel} is not in the remote index");
                return Ok(());
            };
            // One recursive remote call covers the whole subtree.
            match self.client.remove_dir(&id, true, true).await {
                Ok(()) => {
                    self.remote.remove_dir_recursive(&rel).await?;
                    self.invalidate_dir_ids(&rel);
                }
                Err(err) => {
                    eprintln!("[cumulusd] error deleting remote directory {rel}: {err}");
                }
            }
        } else {
            if !self.local.file_exists(&rel).await? {
                return Ok(());
            }
            eprintln!("[cumulusd] local file deleted: {rel}");
            self.queue.cancel(&rel);
            match self.remote.file_id(&rel).await? {
                Some(id) => {
                    if let Err(err) = self.client.remove_file(&id, true).await {
                        eprintln!("[cumulusd] error deleting remote file {rel}: {err}");
                    }
                }
                None => {
                    eprintln!("[cumulusd] file {rel} is not in the remote index");
                }
            }
            self.local.remove_file(&rel).await?;
            let (dir_path, _) = split_parent(&rel);
            self.local.recompute_dir_hash(&dir_path).await?;
        }
        Ok(())
    }

    /// The remote API has no rename call, so a local move propagates as a
    /// delete of the origin plus an upload (or subtree re-index) of the
    /// destination.
    async fn local_moved(
        &mut self,
        from: &std::path::Path,
        to: &std::path::Path,
        is_dir: bool,
    ) -> Result<(), EngineError> {
        self.local_deleted(from, is_dir).await?;
        if is_dir {
            self.local_dir_added(to).await
        } else {
            self.local_file_changed(to).await
        }
    }

    /// Walks a local subtree, mirroring directories to the remote side and
    /// queueing uploads for files the remote index does not know.
    async fn index_local_subtree(&mut self, rel: &str) -> Result<(), EngineError> {
        let subtree_root = local_path_for(&self.sync_root, rel)?;
        let mut stack = vec![subtree_root];
        while let Some(dir) = stack.pop() {
            let Some(dir_rel) = relative_path_of(&self.sync_root, &dir) else {
                continue;
            };
            for path in sorted_entries(&dir).await {
                let Some(entry_rel) = relative_path_of(&self.sync_root, &path) else {
                    continue;
                };
                if is_hidden(&entry_rel) {
                    continue;
                }
                let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                    continue;
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                if meta.is_dir() {
                    let (_, name) = split_parent(&entry_rel);
                    let remote_id = self.local.dir_id(&entry_rel).await?;
                    self.local
                        .upsert_dir(&DirEntry {
                            path: entry_rel.clone(),
                            name,
                            mtime: mtime_of(&meta),
                            hash: None,
                            remote_id,
                        })
                        .await?;
                    if !self.remote.dir_exists(&entry_rel).await? {
                        self.push_dir_to_remote(&entry_rel).await?;
                    }
                    stack.push(path);
                } else if meta.is_file() {
                    let hash = match file_digest(&path).await {
                        Ok(hash) => hash,
                        Err(err) => {
                            eprintln!("[cumulusd] skipping {entry_rel}: {err}");
                            continue;
                        }
                    };
                    let (dir_path, name) = split_parent(&entry_rel);
                    let remote_id = self.local.file_id(&entry_rel).await?;
                    self.local
                        .upsert_file(&FileEntry {
                            dir_path: dir_path.clone(),
                            path: entry_rel.clone(),
                            name,
                            mtime: mtime_of(&meta),
                            hash: Some(hash),
                            remote_id,
                        })
                        .await?;
                    if self.remote.file_exists(&entry_rel).await? {
                        continue;
                    }
                    let Some(dir_id) = self.resolve_dir_id(&dir_path).await? else {
                        eprintln!("[cumulusd] cannot upload {entry_rel}: unknown parent");
                        continue;
                    };
                    self.queue.enqueue_upload(dir_id, entry_rel);
                }
            }
            if dir_rel != ROOT_SENTINEL {
                self.local.recompute_dir_hash(&dir_rel).await?;
            }
        }
        Ok(())
    }
}
