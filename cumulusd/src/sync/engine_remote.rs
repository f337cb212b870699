impl SyncEngine {
    /// Entry point for decoded remote events in `Steady` state.
    pub async fn handle_remote_change(&mut self, change: RemoteChange) -> Result<(), EngineError> {
        match change {
            RemoteChange::Watermark(timestamp) => {
                self.settings.set_watermark(timestamp)?;
                Ok(())
            }
            RemoteChange::FileAdded {
                id,
                parent_id,
                name,
            } => self.remote_file_added(id, parent_id, name).await,
            RemoteChange::FileRemoved {
                id,
                parent_id,
                name,
            } => self.remote_file_removed(id, parent_id, name).await,
            RemoteChange::DirCreated {
                id,
                parent_id,
                name,
            } => self.remote_dir_created(id, parent_id, name).await,
            RemoteChange::DirRemoved { id } => self.remote_dir_removed(id).await,
            RemoteChange::FileMoved {
                id,
                old_parent_id,
                old_name,
                new_parent_id,
                new_name,
            } => {
                self.remote_file_moved(id, old_parent_id, old_name, new_parent_id, new_name)
                    .await
            }
            RemoteChange::DirMoved {
                id,
                old_parent_id,
                old_name,
                new_parent_id,
                new_name,
            } => {
                self.remote_dir_moved(id, old_parent_id, old_name, new_parent_id, new_name)
                    .await
            }
        }
    }

    async fn remote_file_added(
        &mut self,
        id: String,
        parent_id: String,
        name: String,
    ) -> Result<(), EngineError> {
        let Some(dir_path) = self.remote.dir_path_by_id(&parent_id).await? else {
            eprintln!("[cumulusd] remote file added under unknown parent {parent_id}");
            return Ok(());
        };
        let rel = join_relative(&dir_path, &name);
        eprintln!("[cumulusd] remote file added: {rel}");

        let props = match self.client.get_props_by_id(&id).await {
            Ok(props) => props,
            Err(err) => {
                eprintln!("[cumulusd] error fetching props for {rel}: {err}");
                return Ok(());
            }
        };
        self.remote
            .upsert_file(&FileEntry {
                dir_path: dir_path.clone(),
                path: rel.clone(),
                name,
                mtime: props.mtime,
                hash: props.chksum,
                remote_id: Some(id.clone()),
            })
            .await?;
        self.remote.recompute_dir_hash(&dir_path).await?;

        // The local side already has this path: the event is the echo of
        // our own upload, not new content.
        if self.local.file_exists(&rel).await? {
            return Ok(());
        }
        self.queue.enqueue_download(id, rel);
        Ok(())
    }

    async fn remote_file_removed(
        &mut self,
        id: String,
        parent_id: String,
        name: String,
    ) -> Result<(), EngineError> {
        let rel = match self.remote.dir_path_by_id(&parent_id).await? {
            Some(dir_path) => join_relative(&dir_path, &name),
            None => match self.remote.file_path_by_id(&id).await? {
                Some(path) => path,
                None => {
                    eprintln!("[cumulusd] remote file removed under unknown parent {parent_id}");
                    return Ok(());
                }
            },
        };
        eprintln!("[cumulusd] remote file removed: {rel}");
        self.remote.remove_file(&rel).await?;
        let (dir_path, _) = split_parent(&rel);
        self.remote.recompute_dir_hash(&dir_path).await?;

        if self.local.file_exists(&rel).await? {
            self.queue.cancel(&rel);
            self.local.remove_file(&rel).await?;
            self.local.recompute_dir_hash(&dir_path).await?;
            let local = local_path_for(&self.sync_root, &rel)?;
            if let Err(err) = tokio::fs::remove_file(&local).await {
                eprintln!("[cumulusd] error removing {rel}: {err}");
            }
        }
        Ok(())
    }

    async fn remote_dir_created(
        &mut self,
        id: String,
        parent_id: String,
        name: String,
    ) -> Result<(), EngineError> {
        let Some(parent_path) = self.remote.dir_path_by_id(&parent_id).await? else {
            eprintln!("[cumulusd] remote directory created under unknown parent {parent_id}");
            return Ok(());
        };
        let rel = join_relative(&parent_path, &name);
        eprintln!("[cumulusd] remote directory created: {rel}");

        let mtime = match self.client.get_props_by_id(&id).await {
            Ok(props) => props.mtime,
            Err(err) => {
                eprintln!("[cumulusd] error fetching props for {rel}: {err}");
                0
            }
        };
        self.remote
            .upsert_dir(&DirEntry {
                path: rel.clone(),
                name: name.clone(),
                mtime,
                hash: None,
                remote_id: Some(id.clone()),
            })
            .await?;
        self.dir_ids.insert(rel.clone(), id.clone());

        if self.local.dir_exists(&rel).await? {
            return Ok(());
        }
        self.local
            .upsert_dir(&DirEntry {
                path: rel.clone(),
                name,
                mtime,
                hash: None,
                remote_id: Some(id),
            })
            .await?;
        let local = local_path_for(&self.sync_root, &rel)?;
        if let Err(err) = tokio::fs::create_dir_all(&local).await {
            eprintln!("[cumulusd] error creating {rel}: {err}");
        }
        Ok(())
    }

    /// The removed directory is resolved to a path by its own id against
    /// the remote index, then both index subtrees and the on-disk tree go.
    async fn remote_dir_removed(&mut self, id: String) -> Result<(), EngineError> {
        let Some(rel) = self.remote.dir_path_by_id(&id).await? else {
            eprintln!("[cumulusd] remote directory removed with unknown id {id}");
            return Ok(());
        };
        eprintln!("[cumulusd] remote directory removed: {rel}");
        self.remote.remove_dir_recursive(&rel).await?;
        self.invalidate_dir_ids(&rel);

        if self.local.dir_exists(&rel).await? {
            self.local.remove_dir_recursive(&rel).await?;
        }
        // Never the sync root itself.
        if rel != ROOT_SENTINEL {
            let local = local_path_for(&self.sync_root, &rel)?;
            if tokio::fs::metadata(&local).await.is_ok() {
                if let Err(err) = tokio::fs::remove_dir_all(&local).await {
                    eprintln!("[cumulusd] error removing {rel}: {err}");
                }
            }
        }
        Ok(())
    }

    /// Remote file moves propagate as local renames rather than a
    /// delete-and-redownload cycle.
    async fn remote_file_moved(
        &mut self,
        id: String,
        old_parent_id: String,
        old_name: String,
        new_parent_id: String,
        new_name: String,
    ) -> Result<(), EngineError> {
        let Some(old_dir) = self.remote.dir_path_by_id(&old_parent_id).await? else {
            eprintln!("[cumulusd] remote file moved from unknown parent {old_parent_id}");
            return Ok(());
        };
        let Some(new_dir) = self.remote.dir_path_by_id(&new_parent_id).await? else {
            eprintln!("[cumulusd] remote file moved to unknown parent {new_parent_id}");
            return Ok(());
        };
        let old_rel = join_relative(&old_dir, &old_name);
        let new_rel = join_relative(&new_dir, &new_name);
        eprintln!("[cumulusd] remote file moved: {old_rel} -> {new_rel}");

        self.remote.move_file(&old_rel, &new_rel).await?;
        self.remote.recompute_dir_hash(&old_dir).await?;
        self.remote.recompute_dir_hash(&new_dir).await?;

        if self.local.file_exists(&old_rel).await? {
            let from = local_path_for(&self.sync_root, &old_rel)?;
            let to = local_path_for(&self.sync_root, &new_rel)?;
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {
                    self.local.move_file(&old_rel, &new_rel).await?;
                    self.local.recompute_dir_hash(&old_dir).await?;
                    self.local.recompute_dir_hash(&new_dir).await?;
                }
                Err(err) => {
                    eprintln!("[cumulusd] error renaming {old_rel}: {err}");
                    self.queue.enqueue_download(id, new_rel);
                }
            }
        } else {
            // No local counterpart to rename; fetch the destination.
            self.queue.enqueue_download(id, new_rel);
        }
        Ok(())
    }

    async fn remote_dir_moved(
        &mut self,
        _id: String,
        old_parent_id: String,
        old_name: String,
        new_parent_id: String,
        new_name: String,
    ) -> Result<(), EngineError> {
        let Some(old_dir) = self.remote.dir_path_by_id(&old_parent_id).await? else {
            eprintln!("[cumulusd] remote directory moved from unknown parent {old_parent_id}");
            return Ok(());
        };
        let Some(new_dir) = self.remote.dir_path_by_id(&new_parent_id).await? else {
            eprintln!("[cumulusd] remote directory moved to unknown parent {new_parent_id}");
            return Ok(());
        };
        let old_rel = join_relative(&old_dir, &old_name);
        let new_rel = join_relative(&new_dir, &new_name);
        eprintln!("[cumulusd] remote directory moved: {old_rel} -> {new_rel}");

        self.remote.move_subtree(&old_rel, &new_rel).await?;
        self.invalidate_dir_ids(&old_rel);

        if self.local.dir_exists(&old_rel).await? {
            let from = local_path_for(&self.sync_root, &old_rel)?;
            let to = local_path_for(&self.sync_root, &new_rel)?;
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {
                    self.local.move_subtree(&old_rel, &new_rel).await?;
                }
                Err(err) => {
                    eprintln!("[cumulusd] error renaming {old_rel}: {err}");
                }
            }
        } else {
            // Left for the next bootstrap pass to materialize.
            eprintln!("[cumulusd] moved directory {new_rel} has no local counterpart");
        }
        Ok(())
    }
}
