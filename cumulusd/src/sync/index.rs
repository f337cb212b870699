use std::fs;
use std::path::Path;

use sqlx::{Row, SqlitePool, sqlite::SqliteConnectOptions};
use thiserror::Error;

use super::fingerprint::child_digest;
use super::paths::{ROOT_SENTINEL, rebase, split_parent};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One file the daemon believes exists on a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub dir_path: String,
    pub path: String,
    pub name: String,
    pub mtime: i64,
    pub hash: Option<String>,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub name: String,
    pub mtime: i64,
    pub hash: Option<String>,
    pub remote_id: Option<String>,
}

/// Persistent snapshot of one replica (local filesystem or remote store).
/// The reconciliation engine is the only writer; two instances exist, one
/// per replica, over the same schema.
pub struct StateIndex {
    pool: SqlitePool,
}

impl StateIndex {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let index = Self { pool };
        index.init().await?;
        Ok(index)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                dir TEXT NOT NULL,
                name TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                hash TEXT,
                remote_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dirs (
                path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                hash TEXT,
                remote_id TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS files_dir ON files(dir)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS files_remote_id ON files(remote_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS dirs_remote_id ON dirs(remote_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_file(&self, entry: &FileEntry) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO files (path, dir, name, mtime, hash, remote_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                dir = excluded.dir,
                name = excluded.name,
                mtime = excluded.mtime,
                hash = excluded.hash,
                remote_id = excluded.remote_id",
        )
        .bind(&entry.path)
        .bind(&entry.dir_path)
        .bind(&entry.name)
        .bind(entry.mtime)
        .bind(&entry.hash)
        .bind(&entry.remote_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_dir(&self, entry: &DirEntry) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO dirs (path, name, mtime, hash, remote_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                mtime = excluded.mtime,
                hash = excluded.hash,
                remote_id = excluded.remote_id",
        )
        .bind(&entry.path)
        .bind(&entry.name)
        .bind(entry.mtime)
        .bind(&entry.hash)
        .bind(&entry.remote_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn file_by_path(&self, path: &str) -> Result<Option<FileEntry>, IndexError> {
        let row = sqlx::query(
            "SELECT path, dir, name, mtime, hash, remote_id FROM files WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(file_from_row).transpose()
    }

    pub async fn dir_by_path(&self, path: &str) -> Result<Option<DirEntry>, IndexError> {
        let row = sqlx::query("SELECT path, name, mtime, hash, remote_id FROM dirs WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(dir_from_row).transpose()
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool, IndexError> {
        let row = sqlx::query("SELECT 1 FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn dir_exists(&self, path: &str) -> Result<bool, IndexError> {
        let row = sqlx::query("SELECT 1 FROM dirs WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_dir(&self, path: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM dirs WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes the directory row and every file and directory below it in
    /// one logical operation.
    pub async fn remove_dir_recursive(&self, path: &str) -> Result<(), IndexError> {
        if path == ROOT_SENTINEL {
            sqlx::query("DELETE FROM files").execute(&self.pool).await?;
            sqlx::query("DELETE FROM dirs").execute(&self.pool).await?;
            return Ok(());
        }
        let pattern = format!("{}/%", path.trim_end_matches('/'));
        sqlx::query("DELETE FROM files WHERE path LIKE ?1")
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM dirs WHERE path = ?1 OR path LIKE ?2")
            .bind(path)
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn file_id(&self, path: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT remote_id FROM files WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("remote_id")?),
            None => Ok(None),
        }
    }

    pub async fn dir_id(&self, path: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT remote_id FROM dirs WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("remote_id")?),
            None => Ok(None),
        }
    }

    pub async fn file_path_by_id(&self, remote_id: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT path FROM files WHERE remote_id = ?1")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("path")?)),
            None => Ok(None),
        }
    }

    pub async fn dir_path_by_id(&self, remote_id: &str) -> Result<Option<String>, IndexError> {
        let row = sqlx::query("SELECT path FROM dirs WHERE remote_id = ?1")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("path")?)),
            None => Ok(None),
        }
    }

    pub async fn set_file_remote_id(&self, path: &str, remote_id: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE files SET remote_id = ?1 WHERE path = ?2")
            .bind(remote_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_dir_remote_id(&self, path: &str, remote_id: &str) -> Result<(), IndexError> {
        sqlx::query("UPDATE dirs SET remote_id = ?1 WHERE path = ?2")
            .bind(remote_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Recomputes a directory's aggregate hash from its immediate child
    /// file hashes in insertion order and stores it on the dir row.
    pub async fn recompute_dir_hash(&self, dir_path: &str) -> Result<String, IndexError> {
        let rows = sqlx::query(
            "SELECT hash FROM files WHERE dir = ?1 AND hash IS NOT NULL ORDER BY rowid ASC",
        )
        .bind(dir_path)
        .fetch_all(&self.pool)
        .await?;
        let mut hashes = Vec::with_capacity(rows.len());
        for row in rows {
            hashes.push(row.try_get::<String, _>("hash")?);
        }
        let digest = child_digest(&hashes);
        sqlx::query("UPDATE dirs SET hash = ?1 WHERE path = ?2")
            .bind(&digest)
            .bind(dir_path)
            .execute(&self.pool)
            .await?;
        Ok(digest)
    }

    pub async fn move_file(&self, from: &str, to: &str) -> Result<(), IndexError> {
        let Some(entry) = self.file_by_path(from).await? else {
            return Ok(());
        };
        let (dir_path, name) = split_parent(to);
        self.remove_file(from).await?;
        self.upsert_file(&FileEntry {
            dir_path,
            path: to.to_string(),
            name,
            mtime: entry.mtime,
            hash: entry.hash,
            remote_id: entry.remote_id,
        })
        .await?;
        Ok(())
    }

    /// Rewrites a directory row and everything below it from `from` to
    /// `to`, preserving hashes, remote ids, and sibling order.
    pub async fn move_subtree(&self, from: &str, to: &str) -> Result<(), IndexError> {
        let dirs = self.dirs_under(from).await?;
        let files = self.files_under(from).await?;
        for entry in dirs {
            let Some(new_path) = rebase(&entry.path, from, to) else {
                continue;
            };
            let (_, name) = split_parent(&new_path);
            self.remove_dir(&entry.path).await?;
            self.upsert_dir(&DirEntry {
                path: new_path,
                name,
                mtime: entry.mtime,
                hash: entry.hash,
                remote_id: entry.remote_id,
            })
            .await?;
        }
        for entry in files {
            let Some(new_path) = rebase(&entry.path, from, to) else {
                continue;
            };
            let (dir_path, name) = split_parent(&new_path);
            self.remove_file(&entry.path).await?;
            self.upsert_file(&FileEntry {
                dir_path,
                path: new_path,
                name,
                mtime: entry.mtime,
                hash: entry.hash,
                remote_id: entry.remote_id,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>, IndexError> {
        let rows = sqlx::query(
            "SELECT path, dir, name, mtime, hash, remote_id FROM files ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(file_from_row).collect()
    }

    pub async fn list_dirs(&self) -> Result<Vec<DirEntry>, IndexError> {
        let rows =
            sqlx::query("SELECT path, name, mtime, hash, remote_id FROM dirs ORDER BY path ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(dir_from_row).collect()
    }

    async fn dirs_under(&self, prefix: &str) -> Result<Vec<DirEntry>, IndexError> {
        let pattern = format!("{}/%", prefix.trim_end_matches('/'));
        let rows = sqlx::query(
            "SELECT path, name, mtime, hash, remote_id FROM dirs
             WHERE path = ?1 OR path LIKE ?2
             ORDER BY rowid ASC",
        )
        .bind(prefix)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(dir_from_row).collect()
    }

    async fn files_under(&self, prefix: &str) -> Result<Vec<FileEntry>, IndexError> {
        let pattern = format!("{}/%", prefix.trim_end_matches('/'));
        let rows = sqlx::query(
            "SELECT path, dir, name, mtime, hash, remote_id FROM files
             WHERE path LIKE ?1
             ORDER BY rowid ASC",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(file_from_row).collect()
    }
}

fn file_from_row(row: sqlx::sqlite::SqliteRow) -> Result<FileEntry, IndexError> {
    Ok(FileEntry {
        path: row.try_get("path")?,
        dir_path: row.try_get("dir")?,
        name: row.try_get("name")?,
        mtime: row.try_get("mtime")?,
        hash: row.try_get("hash")?,
        remote_id: row.try_get("remote_id")?,
    })
}

fn dir_from_row(row: sqlx::sqlite::SqliteRow) -> Result<DirEntry, IndexError> {
    Ok(DirEntry {
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        mtime: row.try_get("mtime")?,
        hash: row.try_get("hash")?,
        remote_id: row.try_get("remote_id")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
