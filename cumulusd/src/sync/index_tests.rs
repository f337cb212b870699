use super::*;
use sqlx::SqlitePool;

async fn make_index() -> StateIndex {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let index = StateIndex::from_pool(pool);
    index.init().await.unwrap();
    index
}

fn file(dir_path: &str, path: &str, hash: &str) -> FileEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    FileEntry {
        dir_path: dir_path.to_string(),
        path: path.to_string(),
        name,
        mtime: 100,
        hash: Some(hash.to_string()),
        remote_id: None,
    }
}

fn dir(path: &str) -> DirEntry {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    DirEntry {
        path: path.to_string(),
        name,
        mtime: 100,
        hash: None,
        remote_id: None,
    }
}

#[tokio::test]
async fn upsert_and_fetch_file() {
    let index = make_index().await;
    let entry = file("Docs", "Docs/A.txt", "h1");
    index.upsert_file(&entry).await.unwrap();

    let fetched = index.file_by_path("Docs/A.txt").await.unwrap().unwrap();
    assert_eq!(fetched, entry);
    assert!(index.file_exists("Docs/A.txt").await.unwrap());
    assert!(!index.file_exists("Docs/B.txt").await.unwrap());
}

#[tokio::test]
async fn upsert_replaces_by_path() {
    let index = make_index().await;
    let mut entry = file("/", "a.txt", "h1");
    index.upsert_file(&entry).await.unwrap();

    entry.mtime = 200;
    entry.hash = Some("h2".to_string());
    index.upsert_file(&entry).await.unwrap();

    let rows = index.list_files().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].mtime, 200);
    assert_eq!(rows[0].hash.as_deref(), Some("h2"));
}

#[tokio::test]
async fn reindexing_unchanged_rows_is_idempotent() {
    let index = make_index().await;
    let entries = vec![
        file("/", "a.txt", "ha"),
        file("Docs", "Docs/A.txt", "h1"),
        file("Docs", "Docs/B.txt", "h2"),
    ];
    for entry in &entries {
        index.upsert_file(entry).await.unwrap();
    }
    let first = index.list_files().await.unwrap();

    for entry in &entries {
        index.upsert_file(entry).await.unwrap();
    }
    let second = index.list_files().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.len(), 3);
}

#[tokio::test]
async fn recursive_delete_removes_the_whole_subtree() {
    let index = make_index().await;
    index.upsert_dir(&dir("D")).await.unwrap();
    index.upsert_dir(&dir("D/D2")).await.unwrap();
    index.upsert_dir(&dir("Docs")).await.unwrap();
    index.upsert_file(&file("D", "D/F.txt", "h1")).await.unwrap();
    index
        .upsert_file(&file("D/D2", "D/D2/G.txt", "h2"))
        .await
        .unwrap();
    index
        .upsert_file(&file("Docs", "Docs/keep.txt", "h3"))
        .await
        .unwrap();

    index.remove_dir_recursive("D").await.unwrap();

    assert!(!index.dir_exists("D").await.unwrap());
    assert!(!index.dir_exists("D/D2").await.unwrap());
    assert!(!index.file_exists("D/F.txt").await.unwrap());
    assert!(!index.file_exists("D/D2/G.txt").await.unwrap());
    assert!(index.file_exists("Docs/keep.txt").await.unwrap());
    assert!(index.dir_exists("Docs").await.unwrap());
}

#[tokio::test]
async fn recursive_delete_does_not_match_sibling_prefixes() {
    let index = make_index().await;
    index.upsert_dir(&dir("D")).await.unwrap();
    index.upsert_dir(&dir("D2")).await.unwrap();
    index.upsert_file(&file("D2", "D2/F.txt", "h1")).await.unwrap();

    index.remove_dir_recursive("D").await.unwrap();

    assert!(index.dir_exists("D2").await.unwrap());
    assert!(index.file_exists("D2/F.txt").await.unwrap());
}

#[tokio::test]
async fn dir_hash_aggregates_child_hashes_in_insertion_order() {
    let index = make_index().await;
    index.upsert_dir(&dir("Docs")).await.unwrap();
    index.upsert_file(&file("Docs", "Docs/A.txt", "h1")).await.unwrap();
    index.upsert_file(&file("Docs", "Docs/B.txt", "h2")).await.unwrap();

    let original = index.recompute_dir_hash("Docs").await.unwrap();
    assert_eq!(original, child_digest(["h1", "h2"]));
    assert_eq!(
        index.dir_by_path("Docs").await.unwrap().unwrap().hash,
        Some(original.clone())
    );

    index.upsert_file(&file("Docs", "Docs/C.txt", "h3")).await.unwrap();
    let with_third = index.recompute_dir_hash("Docs").await.unwrap();
    assert_ne!(with_third, original);

    index.remove_file("Docs/C.txt").await.unwrap();
    let restored = index.recompute_dir_hash("Docs").await.unwrap();
    assert_eq!(restored, original);
}

#[tokio::test]
async fn updating_a_file_keeps_its_position_in_the_dir_hash() {
    let index = make_index().await;
    index.upsert_dir(&dir("Docs")).await.unwrap();
    index.upsert_file(&file("Docs", "Docs/A.txt", "h1")).await.unwrap();
    index.upsert_file(&file("Docs", "Docs/B.txt", "h2")).await.unwrap();

    let mut changed = file("Docs", "Docs/A.txt", "h9");
    changed.mtime = 300;
    index.upsert_file(&changed).await.unwrap();

    let digest = index.recompute_dir_hash("Docs").await.unwrap();
    assert_eq!(digest, child_digest(["h9", "h2"]));
}

#[tokio::test]
async fn id_lookups_resolve_both_directions() {
    let index = make_index().await;
    let mut docs = dir("Docs");
    docs.remote_id = Some("d1".to_string());
    index.upsert_dir(&docs).await.unwrap();
    let mut entry = file("Docs", "Docs/A.txt", "h1");
    entry.remote_id = Some("f1".to_string());
    index.upsert_file(&entry).await.unwrap();

    assert_eq!(index.dir_id("Docs").await.unwrap().as_deref(), Some("d1"));
    assert_eq!(
        index.dir_path_by_id("d1").await.unwrap().as_deref(),
        Some("Docs")
    );
    assert_eq!(
        index.file_id("Docs/A.txt").await.unwrap().as_deref(),
        Some("f1")
    );
    assert_eq!(
        index.file_path_by_id("f1").await.unwrap().as_deref(),
        Some("Docs/A.txt")
    );
    assert_eq!(index.dir_path_by_id("missing").await.unwrap(), None);
}

#[tokio::test]
async fn set_remote_id_after_upload() {
    let index = make_index().await;
    index.upsert_file(&file("/", "a.txt", "h1")).await.unwrap();
    index.set_file_remote_id("a.txt", "R1").await.unwrap();
    assert_eq!(index.file_id("a.txt").await.unwrap().as_deref(), Some("R1"));
}

#[tokio::test]
async fn move_subtree_rewrites_paths_and_keeps_metadata() {
    let index = make_index().await;
    let mut docs = dir("Docs");
    docs.remote_id = Some("d1".to_string());
    index.upsert_dir(&docs).await.unwrap();
    index.upsert_dir(&dir("Docs/Letters")).await.unwrap();
    let mut entry = file("Docs/Letters", "Docs/Letters/A.txt", "h1");
    entry.remote_id = Some("f1".to_string());
    index.upsert_file(&entry).await.unwrap();

    index.move_subtree("Docs", "Archive").await.unwrap();

    assert!(!index.dir_exists("Docs").await.unwrap());
    assert_eq!(
        index.dir_id("Archive").await.unwrap().as_deref(),
        Some("d1")
    );
    assert!(index.dir_exists("Archive/Letters").await.unwrap());
    let moved = index
        .file_by_path("Archive/Letters/A.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.dir_path, "Archive/Letters");
    assert_eq!(moved.hash.as_deref(), Some("h1"));
    assert_eq!(moved.remote_id.as_deref(), Some("f1"));
}

#[tokio::test]
async fn move_file_updates_parent_linkage() {
    let index = make_index().await;
    index.upsert_file(&file("/", "a.txt", "h1")).await.unwrap();
    index.move_file("a.txt", "Docs/a.txt").await.unwrap();

    let moved = index.file_by_path("Docs/a.txt").await.unwrap().unwrap();
    assert_eq!(moved.dir_path, "Docs");
    assert!(!index.file_exists("a.txt").await.unwrap());
}
