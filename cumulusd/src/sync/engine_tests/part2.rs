use super::*;
use super::engine_tests_part1::{Harness, make_harness, md5_hex, run_transfers, seed_remote_root};
use wiremock::matchers::{method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn seed_remote_file(harness: &Harness, dir_path: &str, path: &str, id: &str) {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    harness
        .engine
        .remote
        .upsert_file(&FileEntry {
            dir_path: dir_path.to_string(),
            path: path.to_string(),
            name,
            mtime: 50,
            hash: Some("h1".to_string()),
            remote_id: Some(id.to_string()),
        })
        .await
        .unwrap();
}

async fn seed_local_file(harness: &Harness, dir_path: &str, path: &str, remote_id: Option<&str>) {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    harness
        .engine
        .local
        .upsert_file(&FileEntry {
            dir_path: dir_path.to_string(),
            path: path.to_string(),
            name,
            mtime: 50,
            hash: Some("h1".to_string()),
            remote_id: remote_id.map(str::to_string),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn remote_file_added_is_downloaded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("id", "f1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "f1", "name": "b.txt", "mtime": 50, "chksum": md5_hex(b"hello")}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/v1/files/f1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;

    harness
        .engine
        .handle_remote_change(RemoteChange::FileAdded {
            id: "f1".to_string(),
            parent_id: "root".to_string(),
            name: "b.txt".to_string(),
        })
        .await
        .unwrap();

    assert!(harness.engine.remote.file_exists("b.txt").await.unwrap());
    run_transfers(&mut harness, 1).await;

    assert_eq!(
        std::fs::read(harness.sync_root.join("b.txt")).unwrap(),
        b"hello"
    );
    let row = harness
        .engine
        .local
        .file_by_path("b.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.remote_id.as_deref(), Some("f1"));
    assert_eq!(row.hash.as_deref(), Some(md5_hex(b"hello").as_str()));
}

#[tokio::test]
async fn remote_add_for_a_path_present_locally_is_not_downloaded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("id", "f1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "f1", "name": "b.txt", "mtime": 50, "chksum": "h1"}
        })))
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    seed_local_file(&harness, ROOT_SENTINEL, "b.txt", None).await;

    harness
        .engine
        .handle_remote_change(RemoteChange::FileAdded {
            id: "f1".to_string(),
            parent_id: "root".to_string(),
            name: "b.txt".to_string(),
        })
        .await
        .unwrap();

    // The remote index reflects the event, but no local write is queued.
    assert!(harness.engine.remote.file_exists("b.txt").await.unwrap());
    assert_eq!(harness.engine.queue.in_flight(), 0);
    assert!(harness.signals.try_recv().is_err());
}

#[tokio::test]
async fn remote_file_removed_deletes_the_local_copy() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    seed_remote_file(&harness, ROOT_SENTINEL, "b.txt", "f1").await;
    seed_local_file(&harness, ROOT_SENTINEL, "b.txt", Some("f1")).await;
    std::fs::write(harness.sync_root.join("b.txt"), b"bytes").unwrap();

    harness
        .engine
        .handle_remote_change(RemoteChange::FileRemoved {
            id: "f1".to_string(),
            parent_id: "root".to_string(),
            name: "b.txt".to_string(),
        })
        .await
        .unwrap();

    assert!(!harness.engine.remote.file_exists("b.txt").await.unwrap());
    assert!(!harness.engine.local.file_exists("b.txt").await.unwrap());
    assert!(!harness.sync_root.join("b.txt").exists());
}

#[tokio::test]
async fn remote_dir_created_materializes_locally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("id", "d2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "d2", "name": "Docs", "mtime": 60}
        })))
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;

    harness
        .engine
        .handle_remote_change(RemoteChange::DirCreated {
            id: "d2".to_string(),
            parent_id: "root".to_string(),
            name: "Docs".to_string(),
        })
        .await
        .unwrap();

    assert!(harness.sync_root.join("Docs").is_dir());
    assert_eq!(
        harness.engine.remote.dir_id("Docs").await.unwrap().as_deref(),
        Some("d2")
    );
    assert_eq!(
        harness.engine.local.dir_id("Docs").await.unwrap().as_deref(),
        Some("d2")
    );
}

#[tokio::test]
async fn remote_dir_removed_resolves_the_path_by_its_own_id() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    for (index, id) in [
        (&harness.engine.remote, Some("d2".to_string())),
        (&harness.engine.local, Some("d2".to_string())),
    ] {
        index
            .upsert_dir(&DirEntry {
                path: "Docs".to_string(),
                name: "Docs".to_string(),
                mtime: 60,
                hash: None,
                remote_id: id,
            })
            .await
            .unwrap();
    }
    seed_remote_file(&harness, "Docs", "Docs/A.txt", "f2").await;
    seed_local_file(&harness, "Docs", "Docs/A.txt", Some("f2")).await;
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/A.txt"), b"bytes").unwrap();

    harness
        .engine
        .handle_remote_change(RemoteChange::DirRemoved {
            id: "d2".to_string(),
        })
        .await
        .unwrap();

    for index in [&harness.engine.remote, &harness.engine.local] {
        assert!(!index.dir_exists("Docs").await.unwrap());
        assert!(!index.file_exists("Docs/A.txt").await.unwrap());
    }
    assert!(!harness.sync_root.join("Docs").exists());
}

#[tokio::test]
async fn remote_file_move_becomes_a_local_rename() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    harness
        .engine
        .remote
        .upsert_dir(&DirEntry {
            path: "Docs".to_string(),
            name: "Docs".to_string(),
            mtime: 60,
            hash: None,
            remote_id: Some("d1".to_string()),
        })
        .await
        .unwrap();
    seed_remote_file(&harness, ROOT_SENTINEL, "a.txt", "f1").await;
    seed_local_file(&harness, ROOT_SENTINEL, "a.txt", Some("f1")).await;
    std::fs::write(harness.sync_root.join("a.txt"), b"bytes").unwrap();

    harness
        .engine
        .handle_remote_change(RemoteChange::FileMoved {
            id: "f1".to_string(),
            old_parent_id: "root".to_string(),
            old_name: "a.txt".to_string(),
            new_parent_id: "d1".to_string(),
            new_name: "b.txt".to_string(),
        })
        .await
        .unwrap();

    assert!(!harness.sync_root.join("a.txt").exists());
    assert_eq!(
        std::fs::read(harness.sync_root.join("Docs/b.txt")).unwrap(),
        b"bytes"
    );
    assert!(!harness.engine.remote.file_exists("a.txt").await.unwrap());
    assert_eq!(
        harness
            .engine
            .remote
            .file_id("Docs/b.txt")
            .await
            .unwrap()
            .as_deref(),
        Some("f1")
    );
    assert_eq!(
        harness
            .engine
            .local
            .file_id("Docs/b.txt")
            .await
            .unwrap()
            .as_deref(),
        Some("f1")
    );
    // No transfer was needed for a rename.
    assert_eq!(harness.engine.queue.in_flight(), 0);
}

#[tokio::test]
async fn remote_file_move_without_local_copy_downloads_the_destination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/files/f1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fetched"))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    seed_remote_file(&harness, ROOT_SENTINEL, "a.txt", "f1").await;

    harness
        .engine
        .handle_remote_change(RemoteChange::FileMoved {
            id: "f1".to_string(),
            old_parent_id: "root".to_string(),
            old_name: "a.txt".to_string(),
            new_parent_id: "root".to_string(),
            new_name: "b.txt".to_string(),
        })
        .await
        .unwrap();
    run_transfers(&mut harness, 1).await;

    assert_eq!(
        std::fs::read(harness.sync_root.join("b.txt")).unwrap(),
        b"fetched"
    );
}

#[tokio::test]
async fn remote_dir_move_renames_the_local_subtree() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    for index in [&harness.engine.remote, &harness.engine.local] {
        index
            .upsert_dir(&DirEntry {
                path: "Docs".to_string(),
                name: "Docs".to_string(),
                mtime: 60,
                hash: None,
                remote_id: Some("d1".to_string()),
            })
            .await
            .unwrap();
    }
    seed_remote_file(&harness, "Docs", "Docs/A.txt", "f2").await;
    seed_local_file(&harness, "Docs", "Docs/A.txt", Some("f2")).await;
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/A.txt"), b"bytes").unwrap();

    harness
        .engine
        .handle_remote_change(RemoteChange::DirMoved {
            id: "d1".to_string(),
            old_parent_id: "root".to_string(),
            old_name: "Docs".to_string(),
            new_parent_id: "root".to_string(),
            new_name: "Work".to_string(),
        })
        .await
        .unwrap();

    assert!(!harness.sync_root.join("Docs").exists());
    assert_eq!(
        std::fs::read(harness.sync_root.join("Work/A.txt")).unwrap(),
        b"bytes"
    );
    for index in [&harness.engine.remote, &harness.engine.local] {
        assert!(!index.dir_exists("Docs").await.unwrap());
        assert!(index.dir_exists("Work").await.unwrap());
        assert!(index.file_exists("Work/A.txt").await.unwrap());
    }
}

#[tokio::test]
async fn watermark_changes_are_persisted_for_restart() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;

    harness
        .engine
        .handle_remote_change(RemoteChange::Watermark(1_700_000_123))
        .await
        .unwrap();

    assert_eq!(harness.settings.watermark(), 1_700_000_123);
}

#[tokio::test]
async fn events_under_unknown_parents_are_skipped() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;

    harness
        .engine
        .handle_remote_change(RemoteChange::FileAdded {
            id: "f1".to_string(),
            parent_id: "nowhere".to_string(),
            name: "ghost.txt".to_string(),
        })
        .await
        .unwrap();

    assert!(!harness.engine.remote.file_exists("ghost.txt").await.unwrap());
    assert_eq!(harness.engine.queue.in_flight(), 0);
}
