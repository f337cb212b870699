use super::*;
use super::engine_tests_part1::{make_harness, md5_hex, run_transfers, seed_remote_root};
use wiremock::matchers::{method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn full_remote_index_skips_trash_and_special_containers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("path", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "root", "name": "/", "mtime": 0}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/v1/dirs/root/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "info": {"id": "root", "tree": "/"},
            "dirs": [
                {"id": "d1", "name": "Docs", "mtime": 10},
                {"id": "d2", "name": "Thumbs", "mtime": 10, "special_dir": "service"},
                {"id": "d3", "name": "Old", "mtime": 10, "is_trash": true}
            ],
            "files": [
                {"id": "f1", "name": "keep.txt", "mtime": 10, "chksum": "h1"},
                {"id": "f2", "name": "gone.txt", "mtime": 10, "chksum": "h2", "is_trash": true}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/v1/dirs/d1/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "info": {"id": "d1", "tree": "/Docs/"},
            "dirs": [],
            "files": [
                {"id": "f3", "name": "A.txt", "mtime": 11, "chksum": "h3"}
            ]
        })))
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    let stats = harness.engine.full_remote_index().await.unwrap();

    assert_eq!(stats.files, 2);
    assert_eq!(stats.dirs, 1);
    assert!(harness.engine.remote.file_exists("keep.txt").await.unwrap());
    assert!(!harness.engine.remote.file_exists("gone.txt").await.unwrap());
    assert!(harness.engine.remote.dir_exists("Docs").await.unwrap());
    assert!(!harness.engine.remote.dir_exists("Thumbs").await.unwrap());
    assert!(!harness.engine.remote.dir_exists("Old").await.unwrap());
    assert!(harness.engine.remote.file_exists("Docs/A.txt").await.unwrap());

    // The root aggregate covers only the surviving child file.
    let root_row = harness
        .engine
        .remote
        .dir_by_path(ROOT_SENTINEL)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        root_row.hash,
        Some(super::super::fingerprint::child_digest(["h1"]))
    );
}

#[tokio::test]
async fn full_local_index_twice_produces_identical_rows() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    std::fs::write(harness.sync_root.join("a.txt"), b"alpha").unwrap();
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/B.txt"), b"beta").unwrap();
    std::fs::create_dir_all(harness.sync_root.join("Empty")).unwrap();

    harness.engine.full_local_index().await.unwrap();
    let files_first = harness.engine.local.list_files().await.unwrap();
    let dirs_first = harness.engine.local.list_dirs().await.unwrap();

    harness.engine.full_local_index().await.unwrap();
    let files_second = harness.engine.local.list_files().await.unwrap();
    let dirs_second = harness.engine.local.list_dirs().await.unwrap();

    assert_eq!(files_first, files_second);
    assert_eq!(dirs_first, dirs_second);
    assert_eq!(files_second.len(), 2);
    assert_eq!(dirs_second.len(), 2);

    let docs = harness
        .engine
        .local
        .dir_by_path("Docs")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        docs.hash,
        Some(super::super::fingerprint::child_digest([md5_hex(b"beta")]))
    );
}

#[tokio::test]
async fn local_and_remote_indexers_agree_on_directory_hashes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("path", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "root", "name": "/", "mtime": 0}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/v1/dirs/root/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "info": {"id": "root", "tree": "/"},
            "dirs": [{"id": "d1", "name": "Docs", "mtime": 10}],
            "files": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(url_path("/v1/dirs/d1/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "info": {"id": "d1", "tree": "/Docs/"},
            "dirs": [],
            "files": [
                {"id": "f1", "name": "B.txt", "mtime": 11, "chksum": md5_hex(b"beta")}
            ]
        })))
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/B.txt"), b"beta").unwrap();

    harness.engine.full_remote_index().await.unwrap();
    harness.engine.full_local_index().await.unwrap();

    let local_docs = harness
        .engine
        .local
        .dir_by_path("Docs")
        .await
        .unwrap()
        .unwrap();
    let remote_docs = harness
        .engine
        .remote
        .dir_by_path("Docs")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local_docs.hash, remote_docs.hash);
    assert!(local_docs.hash.is_some());
}

#[tokio::test]
async fn reconcile_downloads_remote_only_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/files/f9/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"cloud"))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    harness
        .engine
        .remote
        .upsert_file(&FileEntry {
            dir_path: ROOT_SENTINEL.to_string(),
            path: "c.txt".to_string(),
            name: "c.txt".to_string(),
            mtime: 70,
            hash: Some(md5_hex(b"cloud")),
            remote_id: Some("f9".to_string()),
        })
        .await
        .unwrap();

    harness.engine.reconcile_indexes().await.unwrap();
    run_transfers(&mut harness, 1).await;

    assert_eq!(
        std::fs::read(harness.sync_root.join("c.txt")).unwrap(),
        b"cloud"
    );
    assert_eq!(
        harness
            .engine
            .local
            .file_id("c.txt")
            .await
            .unwrap()
            .as_deref(),
        Some("f9")
    );
}

#[tokio::test]
async fn reconcile_materializes_remote_only_directories() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    harness
        .engine
        .remote
        .upsert_dir(&DirEntry {
            path: "Photos".to_string(),
            name: "Photos".to_string(),
            mtime: 80,
            hash: None,
            remote_id: Some("d5".to_string()),
        })
        .await
        .unwrap();

    harness.engine.reconcile_indexes().await.unwrap();

    assert!(harness.sync_root.join("Photos").is_dir());
    assert_eq!(
        harness
            .engine
            .local
            .dir_id("Photos")
            .await
            .unwrap()
            .as_deref(),
        Some("d5")
    );
}

#[tokio::test]
async fn reindex_after_restart_preserves_remote_ids() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    std::fs::write(harness.sync_root.join("a.txt"), b"kept").unwrap();
    harness
        .engine
        .local
        .upsert_file(&FileEntry {
            dir_path: ROOT_SENTINEL.to_string(),
            path: "a.txt".to_string(),
            name: "a.txt".to_string(),
            mtime: 0,
            hash: Some("stale".to_string()),
            remote_id: Some("R1".to_string()),
        })
        .await
        .unwrap();

    harness.engine.full_local_index().await.unwrap();

    let row = harness
        .engine
        .local
        .file_by_path("a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.remote_id.as_deref(), Some("R1"));
    assert_eq!(row.hash.as_deref(), Some(md5_hex(b"kept").as_str()));
}
