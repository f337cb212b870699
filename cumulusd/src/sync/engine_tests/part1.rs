use super::*;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_bytes, method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub(super) struct Harness {
    pub engine: SyncEngine,
    pub signals: mpsc::UnboundedReceiver<QueueSignal>,
    pub settings: Arc<SettingsStore>,
    pub sync_root: PathBuf,
    _dir: tempfile::TempDir,
}

pub(super) async fn make_harness(server: &MockServer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sync_root = dir.path().join("root");
    std::fs::create_dir_all(&sync_root).unwrap();

    let client = CloudClient::with_token(&server.uri(), "test-token").unwrap();
    let local = make_index().await;
    let remote = make_index().await;
    let settings = Arc::new(SettingsStore::load(dir.path().join("settings.json")).unwrap());
    let (queue, signals) = TransferQueue::new(client.clone(), sync_root.clone());
    let queue = queue.with_debounce(Duration::from_millis(25));
    let engine = SyncEngine::new(
        client,
        local,
        remote,
        queue,
        Arc::clone(&settings),
        sync_root.clone(),
    );
    Harness {
        engine,
        signals,
        settings,
        sync_root,
        _dir: dir,
    }
}

pub(super) async fn make_index() -> StateIndex {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let index = StateIndex::from_pool(pool);
    index.init().await.unwrap();
    index
}

/// Drains queue signals until `count` transfers have completed.
pub(super) async fn run_transfers(harness: &mut Harness, count: usize) {
    let mut done = 0;
    while done < count {
        let signal = tokio::time::timeout(Duration::from_secs(5), harness.signals.recv())
            .await
            .expect("timed out waiting for a queue signal")
            .expect("queue signal channel closed");
        let finished = matches!(signal, QueueSignal::Done(_));
        harness.engine.handle_queue_signal(signal).await.unwrap();
        if finished {
            done += 1;
        }
    }
}

pub(super) async fn seed_remote_root(harness: &Harness) {
    harness
        .engine
        .remote
        .upsert_dir(&DirEntry {
            path: ROOT_SENTINEL.to_string(),
            name: ROOT_SENTINEL.to_string(),
            mtime: 0,
            hash: None,
            remote_id: Some("root".to_string()),
        })
        .await
        .unwrap();
}

pub(super) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

fn mock_empty_remote(server: &MockServer) -> (wiremock::Mock, wiremock::Mock) {
    let props = Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("path", "/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "root", "name": "/", "mtime": 0}
        })));
    let listing = Mock::given(method("GET"))
        .and(url_path("/v1/dirs/root/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "info": {"id": "root", "tree": "/"},
            "dirs": [],
            "files": []
        })));
    (props, listing)
}

#[tokio::test]
async fn bootstrap_uploads_local_only_file_and_mirrors_the_row() {
    let server = MockServer::start().await;
    let (props, listing) = mock_empty_remote(&server);
    props.mount(&server).await;
    listing.mount(&server).await;
    Mock::given(method("PUT"))
        .and(url_path("/v1/files"))
        .and(query_param("dir_id", "root"))
        .and(query_param("name", "a.txt"))
        .and(body_bytes(b"x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "R1", "name": "a.txt", "size": 1, "mtime": 100, "chksum": md5_hex(b"x")
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    std::fs::write(harness.sync_root.join("a.txt"), b"x").unwrap();

    harness.engine.full_remote_index().await.unwrap();
    harness.engine.full_local_index().await.unwrap();

    let row = harness
        .engine
        .local
        .file_by_path("a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.hash.as_deref(), Some(md5_hex(b"x").as_str()));
    assert_eq!(row.remote_id, None);
    assert!(!harness.engine.remote.file_exists("a.txt").await.unwrap());

    harness.engine.reconcile_indexes().await.unwrap();
    run_transfers(&mut harness, 1).await;

    let row = harness
        .engine
        .local
        .file_by_path("a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.remote_id.as_deref(), Some("R1"));

    let mirrored = harness
        .engine
        .remote
        .file_by_path("a.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirrored.remote_id.as_deref(), Some("R1"));
    assert_eq!(mirrored.hash, row.hash);
}

#[tokio::test]
async fn modified_file_is_uploaded_and_parent_hash_recomputed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(url_path("/v1/props"))
        .and(query_param("path", "/Docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "object": {"id": "d1", "name": "Docs", "mtime": 10}
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(url_path("/v1/files"))
        .and(query_param("dir_id", "d1"))
        .and(query_param("name", "A.txt"))
        .and(body_bytes(b"contents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "R2", "name": "A.txt", "size": 8, "mtime": 20
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/A.txt"), b"contents").unwrap();
    harness
        .engine
        .local
        .upsert_dir(&DirEntry {
            path: "Docs".to_string(),
            name: "Docs".to_string(),
            mtime: 10,
            hash: None,
            remote_id: None,
        })
        .await
        .unwrap();

    let event = LocalEvent::Modified {
        path: harness.sync_root.join("Docs/A.txt"),
    };
    harness.engine.handle_local_event(event).await.unwrap();
    run_transfers(&mut harness, 1).await;

    let row = harness
        .engine
        .local
        .file_by_path("Docs/A.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.remote_id.as_deref(), Some("R2"));

    let parent = harness
        .engine
        .local
        .dir_by_path("Docs")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        parent.hash,
        Some(super::super::fingerprint::child_digest([md5_hex(
            b"contents"
        )]))
    );
}

#[tokio::test]
async fn change_already_reflected_remotely_is_not_reuploaded() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    std::fs::write(harness.sync_root.join("a.txt"), b"same").unwrap();
    harness
        .engine
        .remote
        .upsert_file(&FileEntry {
            dir_path: ROOT_SENTINEL.to_string(),
            path: "a.txt".to_string(),
            name: "a.txt".to_string(),
            mtime: 100,
            hash: Some(md5_hex(b"same")),
            remote_id: Some("f1".to_string()),
        })
        .await
        .unwrap();

    let event = LocalEvent::Modified {
        path: harness.sync_root.join("a.txt"),
    };
    harness.engine.handle_local_event(event).await.unwrap();

    // Local index still records the change, but nothing is queued.
    assert!(harness.engine.local.file_exists("a.txt").await.unwrap());
    assert_eq!(harness.engine.queue.in_flight(), 0);
    assert!(harness.signals.try_recv().is_err());
}

#[tokio::test]
async fn local_file_delete_issues_remote_delete() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(url_path("/v1/files/f1"))
        .and(query_param("purge", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    for index in [&harness.engine.local, &harness.engine.remote] {
        index
            .upsert_file(&FileEntry {
                dir_path: ROOT_SENTINEL.to_string(),
                path: "a.txt".to_string(),
                name: "a.txt".to_string(),
                mtime: 100,
                hash: Some("h1".to_string()),
                remote_id: Some("f1".to_string()),
            })
            .await
            .unwrap();
    }

    let event = LocalEvent::Deleted {
        path: harness.sync_root.join("a.txt"),
        is_dir: false,
    };
    harness.engine.handle_local_event(event).await.unwrap();

    assert!(!harness.engine.local.file_exists("a.txt").await.unwrap());
    // The remote row is cleared by the event echo, not here.
    assert!(harness.engine.remote.file_exists("a.txt").await.unwrap());
}

#[tokio::test]
async fn local_dir_delete_is_one_recursive_remote_call() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(url_path("/v1/dirs/d9"))
        .and(query_param("recursive", "true"))
        .and(query_param("purge", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    for (index, dir_id) in [
        (&harness.engine.local, None),
        (&harness.engine.remote, Some("d9".to_string())),
    ] {
        index
            .upsert_dir(&DirEntry {
                path: "D".to_string(),
                name: "D".to_string(),
                mtime: 10,
                hash: None,
                remote_id: dir_id,
            })
            .await
            .unwrap();
        index
            .upsert_dir(&DirEntry {
                path: "D/D2".to_string(),
                name: "D2".to_string(),
                mtime: 10,
                hash: None,
                remote_id: None,
            })
            .await
            .unwrap();
        index
            .upsert_file(&FileEntry {
                dir_path: "D".to_string(),
                path: "D/F.txt".to_string(),
                name: "F.txt".to_string(),
                mtime: 10,
                hash: Some("h1".to_string()),
                remote_id: None,
            })
            .await
            .unwrap();
        index
            .upsert_file(&FileEntry {
                dir_path: "D/D2".to_string(),
                path: "D/D2/G.txt".to_string(),
                name: "G.txt".to_string(),
                mtime: 10,
                hash: Some("h2".to_string()),
                remote_id: None,
            })
            .await
            .unwrap();
    }

    let event = LocalEvent::Deleted {
        path: harness.sync_root.join("D"),
        is_dir: true,
    };
    harness.engine.handle_local_event(event).await.unwrap();

    for index in [&harness.engine.local, &harness.engine.remote] {
        assert!(!index.dir_exists("D").await.unwrap());
        assert!(!index.dir_exists("D/D2").await.unwrap());
        assert!(!index.file_exists("D/F.txt").await.unwrap());
        assert!(!index.file_exists("D/D2/G.txt").await.unwrap());
    }
}

#[tokio::test]
async fn hidden_entries_are_ignored() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;
    std::fs::create_dir_all(harness.sync_root.join(".cache")).unwrap();
    std::fs::write(harness.sync_root.join(".env"), b"secret").unwrap();

    harness
        .engine
        .handle_local_event(LocalEvent::Added {
            path: harness.sync_root.join(".cache"),
            is_dir: true,
        })
        .await
        .unwrap();
    harness
        .engine
        .handle_local_event(LocalEvent::Modified {
            path: harness.sync_root.join(".env"),
        })
        .await
        .unwrap();

    assert!(!harness.engine.local.dir_exists(".cache").await.unwrap());
    assert!(!harness.engine.local.file_exists(".env").await.unwrap());
    assert_eq!(harness.engine.queue.in_flight(), 0);
}

#[tokio::test]
async fn untracked_delete_is_ignored() {
    let server = MockServer::start().await;
    let mut harness = make_harness(&server).await;

    harness
        .engine
        .handle_local_event(LocalEvent::Deleted {
            path: harness.sync_root.join("never-indexed.txt"),
            is_dir: false,
        })
        .await
        .unwrap();
    harness
        .engine
        .handle_local_event(LocalEvent::Deleted {
            path: harness.sync_root.join("never-indexed-dir"),
            is_dir: true,
        })
        .await
        .unwrap();

    assert_eq!(harness.engine.queue.in_flight(), 0);
}

#[tokio::test]
async fn added_directory_is_created_remotely_with_its_contents() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(url_path("/v1/dirs"))
        .and(query_param("parent_id", "root"))
        .and(query_param("name", "Docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "d1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(url_path("/v1/files"))
        .and(query_param("dir_id", "d1"))
        .and(query_param("name", "A.txt"))
        .and(body_bytes(b"inside"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "R3", "name": "A.txt", "size": 6, "mtime": 30
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;
    std::fs::create_dir_all(harness.sync_root.join("Docs")).unwrap();
    std::fs::write(harness.sync_root.join("Docs/A.txt"), b"inside").unwrap();

    harness
        .engine
        .handle_local_event(LocalEvent::Added {
            path: harness.sync_root.join("Docs"),
            is_dir: true,
        })
        .await
        .unwrap();
    run_transfers(&mut harness, 1).await;

    assert_eq!(
        harness.engine.remote.dir_id("Docs").await.unwrap().as_deref(),
        Some("d1")
    );
    assert_eq!(
        harness.engine.local.dir_id("Docs").await.unwrap().as_deref(),
        Some("d1")
    );
    assert_eq!(
        harness
            .engine
            .remote
            .file_id("Docs/A.txt")
            .await
            .unwrap()
            .as_deref(),
        Some("R3")
    );
}

#[tokio::test]
async fn burst_of_changes_yields_one_upload_of_final_content() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(url_path("/v1/files"))
        .and(query_param("name", "a.txt"))
        .and(body_bytes(b"final"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "R1", "name": "a.txt", "size": 5, "mtime": 10
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = make_harness(&server).await;
    seed_remote_root(&harness).await;

    for contents in [b"one".as_slice(), b"two", b"final"] {
        std::fs::write(harness.sync_root.join("a.txt"), contents).unwrap();
        harness
            .engine
            .handle_local_event(LocalEvent::Modified {
                path: harness.sync_root.join("a.txt"),
            })
            .await
            .unwrap();
    }
    run_transfers(&mut harness, 1).await;

    assert_eq!(
        harness
            .engine
            .local
            .file_id("a.txt")
            .await
            .unwrap()
            .as_deref(),
        Some("R1")
    );
}
