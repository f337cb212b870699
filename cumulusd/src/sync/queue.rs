use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use cumulus_core::{ApiError, CloudClient, RemoteFile};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::paths::{local_path_for, split_parent};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Signals the queue routes back into the engine loop: a debounce timer
/// expired, or a network transfer finished.
#[derive(Debug)]
pub enum QueueSignal {
    TimerFired { path: String },
    Done(TransferOutcome),
}

#[derive(Debug)]
pub struct TransferOutcome {
    pub path: String,
    pub direction: Direction,
    /// Remote metadata for completed uploads, `None` for downloads.
    pub result: Result<Option<RemoteFile>, ApiError>,
    /// The remote id a download was fetched from.
    pub file_id: Option<String>,
}

#[derive(Debug, Clone)]
enum TransferJob {
    Upload { dir_id: String },
    Download { file_id: String },
}

struct TransferRecord {
    job: TransferJob,
    pending: Option<JoinHandle<()>>,
    active: Option<JoinHandle<()>>,
}

/// Debounces and serializes transfers per relative path: at most one
/// network transfer in flight per path, and a burst of N events within the
/// debounce window yields exactly one transfer of the final content.
pub struct TransferQueue {
    client: CloudClient,
    sync_root: PathBuf,
    debounce: Duration,
    signals: mpsc::UnboundedSender<QueueSignal>,
    records: HashMap<String, TransferRecord>,
}

impl TransferQueue {
    pub fn new(
        client: CloudClient,
        sync_root: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<QueueSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                sync_root,
                debounce: DEFAULT_DEBOUNCE,
                signals,
                records: HashMap::new(),
            },
            rx,
        )
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn enqueue_upload(&mut self, dir_id: String, path: String) {
        self.enqueue(path, TransferJob::Upload { dir_id });
    }

    pub fn enqueue_download(&mut self, file_id: String, path: String) {
        self.enqueue(path, TransferJob::Download { file_id });
    }

    /// A new event for a path with pending or active work cancels it and
    /// restarts the timer rather than queueing a second transfer.
    fn enqueue(&mut self, path: String, job: TransferJob) {
        if let Some(existing) = self.records.remove(&path) {
            cancel_record(existing);
        }
        let signals = self.signals.clone();
        let debounce = self.debounce;
        let timer_path = path.clone();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = signals.send(QueueSignal::TimerFired { path: timer_path });
        });
        self.records.insert(
            path,
            TransferRecord {
                job,
                pending: Some(pending),
                active: None,
            },
        );
    }

    /// Debounce expired: start the one network transfer for this path. The
    /// outcome comes back through the signal channel.
    pub fn begin(&mut self, path: &str) {
        let Some(record) = self.records.get_mut(path) else {
            return;
        };
        record.pending = None;
        if record.active.is_some() {
            return;
        }
        let local = match local_path_for(&self.sync_root, path) {
            Ok(local) => local,
            Err(err) => {
                eprintln!("[cumulusd] refusing transfer for {path}: {err}");
                self.records.remove(path);
                return;
            }
        };
        let client = self.client.clone();
        let signals = self.signals.clone();
        let rel = path.to_string();
        let job = record.job.clone();
        record.active = Some(tokio::spawn(async move {
            let outcome = match job {
                TransferJob::Upload { dir_id } => {
                    let (_, name) = split_parent(&rel);
                    let progress_path = rel.clone();
                    let result = client
                        .push_file(
                            &dir_id,
                            &local,
                            &name,
                            true,
                            Some(Box::new(move |sent, total| {
                                log_progress("upload", &progress_path, sent, total);
                            })),
                        )
                        .await;
                    TransferOutcome {
                        path: rel,
                        direction: Direction::Upload,
                        result: result.map(Some),
                        file_id: None,
                    }
                }
                TransferJob::Download { file_id } => {
                    let progress_path = rel.clone();
                    let result = client
                        .pull_file(
                            &file_id,
                            &local,
                            Some(Box::new(move |received, total| {
                                log_progress("download", &progress_path, received, total);
                            })),
                        )
                        .await;
                    TransferOutcome {
                        path: rel,
                        direction: Direction::Download,
                        result: result.map(|_| None),
                        file_id: Some(file_id),
                    }
                }
            };
            let _ = signals.send(QueueSignal::Done(outcome));
        }));
    }

    /// Releases the per-path slot once the outcome has been processed; the
    /// path becomes eligible for a fresh transfer on the next event.
    pub fn finish(&mut self, path: &str) {
        self.records.remove(path);
    }

    pub fn cancel(&mut self, path: &str) {
        if let Some(record) = self.records.remove(path) {
            cancel_record(record);
        }
    }

    /// Stops debounce timers at shutdown; transfers already handed to the
    /// network layer are left to complete or fail on their own.
    pub fn cancel_timers(&mut self) {
        for record in self.records.values_mut() {
            if let Some(pending) = record.pending.take() {
                pending.abort();
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.records.len()
    }
}

fn cancel_record(record: TransferRecord) {
    if let Some(pending) = record.pending {
        pending.abort();
    }
    if let Some(active) = record.active {
        active.abort();
    }
}

fn log_progress(direction: &str, path: &str, done: u64, total: Option<u64>) {
    match total {
        Some(total) => eprintln!("[cumulusd] {direction} {path}: {done}/{total}"),
        None => eprintln!("[cumulusd] {direction} {path}: {done}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, method, path as url_path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_queue(
        server: &MockServer,
        sync_root: PathBuf,
    ) -> (TransferQueue, mpsc::UnboundedReceiver<QueueSignal>) {
        let client = CloudClient::with_token(&server.uri(), "test-token").unwrap();
        let (queue, rx) = TransferQueue::new(client, sync_root);
        (queue.with_debounce(Duration::from_millis(20)), rx)
    }

    #[tokio::test]
    async fn burst_of_events_collapses_into_one_upload_of_final_content() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(url_path("/v1/files"))
            .and(query_param("dir_id", "d1"))
            .and(query_param("name", "a.txt"))
            .and(body_bytes(b"final"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "R1", "name": "a.txt", "size": 5, "mtime": 10
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (mut queue, mut signals) = make_queue(&server, dir.path().to_path_buf());

        for contents in [b"one".as_slice(), b"two", b"final"] {
            std::fs::write(dir.path().join("a.txt"), contents).unwrap();
            queue.enqueue_upload("d1".to_string(), "a.txt".to_string());
        }
        assert_eq!(queue.in_flight(), 1);

        match signals.recv().await.unwrap() {
            QueueSignal::TimerFired { path } => queue.begin(&path),
            other => panic!("expected timer signal, got {other:?}"),
        }
        match signals.recv().await.unwrap() {
            QueueSignal::Done(outcome) => {
                assert_eq!(outcome.direction, Direction::Upload);
                let uploaded = outcome.result.unwrap().unwrap();
                assert_eq!(uploaded.id, "R1");
                queue.finish(&outcome.path);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn download_writes_target_and_reports_source_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/v1/files/f1/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (mut queue, mut signals) = make_queue(&server, dir.path().to_path_buf());
        queue.enqueue_download("f1".to_string(), "Docs/b.txt".to_string());

        match signals.recv().await.unwrap() {
            QueueSignal::TimerFired { path } => queue.begin(&path),
            other => panic!("expected timer signal, got {other:?}"),
        }
        match signals.recv().await.unwrap() {
            QueueSignal::Done(outcome) => {
                assert!(outcome.result.is_ok());
                assert_eq!(outcome.file_id.as_deref(), Some("f1"));
                queue.finish(&outcome.path);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(
            std::fs::read(dir.path().join("Docs/b.txt")).unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn error_releases_the_slot_without_panicking() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/v1/files/f1/content"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (mut queue, mut signals) = make_queue(&server, dir.path().to_path_buf());
        queue.enqueue_download("f1".to_string(), "b.txt".to_string());

        match signals.recv().await.unwrap() {
            QueueSignal::TimerFired { path } => queue.begin(&path),
            other => panic!("expected timer signal, got {other:?}"),
        }
        match signals.recv().await.unwrap() {
            QueueSignal::Done(outcome) => {
                assert!(outcome.result.is_err());
                queue.finish(&outcome.path);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_discards_pending_work() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let (mut queue, mut signals) = make_queue(&server, dir.path().to_path_buf());

        queue.enqueue_upload("d1".to_string(), "a.txt".to_string());
        queue.cancel("a.txt");
        assert_eq!(queue.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(signals.try_recv().is_err());
    }
}
