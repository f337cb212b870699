use std::time::Duration;

use cumulus_core::{
    CloudClient, DIR_CREATED_EVENT, DIR_MOVED_EVENT, DIR_REMOVED_EVENT, FILE_MOVED_EVENT,
    FILE_REMOVED_EVENT, FILE_UPLOADED_EVENT, RemoteEventRecord, SYSTEM_PARENT_ID, TRASH_PARENT_ID,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// Decoded per-entity notification from the remote event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    FileAdded {
        id: String,
        parent_id: String,
        name: String,
    },
    FileRemoved {
        id: String,
        parent_id: String,
        name: String,
    },
    DirCreated {
        id: String,
        parent_id: String,
        name: String,
    },
    DirRemoved {
        id: String,
    },
    FileMoved {
        id: String,
        old_parent_id: String,
        old_name: String,
        new_parent_id: String,
        new_name: String,
    },
    DirMoved {
        id: String,
        old_parent_id: String,
        old_name: String,
        new_parent_id: String,
        new_name: String,
    },
    /// The timestamp cursor advanced past this value; the consumer persists
    /// it so a restart resumes from the last acknowledged point.
    Watermark(u64),
}

/// Polls the remote event log on a fixed interval, decoding raw records
/// into [`RemoteChange`] values. Poll errors do not stop the ticker; the
/// next tick retries with the same watermark (at-least-once delivery).
pub struct RemoteWatcher {
    handle: JoinHandle<()>,
}

impl RemoteWatcher {
    pub fn start(
        client: CloudClient,
        watermark: u64,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RemoteChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut mark = watermark;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match client.get_events(mark).await {
                    Ok(records) => {
                        let (changes, next_mark) = decode_events(records, mark);
                        mark = next_mark;
                        for change in changes {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        eprintln!("[cumulusd] error fetching remote events: {err}");
                    }
                }
            }
        });
        (Self { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for RemoteWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decodes one poll's worth of raw records. The watermark advances whenever
/// a record's timestamp exceeds the held value and is emitted inline so the
/// consumer can persist it in order with the changes it covers.
fn decode_events(
    records: Vec<RemoteEventRecord>,
    watermark: u64,
) -> (Vec<RemoteChange>, u64) {
    let mut out = Vec::new();
    let mut mark = watermark;
    for record in records {
        if record.timestamp > mark {
            mark = record.timestamp;
            out.push(RemoteChange::Watermark(mark));
        }
        if let Some(change) = decode_one(record) {
            out.push(change);
        }
    }
    (out, mark)
}

fn decode_one(record: RemoteEventRecord) -> Option<RemoteChange> {
    match record.event.as_str() {
        DIR_CREATED_EVENT => {
            let (id, parent_id, name) = entity_fields(&record)?;
            if parent_id == SYSTEM_PARENT_ID {
                return None;
            }
            Some(RemoteChange::DirCreated {
                id,
                parent_id,
                name,
            })
        }
        FILE_UPLOADED_EVENT => {
            let (id, parent_id, name) = entity_fields(&record)?;
            if parent_id == SYSTEM_PARENT_ID {
                return None;
            }
            Some(RemoteChange::FileAdded {
                id,
                parent_id,
                name,
            })
        }
        FILE_REMOVED_EVENT => {
            let (id, parent_id, name) = entity_fields(&record)?;
            if parent_id == SYSTEM_PARENT_ID {
                return None;
            }
            Some(RemoteChange::FileRemoved {
                id,
                parent_id,
                name,
            })
        }
        DIR_REMOVED_EVENT => Some(RemoteChange::DirRemoved {
            id: required(&record, record.id.clone())?,
        }),
        FILE_MOVED_EVENT | DIR_MOVED_EVENT => decode_move(record),
        other => {
            eprintln!("[cumulusd] unknown remote event kind: {other}");
            None
        }
    }
}

fn decode_move(record: RemoteEventRecord) -> Option<RemoteChange> {
    let is_dir = record.event == DIR_MOVED_EVENT;
    let id = required(&record, record.id.clone())?;
    let old_parent_id = required(&record, record.old_parent_id.clone())?;
    let old_name = required(&record, record.old_name.clone())?;
    let new_parent_id = required(&record, record.new_parent_id.clone())?;
    let new_name = required(&record, record.new_name.clone())?;

    if old_parent_id == SYSTEM_PARENT_ID || new_parent_id == SYSTEM_PARENT_ID {
        return None;
    }
    // A move into the trash container is a deletion of the origin.
    if new_parent_id == TRASH_PARENT_ID {
        if is_dir {
            return Some(RemoteChange::DirRemoved { id });
        }
        return Some(RemoteChange::FileRemoved {
            id,
            parent_id: old_parent_id,
            name: old_name,
        });
    }
    if is_dir {
        Some(RemoteChange::DirMoved {
            id,
            old_parent_id,
            old_name,
            new_parent_id,
            new_name,
        })
    } else {
        Some(RemoteChange::FileMoved {
            id,
            old_parent_id,
            old_name,
            new_parent_id,
            new_name,
        })
    }
}

fn entity_fields(record: &RemoteEventRecord) -> Option<(String, String, String)> {
    let id = required(record, record.id.clone())?;
    let parent_id = required(record, record.parent_id.clone())?;
    let name = required(record, record.name.clone())?;
    Some((id, parent_id, name))
}

fn required(record: &RemoteEventRecord, field: Option<String>) -> Option<String> {
    if field.is_none() {
        eprintln!(
            "[cumulusd] malformed remote event skipped: {} at {}",
            record.event, record.timestamp
        );
    }
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event: &str, timestamp: u64) -> RemoteEventRecord {
        RemoteEventRecord {
            event: event.to_string(),
            timestamp,
            id: Some("e1".to_string()),
            parent_id: Some("d1".to_string()),
            name: Some("A.txt".to_string()),
            old_parent_id: None,
            old_name: None,
            new_parent_id: None,
            new_name: None,
        }
    }

    fn move_record(event: &str, timestamp: u64, new_parent_id: &str) -> RemoteEventRecord {
        RemoteEventRecord {
            event: event.to_string(),
            timestamp,
            id: Some("e1".to_string()),
            parent_id: None,
            name: None,
            old_parent_id: Some("d1".to_string()),
            old_name: Some("A.txt".to_string()),
            new_parent_id: Some(new_parent_id.to_string()),
            new_name: Some("B.txt".to_string()),
        }
    }

    #[test]
    fn decodes_upload_and_advances_watermark() {
        let (changes, mark) = decode_events(vec![record(FILE_UPLOADED_EVENT, 50)], 10);
        assert_eq!(mark, 50);
        assert_eq!(
            changes,
            vec![
                RemoteChange::Watermark(50),
                RemoteChange::FileAdded {
                    id: "e1".to_string(),
                    parent_id: "d1".to_string(),
                    name: "A.txt".to_string(),
                },
            ]
        );
    }

    #[test]
    fn watermark_only_moves_forward() {
        let (changes, mark) = decode_events(
            vec![record(FILE_UPLOADED_EVENT, 50), record(FILE_REMOVED_EVENT, 40)],
            45,
        );
        assert_eq!(mark, 50);
        let watermarks: Vec<_> = changes
            .iter()
            .filter(|change| matches!(change, RemoteChange::Watermark(_)))
            .collect();
        assert_eq!(watermarks, vec![&RemoteChange::Watermark(50)]);
    }

    #[test]
    fn move_into_trash_is_reclassified_as_delete() {
        let (changes, _) = decode_events(
            vec![move_record(FILE_MOVED_EVENT, 60, TRASH_PARENT_ID)],
            0,
        );
        assert_eq!(
            changes[1],
            RemoteChange::FileRemoved {
                id: "e1".to_string(),
                parent_id: "d1".to_string(),
                name: "A.txt".to_string(),
            }
        );

        let (changes, _) = decode_events(
            vec![move_record(DIR_MOVED_EVENT, 61, TRASH_PARENT_ID)],
            0,
        );
        assert_eq!(
            changes[1],
            RemoteChange::DirRemoved {
                id: "e1".to_string(),
            }
        );
    }

    #[test]
    fn plain_move_keeps_both_endpoints() {
        let (changes, _) = decode_events(vec![move_record(FILE_MOVED_EVENT, 60, "d2")], 0);
        assert_eq!(
            changes[1],
            RemoteChange::FileMoved {
                id: "e1".to_string(),
                old_parent_id: "d1".to_string(),
                old_name: "A.txt".to_string(),
                new_parent_id: "d2".to_string(),
                new_name: "B.txt".to_string(),
            }
        );
    }

    #[test]
    fn system_container_events_are_suppressed() {
        let mut upload = record(FILE_UPLOADED_EVENT, 70);
        upload.parent_id = Some(SYSTEM_PARENT_ID.to_string());
        let (changes, mark) = decode_events(vec![upload], 0);
        assert_eq!(changes, vec![RemoteChange::Watermark(70)]);
        assert_eq!(mark, 70);

        let (changes, _) = decode_events(
            vec![move_record(FILE_MOVED_EVENT, 71, SYSTEM_PARENT_ID)],
            0,
        );
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn unknown_kinds_and_malformed_records_are_skipped() {
        let (changes, mark) = decode_events(vec![record("snapshot_rotated", 80)], 0);
        assert_eq!(changes, vec![RemoteChange::Watermark(80)]);
        assert_eq!(mark, 80);

        let mut broken = record(FILE_UPLOADED_EVENT, 81);
        broken.name = None;
        let (changes, _) = decode_events(vec![broken], 80);
        assert_eq!(changes, vec![RemoteChange::Watermark(81)]);
    }
}
