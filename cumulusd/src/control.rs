use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

use crate::settings::SettingsStore;

/// Local IPC surface: newline-framed JSON requests over a Unix socket.
/// `get_settings` is answered with a `settings` reply, `set_settings` has
/// no reply, anything else is logged and ignored.
pub struct ControlServer {
    socket_path: PathBuf,
    handle: JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SettingsReply {
    #[serde(rename = "type")]
    kind: &'static str,
    values: BTreeMap<String, String>,
}

impl ControlServer {
    pub fn bind(socket_path: &Path, settings: Arc<SettingsStore>) -> std::io::Result<Self> {
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(_) => {
                // A previous run may have left its socket file behind.
                let _ = std::fs::remove_file(socket_path);
                UnixListener::bind(socket_path)?
            }
        };
        let handle = tokio::spawn(accept_loop(listener, settings));
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            handle,
        })
    }

    pub fn stop(&self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: UnixListener, settings: Arc<SettingsStore>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let settings = Arc::clone(&settings);
                tokio::spawn(handle_client(stream, settings));
            }
            Err(err) => {
                eprintln!("[cumulusd] control accept error: {err}");
            }
        }
    }
}

async fn handle_client(stream: UnixStream, settings: Arc<SettingsStore>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(reply) = handle_request(&line, &settings) {
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    }
}

fn handle_request(line: &str, settings: &SettingsStore) -> Option<String> {
    let request: RequestEnvelope = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("[cumulusd] control parse error: {err}");
            return None;
        }
    };
    match request.kind.as_str() {
        "get_settings" => {
            let reply = SettingsReply {
                kind: "settings",
                values: settings.get_fields(&request.fields),
            };
            match serde_json::to_string(&reply) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    eprintln!("[cumulusd] control encode error: {err}");
                    None
                }
            }
        }
        "set_settings" => {
            if let Err(err) = settings.set_many(&request.args) {
                eprintln!("[cumulusd] failed to store settings: {err}");
            }
            None
        }
        other => {
            eprintln!("[cumulusd] got control message of unknown type: {other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    fn make_settings(dir: &Path) -> Arc<SettingsStore> {
        Arc::new(SettingsStore::load(dir.join("settings.json")).unwrap())
    }

    #[test]
    fn get_settings_returns_requested_values() {
        let dir = tempdir().unwrap();
        let settings = make_settings(dir.path());
        settings.set("login", "user").unwrap();

        let reply = handle_request(
            r#"{"type":"get_settings","fields":["login","password"]}"#,
            &settings,
        )
        .unwrap();
        let decoded: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(decoded["type"], "settings");
        assert_eq!(decoded["values"]["login"], "user");
        assert!(decoded["values"].get("password").is_none());
    }

    #[test]
    fn set_settings_stores_values_without_reply() {
        let dir = tempdir().unwrap();
        let settings = make_settings(dir.path());

        let reply = handle_request(
            r#"{"type":"set_settings","args":{"login":"user","root_name":"Cumulus"}}"#,
            &settings,
        );
        assert!(reply.is_none());
        assert_eq!(settings.get("login").as_deref(), Some("user"));
        assert_eq!(settings.get("root_name").as_deref(), Some("Cumulus"));
    }

    #[test]
    fn unknown_type_and_malformed_requests_are_ignored() {
        let dir = tempdir().unwrap();
        let settings = make_settings(dir.path());
        assert!(handle_request(r#"{"type":"reboot"}"#, &settings).is_none());
        assert!(handle_request("not json", &settings).is_none());
    }

    #[tokio::test]
    async fn roundtrip_over_the_socket() {
        let dir = tempdir().unwrap();
        let settings = make_settings(dir.path());
        let socket_path = dir.path().join("control.sock");
        let server = ControlServer::bind(&socket_path, Arc::clone(&settings)).unwrap();

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream
            .write_all(b"{\"type\":\"set_settings\",\"args\":{\"login\":\"user\"}}\n")
            .await
            .unwrap();
        stream
            .write_all(b"{\"type\":\"get_settings\",\"fields\":[\"login\"]}\n")
            .await
            .unwrap();

        let mut reply = vec![0u8; 256];
        let read = stream.read(&mut reply).await.unwrap();
        let decoded: serde_json::Value =
            serde_json::from_slice(reply[..read].trim_ascii_end()).unwrap();
        assert_eq!(decoded["values"]["login"], "user");

        server.stop();
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced_on_bind() {
        let dir = tempdir().unwrap();
        let settings = make_settings(dir.path());
        let socket_path = dir.path().join("control.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let server = ControlServer::bind(&socket_path, settings).unwrap();
        assert!(UnixStream::connect(&socket_path).await.is_ok());
        server.stop();
    }
}
