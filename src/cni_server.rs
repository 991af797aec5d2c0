//! Unix-domain-socket front end that turns CNI requests into PodManager
//! commands (component N).
//!
//! Grounded on `original_source/ksdn/pod_linux.go`'s `CmdAdd`/`CmdUpdate`/
//! `CmdDel` wire shape and the teacher's `client.rs` request/response framing
//! idiom (length-prefixed JSON frames). One task per accepted connection;
//! serialisation happens inside [`PodManager`], not here.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pod_manager::{PodCommand, PodManager, PodRequest};

#[derive(Debug, Error)]
pub enum CniServerError {
    #[error("failed to bind CNI socket at {0}: {1}")]
    Bind(String, std::io::Error),
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    command: WireCommand,
    pod_namespace: String,
    pod_name: String,
    container_id: String,
    netns: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum WireCommand {
    Add,
    Update,
    Del,
}

#[derive(Debug, Serialize)]
struct WireResponse {
    bytes: Vec<u8>,
    error: Option<String>,
}

pub struct CniServer {
    listener: UnixListener,
    pod_manager: PodManager,
}

impl CniServer {
    /// Binds `socket_path`, removing a stale socket file left behind by a
    /// prior crashed instance (mirroring the teacher's PID-file-cleanup
    /// idiom in `init.rs`).
    pub fn bind(socket_path: &Path, pod_manager: PodManager) -> Result<Self, CniServerError> {
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| CniServerError::Bind(socket_path.display().to_string(), e))?;
        Ok(Self { listener, pod_manager })
    }

    pub fn run(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = self.listener.accept() => {
                        let Ok((stream, _)) = accepted else {
                            warn!("CNI socket accept failed");
                            continue;
                        };
                        let pod_manager = self.pod_manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, pod_manager).await {
                                debug!("CNI connection ended with error: {e}");
                            }
                        });
                    }
                }
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, pod_manager: PodManager) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;

    let wire: WireRequest = match serde_json::from_slice(&buf) {
        Ok(req) => req,
        Err(e) => {
            let resp = WireResponse { bytes: Vec::new(), error: Some(format!("malformed request: {e}")) };
            write_response(&mut stream, &resp).await?;
            return Ok(());
        }
    };

    let req = PodRequest {
        command: match wire.command {
            WireCommand::Add => PodCommand::Add,
            WireCommand::Update => PodCommand::Update,
            WireCommand::Del => PodCommand::Del,
        },
        pod_namespace: wire.pod_namespace,
        pod_name: wire.pod_name,
        container_id: wire.container_id,
        netns: wire.netns,
    };

    let resp = match pod_manager.submit(req).await {
        Ok(Some(result)) => WireResponse {
            bytes: serde_json::to_vec(&result)?,
            error: None,
        },
        Ok(None) => WireResponse { bytes: Vec::new(), error: None },
        Err(e) => WireResponse { bytes: Vec::new(), error: Some(e.to_string()) },
    };

    write_response(&mut stream, &resp).await
}

async fn write_response(stream: &mut UnixStream, resp: &WireResponse) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(resp)?;
    stream.write_all(&payload).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_command_deserializes_uppercase() {
        let parsed: WireCommand = serde_json::from_str("\"ADD\"").unwrap();
        assert!(matches!(parsed, WireCommand::Add));
    }

    #[test]
    fn wire_request_parses_full_shape() {
        let raw = r#"{"command":"UPDATE","pod_namespace":"ns","pod_name":"p","container_id":"c1","netns":"/proc/1/ns/net"}"#;
        let parsed: WireRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.pod_namespace, "ns");
        assert!(matches!(parsed.command, WireCommand::Update));
        assert_eq!(parsed.netns.as_deref(), Some("/proc/1/ns/net"));
    }

    #[test]
    fn wire_request_netns_is_optional() {
        let raw = r#"{"command":"DEL","pod_namespace":"ns","pod_name":"p","container_id":"c1"}"#;
        let parsed: WireRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.netns, None);
    }
}
