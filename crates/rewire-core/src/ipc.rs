use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{mpsc, oneshot},
};

use crate::enforcement::GateRequest;
use crate::firewall::FirewallStatus;

/// IPC request from CLI to daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcRequest {
    Status,
    /// The user passed the gate for this package
    Approve { package: String },
    /// The user backed out of the gate
    DismissGate,
    /// Settings changed on disk
    ReloadSettings,
    Shutdown,
}

/// IPC response from daemon to CLI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum IpcResponse {
    Status {
        status: FirewallStatus,
        /// Most recent gate the host has not answered yet
        pending_gate: Option<GateRequest>,
    },
    Ok,
    Error(String),
    Shutdown,
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Send one request and wait for the reply
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or replies with garbage
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .with_context(|| format!("Failed to connect to {}", self.sock_path.display()))?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

/// A request waiting for the daemon loop to answer it
pub type IpcCommand = (IpcRequest, oneshot::Sender<IpcResponse>);

/// Forwards socket requests into the daemon loop, which owns all state
pub struct DaemonIpcHandler {
    commands: mpsc::Sender<IpcCommand>,
}

impl DaemonIpcHandler {
    #[must_use]
    pub fn new(commands: mpsc::Sender<IpcCommand>) -> Self {
        Self { commands }
    }

    async fn dispatch(&self, request: IpcRequest) -> IpcResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send((request, reply_tx)).await.is_err() {
            return IpcResponse::Error(String::from("daemon is shutting down"));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| IpcResponse::Error(String::from("daemon dropped the request")))
    }

    /// Answer one request on `stream`
    ///
    /// # Errors
    ///
    /// Returns an error if the response cannot be encoded or written
    pub async fn handle(&self, stream: &mut UnixStream, request: IpcRequest) -> Result<()> {
        let response = self.dispatch(request).await;
        let encoded = bincode::serialize(&response)?;
        stream.write_all(&encoded).await?;
        Ok(())
    }
}

/// Accept connections on `sock_path` forever
///
/// # Errors
///
/// Returns an error if the socket cannot be bound
pub async fn listen(handler: Arc<DaemonIpcHandler>, sock_path: &Path) -> io::Result<()> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;

    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    match stream.read_to_end(&mut buf).await {
                        Ok(n) if n > 0 => match bincode::deserialize::<IpcRequest>(&buf) {
                            Ok(request) => {
                                if let Err(e) = handler.handle(&mut stream, request).await {
                                    log::error!("IPC handle error: {e}");
                                }
                            }
                            Err(e) => {
                                log::error!("IPC deserialize error: {e}");
                            }
                        },
                        Ok(_) => {} // Connection closed
                        Err(e) => {
                            log::error!("IPC read error: {e}");
                        }
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_round_trips_through_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("rewire.sock");

        let (tx, mut rx) = mpsc::channel::<IpcCommand>(4);
        let handler = Arc::new(DaemonIpcHandler::new(tx));
        let listen_path = sock_path.clone();
        tokio::spawn(async move {
            let _ = listen(handler, &listen_path).await;
        });

        // Stand-in for the daemon loop
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let response = match request {
                    IpcRequest::Approve { package } if package == "com.example" => IpcResponse::Ok,
                    _ => IpcResponse::Error(String::from("unexpected")),
                };
                let _ = reply.send(response);
            }
        });

        let client = IpcClient::new(&sock_path);
        let mut response = None;
        for _ in 0..50 {
            match client
                .send_command(IpcRequest::Approve {
                    package: String::from("com.example"),
                })
                .await
            {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        assert_eq!(response, Some(IpcResponse::Ok));
    }

    #[tokio::test]
    async fn test_closed_daemon_reports_error() {
        let (tx, rx) = mpsc::channel::<IpcCommand>(1);
        drop(rx);
        let handler = DaemonIpcHandler::new(tx);
        assert!(matches!(
            handler.dispatch(IpcRequest::Status).await,
            IpcResponse::Error(_)
        ));
    }
}
