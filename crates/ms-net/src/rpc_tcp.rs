//! ---
//! ms_section: "05-networking-external-interfaces"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Line-delimited JSON transport for the command endpoint."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! One JSON request per line in, one JSON reply per line out. Requests from
//! every connection funnel into the single command endpoint, so they are
//! served one at a time in arrival order. Requests that get no reply (unknown
//! commands) produce no output line.

use std::net::SocketAddr;

use ms_core::{RpcClient, RpcReply, RpcRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct RpcServerBuilder {
    listen: SocketAddr,
    client: RpcClient,
}

impl RpcServerBuilder {
    pub fn new(listen: SocketAddr, client: RpcClient) -> Self {
        Self { listen, client }
    }

    pub async fn spawn(self) -> anyhow::Result<RpcServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "command endpoint listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "command client connected");
                            let client = client.clone();
                            let shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = serve_connection(stream, client, shutdown).await {
                                    warn!(peer = %peer, error = %err, "command connection failed");
                                }
                            });
                        }
                        Err(err) => error!(error = %err, "command endpoint accept failed"),
                    },
                    _ = shutdown_rx.changed() => {
                        debug!("command endpoint shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(RpcServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

pub struct RpcServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|err| anyhow::anyhow!(err))
    }
}

/// Reply for one request line, `None` when nothing should be written back.
async fn answer(client: &RpcClient, line: &str) -> Option<RpcReply> {
    match serde_json::from_str::<RpcRequest>(line) {
        Ok(request) => client.call(request).await,
        Err(err) => {
            debug!(error = %err, "malformed command request");
            Some(RpcReply::fail(format!("malformed request: {err}")))
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    client: RpcClient,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(reply) = answer(&client, line).await {
            let mut encoded = serde_json::to_vec(&reply)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_core::{RpcCall, RpcStatus};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// Endpoint stand-in: echoes `val` for "echo" and ignores anything else.
    fn fake_endpoint() -> RpcClient {
        let (tx, mut rx) = mpsc::channel::<RpcCall>(8);
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                if request.cmd == "echo" {
                    let _ = reply.send(RpcReply::ok_with(request.val));
                }
            }
        });
        RpcClient::new(tx)
    }

    #[tokio::test]
    async fn requests_are_answered_line_by_line() {
        let handle = RpcServerBuilder::new("127.0.0.1:0".parse().unwrap(), fake_endpoint())
            .spawn()
            .await
            .unwrap();
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut replies = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"cmd\":\"echo\",\"val\":[1,2]}\n{\"cmd\":\"nope\"}\nnot json\n")
            .await
            .unwrap();

        let first: RpcReply = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, RpcReply::ok_with(json!([1, 2])));
        let second: RpcReply = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.status, RpcStatus::Fail);
        assert!(second.err.unwrap().starts_with("malformed request"));
        assert!(timeout(Duration::from_millis(50), replies.next_line()).await.is_err());

        handle.shutdown().await.unwrap();
    }
}
