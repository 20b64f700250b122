// ABOUTME: Readiness probes: one check of one replica over HTTP, TCP, a command, or the cluster flag.
// ABOUTME: Any error, including transport failures, is a failed check for classification.

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use tokio::net::TcpStream;
use tokio::process::Command;

use crate::cluster::ReplicaStatus;
use crate::config::ProbeSpec;
use crate::types::ReplicaId;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("replica {0} has no address")]
    NoAddress(ReplicaId),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("probe command failed to run: {0}")]
    Spawn(String),

    #[error("probe command exited with {0:?}")]
    Exit(Option<i32>),

    #[error("cluster reports replica not ready")]
    NotReady,

    #[error("probe timed out after {0}ms")]
    Timeout(u128),
}

/// A single readiness check against one replica.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, replica: &ReplicaStatus) -> Result<(), ProbeError>;
}

/// Build the probe described by `spec`.
pub fn probe_for(spec: &ProbeSpec) -> Box<dyn Probe> {
    match spec {
        ProbeSpec::Http { path, port } => Box::new(HttpProbe {
            path: path.clone(),
            port: *port,
        }),
        ProbeSpec::Tcp { port } => Box::new(TcpProbe { port: *port }),
        ProbeSpec::Exec { command } => Box::new(ExecProbe {
            command: command.clone(),
        }),
        ProbeSpec::Cluster => Box::new(ClusterProbe),
    }
}

fn address(replica: &ReplicaStatus) -> Result<IpAddr, ProbeError> {
    replica
        .address
        .ok_or_else(|| ProbeError::NoAddress(replica.id.clone()))
}

/// GET `path`; 2xx and 3xx are healthy.
pub struct HttpProbe {
    path: String,
    port: u16,
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, replica: &ReplicaStatus) -> Result<(), ProbeError> {
        let addr = SocketAddr::new(address(replica)?, self.port);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeError::Connect(format!("{addr}: {e}")))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Http(format!("handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("probe connection error: {}", e);
            }
        });

        let req = hyper::Request::builder()
            .method("GET")
            .uri(self.path.as_str())
            .header("Host", addr.to_string())
            .header("User-Agent", concat!("conveyor/", env!("CARGO_PKG_VERSION")))
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Http(format!("failed to build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

/// An accepted TCP connection is healthy.
pub struct TcpProbe {
    port: u16,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self, replica: &ReplicaStatus) -> Result<(), ProbeError> {
        let addr = SocketAddr::new(address(replica)?, self.port);
        TcpStream::connect(addr)
            .await
            .map(drop)
            .map_err(|e| ProbeError::Connect(format!("{addr}: {e}")))
    }
}

/// Runs on the orchestrator host. Exit status 0 is healthy.
pub struct ExecProbe {
    command: Vec<String>,
}

#[async_trait]
impl Probe for ExecProbe {
    async fn check(&self, replica: &ReplicaStatus) -> Result<(), ProbeError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ProbeError::Spawn("empty command".to_string()));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env("CONVEYOR_REPLICA_ID", replica.id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(addr) = replica.address {
            command.env("CONVEYOR_REPLICA_ADDR", addr.to_string());
        }

        let status = command
            .status()
            .await
            .map_err(|e| ProbeError::Spawn(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::Exit(status.code()))
        }
    }
}

/// Defers to the cluster's readiness flag.
pub struct ClusterProbe;

#[async_trait]
impl Probe for ClusterProbe {
    async fn check(&self, replica: &ReplicaStatus) -> Result<(), ProbeError> {
        if replica.ready {
            Ok(())
        } else {
            Err(ProbeError::NotReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Digest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn replica(address: Option<IpAddr>, ready: bool) -> ReplicaStatus {
        ReplicaStatus {
            id: ReplicaId::new("web-1"),
            digest: Digest::parse("sha256:aa").unwrap(),
            ready,
            address,
        }
    }

    async fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!("{status_line}\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn cluster_probe_follows_ready_flag() {
        assert!(ClusterProbe.check(&replica(None, true)).await.is_ok());
        assert!(matches!(
            ClusterProbe.check(&replica(None, false)).await,
            Err(ProbeError::NotReady)
        ));
    }

    #[tokio::test]
    async fn network_probes_need_an_address() {
        let probe = probe_for(&ProbeSpec::Tcp { port: 80 });
        assert!(matches!(
            probe.check(&replica(None, true)).await,
            Err(ProbeError::NoAddress(_))
        ));
    }

    #[tokio::test]
    async fn tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = probe_for(&ProbeSpec::Tcp { port });

        let result = probe.check(&replica(Some("127.0.0.1".parse().unwrap()), true)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn http_probe_accepts_redirects() {
        let port = serve_once("HTTP/1.1 302 Found").await;
        let probe = probe_for(&ProbeSpec::Http {
            path: "/healthz".to_string(),
            port,
        });

        let result = probe.check(&replica(Some("127.0.0.1".parse().unwrap()), true)).await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn http_probe_rejects_server_errors() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable").await;
        let probe = probe_for(&ProbeSpec::Http {
            path: "/healthz".to_string(),
            port,
        });

        let result = probe.check(&replica(Some("127.0.0.1".parse().unwrap()), true)).await;
        assert!(matches!(result, Err(ProbeError::Status(503))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_probe_uses_exit_status() {
        let ok = probe_for(&ProbeSpec::Exec {
            command: vec!["sh".into(), "-c".into(), "test \"$CONVEYOR_REPLICA_ID\" = web-1".into()],
        });
        assert!(ok.check(&replica(None, true)).await.is_ok());

        let failing = probe_for(&ProbeSpec::Exec {
            command: vec!["sh".into(), "-c".into(), "exit 2".into()],
        });
        assert!(matches!(
            failing.check(&replica(None, true)).await,
            Err(ProbeError::Exit(Some(2)))
        ));
    }
}
