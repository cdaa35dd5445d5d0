//! Minion RPC client contract and its HTTP implementation.
//!
//! Minions expose their configuration at `/config`: `GET` returns the
//! config the minion is running with, `PUT` replaces it. Bodies are JSON.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_db::Role;

use crate::error::{ForemanError, ForemanResult};

/// Default port minions listen on.
pub const DEFAULT_MINION_PORT: u16 = 9999;

/// Default per-call timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration pushed to, and reported by, a minion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MinionConfig {
    pub role: Role,
    pub private_ip: String,
    pub floating_ip: String,
    pub blueprint: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub etcd_members: Vec<String>,
    pub authorized_keys: Vec<String>,
}

/// Boxed future returned by minion RPCs.
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = ForemanResult<T>> + Send + 'a>>;

/// One minion's RPC surface. Injected so tests can substitute fakes.
pub trait MinionClient: Send + Sync {
    /// Fetch the minion's current configuration.
    fn get_config(&self) -> RpcFuture<'_, MinionConfig>;

    /// Replace the minion's configuration.
    fn set_config<'a>(&'a self, config: &'a MinionConfig) -> RpcFuture<'a, ()>;

    /// Release the client. Later calls fail.
    fn close(&self);
}

/// Creates minion clients by public IP.
///
/// `connect` does no I/O; an unreachable minion is discovered by the first
/// RPC, not here.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, public_ip: &str) -> ForemanResult<Arc<dyn MinionClient>>;
}

// ── HTTP ──────────────────────────────────────────────────────────

/// Builds [`HttpMinionClient`]s for a fixed port and timeout.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    port: u16,
    timeout: Duration,
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MINION_PORT, DEFAULT_RPC_TIMEOUT)
    }
}

impl HttpClientFactory {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, public_ip: &str) -> ForemanResult<Arc<dyn MinionClient>> {
        let ip: IpAddr = public_ip
            .parse()
            .map_err(|_| ForemanError::InvalidAddress(public_ip.to_string()))?;
        Ok(Arc::new(HttpMinionClient::new(
            SocketAddr::new(ip, self.port),
            self.timeout,
        )))
    }
}

/// Minion client speaking JSON over HTTP/1.1, one connection per call.
#[derive(Debug)]
pub struct HttpMinionClient {
    addr: SocketAddr,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpMinionClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    async fn call(&self, method: http::Method, body: Bytes) -> ForemanResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ForemanError::Closed);
        }

        tokio::time::timeout(self.timeout, self.exchange(method, body))
            .await
            .map_err(|_| ForemanError::Timeout(self.timeout))?
    }

    async fn exchange(&self, method: http::Method, body: Bytes) -> ForemanResult<Bytes> {
        let addr = self.addr.to_string();

        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .map_err(|e| ForemanError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ForemanError::Connect {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "minion connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method(method)
            .uri("/config")
            .header("host", &addr)
            .header("content-type", "application/json")
            .header("user-agent", "stratus-foreman/0.1")
            .body(Full::new(body))
            .map_err(|e| ForemanError::Rpc(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ForemanError::Rpc(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ForemanError::Status(status.as_u16()));
        }

        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ForemanError::Rpc(e.to_string()))?;
        Ok(collected.to_bytes())
    }
}

impl MinionClient for HttpMinionClient {
    fn get_config(&self) -> RpcFuture<'_, MinionConfig> {
        Box::pin(async move {
            let body = self.call(http::Method::GET, Bytes::new()).await?;
            Ok(serde_json::from_slice(&body)?)
        })
    }

    fn set_config<'a>(&'a self, config: &'a MinionConfig) -> RpcFuture<'a, ()> {
        Box::pin(async move {
            let body = serde_json::to_vec(config)?;
            self.call(http::Method::PUT, Bytes::from(body)).await?;
            Ok(())
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
