//! Discovering this daemon's public IP.
//!
//! The address is needed to let the daemon itself through the ACLs and to
//! resolve `local` admin entries. It is looked up through a callback so
//! tests and offline deployments can pin it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use http_body_util::{BodyExt, Empty};
use tracing::debug;

/// Callback returning this host's public IP.
pub type MyIp = Arc<dyn Fn() -> MyIpFuture + Send + Sync>;

pub type MyIpFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

const CHECK_IP_HOST: &str = "checkip.amazonaws.com";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Look the address up with checkip.amazonaws.com.
pub fn default_my_ip() -> MyIp {
    Arc::new(|| Box::pin(public_ip()))
}

/// Always answer `ip`.
pub fn fixed_my_ip(ip: impl Into<String>) -> MyIp {
    let ip: String = ip.into();
    Arc::new(move || {
        let ip = ip.clone();
        Box::pin(async move { Ok(ip) })
    })
}

/// Fetch this host's public IP over plain HTTP.
pub async fn public_ip() -> anyhow::Result<String> {
    tokio::time::timeout(LOOKUP_TIMEOUT, fetch())
        .await
        .context("public ip lookup timed out")?
}

async fn fetch() -> anyhow::Result<String> {
    let stream = tokio::net::TcpStream::connect((CHECK_IP_HOST, 80))
        .await
        .with_context(|| format!("connect to {CHECK_IP_HOST}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(format!("http://{CHECK_IP_HOST}/"))
        .header("host", CHECK_IP_HOST)
        .header("user-agent", "stratus/0.1")
        .body(Empty::<bytes::Bytes>::new())?;

    let resp = sender.send_request(req).await?;
    if !resp.status().is_success() {
        bail!("{CHECK_IP_HOST} responded with {}", resp.status());
    }

    let body = resp.into_body().collect().await?.to_bytes();
    let ip = String::from_utf8(body.to_vec())?.trim().to_string();
    if ip.is_empty() {
        bail!("{CHECK_IP_HOST} returned an empty body");
    }

    debug!(%ip, "discovered public ip");
    Ok(ip)
}
