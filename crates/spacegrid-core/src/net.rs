//! Outbound plain-HTTP requests over a single hyper http1 connection.

use std::time::Duration;

use anyhow::{Context, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

/// Status and body of a completed request.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Send one request to an `http://` URL, bounded by `timeout`.
pub async fn send(
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: Bytes,
    timeout: Duration,
) -> anyhow::Result<HttpReply> {
    let uri: http::Uri = url.parse().with_context(|| format!("invalid url {url}"))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => bail!("unsupported scheme {other} in {url}"),
        None => bail!("missing scheme in {url}"),
    }
    let host = uri.host().context("url has no host")?.to_string();
    let port = uri.port_u16().unwrap_or(80);
    let address = format!("{host}:{port}");
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| address.clone());

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .with_context(|| format!("connect {address}"))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri.path_and_query().map(|p| p.as_str()).unwrap_or("/"))
            .header("host", authority.as_str())
            .header("user-agent", "spacegrid/0.1");
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let req = builder.body(Full::new(body))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status().as_u16();
        let body = resp.into_body().collect().await?.to_bytes();
        Ok::<_, anyhow::Error>(HttpReply { status, body })
    };

    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .with_context(|| format!("{method} {url} timed out after {timeout:?}"))??;
    debug!(%method, %url, status = reply.status, bytes = reply.body.len(), "http request complete");
    Ok(reply)
}
