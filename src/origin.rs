use axum::http::Version;
use futures::StreamExt;
use reqwest::{Client, Response, header};
use tracing::{debug, info};

use crate::SERVER_STRING;
use crate::config::{BaseConfig, IoConfig};
use crate::error::{OffloadError, OffloadResult};
use crate::fetcher::OriginBody;
use crate::headers::HeaderTable;

/// Minimal HTTP/1.1 client against the base server. Every request rides
/// a fresh connection (`Connection: close`, no pooling) and carries the
/// bypass marker so the base server's redirect module serves us the
/// actual bytes instead of bouncing us back here.
pub struct OriginClient {
    client: Client,
    base_host: String,
    base_port: u16,
}

impl OriginClient {
    pub fn new(base: &BaseConfig, io: &IoConfig) -> OffloadResult<Self> {
        let client = Client::builder()
            .http1_only()
            .pool_max_idle_per_host(0)
            .connect_timeout(io.timeout())
            .read_timeout(io.timeout())
            // non-200s are mirrored to the client, never chased
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| OffloadError::Internal(format!("Failed to create HTTP client: {e}")))?;

        info!(
            host = %base.host,
            port = base.port,
            timeout_secs = io.timeout().as_secs(),
            "Initialized origin client"
        );

        Ok(Self {
            client,
            base_host: base.host.clone(),
            base_port: base.port,
        })
    }

    pub fn base_host(&self) -> &str {
        &self.base_host
    }

    fn url(&self, uri: &str) -> String {
        format!("http://{}:{}{}", self.base_host, self.base_port, uri)
    }

    async fn request(&self, method: reqwest::Method, uri: &str) -> OffloadResult<Response> {
        debug!(method = %method, uri = %uri, "asking base server");
        let response = self
            .client
            .request(method, self.url(uri))
            .header(header::HOST, self.base_host.as_str())
            .header(header::USER_AGENT, SERVER_STRING)
            .header(header::CONNECTION, "close")
            .header("X-Mod-Offload-Bypass", "true")
            .send()
            .await?;
        Ok(response)
    }

    /// `HEAD` the resource, returning its header table.
    pub async fn head(&self, uri: &str) -> OffloadResult<HeaderTable> {
        let response = self.request(reqwest::Method::HEAD, uri).await?;
        Ok(header_table(&response))
    }

    /// `GET` the resource, returning its header table and the open body
    /// stream for the fetcher.
    pub async fn get(&self, uri: &str) -> OffloadResult<(HeaderTable, OriginBody)> {
        let response = self.request(reqwest::Method::GET, uri).await?;
        let table = header_table(&response);
        Ok((table, response.bytes_stream().boxed()))
    }
}

/// Collect response headers into an ordered table, preceded by the
/// synthetic `response`/`response_code` entries for the status line.
fn header_table(response: &Response) -> HeaderTable {
    let mut table = HeaderTable::new();
    let status = response.status();
    table.set_status(
        version_str(response.version()),
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
    );
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            table.set(name.as_str(), value);
        }
    }
    table
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_09 {
        "HTTP/0.9"
    } else if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/1.1"
    }
}
