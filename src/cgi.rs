//! CGI-style front end: one request taken from the environment the web
//! server prepared, the response written to standard output.

use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::accesslog::Transaction;
use crate::pipeline::{self, App, CannedResponse, EntryResponse, Outcome, RequestContext};
use crate::streamer;

pub fn context_from_env() -> RequestContext {
    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

    RequestContext {
        method: env("REDIRECT_REQUEST_METHOD")
            .or_else(|| env("REQUEST_METHOD"))
            .unwrap_or_else(|| "GET".to_string()),
        uri: env("REQUEST_URI").unwrap_or_default(),
        remote: env("REMOTE_ADDR").unwrap_or_default(),
        version: env("REQUEST_VERSION").unwrap_or_default(),
        user_agent: env("HTTP_USER_AGENT"),
        referer: env("HTTP_REFERER"),
        range: env("HTTP_RANGE"),
        if_range: env("HTTP_IF_RANGE"),
    }
}

pub async fn run(app: &Arc<App>) -> anyhow::Result<()> {
    let ctx = context_from_env();
    debug!(method = %ctx.method, uri = %ctx.uri, remote = %ctx.remote, "CGI request");
    let mut txn = app.transaction(&ctx);

    let outcome = pipeline::run(app, &ctx, &mut txn).await;
    let mut out = tokio::io::stdout();
    let written = match outcome {
        Ok(Outcome::Canned(canned)) => write_canned(&mut out, canned, &mut txn).await,
        Ok(Outcome::Entry(entry)) => write_entry(&mut out, entry, app, &mut txn).await,
        Err(err) => write_canned(&mut out, CannedResponse::from_error(&err), &mut txn).await,
    };
    if let Err(e) = written {
        debug!(error = %e, "client went away mid-response");
    }

    txn.finish_releasing().await;
    // a fetch may still be copying; hold the process open until it lands
    app.fetches.wait_idle().await;
    Ok(())
}

fn render_head(status_text: &str, pairs: Vec<(&'static str, String)>) -> String {
    let mut head = format!("HTTP/1.1 {status_text}\r\n");
    for (name, value) in pairs {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(&value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

async fn write_canned(
    out: &mut tokio::io::Stdout,
    canned: CannedResponse,
    txn: &mut Transaction,
) -> std::io::Result<()> {
    txn.set_status(canned.status.as_u16());
    let head = render_head(&canned.status_text, canned.header_pairs());
    out.write_all(head.as_bytes()).await?;

    let body = canned.body_text();
    out.write_all(body.as_bytes()).await?;
    txn.add_bytes(body.len() as u64);
    out.flush().await
}

async fn write_entry(
    out: &mut tokio::io::Stdout,
    entry: EntryResponse,
    app: &Arc<App>,
    txn: &mut Transaction,
) -> std::io::Result<()> {
    txn.set_status(entry.status.as_u16());
    let head = render_head(&entry.status_text, entry.header_pairs());
    out.write_all(head.as_bytes()).await?;

    if let Some(file) = entry.body {
        let stream =
            streamer::body_stream(file, entry.window, entry.total, app.config.io.timeout());
        futures::pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            txn.add_bytes(chunk.len() as u64);
        }
    }
    out.flush().await
}
