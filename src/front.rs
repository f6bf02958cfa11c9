//! The standalone listener front end: axum does the request-line and
//! header parsing the CGI host would otherwise do for us.

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::accesslog::Transaction;
use crate::pipeline::{self, App, CannedResponse, EntryResponse, Outcome, RequestContext};
use crate::streamer;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .fallback(offload_handler)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app)
}

async fn offload_handler(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let ctx = context_from_request(&app, addr, &request);
    let mut txn = app.transaction(&ctx);

    match pipeline::run(&app, &ctx, &mut txn).await {
        Ok(Outcome::Canned(canned)) => canned_response(canned, txn),
        Ok(Outcome::Entry(entry)) => entry_response(entry, &app, txn),
        Err(err) => canned_response(CannedResponse::from_error(&err), txn),
    }
}

fn context_from_request(app: &App, addr: SocketAddr, request: &Request) -> RequestContext {
    let headers = request.headers();

    let mut remote = addr.ip().to_string();
    let trusted = app
        .config
        .listen
        .trusted_proxies
        .iter()
        .any(|proxy| proxy == &remote);
    if trusted {
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            remote = forwarded.to_string();
        }
    }

    let uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    RequestContext {
        method: request.method().as_str().to_string(),
        uri,
        remote,
        version: format!("{:?}", request.version()),
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        referer: header_str(headers, "referer").map(str::to_string),
        range: header_str(headers, "range").map(str::to_string),
        if_range: header_str(headers, "if-range").map(str::to_string),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn canned_response(canned: CannedResponse, mut txn: Transaction) -> Response {
    txn.set_status(canned.status.as_u16());
    let body = canned.body_text();
    txn.add_bytes(body.len() as u64);

    let mut builder = Response::builder().status(canned.status);
    for (name, value) in canned.header_pairs() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| fallback_500())
}

fn entry_response(entry: EntryResponse, app: &Arc<App>, mut txn: Transaction) -> Response {
    txn.set_status(entry.status.as_u16());

    let mut builder = Response::builder().status(entry.status);
    for (name, value) in entry.header_pairs() {
        builder = builder.header(name, value);
    }

    match entry.body {
        None => builder
            .body(Body::empty())
            .unwrap_or_else(|_| fallback_500()),
        Some(file) => {
            let stream = streamer::logged_body_stream(
                file,
                entry.window,
                entry.total,
                app.config.io.timeout(),
                txn,
            );
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| fallback_500())
        }
    }
}

fn fallback_500() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to build response\n\n",
    )
        .into_response()
}
