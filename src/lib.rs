//! offload - an HTTP bandwidth-offload cache, a sort of poor man's CDN.
//!
//! Clients are redirected here by a base server; each request is answered
//! from an on-disk cache of the base server's content, or streamed from
//! the base server to disk and to the client at the same time.

pub mod accesslog;
pub mod cgi;
pub mod coherence;
pub mod config;
pub mod dupes;
pub mod error;
pub mod fetcher;
pub mod front;
pub mod headers;
pub mod lock;
pub mod origin;
pub mod pipeline;
pub mod range;
pub mod stats;
pub mod store;
pub mod streamer;

/// Server identification sent in `Server` and `User-Agent` headers.
pub const SERVER_STRING: &str = concat!("offloadd/", env!("CARGO_PKG_VERSION"));
