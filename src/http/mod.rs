//! Outbound HTTP with per-call caching, deadlines and retries.
//!
//! [`HttpClient`] is the only component that talks to the network. Every
//! adapter goes through it, so caching and failure classification are
//! uniform across sources:
//!
//! - **Caching**: responses are stored under `http:<url>` for the request TTL
//! - **Deadlines**: each attempt is bounded by the request timeout
//! - **Retries**: a fixed number of immediate retries for transient failures
//! - **Errors**: [`FetchError`] separates timeouts, transport failures and
//!   non-success statuses so callers can tell "later" from "broken"

mod client;

pub use client::{cache_key, FetchError, FetchResponse, HttpClient, RequestOptions};
