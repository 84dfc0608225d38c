//! Networking layer for Rosterline
//!
//! This crate provides the request/response model, the `Fetcher` seam the
//! sync engine talks to, and a reqwest-backed HTTP client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;

#[cfg(any(test, feature = "mock"))]
pub mod testing;

pub use client::{FetchError, Fetcher, HttpClient, HttpClientConfig, Method, Request, Response};

#[cfg(any(test, feature = "mock"))]
pub use client::MockFetcher;
