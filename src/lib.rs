//! webacquire - multi-tenant web data-acquisition server.
//!
//! One long-running process supervising a dynamic set of worker threads
//! (crawler, parser, extractor, analyzer) over a shared store, driven by a
//! JSON command-and-control endpoint.

pub mod app;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod queries;
pub mod repository;
pub mod server;
pub mod utils;
pub mod workers;
