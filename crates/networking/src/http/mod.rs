//! HTTP client for the broker REST API

mod client;

pub use client::KotakNeoClient;
