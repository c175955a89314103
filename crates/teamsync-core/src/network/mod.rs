//! Network utilities for talking to platform instances.
//!
//! This module provides an HTTP client that authenticates every request with
//! an instance API key and turns non-success responses into typed errors.

mod client;
mod multipart;

pub use client::{endpoint_url, HttpClient};
pub use multipart::MultipartPart;
