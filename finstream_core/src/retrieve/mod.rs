//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the market-data clients.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: `ApiClient`, a JSON client on `reqwest` and
//!   `reqwest-middleware` with transient-failure retries. The Nasdaq client in
//!   `markets::nasdaq` is built on it.

/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiError, ApiResponse};
