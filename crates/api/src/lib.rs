//! HTTP admission layer for the corporate directory.
//!
//! - Bearer tokens are checked by [`corpdir_authn::Authenticator`] in
//!   [`middleware::require_principal`].
//! - Webhook deliveries on `/v1/ingestion/events` are checked by
//!   [`corpdir_authn::WebhookVerifier`].
//! - Contact writes go through [`corpdir_concurrency::ConcurrencyController`]
//!   with `ETag` / `If-Match`.
//!
//! The binary in `main.rs` wires these from [`config::Cli`]; tests build an
//! [`AppState`] directly and drive [`router`] in-process.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
