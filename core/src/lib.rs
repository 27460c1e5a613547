//! Authenticated API client core for the time-tracking service.
//!
//! # Overview
//! Every network call from the dashboard goes through [`ApiClient`]. It
//! attaches the bearer token, converts payload keys between the wire's
//! snake_case and the local camelCase, and recovers from an expired access
//! token by refreshing it once (shared by every concurrent caller) and
//! replaying each affected request exactly once.
//!
//! # Design
//! - `TokenState` is an injected, in-memory cell; nothing is persisted.
//! - `Payload` is a closed variant set so dates and binary uploads are never
//!   mistaken for records during case conversion.
//! - Requests and responses are plain data (`HttpRequest`/`HttpResponse`);
//!   the `Transport` trait is the only place I/O happens.
//! - `RefreshCoordinator` guards its Idle/Refreshing transition with a mutex,
//!   so single-flight holds on a multi-threaded runtime.

pub mod case;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod interceptor;
pub mod payload;
pub mod refresh;
pub mod token;
pub mod transport;
pub mod types;

pub use case::{to_local_case, to_wire_case};
pub use client::{ApiClient, RequestOptions};
pub use config::ClientConfig;
pub use error::{ApiError, Result};
pub use http::{Attempt, FormPart, FormValue, HttpMethod, HttpRequest, HttpResponse, RequestBody};
pub use interceptor::ApiEnvelope;
pub use payload::{Binary, Payload};
pub use refresh::RefreshCoordinator;
pub use token::{AccessToken, TokenState};
#[cfg(feature = "reqwest")]
pub use transport::ReqwestTransport;
pub use transport::Transport;
pub use types::{AuthSession, NewProject, Project, TimeEntry, User};
