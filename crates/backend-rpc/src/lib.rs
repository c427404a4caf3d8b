//! HTTP RPC surface of the chat backend.
//!
//! [`BackendApi`] is the seam the sync service, badge engine, and
//! notification feed consume; [`BackendClient`] implements it over the
//! backend's PostgREST-style REST API. Tests inject fakes behind
//! `Arc<dyn BackendApi>` instead of spinning up HTTP servers.

mod api;
mod client;
mod query;

pub use api::BackendApi;
pub use client::{BackendClient, BackendConfig};
pub use query::messages_query;
