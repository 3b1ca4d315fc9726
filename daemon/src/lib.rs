//! Transport and HTTP diagnostics for the modhost daemon.

pub mod api;
pub mod transport;

pub use api::build_router;
pub use transport::{serve, serve_with_limit, TcpConnection, DEFAULT_MAX_LINE_BYTES};
