//! monocle command line and HTTP query API
//!
//! The binary wires the `store` and `crawler` crates together. This library
//! holds the parts worth testing on their own: the axum router serving named
//! queries and the pull request dump helpers.

pub mod dump;
pub mod webapp;

pub use dump::{dump_prefix, write_dump};
pub use webapp::{create_router, serve, AppState};
