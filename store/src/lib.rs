pub mod backend;
pub mod config;
pub mod db;
pub mod elastic;
pub mod filter;
pub mod params;
pub mod queries;
pub mod types;

pub use backend::{
    validate_index_name, wait_for_backend, SearchBackend, SearchResponse, StoreError, StoreResult,
};
pub use config::ElasticConfig;
pub use db::MonocleDb;
pub use elastic::ElasticBackend;
pub use params::{parse_interval, QueryArgs, QueryParams};
pub use queries::{NamedQuery, Scope};
pub use types::{
    Change, ChangeKind, ChangeState, ChangedFile, Commit, DocType, Document, Event, EventKind,
};

pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::db::*;
    pub use crate::elastic::*;
    pub use crate::params::*;
    pub use crate::types::*;
}
