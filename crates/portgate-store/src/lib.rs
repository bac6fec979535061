//! SQLite-backed persistence for the portgate server
//!
//! Three databases live in the data directory: `jobs.db` (single and
//! multi-client job records), `clients.db` (client metadata surviving
//! restarts for the keep-lost window) and `client_groups.db`. All access
//! goes through parameterized statements.

pub mod clients;
pub mod groups;
pub mod jobs;
pub mod query;

pub use clients::{ClientStore, StoredClient};
pub use groups::{ClientGroup, GroupParams, GroupStore};
pub use jobs::JobStore;
pub use query::{
    append_options_to_query, convert_list_options_to_query, FieldsOption, FilterOperator,
    FilterOption, ListOptions, Pagination, SortOption,
};

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid group id: {0:?}")]
    InvalidGroupId(String),
}
