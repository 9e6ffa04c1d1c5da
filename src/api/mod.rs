//! Purpose: Define the public Rust API boundary for rowpipe.
//! Exports: `RowSource`, seeding helpers, and the core types callers touch.
//! Role: Stable surface for the CLI and embedding code; `core` stays internal.
//! Invariants: Additive-only; everything a caller needs is re-exported here.

mod seed;
mod source;

pub use crate::config::{PipelineOptions, Target, default_database_path};
pub use crate::core::backend::{Backend, SqliteBackend};
pub use crate::core::cache::{CacheStats, QueryCache, RecordCache};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::executor::{Executor, FailurePolicy, Op, op};
pub use crate::core::paginate::{Page, PageStream, Paginator};
pub use crate::core::query::{Query, QuerySignature};
pub use crate::core::record::{Record, Value};
pub use crate::core::scope::ConnectionScope;
pub use crate::core::stage::{Mean, filter_within, format_mean};
pub use crate::core::stream::{RecordStream, RowStream};
pub use crate::core::window::{Batch, BatchStream};
pub use seed::{
    NewUser, SeedReport, USER_TABLE_DDL, create_user_table, read_users, read_users_file, seed_from_csv,
    seed_users,
};
pub use source::RowSource;
