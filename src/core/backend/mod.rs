// Primitives the pipeline consumes from a relational store.
use crate::config::Target;
use crate::core::error::Error;
use crate::core::query::Query;
use crate::core::record::Record;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(test)]
pub(crate) mod fake;
pub mod sqlite;

pub use sqlite::SqliteBackend;

/// A relational store reachable through exclusively-owned connection handles.
///
/// Implementations never share a `Handle` between callers; the pipeline owns
/// each handle through one `ConnectionScope` and hands it back via `release`
/// exactly once.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Failures must carry `ErrorKind::Connection`.
    async fn acquire(&self, target: &Target) -> Result<Self::Handle, Error>;

    /// Run `query` and yield its rows lazily, in store order.
    ///
    /// Failures (including a rejected statement) are yielded as
    /// `ErrorKind::Query` items; the stream ends after the first one.
    fn execute<'c>(
        &'c self,
        handle: &'c mut Self::Handle,
        query: &'c Query,
    ) -> BoxStream<'c, Result<Record, Error>>;

    /// Run a statement that produces no rows and report rows affected.
    async fn command(&self, handle: &mut Self::Handle, query: &Query) -> Result<u64, Error>;

    fn release(&self, handle: Self::Handle);
}
