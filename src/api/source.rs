//! Purpose: One entry point tying a store, a target, and pipeline options
//! together for callers (CLI, tests, embedding code).
//! Exports: `RowSource`.
//! Role: Thin composition layer over `core`; owns no state beyond shared
//! handles (backend, target, cache, cancellation token).
//! Invariants: Every stream it returns owns its own connection scope and
//! releases it before surfacing an error or finishing.
//! Invariants: Cloning a `RowSource` shares the backend and cache.
#![allow(clippy::result_large_err)]

use crate::config::{PipelineOptions, Target};
use crate::core::backend::{Backend, SqliteBackend};
use crate::core::cache::RecordCache;
use crate::core::error::Error;
use crate::core::executor::{Executor, Op, op};
use crate::core::paginate::{PageStream, Paginator};
use crate::core::query::Query;
use crate::core::record::Record;
use crate::core::scope::ConnectionScope;
use crate::core::stage::{self, Mean};
use crate::core::stream::RecordStream;
use crate::core::window::{BatchStream, window};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RowSource<B: Backend = SqliteBackend> {
    backend: Arc<B>,
    target: Arc<Target>,
    options: PipelineOptions,
    cache: Arc<RecordCache>,
    cancel: Option<CancellationToken>,
}

impl<B: Backend> Clone for RowSource<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            target: self.target.clone(),
            options: self.options.clone(),
            cache: self.cache.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl RowSource<SqliteBackend> {
    pub fn sqlite(target: Target) -> Self {
        Self::new(SqliteBackend::new(), target)
    }
}

impl<B: Backend> RowSource<B> {
    /// Uses the process-wide record cache; see `with_cache` for a private one.
    pub fn new(backend: B, target: Target) -> Self {
        Self::from_parts(Arc::new(backend), Arc::new(target))
    }

    pub fn from_parts(backend: Arc<B>, target: Arc<Target>) -> Self {
        Self {
            backend,
            target,
            options: PipelineOptions::default(),
            cache: RecordCache::shared(),
            cancel: None,
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cache(mut self, cache: Arc<RecordCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Streams, pages and concurrent runs started from this source stop
    /// with `ErrorKind::Cancelled` once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub async fn open_scope(&self) -> Result<ConnectionScope<B>, Error> {
        let scope = ConnectionScope::open(self.backend.clone(), &self.target).await?;
        Ok(match &self.cancel {
            Some(token) => scope.with_cancellation(token.clone()),
            None => scope,
        })
    }

    /// Lazily stream every row of `query`. The connection is acquired on the
    /// first poll and released when the stream ends, fails, or is dropped.
    pub fn stream(&self, query: impl Into<Query>) -> RecordStream {
        let source = self.clone();
        let query = query.into();
        Box::pin(async_stream::stream! {
            let mut scope = match source.open_scope().await {
                Ok(scope) => scope,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            let mut failure = None;
            {
                let mut rows = scope.rows(&query);
                while let Some(item) = rows.next().await {
                    match item {
                        Ok(record) => yield Ok(record),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }
            scope.release();
            if let Some(err) = failure {
                yield Err(err);
            }
        })
    }

    pub fn batches(&self, query: impl Into<Query>, size: usize) -> Result<BatchStream, Error> {
        Ok(window(self.stream(query), size)?.boxed())
    }

    /// Paginator over `query`, ordered by the configured order key if any.
    pub fn paginator(&self, query: impl Into<Query>) -> Result<Paginator<B>, Error> {
        let mut paginator = Paginator::new(self.backend.clone(), self.target.clone(), query.into());
        if let Some(key) = &self.options.order_by {
            paginator = paginator.order_by(key)?;
        }
        if let Some(token) = &self.cancel {
            paginator = paginator.with_cancellation(token.clone());
        }
        Ok(paginator)
    }

    pub fn paginate(&self, query: impl Into<Query>, page_size: usize) -> Result<PageStream, Error> {
        self.paginator(query)?.pages(page_size)
    }

    pub fn filter<P>(&self, query: impl Into<Query>, predicate: P) -> RecordStream
    where
        P: FnMut(&Record) -> bool + Send + 'static,
    {
        stage::filter(self.stream(query), predicate).boxed()
    }

    pub async fn aggregate<A, F>(&self, query: impl Into<Query>, identity: A, reducer: F) -> Result<A, Error>
    where
        F: FnMut(A, Record) -> A,
    {
        stage::aggregate(self.stream(query), identity, reducer).await
    }

    pub async fn mean(&self, query: impl Into<Query>, column: &str) -> Result<Mean, Error> {
        stage::column_mean(self.stream(query), column).await
    }

    /// Run `query` on a fresh scope and materialize every row.
    pub async fn fetch_all(&self, query: impl Into<Query>) -> Result<Vec<Record>, Error> {
        let query = query.into();
        let mut scope = self.open_scope().await?;
        let records: Vec<Record> = scope.rows(&query).try_collect().await?;
        scope.release();
        tracing::debug!(query = query.text(), records = records.len(), "fetched all rows");
        Ok(records)
    }

    pub async fn command(&self, query: impl Into<Query>) -> Result<u64, Error> {
        let query = query.into();
        let mut scope = self.open_scope().await?;
        let affected = scope.command(&query).await?;
        scope.release();
        Ok(affected)
    }

    /// Materialized rows of `query`, computed at most once per signature for
    /// the lifetime of the cache.
    pub async fn cached_query(&self, query: impl Into<Query>) -> Result<Arc<Vec<Record>>, Error> {
        let query = query.into();
        self.cache
            .get_or_compute(&query, || self.fetch_all(query.clone()))
            .await
    }

    /// Fetch every query concurrently, each on its own connection scope.
    /// Results follow submission order; the failure policy comes from the
    /// source's options.
    pub async fn run_concurrently(&self, queries: Vec<Query>) -> Result<Vec<Vec<Record>>, Error> {
        self.executor().run_all(self.fetch_ops(queries)).await
    }

    pub async fn run_concurrently_settled(&self, queries: Vec<Query>) -> Vec<Result<Vec<Record>, Error>> {
        self.executor().run_settled(self.fetch_ops(queries)).await
    }

    fn executor(&self) -> Executor {
        let executor = Executor::new(self.options.failure_policy);
        match &self.cancel {
            Some(token) => executor.with_cancellation(token.clone()),
            None => executor,
        }
    }

    fn fetch_ops(&self, queries: Vec<Query>) -> Vec<Op<Vec<Record>>> {
        queries
            .into_iter()
            .map(|query| {
                let source = self.clone();
                op(move |token| async move { source.with_cancellation(token).fetch_all(query).await })
            })
            .collect()
    }
}
