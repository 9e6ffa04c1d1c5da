// Scoped acquisition: one connection per scope, released exactly once on
// every exit path (explicit release, drop, error, panic, future cancellation).
use crate::config::Target;
use crate::core::backend::Backend;
use crate::core::error::{Error, ErrorKind};
use crate::core::query::Query;
use crate::core::stream::RowStream;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ConnectionScope<B: Backend> {
    backend: Arc<B>,
    handle: Option<B::Handle>,
    target: String,
    cancel: Option<CancellationToken>,
}

impl<B: Backend> ConnectionScope<B> {
    pub async fn open(backend: Arc<B>, target: &Target) -> Result<Self, Error> {
        let handle = match backend.acquire(target).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(target = %target.label(), error = %err, "connection failed");
                return Err(err);
            }
        };
        tracing::debug!(target = %target.label(), "connection acquired");
        Ok(Self {
            backend,
            handle: Some(handle),
            target: target.label(),
            cancel: None,
        })
    }

    /// Run `f` with a freshly opened scope, releasing it before `f`'s result
    /// (success or failure) is returned.
    pub async fn using<T, F>(backend: Arc<B>, target: &Target, f: F) -> Result<T, Error>
    where
        F: for<'s> FnOnce(&'s mut ConnectionScope<B>) -> BoxFuture<'s, Result<T, Error>>,
    {
        let mut scope = Self::open(backend, target).await?;
        let result = f(&mut scope).await;
        scope.release();
        result
    }

    /// Row streams opened from this scope stop with `ErrorKind::Cancelled`
    /// once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn rows<'s>(&'s mut self, query: &'s Query) -> RowStream<'s> {
        let cancel = self.cancel.clone();
        let Some(handle) = self.handle.as_mut() else {
            return RowStream::failed(released_error());
        };
        tracing::debug!(target = %self.target, query = query.text(), "executing query");
        RowStream::new(self.backend.execute(handle, query), cancel)
    }

    pub async fn command(&mut self, query: &Query) -> Result<u64, Error> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::cancelled().with_query(query.text()));
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(released_error());
        };
        self.backend.command(handle, query).await
    }

    pub fn release(mut self) {
        self.release_handle();
    }

    fn release_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.backend.release(handle);
            tracing::debug!(target = %self.target, "connection released");
        }
    }
}

impl<B: Backend> Drop for ConnectionScope<B> {
    fn drop(&mut self) {
        self.release_handle();
    }
}

fn released_error() -> Error {
    Error::new(ErrorKind::Internal).with_message("connection already released")
}

#[cfg(test)]
mod tests {
    use super::ConnectionScope;
    use crate::config::Target;
    use crate::core::backend::fake::{FakeBackend, Script, ages};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::query::Query;
    use futures::{FutureExt, TryStreamExt};
    use std::sync::Arc;

    fn target() -> Target {
        Target::new("users.db")
    }

    #[tokio::test]
    async fn explicit_release_runs_once() {
        let backend = Arc::new(FakeBackend::table(ages(&[30])));
        let scope = ConnectionScope::open(backend.clone(), &target()).await.expect("open");
        scope.release();
        assert_eq!(backend.acquired(), 1);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn drop_releases() {
        let backend = Arc::new(FakeBackend::table(ages(&[30])));
        {
            let _scope = ConnectionScope::open(backend.clone(), &target()).await.expect("open");
        }
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn failed_acquire_releases_nothing() {
        let backend = Arc::new(FakeBackend::table(Vec::new()).refuse_connections());
        let err = ConnectionScope::open(backend.clone(), &target())
            .await
            .err()
            .expect("err");
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(backend.acquired(), 0);
        assert_eq!(backend.released(), 0);
    }

    #[tokio::test]
    async fn using_releases_before_propagating_failure() {
        let backend = Arc::new(FakeBackend::new(|_| Script::rows(ages(&[1, 2, 3])).failing_after(2)));
        let observed = backend.clone();
        let query = Query::new("SELECT age FROM user_data");
        let err = ConnectionScope::using(backend.clone(), &target(), |scope| {
            async move {
                let rows: Vec<_> = scope.rows(&query).try_collect().await?;
                Ok::<_, Error>(rows.len())
            }
            .boxed()
        })
        .await
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(observed.acquired(), 1);
        assert_eq!(observed.released(), 1);
    }

    #[tokio::test]
    async fn using_returns_value_and_releases() {
        let backend = Arc::new(FakeBackend::table(ages(&[30, 50])));
        let query = Query::new("SELECT age FROM user_data");
        let count = ConnectionScope::using(backend.clone(), &target(), |scope| {
            async move {
                let rows: Vec<_> = scope.rows(&query).try_collect().await?;
                Ok::<_, Error>(rows.len())
            }
            .boxed()
        })
        .await
        .expect("count");
        assert_eq!(count, 2);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn cancelled_command_is_rejected() {
        let backend = Arc::new(FakeBackend::table(Vec::new()));
        let token = tokio_util::sync::CancellationToken::new();
        let mut scope = ConnectionScope::open(backend.clone(), &target())
            .await
            .expect("open")
            .with_cancellation(token.clone());
        token.cancel();
        let err = scope
            .command(&Query::new("DELETE FROM user_data"))
            .await
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        drop(scope);
        assert_eq!(backend.released(), 1);
        assert!(backend.executed().is_empty());
    }
}
