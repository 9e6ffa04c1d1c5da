// Lazy, forward-only row iteration over one executing query.
use crate::core::error::Error;
use crate::core::record::Record;
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Owned record stream handed across API boundaries.
pub type RecordStream = BoxStream<'static, Result<Record, Error>>;

/// Rows of one query, yielded in store order.
///
/// The stream is single-pass: a second pass re-issues the query. After the
/// first error (store failure or cancellation) it yields nothing more.
pub struct RowStream<'c> {
    inner: Option<BoxStream<'c, Result<Record, Error>>>,
    pending_error: Option<Error>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    yielded: u64,
    finished: bool,
}

impl<'c> RowStream<'c> {
    pub(crate) fn new(
        inner: BoxStream<'c, Result<Record, Error>>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            inner: Some(inner),
            pending_error: None,
            cancelled: cancel.map(|token| Box::pin(token.cancelled_owned())),
            yielded: 0,
            finished: false,
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            inner: None,
            pending_error: Some(err),
            cancelled: None,
            yielded: 0,
            finished: false,
        }
    }

    /// Pull the next record; `Ok(None)` once the result set is exhausted.
    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        self.next().await.transpose()
    }

    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    fn finish(&mut self) {
        self.finished = true;
        self.inner = None;
        self.cancelled = None;
    }
}

impl Stream for RowStream<'_> {
    type Item = Result<Record, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(err) = this.pending_error.take() {
            this.finish();
            return Poll::Ready(Some(Err(err)));
        }
        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                tracing::debug!(yielded = this.yielded, "row stream cancelled");
                this.finish();
                return Poll::Ready(Some(Err(Error::cancelled())));
            }
        }
        let Some(inner) = this.inner.as_mut() else {
            this.finish();
            return Poll::Ready(None);
        };
        match ready!(inner.poll_next_unpin(cx)) {
            Some(Ok(record)) => {
                this.yielded += 1;
                Poll::Ready(Some(Ok(record)))
            }
            Some(Err(err)) => {
                tracing::debug!(yielded = this.yielded, error = %err, "row stream failed");
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            None => {
                tracing::debug!(yielded = this.yielded, "row stream exhausted");
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for RowStream<'_> {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}
