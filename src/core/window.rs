// Fixed-size windows over a record stream.
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use futures::stream::{BoxStream, FusedStream, Stream};
use pin_project_lite::pin_project;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pub type BatchStream = BoxStream<'static, Result<Batch, Error>>;

/// Consecutive records from one stream; only the final batch may be short.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub(crate) fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl IntoIterator for Batch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

pin_project! {
    /// Groups a record stream into batches of `size`.
    ///
    /// When the source fails, records already accumulated are flushed as a
    /// short batch first and the error follows on the next poll, so every
    /// record the source produced reaches the caller exactly once.
    pub struct Windows<S> {
        #[pin]
        source: S,
        size: usize,
        pending: Vec<Record>,
        error: Option<Error>,
        done: bool,
    }
}

pub fn window<S>(source: S, size: usize) -> Result<Windows<S>, Error>
where
    S: Stream<Item = Result<Record, Error>>,
{
    if size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("batch size must be at least 1")
            .with_hint("Use a batch size of 1 or more."));
    }
    Ok(Windows {
        source,
        size,
        pending: Vec::with_capacity(size),
        error: None,
        done: false,
    })
}

impl<S> Windows<S> {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl<S> Stream for Windows<S>
where
    S: Stream<Item = Result<Record, Error>>,
{
    type Item = Result<Batch, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if let Some(err) = this.error.take() {
            return Poll::Ready(Some(Err(err)));
        }
        if *this.done {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.source.as_mut().poll_next(cx)) {
                Some(Ok(record)) => {
                    this.pending.push(record);
                    if this.pending.len() == *this.size {
                        let full = std::mem::replace(this.pending, Vec::with_capacity(*this.size));
                        return Poll::Ready(Some(Ok(Batch::from_records(full))));
                    }
                }
                Some(Err(err)) => {
                    *this.done = true;
                    if this.pending.is_empty() {
                        return Poll::Ready(Some(Err(err)));
                    }
                    *this.error = Some(err);
                    let partial = std::mem::take(this.pending);
                    return Poll::Ready(Some(Ok(Batch::from_records(partial))));
                }
                None => {
                    *this.done = true;
                    if this.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                    let partial = std::mem::take(this.pending);
                    return Poll::Ready(Some(Ok(Batch::from_records(partial))));
                }
            }
        }
    }
}

impl<S> FusedStream for Windows<S>
where
    S: Stream<Item = Result<Record, Error>>,
{
    fn is_terminated(&self) -> bool {
        self.done && self.error.is_none()
    }
}
