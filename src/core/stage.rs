// Filters and folds over record or batch streams in constant auxiliary memory.
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Record, Value};
use crate::core::window::Batch;
use futures::future;
use futures::stream::{Stream, TryStreamExt};

/// Keep the items (records or whole batches) for which `predicate` holds.
///
/// The predicate runs once per item, in stream order; errors pass through.
pub fn filter<S, T, P>(source: S, mut predicate: P) -> impl Stream<Item = Result<T, Error>>
where
    S: Stream<Item = Result<T, Error>>,
    P: FnMut(&T) -> bool,
{
    source.try_filter(move |item| future::ready(predicate(item)))
}

/// Keep every batch but retain only its matching records. Batches may come
/// out shorter than the window size, or empty.
pub fn filter_within<S, P>(source: S, mut predicate: P) -> impl Stream<Item = Result<Batch, Error>>
where
    S: Stream<Item = Result<Batch, Error>>,
    P: FnMut(&Record) -> bool,
{
    source.map_ok(move |batch| {
        let kept = batch.into_iter().filter(|record| predicate(record)).collect();
        Batch::from_records(kept)
    })
}

/// Left fold of `source` starting from `identity`.
pub async fn aggregate<S, T, A, F>(source: S, identity: A, mut reducer: F) -> Result<A, Error>
where
    S: Stream<Item = Result<T, Error>>,
    F: FnMut(A, T) -> A,
{
    source
        .try_fold(identity, move |acc, item| future::ready(Ok(reducer(acc, item))))
        .await
}

/// Left fold whose reducer may reject an item.
pub async fn try_aggregate<S, T, A, F>(source: S, identity: A, mut reducer: F) -> Result<A, Error>
where
    S: Stream<Item = Result<T, Error>>,
    F: FnMut(A, T) -> Result<A, Error>,
{
    source
        .try_fold(identity, move |acc, item| future::ready(reducer(acc, item)))
        .await
}

/// Running arithmetic mean.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Mean {
    sum: f64,
    count: u64,
}

impl Mean {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Mean of the pushed values, or `0.0` when nothing was pushed.
    ///
    /// An empty input is a defined degenerate case, not an error.
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Mean of a numeric column. NULLs are skipped like SQL `AVG`; a missing
/// column or a non-numeric value fails with `ErrorKind::Query`.
pub async fn column_mean<S>(source: S, column: &str) -> Result<Mean, Error>
where
    S: Stream<Item = Result<Record, Error>>,
{
    try_aggregate(source, Mean::default(), |mut mean, record: Record| {
        match record.get(column) {
            None => Err(Error::new(ErrorKind::Query)
                .with_message(format!("column `{column}` is not in the result set"))),
            Some(Value::Null) => Ok(mean),
            Some(value) => match value.as_f64() {
                Some(number) => {
                    mean.push(number);
                    Ok(mean)
                }
                None => Err(Error::new(ErrorKind::Query).with_message(format!(
                    "column `{column}` holds {} values, expected numbers",
                    value.type_name()
                ))),
            },
        }
    })
    .await
}

pub fn format_mean(value: f64) -> String {
    format!("{value:.2}")
}
