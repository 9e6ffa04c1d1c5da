// LIMIT/OFFSET pagination: one bounded fetch per page, each on its own
// connection scope, ending on the first empty page.
use crate::config::Target;
use crate::core::backend::Backend;
use crate::core::error::{Error, ErrorKind};
use crate::core::query::Query;
use crate::core::record::{Record, Value};
use crate::core::scope::ConnectionScope;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type PageStream = BoxStream<'static, Result<Page, Error>>;

/// Records returned by one bounded fetch. Empty means end of data; failures
/// never show up as empty pages.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Page {
    offset: u64,
    size: usize,
    records: Vec<Record>,
}

impl Page {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested page size; `len()` may be smaller on the last page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// 1-based page number for page-number addressing.
    pub fn number(&self) -> u64 {
        self.offset / self.size as u64 + 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Pages over `base`. Without `order_by` rows come back in the store's
/// default order, which need not be stable between fetches.
///
/// Pagination assumes no concurrent writes to the underlying rows.
pub struct Paginator<B: Backend> {
    backend: Arc<B>,
    target: Arc<Target>,
    base: Query,
    order_by: Option<String>,
    cancel: Option<CancellationToken>,
}

impl<B: Backend> Clone for Paginator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            target: self.target.clone(),
            base: self.base.clone(),
            order_by: self.order_by.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<B: Backend> Paginator<B> {
    pub fn new(backend: Arc<B>, target: Arc<Target>, base: Query) -> Self {
        Self {
            backend,
            target,
            base,
            order_by: None,
            cancel: None,
        }
    }

    /// Order pages by `key`: comma-separated column names, each optionally
    /// followed by `ASC` or `DESC`.
    pub fn order_by(mut self, key: &str) -> Result<Self, Error> {
        self.order_by = Some(normalize_order_key(key)?);
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The bounded query for one page. Fails with `ErrorKind::Usage` when
    /// `page_size` or `offset` cannot be bound as a store integer.
    pub fn page_query(&self, page_size: usize, offset: u64) -> Result<Query, Error> {
        let (limit, skip) = page_bounds(page_size, offset)?;
        let base = self.base.text().trim().trim_end_matches(';').trim_end();
        let text = match &self.order_by {
            Some(key) => format!("SELECT * FROM ({base}) AS paged ORDER BY {key} LIMIT ? OFFSET ?"),
            None => format!("SELECT * FROM ({base}) AS paged LIMIT ? OFFSET ?"),
        };
        Ok(Query::new(text)
            .with_params(self.base.params().iter().cloned())
            .bind(Value::Integer(limit))
            .bind(Value::Integer(skip)))
    }

    pub async fn fetch_page(&self, page_size: usize, offset: u64) -> Result<Page, Error> {
        check_page_size(page_size)?;
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::cancelled().with_offset(offset));
        }

        let query = self.page_query(page_size, offset)?;
        let mut scope = ConnectionScope::open(self.backend.clone(), &self.target)
            .await
            .map_err(|err| err.with_offset(offset))?;
        if let Some(token) = &self.cancel {
            scope = scope.with_cancellation(token.clone());
        }
        let records: Vec<Record> = scope
            .rows(&query)
            .try_collect()
            .await
            .map_err(|err| err.with_offset(offset))?;
        scope.release();

        tracing::debug!(offset, page_size, records = records.len(), "page fetched");
        Ok(Page {
            offset,
            size: page_size,
            records,
        })
    }

    pub async fn fetch_page_number(&self, page_size: usize, number: u64) -> Result<Page, Error> {
        check_page_size(page_size)?;
        if number == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("page numbers start at 1")
                .with_hint("Use --number 1 for the first page."));
        }
        let offset = (number - 1)
            .checked_mul(page_size as u64)
            .ok_or_else(|| out_of_range("page number", number))?;
        self.fetch_page(page_size, offset).await
    }

    pub fn pages(&self, page_size: usize) -> Result<PageStream, Error> {
        self.pages_from(page_size, 0)
    }

    /// Lazily fetch pages starting at `offset`, advancing by `page_size`
    /// after each non-empty page. The first fetch error ends the sequence.
    pub fn pages_from(&self, page_size: usize, offset: u64) -> Result<PageStream, Error> {
        check_page_size(page_size)?;
        page_bounds(page_size, offset)?;
        let paginator = self.clone();
        Ok(Box::pin(async_stream::stream! {
            let mut offset = offset;
            loop {
                match paginator.fetch_page(page_size, offset).await {
                    Ok(page) if page.is_empty() => {
                        tracing::debug!(offset, "pagination finished");
                        break;
                    }
                    Ok(page) => {
                        let next = offset.checked_add(page_size as u64);
                        yield Ok(page);
                        match next {
                            Some(next) => offset = next,
                            None => {
                                yield Err(out_of_range("offset", offset));
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }))
    }
}

fn check_page_size(page_size: usize) -> Result<(), Error> {
    if page_size == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("page size must be at least 1")
            .with_hint("Use a page size of 1 or more."));
    }
    Ok(())
}

fn page_bounds(page_size: usize, offset: u64) -> Result<(i64, i64), Error> {
    let limit = i64::try_from(page_size).map_err(|_| out_of_range("page size", page_size as u64))?;
    let skip = i64::try_from(offset).map_err(|_| out_of_range("offset", offset))?;
    Ok((limit, skip))
}

fn out_of_range(what: &str, value: u64) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("{what} {value} is out of range"))
        .with_hint(format!("Keep pages within the first {} rows.", i64::MAX))
}

fn normalize_order_key(key: &str) -> Result<String, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid order key `{key}`"))
            .with_hint("Use unqualified column names, each optionally followed by ASC or DESC (e.g. name ASC).")
    };
    let mut parts = Vec::new();
    for part in key.split(',') {
        let words: Vec<&str> = part.split_whitespace().collect();
        let (column, direction) = match words.as_slice() {
            [column] => (*column, None),
            [column, direction] => (*column, Some(direction.to_ascii_uppercase())),
            _ => return Err(invalid()),
        };
        if !is_column_name(column) {
            return Err(invalid());
        }
        match direction.as_deref() {
            None => parts.push(column.to_string()),
            Some(dir @ ("ASC" | "DESC")) => parts.push(format!("{column} {dir}")),
            Some(_) => return Err(invalid()),
        }
    }
    Ok(parts.join(", "))
}

// Pages select from the wrapped base query, so table qualifiers never resolve.
fn is_column_name(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::{Paginator, normalize_order_key};
    use crate::config::Target;
    use crate::core::backend::fake::{FakeBackend, Script, ages};
    use crate::core::error::ErrorKind;
    use crate::core::query::Query;
    use crate::core::record::{Record, Value};
    use futures::{StreamExt, TryStreamExt};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn paginator(backend: Arc<FakeBackend>) -> Paginator<FakeBackend> {
        Paginator::new(
            backend,
            Arc::new(Target::new("users.db")),
            Query::new("SELECT * FROM user_data;"),
        )
    }

    #[tokio::test]
    async fn pages_concatenate_to_the_full_result() {
        let rows = ages(&(0..23).collect::<Vec<_>>());
        let backend = Arc::new(FakeBackend::paged_table(rows.clone()));
        let pages: Vec<_> = paginator(backend.clone())
            .pages(5)
            .expect("pages")
            .try_collect()
            .await
            .expect("collect");

        let sizes: Vec<_> = pages.iter().map(|page| page.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 5, 3]);
        let offsets: Vec<_> = pages.iter().map(|page| page.offset()).collect();
        assert_eq!(offsets, vec![0, 5, 10, 15, 20]);
        let all: Vec<Record> = pages.into_iter().flat_map(|page| page.into_records()).collect();
        assert_eq!(all, rows);

        // Five data pages plus the terminating empty fetch, each on its own scope.
        assert_eq!(backend.executed().len(), 6);
        assert_eq!(backend.acquired(), 6);
        assert_eq!(backend.released(), 6);
    }

    #[tokio::test]
    async fn empty_table_yields_no_pages() {
        let backend = Arc::new(FakeBackend::paged_table(Vec::new()));
        let pages: Vec<_> = paginator(backend.clone())
            .pages(10)
            .expect("pages")
            .try_collect()
            .await
            .expect("collect");
        assert!(pages.is_empty());
        assert_eq!(backend.executed().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_an_error_not_an_empty_page() {
        let backend = Arc::new(FakeBackend::new(|query| {
            let rows = ages(&[1, 2]);
            match query.params() {
                [.., Value::Integer(_), Value::Integer(0)] => Script::rows(rows),
                _ => Script::rows(rows).failing_after(0),
            }
        }));
        let items: Vec<_> = paginator(backend.clone()).pages(2).expect("pages").collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("first page").len(), 2);
        let err = items[1].as_ref().expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.offset(), Some(2));
        assert_eq!(backend.released(), 2);
    }

    #[tokio::test]
    async fn pages_can_restart_from_any_offset() {
        let rows = ages(&(0..12).collect::<Vec<_>>());
        let backend = Arc::new(FakeBackend::paged_table(rows.clone()));
        let pager = paginator(backend);

        let tail: Vec<Record> = pager
            .pages_from(4, 8)
            .expect("pages")
            .map_ok(|page| page.into_records())
            .try_concat()
            .await
            .expect("collect");
        assert_eq!(tail, rows[8..].to_vec());

        let third = pager.fetch_page_number(4, 3).await.expect("page");
        assert_eq!(third.offset(), 8);
        assert_eq!(third.number(), 3);
        assert_eq!(third.records(), &rows[8..12]);

        let err = pager.fetch_page_number(4, 0).await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn page_query_wraps_base_and_binds_bounds() {
        let backend = Arc::new(FakeBackend::paged_table(Vec::new()));
        let pager = Paginator::new(
            backend,
            Arc::new(Target::new("users.db")),
            Query::new("SELECT * FROM user_data WHERE age > ?").bind(25),
        )
        .order_by("name asc")
        .expect("order");

        let query = pager.page_query(10, 30).expect("query");
        assert_eq!(
            query.text(),
            "SELECT * FROM (SELECT * FROM user_data WHERE age > ?) AS paged ORDER BY name ASC LIMIT ? OFFSET ?"
        );
        assert_eq!(
            query.params(),
            [Value::Integer(25), Value::Integer(10), Value::Integer(30)]
        );
    }

    #[test]
    fn order_keys_are_validated() {
        assert_eq!(normalize_order_key("name").expect("plain"), "name");
        assert_eq!(
            normalize_order_key("name desc, age").expect("list"),
            "name DESC, age"
        );
        for bad in ["", "name; DROP TABLE user_data", "name sideways", "1name", "a b c", "user_data.age"] {
            let err = normalize_order_key(bad).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let backend = Arc::new(FakeBackend::paged_table(Vec::new()));
        let err = paginator(backend).pages(0).err().expect("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn cancelled_paginator_stops_before_fetching() {
        let backend = Arc::new(FakeBackend::paged_table(ages(&[1, 2, 3])));
        let token = CancellationToken::new();
        token.cancel();
        let items: Vec<_> = paginator(backend.clone())
            .with_cancellation(token)
            .pages(2)
            .expect("pages")
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().expect_err("err").kind(), ErrorKind::Cancelled);
        assert_eq!(backend.acquired(), 0);
    }

    #[tokio::test]
    async fn offsets_beyond_the_store_range_are_rejected() {
        let backend = Arc::new(FakeBackend::paged_table(ages(&[1, 2, 3])));
        let pager = paginator(backend.clone());

        let err = pager.fetch_page(2, u64::MAX).await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = pager.fetch_page_number(2, u64::MAX).await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = pager.pages_from(2, u64::MAX - 1).err().expect("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(backend.acquired(), 0);
    }

    #[tokio::test]
    async fn pages_stop_with_an_error_when_the_next_offset_overflows() {
        let backend = Arc::new(FakeBackend::new(|_| Script::rows(ages(&[1, 2]))));
        let last = i64::MAX as u64;
        let items: Vec<_> = paginator(backend).pages_from(2, last).expect("pages").collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("page").offset(), last);
        assert_eq!(items[1].as_ref().expect_err("err").kind(), ErrorKind::Usage);
    }
}
