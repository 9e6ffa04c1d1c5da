// Scripted in-memory store for unit tests: counts handle traffic and injects
// failures and delays per query.
use super::Backend;
use crate::config::Target;
use crate::core::error::{Error, ErrorKind};
use crate::core::query::Query;
use crate::core::record::{Record, Value};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub(crate) struct Script {
    pub rows: Vec<Record>,
    pub fail_after: Option<usize>,
    pub delay: Option<Duration>,
    pub never_ready: bool,
}

impl Script {
    pub fn rows(rows: Vec<Record>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn failing_after(mut self, yielded: usize) -> Self {
        self.fail_after = Some(yielded);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stalled() -> Self {
        Self {
            never_ready: true,
            ..Self::default()
        }
    }
}

type Handler = Box<dyn Fn(&Query) -> Script + Send + Sync>;

pub(crate) struct FakeBackend {
    handler: Handler,
    refuse: AtomicBool,
    next_handle: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    executed: Mutex<Vec<Query>>,
}

#[derive(Debug)]
pub(crate) struct FakeHandle {
    pub id: usize,
}

impl FakeBackend {
    pub fn new(handler: impl Fn(&Query) -> Script + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            refuse: AtomicBool::new(false),
            next_handle: AtomicUsize::new(1),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Every query returns `rows`.
    pub fn table(rows: Vec<Record>) -> Self {
        Self::new(move |_| Script::rows(rows.clone()))
    }

    /// Honors a trailing `LIMIT ? OFFSET ?` parameter pair over `rows`.
    pub fn paged_table(rows: Vec<Record>) -> Self {
        Self::new(move |query| {
            let params = query.params();
            let (limit, offset) = match params {
                [.., Value::Integer(limit), Value::Integer(offset)] => (*limit as usize, *offset as usize),
                _ => (rows.len(), 0),
            };
            Script::rows(rows.iter().skip(offset).take(limit).cloned().collect())
        })
    }

    pub fn refuse_connections(self) -> Self {
        self.refuse.store(true, Ordering::SeqCst);
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Query> {
        self.executed.lock().map(|queries| queries.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    type Handle = FakeHandle;

    async fn acquire(&self, target: &Target) -> Result<FakeHandle, Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Connection)
                .with_message(format!("connection refused by {}", target.label())));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn execute<'c>(
        &'c self,
        _handle: &'c mut FakeHandle,
        query: &'c Query,
    ) -> BoxStream<'c, Result<Record, Error>> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(query.clone());
        }
        let script = (self.handler)(query);
        let text = query.text().to_string();
        Box::pin(async_stream::stream! {
            if script.never_ready {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            for (idx, row) in script.rows.into_iter().enumerate() {
                if script.fail_after == Some(idx) {
                    yield Err(injected_failure(&text));
                    return;
                }
                yield Ok(row);
            }
            if script.fail_after.is_some() {
                yield Err(injected_failure(&text));
            }
        })
    }

    async fn command(&self, _handle: &mut FakeHandle, query: &Query) -> Result<u64, Error> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(query.clone());
        }
        Ok(0)
    }

    fn release(&self, _handle: FakeHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn injected_failure(text: &str) -> Error {
    Error::new(ErrorKind::Query)
        .with_message("injected failure")
        .with_query(text)
}

pub(crate) fn ages(ages: &[i64]) -> Vec<Record> {
    ages.iter()
        .map(|age| Record::from_pairs([("age", Value::Integer(*age))]))
        .collect()
}
