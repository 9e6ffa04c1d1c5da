// Runs independent queries concurrently and gathers their results in
// submission order.
use crate::core::error::{Error, ErrorKind};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;

/// What a failing query does to the others in the same run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Let every query finish, then report.
    #[default]
    WaitAll,
    /// Cancel the remaining queries as soon as one fails.
    CancelSiblings,
}

/// One unit of work: receives the run's cancellation token and returns the
/// future to execute. Boxed so callers can mix different closures.
pub type Op<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, Error>> + Send>;

pub fn op<T, F, Fut>(f: F) -> Op<T>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

#[derive(Clone, Debug, Default)]
pub struct Executor {
    policy: FailurePolicy,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the run to an outer token: cancelling it cancels every query.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run every op concurrently. Results come back in submission order
    /// regardless of completion order; any failure fails the whole run.
    ///
    /// Under `WaitAll` the first failure in submission order is returned;
    /// under `CancelSiblings` it is the first failure that was not itself a
    /// cancellation.
    pub async fn run_all<T, F, Fut>(&self, ops: Vec<F>) -> Result<Vec<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (results, trigger) = self.settle(ops).await;
        let failed = match (self.policy, trigger) {
            (FailurePolicy::CancelSiblings, Some(index)) => Some(index),
            _ => results.iter().position(Result::is_err),
        };
        let Some(index) = failed else {
            return results.into_iter().collect();
        };
        let mut results = results;
        match results.swap_remove(index) {
            Err(err) => Err(err),
            Ok(_) => Err(Error::new(ErrorKind::Internal).with_message("failed query has no error")),
        }
    }

    /// Run every op concurrently and report each outcome, in submission order.
    pub async fn run_settled<T, F, Fut>(&self, ops: Vec<F>) -> Vec<Result<T, Error>>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.settle(ops).await.0
    }

    // Returns each outcome plus the index of the first failure to complete
    // that is not itself a cancellation.
    async fn settle<T, F, Fut>(&self, ops: Vec<F>) -> (Vec<Result<T, Error>>, Option<usize>)
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let total = ops.len();
        let group = self.cancel.child_token();
        // Dropping the run (outer future cancelled) cancels and aborts every task.
        let _cancel_on_drop = group.clone().drop_guard();
        let mut tasks = JoinSet::new();
        let mut indices: HashMap<task::Id, usize> = HashMap::with_capacity(total);
        for (index, op) in ops.into_iter().enumerate() {
            let handle = tasks.spawn(op(group.clone()));
            indices.insert(handle.id(), index);
        }
        tracing::debug!(queries = total, policy = ?self.policy, "concurrent run started");

        let mut slots: Vec<Option<Result<T, Error>>> = (0..total).map(|_| None).collect();
        let mut trigger = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_err) => {
                    tracing::debug!(error = %join_err, "concurrent query task lost");
                    (join_err.id(), Err(lost_task(join_err.is_cancelled())))
                }
            };
            let Some(&index) = indices.get(&id) else {
                continue;
            };
            if let Err(err) = &result {
                tracing::debug!(index, error = %err, "concurrent query failed");
                self.on_failure(&group, &mut trigger, index, err);
            }
            slots[index] = Some(result);
        }

        let results: Vec<Result<T, Error>> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(lost_task(true))))
            .collect();
        let failed = results.iter().filter(|result| result.is_err()).count();
        if trigger.is_none() && failed > 0 {
            trigger = results.iter().position(Result::is_err);
        }
        tracing::debug!(queries = total, failed, "concurrent run finished");
        (results, trigger)
    }

    fn on_failure(&self, group: &CancellationToken, trigger: &mut Option<usize>, index: usize, err: &Error) {
        if trigger.is_none() && err.kind() != ErrorKind::Cancelled {
            *trigger = Some(index);
        }
        if self.policy == FailurePolicy::CancelSiblings && !group.is_cancelled() {
            tracing::debug!("cancelling sibling queries");
            group.cancel();
        }
    }
}

fn lost_task(aborted: bool) -> Error {
    if aborted {
        return Error::cancelled();
    }
    Error::new(ErrorKind::Internal).with_message("query task panicked")
}
