//! Purpose: Hold top-level CLI command dispatch for `rowpipe`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Store commands run inside `block_on_pipeline` so Ctrl-C cancels them.
//! Invariants: Output envelopes and exit code semantics are shared with `main.rs`.

use super::*;
use futures::{StreamExt, TryStreamExt};
use rowpipe::api::{FailurePolicy, filter_within, format_mean, seed_from_csv};

pub(super) fn dispatch_command(command: Command, database: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "rowpipe", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Seed { csv } => {
            let source = seeding_source(&database)?;
            let report = block_on_pipeline(|cancel| async move {
                let source = source.with_cancellation(cancel);
                seed_from_csv(&source, &csv).await
            })?;
            emit_json(to_json(&report)?);
            Ok(RunOutcome::ok())
        }
        Command::Stream { query, limit } => {
            block_on_pipeline(|cancel| stream_rows(row_source(&database, PipelineOptions::default(), cancel), query, limit))
        }
        Command::Batches {
            query,
            size,
            over,
            column,
        } => block_on_pipeline(|cancel| {
            let filter = over.map(|threshold| (column, threshold));
            stream_batches(row_source(&database, PipelineOptions::default(), cancel), query, size, filter)
        }),
        Command::Pages {
            query,
            page_size,
            order_by,
            from,
        } => {
            let options = PipelineOptions {
                page_size,
                order_by,
                ..PipelineOptions::default()
            };
            block_on_pipeline(|cancel| stream_pages(row_source(&database, options, cancel), query, from))
        }
        Command::Page {
            query,
            page_size,
            number,
            order_by,
        } => {
            let options = PipelineOptions {
                page_size,
                order_by,
                ..PipelineOptions::default()
            };
            block_on_pipeline(|cancel| fetch_page(row_source(&database, options, cancel), query, number))
        }
        Command::Mean {
            query,
            params,
            column,
        } => block_on_pipeline(|cancel| {
            let query = Query::new(query).with_params(params);
            column_mean(row_source(&database, PipelineOptions::default(), cancel), query, column)
        }),
        Command::Filter { query, column, over } => block_on_pipeline(|cancel| {
            stream_filtered(row_source(&database, PipelineOptions::default(), cancel), query, column, over)
        }),
        Command::Cached { query, repeat } => block_on_pipeline(|cancel| {
            run_cached(row_source(&database, PipelineOptions::default(), cancel), query, repeat)
        }),
        Command::Concurrent {
            queries,
            cancel_on_error,
        } => {
            let failure_policy = if cancel_on_error {
                FailurePolicy::CancelSiblings
            } else {
                FailurePolicy::WaitAll
            };
            let options = PipelineOptions {
                failure_policy,
                ..PipelineOptions::default()
            };
            block_on_pipeline(|cancel| run_concurrent(row_source(&database, options, cancel), queries))
        }
    }
}

async fn stream_rows(source: RowSource, query: QueryArgs, limit: Option<u64>) -> Result<RunOutcome, Error> {
    let mut rows = source.stream(query.to_query());
    let mut emitted = 0u64;
    while limit.is_none_or(|limit| emitted < limit) {
        let Some(record) = rows.try_next().await? else {
            break;
        };
        emit_json_line(&record)?;
        emitted += 1;
    }
    Ok(RunOutcome::ok())
}

async fn stream_batches(
    source: RowSource,
    query: QueryArgs,
    size: usize,
    filter: Option<(String, f64)>,
) -> Result<RunOutcome, Error> {
    let batches = source.batches(query.to_query(), size)?;
    let mut batches = match filter {
        Some((column, threshold)) => filter_within(batches, exceeds(column, threshold)).boxed(),
        None => batches,
    };
    while let Some(batch) = batches.try_next().await? {
        emit_json_line(&batch)?;
    }
    Ok(RunOutcome::ok())
}

async fn stream_pages(source: RowSource, query: QueryArgs, from: u64) -> Result<RunOutcome, Error> {
    let page_size = source.options().page_size;
    let mut pages = source.paginator(query.to_query())?.pages_from(page_size, from)?;
    while let Some(page) = pages.try_next().await? {
        emit_json_line(&page)?;
    }
    Ok(RunOutcome::ok())
}

async fn fetch_page(source: RowSource, query: QueryArgs, number: u64) -> Result<RunOutcome, Error> {
    let page_size = source.options().page_size;
    let page = source
        .paginator(query.to_query())?
        .fetch_page_number(page_size, number)
        .await?;
    emit_json(json!({
        "number": number,
        "offset": page.offset(),
        "size": page.size(),
        "records": to_json(&page.records())?,
    }));
    Ok(RunOutcome::ok())
}

async fn column_mean(source: RowSource, query: Query, column: String) -> Result<RunOutcome, Error> {
    let mean = source.mean(query, &column).await?;
    emit_json(json!({
        "column": column,
        "count": mean.count(),
        "mean": mean.value(),
        "formatted": format_mean(mean.value()),
    }));
    Ok(RunOutcome::ok())
}

async fn stream_filtered(source: RowSource, query: QueryArgs, column: String, over: f64) -> Result<RunOutcome, Error> {
    let mut rows = source.filter(query.to_query(), exceeds(column, over));
    while let Some(record) = rows.try_next().await? {
        emit_json_line(&record)?;
    }
    Ok(RunOutcome::ok())
}

async fn run_cached(source: RowSource, query: QueryArgs, repeat: u32) -> Result<RunOutcome, Error> {
    let query = query.to_query();
    let mut records = source.cached_query(query.clone()).await?;
    for _ in 1..repeat {
        records = source.cached_query(query.clone()).await?;
    }
    emit_json(json!({
        "signature": query.signature().to_string(),
        "rows": records.len(),
        "records": to_json(records.as_ref())?,
        "cache": to_json(&source.cache().stats())?,
    }));
    Ok(RunOutcome::ok())
}

async fn run_concurrent(source: RowSource, queries: Vec<String>) -> Result<RunOutcome, Error> {
    let results = source
        .run_concurrently(queries.iter().map(Query::new).collect())
        .await?;
    let mut entries = Vec::with_capacity(results.len());
    for (query, records) in queries.iter().zip(&results) {
        entries.push(json!({ "query": query, "records": to_json(records)? }));
    }
    emit_json(json!({ "results": entries }));
    Ok(RunOutcome::ok())
}
