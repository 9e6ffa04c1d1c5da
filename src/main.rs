//! Purpose: `rowpipe` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Streaming commands emit JSON Lines (one item per line) as items
//! arrive; single-result commands emit one JSON document.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Diagnostics (tracing) go to stderr so stdout stays parseable.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::future::Future;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use rowpipe::api::{
    Error, ErrorKind, PipelineOptions, Query, Record, RowSource, SqliteBackend, Target, Value,
    default_database_path, to_exit_code,
};
use rowpipe::config::{DEFAULT_BATCH_SIZE, DEFAULT_PAGE_SIZE};
use serde_json::{Map, Value as JsonValue, json};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

const DEFAULT_QUERY: &str = "SELECT * FROM user_data";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(err.kind(), ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `rowpipe --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let database = cli.database.unwrap_or_else(default_database_path);
    let color_mode = cli.color;

    command_dispatch::dispatch_command(cli.command, database)
        .map_err(add_connection_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "rowpipe",
    version,
    about = "Stream, batch, paginate and cache query results without loading them whole",
    long_about = None,
    before_help = r#"Rows are pulled from the database one at a time, so memory stays bounded
by the batch or page size, not by the table size.

Mental model:
  - `stream` emits every row as it is fetched
  - `batches` groups rows into fixed-size windows
  - `pages` walks the result with LIMIT/OFFSET, one connection per page
"#,
    after_help = r#"EXAMPLES
  $ rowpipe seed user_data.csv
  $ rowpipe stream --query 'SELECT name, age FROM user_data'
  $ rowpipe batches --size 50 --over 25
  $ rowpipe pages --page-size 20 --order-by 'name ASC'
  $ rowpipe mean
  $ rowpipe concurrent --cancel-on-error

LEARN MORE
  $ rowpipe <command> --help
  Set RUST_LOG=debug to trace connections, fetches and cache hits on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "ROWPIPE_DATABASE",
        help = "SQLite database file (default: ~/.rowpipe/users.db)",
        value_hint = ValueHint::FilePath
    )]
    database: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct QueryArgs {
    #[arg(long, default_value = DEFAULT_QUERY, help = "SQL to run; use ? placeholders for --param values")]
    query: String,
    #[arg(
        long = "param",
        value_name = "VALUE",
        value_parser = parse_param,
        help = "Repeatable positional parameter (integers, reals, `null`, otherwise text)"
    )]
    params: Vec<Value>,
}

impl QueryArgs {
    fn to_query(&self) -> Query {
        Query::new(self.query.clone()).with_params(self.params.iter().cloned())
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Create user_data and load users from a CSV file",
        long_about = r#"Create the `user_data` table if missing, then insert each CSV row
(header: name,email,age) under a fresh UUID unless its email already exists.
Creates the database file if it does not exist."#,
        after_help = r#"EXAMPLES
  $ rowpipe seed user_data.csv
  $ rowpipe --database /tmp/users.db seed user_data.csv"#
    )]
    Seed {
        #[arg(help = "CSV file with a name,email,age header", value_hint = ValueHint::FilePath)]
        csv: PathBuf,
    },
    #[command(
        about = "Stream rows as JSON Lines",
        after_help = r#"EXAMPLES
  $ rowpipe stream
  $ rowpipe stream --query 'SELECT * FROM user_data WHERE age > ?' --param 30 --limit 5"#
    )]
    Stream {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, help = "Stop after this many rows")]
        limit: Option<u64>,
    },
    #[command(
        about = "Stream rows grouped into fixed-size batches",
        after_help = r#"EXAMPLES
  $ rowpipe batches --size 50
  $ rowpipe batches --size 50 --over 25          # keep users older than 25 in each batch"#
    )]
    Batches {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, env = "ROWPIPE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE, help = "Rows per batch")]
        size: usize,
        #[arg(long, help = "Keep only rows whose --column value is greater than this")]
        over: Option<f64>,
        #[arg(long, default_value = "age", help = "Column compared against --over")]
        column: String,
    },
    #[command(
        about = "Walk the result page by page (LIMIT/OFFSET)",
        after_help = r#"EXAMPLES
  $ rowpipe pages --page-size 20 --order-by 'name ASC'
  $ rowpipe pages --page-size 20 --from 40"#
    )]
    Pages {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, env = "ROWPIPE_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE, help = "Rows per page")]
        page_size: usize,
        #[arg(long, help = "Order key, e.g. `name ASC` (pages are only stable with one)")]
        order_by: Option<String>,
        #[arg(long, default_value_t = 0, help = "Offset of the first page")]
        from: u64,
    },
    #[command(
        about = "Fetch a single page by number",
        after_help = r#"EXAMPLES
  $ rowpipe page --number 3 --page-size 20 --order-by name"#
    )]
    Page {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, env = "ROWPIPE_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE, help = "Rows per page")]
        page_size: usize,
        #[arg(long, default_value_t = 1, help = "1-based page number")]
        number: u64,
        #[arg(long, help = "Order key, e.g. `name ASC`")]
        order_by: Option<String>,
    },
    #[command(
        about = "Average a numeric column in one pass",
        after_help = r#"EXAMPLES
  $ rowpipe mean
  $ rowpipe mean --query 'SELECT age FROM user_data WHERE age > ?' --param 18"#
    )]
    Mean {
        #[arg(long, default_value = "SELECT age FROM user_data", help = "SQL producing the column")]
        query: String,
        #[arg(long = "param", value_name = "VALUE", value_parser = parse_param, help = "Repeatable positional parameter")]
        params: Vec<Value>,
        #[arg(long, default_value = "age", help = "Column to average")]
        column: String,
    },
    #[command(
        about = "Stream only rows whose column exceeds a threshold",
        after_help = r#"EXAMPLES
  $ rowpipe filter --over 40
  $ rowpipe filter --column score --over 0.5 --query 'SELECT * FROM results'"#
    )]
    Filter {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value = "age", help = "Column to compare")]
        column: String,
        #[arg(long, help = "Keep rows whose column is greater than this")]
        over: f64,
    },
    #[command(
        about = "Run a query through the result cache",
        long_about = r#"Run the same query several times through the process-wide cache.
Only the first run reaches the database; the report shows hit/miss counts."#,
        after_help = r#"EXAMPLES
  $ rowpipe cached --repeat 3"#
    )]
    Cached {
        #[command(flatten)]
        query: QueryArgs,
        #[arg(long, default_value_t = 2, help = "How many times to run the query")]
        repeat: u32,
    },
    #[command(
        about = "Run several queries concurrently",
        long_about = r#"Run every --query on its own connection at the same time and report
results in the order the queries were given."#,
        after_help = r#"EXAMPLES
  $ rowpipe concurrent
  $ rowpipe concurrent --query 'SELECT * FROM user_data' --query 'SELECT COUNT(*) AS n FROM user_data'"#
    )]
    Concurrent {
        #[arg(
            long = "query",
            default_values = [DEFAULT_QUERY, "SELECT * FROM user_data WHERE age > 40"],
            help = "Repeatable query to run"
        )]
        queries: Vec<String>,
        #[arg(long, help = "Cancel the remaining queries as soon as one fails")]
        cancel_on_error: bool,
    },
    #[command(
        about = "Print version info as JSON",
        after_help = r#"EXAMPLES
  $ rowpipe version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ rowpipe completion bash > ~/.local/share/bash-completion/completions/rowpipe
  $ rowpipe completion zsh > ~/.zfunc/_rowpipe
  $ rowpipe completion fish > ~/.config/fish/completions/rowpipe.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn parse_param(input: &str) -> Result<Value, String> {
    if input.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if let Ok(value) = input.parse::<i64>() {
        return Ok(Value::Integer(value));
    }
    if let Ok(value) = input.parse::<f64>() {
        if value.is_finite() {
            return Ok(Value::Real(value));
        }
    }
    Ok(Value::Text(input.to_string()))
}

fn row_source(database: &Path, options: PipelineOptions, cancel: CancellationToken) -> RowSource {
    RowSource::sqlite(Target::path(database))
        .with_options(options)
        .with_cancellation(cancel)
}

fn seeding_source(database: &Path) -> Result<RowSource, Error> {
    if let Some(parent) = database.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to create {}", parent.display()))
                .with_source(err)
        })?;
    }
    Ok(RowSource::new(
        SqliteBackend::new().create_if_missing(true),
        Target::path(database),
    ))
}

/// Run `f` on a fresh multi-threaded runtime. Ctrl-C cancels the token
/// handed to `f`, which stops in-flight streams with `ErrorKind::Cancelled`.
fn block_on_pipeline<T, F, Fut>(f: F) -> Result<T, Error>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling");
                on_interrupt.cancel();
            }
        });
        f(cancel).await
    })
}

fn exceeds(column: String, threshold: f64) -> impl FnMut(&Record) -> bool + Send + 'static {
    move |record| {
        record
            .get(&column)
            .and_then(Value::as_f64)
            .is_some_and(|value| value > threshold)
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<JsonValue, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })
}

fn emit_json(value: JsonValue) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_json_line(value: &impl serde::Serialize) -> Result<(), Error> {
    let line = serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    println!("{line}");
    Ok(())
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("rowpipe {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "rowpipe",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn add_connection_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Connection || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check --database (or ROWPIPE_DATABASE). Run `rowpipe seed <csv>` to create a database.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Connection => "connection failed".to_string(),
        ErrorKind::Query => "query failed".to_string(),
        ErrorKind::CacheCompute => "cached computation failed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> JsonValue {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(query) = err.query() {
        inner.insert("query".to_string(), json!(query));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), JsonValue::Object(inner));
    JsonValue::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!("{} {hint}", colorize_label("hint:", use_color, AnsiColor::Yellow)));
    }
    if let Some(query) = err.query() {
        lines.push(format!("{} {query}", colorize_label("query:", use_color, AnsiColor::Yellow)));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("{} {offset}", colorize_label("offset:", use_color, AnsiColor::Yellow)));
    }
    for cause in error_causes(err) {
        lines.push(format!("{} {cause}", colorize_label("caused by:", use_color, AnsiColor::Yellow)));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        Cli, Command, ErrorKind, error_json, error_text, exceeds, parse_param,
    };
    use clap::Parser;
    use rowpipe::api::{Error, Record, Value};

    #[test]
    fn params_parse_by_shape() {
        assert_eq!(parse_param("30"), Ok(Value::Integer(30)));
        assert_eq!(parse_param("2.5"), Ok(Value::Real(2.5)));
        assert_eq!(parse_param("NULL"), Ok(Value::Null));
        assert_eq!(parse_param("ada@example.com"), Ok(Value::Text("ada@example.com".to_string())));
        assert_eq!(parse_param("inf"), Ok(Value::Text("inf".to_string())));
    }

    #[test]
    fn only_standard_help_flags_show_help() {
        let help = Cli::try_parse_from(["rowpipe", "--help"]).err().expect("help");
        assert_eq!(help.kind(), clap::error::ErrorKind::DisplayHelp);
        let err = Cli::try_parse_from(["rowpipe", "---help"]).err().expect("err");
        assert_ne!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn batches_parse_with_defaults() {
        let cli = Cli::try_parse_from(["rowpipe", "batches", "--over", "25"]).expect("parse");
        match cli.command {
            Command::Batches {
                query,
                size,
                over,
                column,
            } => {
                assert_eq!(query.query, "SELECT * FROM user_data");
                assert!(query.params.is_empty());
                assert!(size >= 1);
                assert_eq!(over, Some(25.0));
                assert_eq!(column, "age");
            }
            _ => panic!("expected batches"),
        }
    }

    #[test]
    fn concurrent_defaults_to_two_queries() {
        let cli = Cli::try_parse_from(["rowpipe", "concurrent"]).expect("parse");
        match cli.command {
            Command::Concurrent {
                queries,
                cancel_on_error,
            } => {
                assert_eq!(queries.len(), 2);
                assert!(!cancel_on_error);
            }
            _ => panic!("expected concurrent"),
        }
    }

    #[test]
    fn threshold_predicate_ignores_missing_and_text() {
        let mut over_40 = exceeds("age".to_string(), 40.0);
        assert!(over_40(&Record::from_pairs([("age", Value::Integer(50))])));
        assert!(!over_40(&Record::from_pairs([("age", Value::Integer(40))])));
        assert!(!over_40(&Record::from_pairs([("age", Value::from("old"))])));
        assert!(!over_40(&Record::from_pairs([("name", Value::from("Ada"))])));
    }

    #[test]
    fn error_json_carries_query_offset_and_causes() {
        let inner = Error::new(ErrorKind::Query).with_message("no such table: users");
        let err = Error::new(ErrorKind::Query)
            .with_message("page fetch failed")
            .with_query("SELECT * FROM users")
            .with_offset(20)
            .with_source(inner);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Query");
        assert_eq!(value["error"]["offset"], 20);
        assert_eq!(value["error"]["query"], "SELECT * FROM users");
        assert_eq!(value["error"]["causes"][0], "Query: no such table: users");
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::Usage).with_message("bad input");
        let colored = error_text(&err, true);
        let plain = error_text(&err, false);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m"));
        assert!(plain.contains("error:"));
        assert!(!plain.contains("\u{1b}["));
    }
}
