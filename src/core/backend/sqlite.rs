// SQLite store via sqlx: one `SqliteConnection` per handle, rows decoded by
// their dynamic storage class.
use super::Backend;
use crate::config::Target;
use crate::core::error::{Error, ErrorKind};
use crate::core::query::Query;
use crate::core::record::{Record, Value};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Clone, Debug)]
pub struct SqliteBackend {
    create_if_missing: bool,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new() -> Self {
        Self {
            create_if_missing: false,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Create the database file on first connect (used when seeding).
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

impl Default for SqliteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    type Handle = SqliteConnection;

    async fn acquire(&self, target: &Target) -> Result<SqliteConnection, Error> {
        if target.host.is_some() {
            return Err(Error::new(ErrorKind::Connection)
                .with_message("sqlite targets are local files and take no host")
                .with_hint("Pass the database file path without --host."));
        }
        if target.user.is_some() {
            tracing::debug!(target = %target.label(), "ignoring credentials for sqlite target");
        }
        let options = SqliteConnectOptions::new()
            .filename(&target.database)
            .create_if_missing(self.create_if_missing)
            .busy_timeout(self.busy_timeout);
        SqliteConnection::connect_with(&options)
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Connection)
                    .with_message(format!("failed to open {}", target.label()))
                    .with_source(err)
            })
    }

    fn execute<'c>(
        &'c self,
        handle: &'c mut SqliteConnection,
        query: &'c Query,
    ) -> BoxStream<'c, Result<Record, Error>> {
        let mut columns: Option<Arc<[String]>> = None;
        bind_params(sqlx::query(query.text()), query.params())
            .fetch(handle)
            .map(move |row| {
                let row = row.map_err(|err| query_error(query, err))?;
                let columns = columns.get_or_insert_with(|| column_names(&row)).clone();
                record_from_row(columns, &row).map_err(|err| query_error(query, err))
            })
            .boxed()
    }

    async fn command(&self, handle: &mut SqliteConnection, query: &Query) -> Result<u64, Error> {
        let done = bind_params(sqlx::query(query.text()), query.params())
            .execute(&mut *handle)
            .await
            .map_err(|err| query_error(query, err))?;
        Ok(done.rows_affected())
    }

    fn release(&self, handle: SqliteConnection) {
        // Dropping the connection shuts down its worker and closes the file.
        drop(handle);
    }
}

fn bind_params<'q>(mut query: SqliteQuery<'q>, params: &'q [Value]) -> SqliteQuery<'q> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(value) => query.bind(*value),
            Value::Real(value) => query.bind(*value),
            Value::Text(value) => query.bind(value.as_str()),
            Value::Blob(value) => query.bind(value.as_slice()),
        };
    }
    query
}

fn column_names(row: &SqliteRow) -> Arc<[String]> {
    row.columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect::<Vec<_>>()
        .into()
}

fn record_from_row(columns: Arc<[String]>, row: &SqliteRow) -> Result<Record, sqlx::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for idx in 0..columns.len() {
        let storage = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_ascii_uppercase())
            }
        };
        let value = match storage.as_deref() {
            None => Value::Null,
            Some(name) if name.contains("INT") || name.contains("BOOL") => {
                Value::Integer(row.try_get_unchecked::<i64, _>(idx)?)
            }
            Some(name) if name.contains("REAL") || name.contains("FLOA") || name.contains("DOUB") => {
                Value::Real(row.try_get_unchecked::<f64, _>(idx)?)
            }
            Some("NUMERIC") => match row.try_get_unchecked::<i64, _>(idx) {
                Ok(value) => Value::Integer(value),
                Err(_) => Value::Real(row.try_get_unchecked::<f64, _>(idx)?),
            },
            Some("BLOB") => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
            Some(_) => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
        };
        values.push(value);
    }
    let len = values.len();
    Record::new(columns, values).ok_or(sqlx::Error::ColumnIndexOutOfBounds { index: len, len })
}

fn query_error(query: &Query, err: sqlx::Error) -> Error {
    Error::new(ErrorKind::Query)
        .with_message("query failed")
        .with_query(query.text())
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::SqliteBackend;
    use crate::config::Target;
    use crate::core::backend::Backend;
    use crate::core::error::ErrorKind;
    use crate::core::query::Query;
    use crate::core::record::Value;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn decodes_each_storage_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = Target::path(dir.path().join("types.db"));
        let backend = SqliteBackend::new().create_if_missing(true);
        let mut conn = backend.acquire(&target).await.expect("acquire");

        let query = Query::new("SELECT 1 AS i, 2.5 AS r, 'x' AS t, x'0102' AS b, NULL AS n");
        let rows: Vec<_> = backend
            .execute(&mut conn, &query)
            .try_collect()
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.columns(), ["i", "r", "t", "b", "n"]);
        assert_eq!(row.get("i"), Some(&Value::Integer(1)));
        assert_eq!(row.get("r"), Some(&Value::Real(2.5)));
        assert_eq!(row.get("t"), Some(&Value::Text("x".to_string())));
        assert_eq!(row.get("b"), Some(&Value::Blob(vec![1, 2])));
        assert_eq!(row.get("n"), Some(&Value::Null));
        backend.release(conn);
    }

    #[tokio::test]
    async fn binds_parameters_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = Target::path(dir.path().join("params.db"));
        let backend = SqliteBackend::new().create_if_missing(true);
        let mut conn = backend.acquire(&target).await.expect("acquire");

        let query = Query::new("SELECT ? AS a, ? AS b, ? AS c").bind(7).bind("seven").bind(Value::Null);
        let rows: Vec<_> = backend
            .execute(&mut conn, &query)
            .try_collect()
            .await
            .expect("rows");
        assert_eq!(rows[0].values(), [Value::Integer(7), Value::from("seven"), Value::Null]);
        backend.release(conn);
    }

    #[tokio::test]
    async fn missing_database_is_a_connection_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = Target::path(dir.path().join("absent.db"));
        let err = SqliteBackend::new().acquire(&target).await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn host_is_rejected() {
        let target = Target::new("users.db").with_host("localhost", None);
        let err = SqliteBackend::new().acquire(&target).await.expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn bad_sql_is_a_query_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = Target::path(dir.path().join("bad.db"));
        let backend = SqliteBackend::new().create_if_missing(true);
        let mut conn = backend.acquire(&target).await.expect("acquire");

        let query = Query::new("SELECT * FROM no_such_table");
        let err = backend
            .execute(&mut conn, &query)
            .try_collect::<Vec<_>>()
            .await
            .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.query(), Some("SELECT * FROM no_such_table"));
        backend.release(conn);
    }
}
