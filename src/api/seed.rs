// Sample `user_data` table: schema creation and CSV loading.
#![allow(clippy::result_large_err)]

use super::RowSource;
use crate::core::backend::Backend;
use crate::core::error::{Error, ErrorKind};
use crate::core::query::Query;
use crate::core::scope::ConnectionScope;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

pub const USER_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS user_data (\
    user_id TEXT PRIMARY KEY, \
    name TEXT NOT NULL, \
    email TEXT NOT NULL UNIQUE, \
    age INTEGER NOT NULL)";

const INSERT_IF_ABSENT: &str = "INSERT INTO user_data (user_id, name, email, age) \
    SELECT ?, ?, ?, ? WHERE NOT EXISTS (SELECT 1 FROM user_data WHERE email = ?)";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub age: i64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SeedReport {
    pub loaded: usize,
    pub inserted: usize,
    /// Rows whose email already existed.
    pub skipped: usize,
}

/// Parse `name,email,age` rows (header required, extra columns ignored).
pub fn read_users(reader: impl Read) -> Result<Vec<NewUser>, Error> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut users = Vec::new();
    for (idx, row) in csv.deserialize::<NewUser>().enumerate() {
        let user = row.map_err(|err| {
            let line = err.position().map(|pos| pos.line()).unwrap_or(idx as u64 + 2);
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid user row at line {line}"))
                .with_hint("Expected a `name,email,age` header and an integer age.")
                .with_source(err)
        })?;
        users.push(user);
    }
    Ok(users)
}

pub fn read_users_file(path: &Path) -> Result<Vec<NewUser>, Error> {
    let file = File::open(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to open {}", path.display()))
            .with_source(err)
    })?;
    read_users(file)
}

pub async fn create_user_table<B: Backend>(source: &RowSource<B>) -> Result<(), Error> {
    source.command(USER_TABLE_DDL).await?;
    Ok(())
}

/// Create the table if needed, then insert each user under a fresh UUIDv4
/// unless a row with the same email is already present. Runs on one scope
/// and stops with `ErrorKind::Cancelled` between inserts once the source's
/// cancellation token fires.
pub async fn seed_users<B: Backend>(source: &RowSource<B>, users: Vec<NewUser>) -> Result<SeedReport, Error> {
    let loaded = users.len();
    let mut scope = source.open_scope().await?;
    let outcome = insert_users(&mut scope, users).await;
    scope.release();
    let inserted = outcome?;

    let report = SeedReport {
        loaded,
        inserted,
        skipped: loaded - inserted,
    };
    tracing::info!(loaded, inserted, "seeded user_data");
    Ok(report)
}

async fn insert_users<B: Backend>(scope: &mut ConnectionScope<B>, users: Vec<NewUser>) -> Result<usize, Error> {
    scope.command(&Query::new(USER_TABLE_DDL)).await?;
    let mut inserted = 0;
    for user in users {
        let insert = Query::new(INSERT_IF_ABSENT)
            .bind(Uuid::new_v4().to_string())
            .bind(user.name)
            .bind(user.email.clone())
            .bind(user.age)
            .bind(user.email);
        inserted += scope.command(&insert).await? as usize;
    }
    Ok(inserted)
}

pub async fn seed_from_csv<B: Backend>(source: &RowSource<B>, path: &Path) -> Result<SeedReport, Error> {
    let users = read_users_file(path)?;
    seed_users(source, users).await
}
