//! Purpose: Describe where the backing store lives and how pipelines are sized.
//! Exports: `Target`, `PipelineOptions`, `default_database_path`.
//! Role: Shared by the library surface and the CLI so both resolve defaults alike.
//! Invariants: Default database path remains `~/.rowpipe/users.db`.
//! Invariants: Credentials never appear in `Debug` output.

use crate::core::executor::FailurePolicy;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_PAGE_SIZE: usize = 10;

pub fn default_database_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".rowpipe").join("users.db")
}

/// Backing-store target descriptor: database name or path plus optional
/// network location and credentials.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Target {
    pub database: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Target {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn path(path: impl AsRef<Path>) -> Self {
        Self::new(path.as_ref().to_string_lossy().to_string())
    }

    pub fn with_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Short label for logs: `user@host:port/database` with whatever parts are set.
    pub fn label(&self) -> String {
        let mut label = String::new();
        if let Some(user) = &self.user {
            label.push_str(user);
            label.push('@');
        }
        if let Some(host) = &self.host {
            label.push_str(host);
            if let Some(port) = self.port {
                label.push_str(&format!(":{port}"));
            }
            label.push('/');
        }
        label.push_str(&self.database);
        label
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub order_by: Option<String>,
    pub failure_policy: FailurePolicy,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            order_by: None,
            failure_policy: FailurePolicy::WaitAll,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineOptions, Target, default_database_path};

    #[test]
    fn default_database_path_is_under_home() {
        let path = default_database_path();
        assert!(path.ends_with(".rowpipe/users.db"));
    }

    #[test]
    fn debug_redacts_password() {
        let target = Target::new("ALX_prodev")
            .with_host("localhost", Some(3306))
            .with_credentials("root", "hunter2");
        let rendered = format!("{target:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn label_includes_set_parts_only() {
        assert_eq!(Target::new("users.db").label(), "users.db");
        let remote = Target::new("ALX_prodev")
            .with_host("localhost", Some(3306))
            .with_credentials("root", "secret");
        assert_eq!(remote.label(), "root@localhost:3306/ALX_prodev");
    }

    #[test]
    fn pipeline_defaults() {
        let options = PipelineOptions::default();
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.page_size, 10);
        assert!(options.order_by.is_none());
    }
}
