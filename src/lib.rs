//! Purpose: Shared library crate used by the `rowpipe` CLI and tests.
//! Exports: `api` (row sources, seeding), `config`, `core` (streaming stages,
//! cache, executor, errors).
//! Role: Lazy, memory-bounded access to query results; the CLI is a thin shell.
//! Invariants: Every stage pulls from its upstream on demand; nothing buffers a
//! full result set unless the caller asks for it (`fetch_all`, caching).
pub mod api;
pub mod config;
pub mod core;
