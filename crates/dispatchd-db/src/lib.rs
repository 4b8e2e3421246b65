//! Durable storage layer for the task-delegation supervisor.
//!
//! Wraps a local SQLite database (WAL journaling, foreign keys on) behind a
//! typed query API. Every row type lives in [`models`]; every query lives
//! under [`queries`], grouped by table.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::create_pool;
