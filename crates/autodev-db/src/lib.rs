//! Persistence layer: models, connection pool, migrations, and query
//! modules for the `tasks`, `task_events`, `jobs`, and `patches` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
