//! Persistence layer for runs, pipelines, cache entries and images.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::{RunPatch, SqliteStorage};
