//! medface-engine: composition root for the resolution pipeline.
//!
//! Wires a SQLite enrollment store and an external extraction helper into
//! a [`medface_core::ResolutionPipeline`], and runs it on worker threads
//! behind an async [`EngineHandle`].

pub mod audit;
pub mod command;
pub mod config;
pub mod db;
pub mod engine;

pub use command::CommandExtractor;
pub use config::{Config, ConfigError};
pub use db::SqliteStore;
pub use engine::{spawn_engine, start, EngineError, EngineHandle, EngineStatus};
