//! # mvr
//!
//! Command-driven data mover: runs an ad-hoc query against PostgreSQL,
//! SQL Server or Snowflake and streams every row into CSV, JSONL,
//! Parquet or Arrow IPC files on disk, stdout or Azure Blob Storage.
//!
//! - **One canonical type vocabulary** reconciling the three source type
//!   systems, preserving precision, scale, nullability and timezone
//!   semantics
//! - **Concurrent streaming** with one reader task, a bounded batch
//!   channel and N parallel format writers
//! - **Typed encoders**, including a Parquet writer with per-column
//!   buffers and arbitrary-precision decimal encoding
//!
//! ## Example
//!
//! ```rust,no_run
//! use mvr::{Orchestrator, StreamSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mvr::Result<()> {
//!     let orchestrator = Orchestrator::connect(4).await?;
//!     let mut spec = StreamSpec {
//!         stream_name: "users".into(),
//!         format: "parquet".into(),
//!         filename: "users.parquet".into(),
//!         ..Default::default()
//!     };
//!     let result = orchestrator.run_stream(&mut spec, CancellationToken::new()).await?;
//!     println!("moved {} rows ({} bytes)", result.rows, result.bytes);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod encode;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod sink;

// Re-exports for convenient access
pub use crate::config::{build_stream_spec, MultiStreamSpec, StreamSpec};
pub use crate::core::{Batch, CanonicalType, Column, ColumnOverride, DataStream, Param, Value};
pub use crate::drivers::{build_exec, build_reader, DbExec, DbReader};
pub use crate::error::{MvrError, Result};
pub use crate::orchestrator::{FlowResult, Orchestrator};
