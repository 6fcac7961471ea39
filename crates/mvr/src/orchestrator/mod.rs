//! Per-stream lifecycle: preflight, stream, teardown, report.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::config::{self, MultiStreamSpec, StreamSpec};
use crate::drivers::{self, DbReader};
use crate::encode;
use crate::error::{MvrError, Result};
use crate::sink;

/// Outcome of one stream, logged as a single structured record.
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    /// Source URL with user-info stripped.
    pub source: String,
    pub sql: String,
    /// Destination path with user-info stripped.
    pub path: String,
    pub rows: u64,
    pub bytes: u64,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowResult {
    fn emit(&self) {
        if self.success {
            info!(
                source = %self.source,
                sql = %self.sql,
                path = %self.path,
                rows = self.rows,
                bytes = self.bytes,
                elapsed_ms = self.elapsed_ms,
                success = true,
                "finished writing data"
            );
        } else {
            error!(
                source = %self.source,
                sql = %self.sql,
                path = %self.path,
                rows = self.rows,
                bytes = self.bytes,
                elapsed_ms = self.elapsed_ms,
                success = false,
                error = self.error.as_deref().unwrap_or_default(),
                "stream failed"
            );
        }
    }
}

/// Owns the reader and destination for one invocation.
pub struct Orchestrator {
    source_url: Url,
    dest_url: Url,
    reader: Arc<dyn DbReader>,
    concurrency: usize,
}

/// Read and template a required connection env var.
fn connection_from_env(name: &str) -> Result<Url> {
    let raw = std::env::var(name)
        .map_err(|_| MvrError::Config(format!("{} connection string is required", name)))?;
    let rendered = config::render_connection_url(&raw);
    if name == "MVR_DEST" {
        sink::parse_dest_url(&rendered)
    } else {
        Url::parse(&rendered)
            .map_err(|e| MvrError::Config(format!("invalid {} url: {}", name, e)))
    }
}

impl Orchestrator {
    /// Connect to the source named by `MVR_SOURCE`/`MVR_DEST`.
    pub async fn connect(concurrency: usize) -> Result<Self> {
        let mut source_url = connection_from_env("MVR_SOURCE")?;
        let dest_url = connection_from_env("MVR_DEST")?;

        if source_url.scheme() == "snowflake" {
            config::keys::prepare_snowflake_url(&mut source_url)?;
        }

        let reader = drivers::build_reader(&source_url).await?;
        Ok(Self {
            source_url,
            dest_url,
            reader,
            concurrency: concurrency.max(1),
        })
    }

    pub fn reader(&self) -> Arc<dyn DbReader> {
        self.reader.clone()
    }

    /// Release the source connection pool.
    pub async fn close(&self) {
        self.reader.close().await;
    }

    /// Execute an ad-hoc server-side command and return its status text.
    pub async fn exec(sql: &str) -> Result<String> {
        let mut source_url = connection_from_env("MVR_SOURCE")?;
        if source_url.scheme() == "snowflake" {
            config::keys::prepare_snowflake_url(&mut source_url)?;
        }
        let exec = drivers::build_exec(&source_url).await?;
        exec.execute(sql).await
    }

    /// Run one stream: preflight, open sink, pipeline, strict teardown.
    pub async fn run_stream(
        &self,
        spec: &mut StreamSpec,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        spec.validate()?;

        let path = sink::build_full_path(&self.dest_url, &spec.filename)?;
        let start_time = Utc::now();
        let started = Instant::now();

        let mut result = FlowResult {
            source: drivers::sanitized_url(&self.source_url),
            sql: spec.sql.clone(),
            path: drivers::sanitized_url(&path),
            rows: 0,
            bytes: 0,
            start_time,
            elapsed_ms: 0,
            success: false,
            error: None,
        };

        let outcome = self.run_stream_inner(spec, &path, &mut result, cancel).await;

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                result.success = true;
                result.emit();
                Ok(result)
            }
            Err(e) => {
                result.error = Some(e.to_string());
                result.emit();
                Err(e)
            }
        }
    }

    async fn run_stream_inner(
        &self,
        spec: &StreamSpec,
        path: &Url,
        result: &mut FlowResult,
        cancel: CancellationToken,
    ) -> Result<()> {
        // preflight failure aborts before any sink is touched
        let ds = Arc::new(self.reader.preflight(spec).await?);
        debug!(
            columns = ds.columns.len(),
            "created data stream"
        );

        let stack = sink::open_sink(path, &spec.compression, &spec.format).await?;
        let counter = stack.counter();
        info!("writing to {}", result.path);

        let encoder = encode::build_encoder(&spec.format, ds.clone(), stack)?;

        let pipeline_result = crate::pipeline::run(
            self.reader.clone(),
            ds.clone(),
            spec.clone(),
            encoder.clone(),
            self.concurrency,
            cancel.child_token(),
        )
        .await;

        // strict-ordered teardown: flush encoder, close encoder, which
        // cascades into gzip, buffer and the sink itself
        let teardown_result = tokio::task::spawn_blocking(move || {
            encoder.flush().and_then(|_| encoder.close())
        })
        .await
        .map_err(|e| MvrError::Teardown(format!("teardown task panicked: {}", e)))?;

        result.rows = ds.total_rows();
        result.bytes = counter.total();

        match (pipeline_result, teardown_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(primary), teardown) => {
                if sink::is_stdout(path) {
                    self.write_stdout_skeleton(spec, &ds).await;
                }
                match teardown {
                    Ok(()) => Err(primary),
                    Err(t) => Err(MvrError::join_teardown(Some(primary), t)),
                }
            }
            (Ok(()), Err(t)) => Err(MvrError::join_teardown(None, t)),
        }
    }

    /// Emit a well-formed empty artifact so downstream pipes keep working.
    async fn write_stdout_skeleton(&self, spec: &StreamSpec, ds: &Arc<crate::core::DataStream>) {
        let empty = Arc::new(crate::core::DataStream::new(
            ds.columns.clone(),
            ds.dest_columns.clone(),
            spec.batch_size(),
            1,
        ));
        let format = spec.format.clone();
        let compression = spec.compression.clone();
        let path = Url::parse("stdout://").expect("static url");
        match sink::open_sink(&path, &compression, &format).await {
            Ok(stack) => {
                let write = tokio::task::spawn_blocking(move || {
                    encode::write_empty_artifact(&format, empty, stack)
                })
                .await;
                match write {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("failed to write empty artifact: {}", e),
                    Err(e) => debug!("empty artifact task panicked: {}", e),
                }
            }
            Err(e) => debug!("failed to reopen stdout for empty artifact: {}", e),
        }
    }

    /// Run every declared table sequentially, reusing the reader.
    ///
    /// Per-table overrides win by field-level merge; the `select` list
    /// keeps only matching stream names (case-insensitive).
    pub async fn run_multi(
        &self,
        multi: &MultiStreamSpec,
        select: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<FlowResult>> {
        let root_yaml = serde_yaml::to_string(&multi.root)?;
        let tables = filter_tables(&multi.tables, select);
        let mut results = Vec::with_capacity(tables.len());

        for (i, table) in tables.iter().enumerate() {
            info!("Starting {}/{}", i + 1, tables.len());
            let mut spec = config::build_stream_spec(&root_yaml, table)?;
            debug!(stream = %spec.stream_name, format = %spec.format, "built table spec");
            let result = self.run_stream(&mut spec, cancel.child_token()).await?;
            results.push(result);

            if cancel.is_cancelled() {
                return Err(MvrError::Cancelled);
            }
        }

        Ok(results)
    }
}

/// Keep only tables whose stream name is in the comma-separated list.
pub fn filter_tables<'a>(tables: &'a [StreamSpec], select: &str) -> Vec<&'a StreamSpec> {
    if select.trim().is_empty() {
        return tables.iter().collect();
    }
    let wanted: Vec<String> = select
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    tables
        .iter()
        .filter(|t| wanted.contains(&t.stream_name.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> StreamSpec {
        StreamSpec {
            stream_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_tables_case_insensitive() {
        let tables = vec![table("Users"), table("orders"), table("events")];
        let kept = filter_tables(&tables, "users,EVENTS");
        let names: Vec<&str> = kept.iter().map(|t| t.stream_name.as_str()).collect();
        assert_eq!(names, vec!["Users", "events"]);
    }

    #[test]
    fn test_filter_tables_empty_select_keeps_all() {
        let tables = vec![table("a"), table("b")];
        assert_eq!(filter_tables(&tables, "").len(), 2);
        assert_eq!(filter_tables(&tables, "  ").len(), 2);
    }

    #[test]
    fn test_flow_result_serializes_without_secrets() {
        let result = FlowResult {
            source: "postgres://db.example.com/app".into(),
            sql: "SELECT 1".into(),
            path: "file:///tmp/out.csv".into(),
            rows: 10,
            bytes: 100,
            start_time: Utc::now(),
            elapsed_ms: 12,
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"rows\":10"));
        assert!(!json.contains("error"));
    }
}
