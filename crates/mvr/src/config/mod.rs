//! Stream configuration: YAML schema, env merging, two-pass templating.

pub mod keys;
pub mod template;

use serde::{Deserialize, Serialize};

use crate::core::{collect_mvr_vars, merge_env_params, ColumnOverride, Params};
use crate::error::{MvrError, Result};

use self::template::TemplateContext;

/// Default rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Default channel capacity in batches.
pub const DEFAULT_BATCH_COUNT: usize = 10;

/// Configuration of a single stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sql: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compression: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnOverride>,

    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub batch_size: usize,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub batch_count: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl StreamSpec {
    /// Effective batch size.
    pub fn batch_size(&self) -> usize {
        if self.batch_size > 0 {
            self.batch_size
        } else {
            DEFAULT_BATCH_SIZE
        }
    }

    /// Effective channel capacity.
    pub fn batch_count(&self) -> usize {
        if self.batch_count > 0 {
            self.batch_count
        } else {
            DEFAULT_BATCH_COUNT
        }
    }

    /// Validate the spec and fill in the default query.
    ///
    /// Either `stream_name` or `sql` must be present; a missing query
    /// becomes `SELECT * FROM {stream_name}`.
    pub fn validate(&mut self) -> Result<()> {
        if self.stream_name.is_empty() && self.sql.is_empty() {
            return Err(MvrError::Config(
                "stream_name or sql must be provided".to_string(),
            ));
        }
        if self.sql.is_empty() {
            self.sql = format!("SELECT * FROM {}", self.stream_name);
        }
        match self.format.to_lowercase().as_str() {
            "csv" | "jsonl" | "parquet" | "arrow" => {}
            other => {
                return Err(MvrError::Config(format!("unsupported format: {}", other)));
            }
        }
        match self.compression.to_lowercase().as_str() {
            "" | "gzip" | "snappy" => {}
            other => {
                return Err(MvrError::Config(format!(
                    "unsupported compression: {}",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Apply non-empty override fields, CLI args and per-table entries win.
    pub fn override_values(&mut self, other: &StreamSpec) {
        if !other.stream_name.is_empty() {
            self.stream_name = other.stream_name.clone();
        }
        if !other.format.is_empty() {
            self.format = other.format.clone();
        }
        if !other.filename.is_empty() {
            self.filename = other.filename.clone();
        }
        if !other.sql.is_empty() {
            self.sql = other.sql.clone();
        }
        if !other.compression.is_empty() {
            self.compression = other.compression.clone();
        }
        if !other.columns.is_empty() {
            self.columns = other.columns.clone();
        }
        if other.batch_size > 0 {
            self.batch_size = other.batch_size;
        }
        if other.batch_count > 0 {
            self.batch_count = other.batch_count;
        }
        for (key, param) in &other.params {
            self.params.insert(key.clone(), param.clone());
        }
    }

    fn absorb_env_params(&mut self) {
        let env = collect_mvr_vars("PARAM");
        merge_env_params(&mut self.params, &env);
    }
}

/// Root config for multi-stream runs: shared settings plus table entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiStreamSpec {
    #[serde(flatten)]
    pub root: StreamSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<StreamSpec>,
}

/// Parse YAML into a stream spec and merge `MVR_PARAM_*` values.
///
/// Empty input is a valid, empty spec so the CLI can run config-less.
pub fn stream_spec_from_yaml(data: &str) -> Result<StreamSpec> {
    let mut spec: StreamSpec = if data.trim().is_empty() {
        StreamSpec::default()
    } else {
        serde_yaml::from_str(data)?
    };
    spec.absorb_env_params();
    Ok(spec)
}

/// Build the effective stream spec from raw config text and overrides.
///
/// Rendered in two passes: the first pass resolves environment template
/// variables, the parsed result absorbs CLI overrides, then the config is
/// re-serialized and rendered again so values computed in the first pass
/// (resolved stream_name, format, compression) are available to filename
/// templates.
pub fn build_stream_spec(data: &str, overrides: &StreamSpec) -> Result<StreamSpec> {
    let first = template::render_vars(data, &TemplateContext::from_env());
    let mut spec = stream_spec_from_yaml(&first)?;
    spec.override_values(overrides);

    let round_trip = serde_yaml::to_string(&spec)?;
    let ctx = TemplateContext::for_stream(&spec.stream_name, &spec.format, &spec.compression);
    let second = template::render(&round_trip, &ctx);

    let mut spec = stream_spec_from_yaml(&second)?;
    spec.validate()?;
    Ok(spec)
}

/// Render a connection URL template (`MVR_SOURCE` / `MVR_DEST`).
pub fn render_connection_url(raw: &str) -> String {
    template::render(raw, &TemplateContext::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_name_or_sql() {
        let mut spec = StreamSpec {
            format: "csv".into(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());

        spec.stream_name = "users".into();
        spec.validate().unwrap();
        assert_eq!(spec.sql, "SELECT * FROM users");
    }

    #[test]
    fn test_validate_rejects_unknown_format() {
        let mut spec = StreamSpec {
            stream_name: "users".into(),
            format: "xml".into(),
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let spec = StreamSpec::default();
        assert_eq!(spec.batch_size(), DEFAULT_BATCH_SIZE);
        assert_eq!(spec.batch_count(), DEFAULT_BATCH_COUNT);
    }

    #[test]
    fn test_override_values_field_merge() {
        let mut root = StreamSpec {
            stream_name: "users".into(),
            format: "csv".into(),
            compression: "gzip".into(),
            batch_size: 500,
            ..Default::default()
        };
        let table = StreamSpec {
            stream_name: "orders".into(),
            format: "parquet".into(),
            ..Default::default()
        };
        root.override_values(&table);
        assert_eq!(root.stream_name, "orders");
        assert_eq!(root.format, "parquet");
        // empty override fields do not clobber
        assert_eq!(root.compression, "gzip");
        assert_eq!(root.batch_size, 500);
    }

    #[test]
    fn test_build_spec_two_pass_filename() {
        let yaml = r#"
stream_name: users
format: parquet
compression: snappy
filename: "out/{{stream_name}}{{ext}}"
"#;
        let spec = build_stream_spec(yaml, &StreamSpec::default()).unwrap();
        assert_eq!(spec.filename, "out/users.snappy.parquet");
        assert_eq!(spec.sql, "SELECT * FROM users");
    }

    #[test]
    fn test_build_spec_cli_override_feeds_second_pass() {
        let yaml = r#"
stream_name: users
format: csv
filename: "{{stream_name}}{{ext}}"
"#;
        let cli = StreamSpec {
            format: "jsonl".into(),
            ..Default::default()
        };
        let spec = build_stream_spec(yaml, &cli).unwrap();
        assert_eq!(spec.format, "jsonl");
        assert_eq!(spec.filename, "users.jsonl");
    }

    #[test]
    fn test_build_spec_without_config_text() {
        let cli = StreamSpec {
            stream_name: "users".into(),
            format: "csv".into(),
            filename: "folder/file{{ext}}".into(),
            ..Default::default()
        };
        let spec = build_stream_spec("", &cli).unwrap();
        assert_eq!(spec.sql, "SELECT * FROM users");
        assert_eq!(spec.filename, "folder/file.csv");
    }

    #[test]
    fn test_table_override_feeds_filename_template() {
        // root config carries the template, the table supplies the name
        let yaml = r#"
format: parquet
compression: snappy
filename: "folder/{{stream_name}}{{ext}}"
"#;
        let table = StreamSpec {
            stream_name: "users".into(),
            ..Default::default()
        };
        let spec = build_stream_spec(yaml, &table).unwrap();
        assert_eq!(spec.filename, "folder/users.snappy.parquet");
    }

    #[test]
    fn test_yaml_params_parse() {
        let yaml = r#"
sql: "SELECT * FROM t WHERE a > $1 AND b < $2"
format: csv
params:
  "$1": { value: "10", type: INT4 }
  "$2": { value: "x" }
"#;
        let spec = stream_spec_from_yaml(yaml).unwrap();
        assert_eq!(spec.params.len(), 2);
        assert_eq!(spec.params["$1"].type_name, "INT4");
    }

    #[test]
    fn test_multi_stream_parse() {
        let yaml = r#"
format: csv
compression: gzip
tables:
  - stream_name: users
  - stream_name: orders
    format: parquet
"#;
        let multi: MultiStreamSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(multi.root.format, "csv");
        assert_eq!(multi.tables.len(), 2);
        assert_eq!(multi.tables[1].format, "parquet");
    }
}
