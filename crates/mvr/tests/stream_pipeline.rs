//! End-to-end pipeline tests with an in-process reader.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use url::Url;

use mvr::core::CanonicalType;
use mvr::{Batch, Column, DataStream, DbReader, StreamSpec, Value};

/// Reader that serves a fixed set of rows.
struct FixtureReader {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

#[async_trait]
impl DbReader for FixtureReader {
    async fn preflight(&self, spec: &StreamSpec) -> mvr::Result<DataStream> {
        let mut dest = self.columns.clone();
        mvr::core::override_columns(&mut dest, &spec.columns)?;
        Ok(DataStream::new(
            self.columns.clone(),
            dest,
            spec.batch_size(),
            spec.batch_count(),
        ))
    }

    async fn stream(
        &self,
        _cancel: CancellationToken,
        ds: Arc<DataStream>,
        _spec: &StreamSpec,
    ) -> mvr::Result<()> {
        let sender = ds.sender();
        let mut batch = Batch::with_capacity(ds.batch_size);
        for row in &self.rows {
            batch.rows.push(row.clone());
            if batch.len() >= ds.batch_size {
                let full = std::mem::replace(&mut batch, Batch::with_capacity(ds.batch_size));
                sender
                    .send(full)
                    .await
                    .map_err(|_| mvr::MvrError::Stream("channel closed".into()))?;
            }
        }
        if !batch.is_empty() {
            sender
                .send(batch)
                .await
                .map_err(|_| mvr::MvrError::Stream("channel closed".into()))?;
        }
        ds.close_channel();
        Ok(())
    }

    async fn close(&self) {}
}

fn numbers_reader() -> FixtureReader {
    let mut decimal_col = Column::new("decimal_value", CanonicalType::Numeric, 3);
    decimal_col.precision = 38;
    decimal_col.scale = 15;
    let columns = vec![
        Column::new("smallint_value", CanonicalType::SmallInt, 0),
        Column::new("integer_value", CanonicalType::Integer, 1),
        Column::new("bigint_value", CanonicalType::BigInt, 2),
        decimal_col,
        Column::new("double_value", CanonicalType::Double, 4),
        Column::new("float_value", CanonicalType::Real, 5),
    ];

    let rows = vec![
        vec![
            Value::I16(1),
            Value::I32(1),
            Value::I64(1),
            Value::Decimal(Decimal::from_str("1").unwrap()),
            Value::F64(1.0),
            Value::F32(1.0),
        ],
        vec![
            Value::I16(32767),
            Value::I32(2147483647),
            Value::I64(9223372036854775807),
            Value::Decimal(Decimal::from_str("507531.111989867").unwrap()),
            Value::F64(1.2345678901234567e+20),
            Value::F32(12345679.0),
        ],
        vec![
            Value::I16(0),
            Value::I32(0),
            Value::I64(0),
            Value::Decimal(Decimal::from_str("468797.177024568").unwrap()),
            Value::F64(1234567890.12345),
            Value::F32(12345.67),
        ],
    ];

    FixtureReader { columns, rows }
}

async fn run_pipeline(
    reader: FixtureReader,
    spec: StreamSpec,
    path: &std::path::Path,
    workers: usize,
) -> Arc<DataStream> {
    let reader: Arc<dyn DbReader> = Arc::new(reader);
    let ds = Arc::new(reader.preflight(&spec).await.unwrap());

    let url = Url::from_file_path(path).unwrap();
    let sink = mvr::sink::open_sink(&url, &spec.compression, &spec.format)
        .await
        .unwrap();
    let encoder = mvr::encode::build_encoder(&spec.format, ds.clone(), sink).unwrap();

    mvr::pipeline::run(
        reader,
        ds.clone(),
        spec,
        encoder.clone(),
        workers,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    tokio::task::spawn_blocking(move || encoder.flush().and_then(|_| encoder.close()))
        .await
        .unwrap()
        .unwrap();
    ds
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_numbers_to_csv_literals() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("numbers.csv");

    let spec = StreamSpec {
        stream_name: "numbers".into(),
        format: "csv".into(),
        batch_size: 100,
        ..Default::default()
    };

    let ds = run_pipeline(numbers_reader(), spec, &path, 1).await;
    assert_eq!(ds.total_rows(), 3);

    let content = std::fs::read_to_string(&path).unwrap();
    let expected = "\
smallint_value,integer_value,bigint_value,decimal_value,double_value,float_value
1,1,1,1.000000000000000,1,1
32767,2147483647,9223372036854775807,507531.111989867000000,123456789012345670000,12345679
0,0,0,468797.177024568000000,1234567890.12345,12345.67
";
    assert_eq!(content, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_to_jsonl_sorted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.jsonl");

    let columns = vec![
        Column::new("name", CanonicalType::Varchar, 0),
        Column::new("createdz", CanonicalType::TimestampTz, 1),
        Column::new("nullable_id", CanonicalType::Integer, 2),
    ];
    let createdz = DateTime::parse_from_rfc3339("2024-10-08T17:22:00Z").unwrap();
    let rows = vec![
        vec![
            Value::Text("John Doe".into()),
            Value::DateTimeTz(createdz),
            Value::Null,
        ],
        vec![
            Value::Text("Test Tester".into()),
            Value::DateTimeTz(createdz),
            Value::Null,
        ],
    ];
    let reader = FixtureReader { columns, rows };

    let spec = StreamSpec {
        stream_name: "users".into(),
        format: "jsonl".into(),
        batch_size: 100,
        ..Default::default()
    };

    run_pipeline(reader, spec, &path, 1).await;

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "{\"createdz\":\"2024-10-08T17:22:00Z\",\"name\":\"John Doe\",\"nullable_id\":null}"
    );
    // every line parses back to exactly the destination column set
    for line in lines {
        let parsed: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(line).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed.contains_key("createdz"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_override_changes_parquet_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("users.parquet");

    let columns = vec![
        Column::new("unique_id", CanonicalType::Uuid, 0),
        Column::new("n", CanonicalType::Integer, 1),
    ];
    let uuid = uuid::Uuid::from_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap();
    let rows = vec![vec![Value::Uuid(uuid), Value::I32(5)]];
    let reader = FixtureReader { columns, rows };

    let spec = StreamSpec {
        stream_name: "users".into(),
        format: "parquet".into(),
        compression: "snappy".into(),
        batch_size: 10,
        columns: vec![mvr::ColumnOverride {
            name: "UNIQUE_ID".into(),
            type_name: "text".into(),
            ..Default::default()
        }],
        ..Default::default()
    };

    let ds = run_pipeline(reader, spec, &path, 2).await;

    // override applied case-insensitively, source column untouched
    assert_eq!(ds.columns[0].canonical_type, CanonicalType::Uuid);
    assert_eq!(ds.dest_columns[0].canonical_type, CanonicalType::Text);
    assert_eq!(ds.columns.len(), ds.dest_columns.len());

    use parquet::file::reader::FileReader;
    let reader =
        parquet::file::reader::SerializedFileReader::new(std::fs::File::open(&path).unwrap())
            .unwrap();
    let schema = reader.metadata().file_metadata().schema();
    // a UUID overridden to TEXT encodes as a string leaf
    assert_eq!(
        schema.get_fields()[0].get_physical_type(),
        parquet::basic::Type::BYTE_ARRAY
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gzip_round_trip() {
    use std::io::Read;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("numbers.csv.gz");

    let spec = StreamSpec {
        stream_name: "numbers".into(),
        format: "csv".into(),
        compression: "gzip".into(),
        batch_size: 2,
        ..Default::default()
    };

    run_pipeline(numbers_reader(), spec, &path, 1).await;

    let file = std::fs::File::open(&path).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut content = String::new();
    decoder.read_to_string(&mut content).unwrap();
    assert!(content.starts_with("smallint_value,"));
    assert_eq!(content.lines().count(), 4);
}
