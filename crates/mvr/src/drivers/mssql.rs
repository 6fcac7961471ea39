//! SQL Server driver adapter.
//!
//! Tiberius with bb8 pooling. The surface convention is named `@key`
//! placeholders; tiberius binds positionally, so placeholders are
//! rewritten to `@Pn` in key-sort order before execution. Preflight runs
//! the zero-row wrapped query for column order and types, then enriches
//! precision/scale/nullability from
//! `sys.dm_exec_describe_first_result_set` when it can.

use std::sync::Arc;

use async_trait::async_trait;
use bb8::Pool;
use futures::TryStreamExt;
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StreamSpec;
use crate::core::{
    build_bind_values, mssql_to_canonical, swap_uuid_fields, BindValue, Batch, CanonicalType,
    Column, DataStream, Value,
};
use crate::error::{MvrError, Result};

use super::{DbExec, DbReader};

/// Connection manager for bb8 with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: Config,
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();
        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub struct MssqlReader {
    pool: Pool<TiberiusConnectionManager>,
    keep_original_uuid: bool,
}

fn query_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.into_owned())
}

impl MssqlReader {
    /// Build a pool from a `sqlserver://` connection URL.
    pub async fn connect(url: &Url) -> Result<Self> {
        let mut config = Config::new();
        if let Some(host) = url.host_str() {
            config.host(host);
        }
        config.port(url.port().unwrap_or(1433));

        let database = query_param(url, "database")
            .or_else(|| {
                let path = url.path().trim_start_matches('/');
                (!path.is_empty()).then(|| path.to_string())
            })
            .unwrap_or_default();
        if !database.is_empty() {
            config.database(&database);
        }

        if !url.username().is_empty() {
            config.authentication(AuthMethod::sql_server(
                url.username(),
                url.password().unwrap_or_default(),
            ));
        }

        let encrypt = query_param(url, "encrypt")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        if encrypt {
            if query_param(url, "TrustServerCertificate")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
            {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        let keep_original_uuid = query_param(url, "KeepOriginalUUID")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let manager = TiberiusConnectionManager { config };
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .await
            .map_err(|e| MvrError::connect(e.to_string(), "creating SQL Server pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| MvrError::connect(e.to_string(), "testing SQL Server connection"))?;
            conn.simple_query("SELECT 1").await?.into_row().await?;
        }

        info!(
            host = url.host_str().unwrap_or_default(),
            database, "connected SQL Server pool"
        );

        Ok(Self {
            pool,
            keep_original_uuid,
        })
    }

    async fn client(
        &self,
    ) -> Result<bb8::PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MvrError::connect(e.to_string(), "getting SQL Server connection"))
    }
}

/// Rewrite `@key` placeholders to positional `@Pn` in key-sort order.
///
/// Longer keys are substituted first so `@start_date` never collides
/// with a shorter `@start` prefix.
fn rewrite_placeholders(sql: &str, keys: &[String]) -> String {
    let mut positions: Vec<(usize, &String)> = keys.iter().enumerate().collect();
    positions.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    let mut rewritten = sql.to_string();
    for (idx, key) in positions {
        rewritten = rewritten.replace(&format!("@{}", key), &format!("@P{}", idx + 1));
    }
    rewritten
}

fn column_type_name(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Bit | ColumnType::Bitn => "BIT",
        ColumnType::Int1 => "TINYINT",
        ColumnType::Int2 => "SMALLINT",
        ColumnType::Int4 | ColumnType::Intn => "INT",
        ColumnType::Int8 => "BIGINT",
        ColumnType::Float4 => "REAL",
        ColumnType::Float8 | ColumnType::Floatn => "FLOAT",
        ColumnType::Money | ColumnType::Money4 => "MONEY",
        ColumnType::Decimaln | ColumnType::Numericn => "DECIMAL",
        ColumnType::Guid => "UNIQUEIDENTIFIER",
        ColumnType::Daten => "DATE",
        ColumnType::Timen => "TIME",
        ColumnType::Datetime
        | ColumnType::Datetime2
        | ColumnType::Datetimen
        | ColumnType::Datetime4 => "DATETIME2",
        ColumnType::DatetimeOffsetn => "DATETIMEOFFSET",
        ColumnType::BigVarBin | ColumnType::BigBinary | ColumnType::Image => "VARBINARY",
        ColumnType::BigVarChar | ColumnType::BigChar | ColumnType::Text => "VARCHAR",
        ColumnType::NVarchar | ColumnType::NChar | ColumnType::NText => "NVARCHAR",
        ColumnType::Xml => "XML",
        _ => "SQL_VARIANT",
    }
}

/// Result-set description from `sys.dm_exec_describe_first_result_set`.
struct DescribedColumn {
    name: String,
    precision: i64,
    scale: i64,
    max_length: i64,
    nullable: bool,
    type_name: String,
}

impl MssqlReader {
    /// Best-effort metadata enrichment; the TDS column list lacks
    /// precision and scale.
    async fn describe_result_set(
        &self,
        sql: &str,
        spec: &StreamSpec,
    ) -> Result<Vec<DescribedColumn>> {
        let mut client = self.client().await?;

        let params_decl = build_bind_values(&spec.params)
            .iter()
            .map(|(key, value)| {
                let sql_type = match value {
                    BindValue::Int(_) => "bigint",
                    BindValue::Bool(_) => "bit",
                    BindValue::Text(_) => "nvarchar(max)",
                };
                format!("@{} {}", key, sql_type)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut query = Query::new(
            "SELECT name, CAST(ISNULL(precision, 0) AS BIGINT), \
             CAST(ISNULL(scale, 0) AS BIGINT), CAST(ISNULL(max_length, 0) AS BIGINT), \
             CAST(ISNULL(is_nullable, 1) AS BIT), ISNULL(system_type_name, '') \
             FROM sys.dm_exec_describe_first_result_set(@P1, @P2, 0) \
             WHERE name IS NOT NULL ORDER BY column_ordinal",
        );
        query.bind(sql);
        query.bind(params_decl);

        let stream = query.query(&mut client).await?;
        let rows = stream.into_first_result().await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(DescribedColumn {
                    name: row.get::<&str, _>(0)?.to_string(),
                    precision: row.get::<i64, _>(1).unwrap_or(0),
                    scale: row.get::<i64, _>(2).unwrap_or(0),
                    max_length: row.get::<i64, _>(3).unwrap_or(0),
                    nullable: row.get::<bool, _>(4).unwrap_or(true),
                    type_name: row.get::<&str, _>(5).unwrap_or_default().to_string(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl DbReader for MssqlReader {
    async fn preflight(&self, spec: &StreamSpec) -> Result<DataStream> {
        let keys: Vec<String> = spec.params.keys().cloned().collect();
        let wrapped = format!(
            "SELECT * FROM ({}) AS sub ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT 1 ROWS ONLY",
            spec.sql
        );
        let rewritten = rewrite_placeholders(&wrapped, &keys);
        debug!(sql = %rewritten, "preflight");

        let mut client = self.client().await?;
        let mut query = Query::new(rewritten);
        for (_, value) in build_bind_values(&spec.params) {
            bind_value(&mut query, value);
        }

        let tds_columns = {
            let mut stream = query
                .query(&mut client)
                .await
                .map_err(|e| MvrError::Preflight(e.to_string()))?;
            stream
                .columns()
                .await
                .map_err(|e| MvrError::Preflight(e.to_string()))?
                .map(|cols| cols.to_vec())
                .unwrap_or_default()
        };
        drop(client);

        let mut columns: Vec<Column> = tds_columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let driver_type = column_type_name(col.column_type());
                let normalized = mssql_to_canonical(driver_type, 0, 0, 0);
                let mut column = Column::new(col.name(), normalized.canonical, i as i32);
                column.driver_type = driver_type.to_string();
                column.precision = normalized.precision;
                column.scale = normalized.scale;
                column
            })
            .collect();

        match self.describe_result_set(&spec.sql, spec).await {
            Ok(described) => {
                for col in columns.iter_mut() {
                    let Some(desc) = described
                        .iter()
                        .find(|d| d.name.eq_ignore_ascii_case(&col.name))
                    else {
                        continue;
                    };
                    col.nullable = desc.nullable;
                    col.length = desc.max_length;
                    // nvarchar lengths are reported in bytes; -1 stays the
                    // unbounded sentinel
                    if desc.type_name.to_lowercase().contains("(max)") {
                        col.length = -1;
                    }
                    let base_type = desc
                        .type_name
                        .split('(')
                        .next()
                        .unwrap_or_default()
                        .trim()
                        .to_uppercase();
                    if !base_type.is_empty() {
                        let normalized = mssql_to_canonical(
                            &base_type,
                            col.length,
                            desc.precision,
                            desc.scale,
                        );
                        col.canonical_type = normalized.canonical;
                        col.driver_type = base_type;
                        col.precision = normalized.precision;
                        col.scale = normalized.scale;
                    }
                }
            }
            Err(e) => {
                warn!("describe_first_result_set unavailable: {}", e);
            }
        }

        let mut dest_columns = columns.clone();
        crate::core::override_columns(&mut dest_columns, &spec.columns)?;

        Ok(DataStream::new(
            columns,
            dest_columns,
            spec.batch_size(),
            spec.batch_count(),
        ))
    }

    async fn stream(
        &self,
        cancel: CancellationToken,
        ds: Arc<DataStream>,
        spec: &StreamSpec,
    ) -> Result<()> {
        let result = self.stream_inner(&cancel, &ds, spec).await;
        ds.close_channel();
        debug!("closed batch channel");
        result
    }

    async fn close(&self) {
        // bb8 releases connections as the pool drops
    }
}

impl MssqlReader {
    async fn stream_inner(
        &self,
        cancel: &CancellationToken,
        ds: &Arc<DataStream>,
        spec: &StreamSpec,
    ) -> Result<()> {
        let keys: Vec<String> = spec.params.keys().cloned().collect();
        let rewritten = rewrite_placeholders(&spec.sql, &keys);
        debug!(sql = %rewritten, "executing data stream");

        let mut client = self.client().await?;
        let mut query = Query::new(rewritten);
        for (_, value) in build_bind_values(&spec.params) {
            bind_value(&mut query, value);
        }

        let stream = query
            .query(&mut client)
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        let mut rows = stream.into_row_stream();

        let canonicals: Vec<CanonicalType> = ds.columns.iter().map(|c| c.canonical_type).collect();
        let sender = ds.sender();
        let mut batch = Batch::with_capacity(ds.batch_size);

        loop {
            if cancel.is_cancelled() {
                return Err(MvrError::Cancelled);
            }

            let row = match rows.try_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(MvrError::Stream(format!("failed to scan row: {}", e))),
            };

            let mut values = Vec::with_capacity(canonicals.len());
            for (idx, canonical) in canonicals.iter().enumerate() {
                values.push(self.convert_row_value(&row, idx, *canonical));
            }
            batch.rows.push(values);

            if batch.len() >= ds.batch_size {
                let full = std::mem::replace(&mut batch, Batch::with_capacity(ds.batch_size));
                tokio::select! {
                    sent = sender.send(full) => {
                        if sent.is_err() {
                            return Err(MvrError::Stream("batch channel closed".to_string()));
                        }
                    }
                    _ = cancel.cancelled() => return Err(MvrError::Cancelled),
                }
            }
        }

        if !batch.is_empty() {
            tokio::select! {
                sent = sender.send(batch) => {
                    if sent.is_err() {
                        return Err(MvrError::Stream("batch channel closed".to_string()));
                    }
                }
                _ = cancel.cancelled() => return Err(MvrError::Cancelled),
            }
        }

        debug!("finished reading rows");
        Ok(())
    }

    fn convert_row_value(
        &self,
        row: &tiberius::Row,
        idx: usize,
        canonical: CanonicalType,
    ) -> Value {
        match canonical {
            CanonicalType::Boolean => row.try_get::<bool, _>(idx).ok().flatten().into(),
            CanonicalType::SmallInt => row.try_get::<i16, _>(idx).ok().flatten().into(),
            CanonicalType::Integer => row.try_get::<i32, _>(idx).ok().flatten().into(),
            CanonicalType::BigInt => row.try_get::<i64, _>(idx).ok().flatten().into(),
            CanonicalType::Real => row
                .try_get::<f32, _>(idx)
                .ok()
                .flatten()
                .map(Value::F32)
                .unwrap_or(Value::Null),
            CanonicalType::Double => row.try_get::<f64, _>(idx).ok().flatten().into(),
            CanonicalType::Numeric => row
                .try_get::<rust_decimal::Decimal, _>(idx)
                .ok()
                .flatten()
                .map(Value::Decimal)
                .unwrap_or(Value::Null),
            CanonicalType::Uuid => match row.try_get::<uuid::Uuid, _>(idx).ok().flatten() {
                // tiberius yields RFC-4122 order; keeping the original
                // wire order means re-applying the field swap
                Some(uuid) if self.keep_original_uuid => {
                    Value::Bytes(swap_uuid_fields(*uuid.as_bytes()).to_vec())
                }
                Some(uuid) => Value::Uuid(uuid),
                None => Value::Null,
            },
            CanonicalType::Date => row
                .try_get::<chrono::NaiveDate, _>(idx)
                .ok()
                .flatten()
                .map(Value::Date)
                .unwrap_or(Value::Null),
            CanonicalType::Timestamp => row
                .try_get::<chrono::NaiveDateTime, _>(idx)
                .ok()
                .flatten()
                .map(Value::DateTime)
                .unwrap_or(Value::Null),
            CanonicalType::TimestampTz => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
                .ok()
                .flatten()
                .map(|dt| Value::DateTimeTz(dt.fixed_offset()))
                .unwrap_or(Value::Null),
            CanonicalType::Bytes => row
                .try_get::<&[u8], _>(idx)
                .ok()
                .flatten()
                .map(|b| Value::Bytes(b.to_vec()))
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<&str, _>(idx)
                .ok()
                .flatten()
                .map(|s| Value::Text(s.to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

fn bind_value(query: &mut Query<'_>, value: BindValue) {
    match value {
        BindValue::Text(s) => query.bind(s),
        BindValue::Int(i) => query.bind(i),
        BindValue::Bool(b) => query.bind(b),
    }
}

#[async_trait]
impl DbExec for MssqlReader {
    async fn execute(&self, sql: &str) -> Result<String> {
        let mut client = self.client().await?;
        let result = client
            .execute(sql, &[])
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        let affected: u64 = result.rows_affected().iter().sum();
        Ok(format!("OK, {} rows affected", affected))
    }
}
