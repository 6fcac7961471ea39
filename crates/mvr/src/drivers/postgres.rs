//! PostgreSQL driver adapter.
//!
//! Uses deadpool-postgres for pooling. Placeholders are `$1`, `$2`, ...
//! bound positionally in key-sort order. Preflight prepares the wrapped
//! query and reads the statement's column metadata, so no rows are
//! materialized.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::TryStreamExt;
use rustls::ClientConfig;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type as PgType};
use tokio_postgres::Config as PgConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StreamSpec;
use crate::core::{
    build_bind_values, BindValue, Batch, CanonicalType, Column, DataStream, Value,
};
use crate::error::{MvrError, Result};

use super::{DbExec, DbReader};

pub struct PostgresReader {
    pool: Pool,
}

impl PostgresReader {
    /// Build a pool from a `postgres://` connection URL.
    pub async fn connect(url: &Url) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        if let Some(host) = url.host_str() {
            pg_config.host(host);
        }
        pg_config.port(url.port().unwrap_or(5432));
        let db = url.path().trim_start_matches('/');
        if !db.is_empty() {
            pg_config.dbname(db);
        }
        if !url.username().is_empty() {
            pg_config.user(url.username());
        }
        if let Some(password) = url.password() {
            pg_config.password(password);
        }

        let ssl_mode = url
            .query_pairs()
            .find(|(k, _)| k == "sslmode")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| "require".to_string());

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let pool = match ssl_mode.to_lowercase().as_str() {
            "disable" => {
                warn!("PostgreSQL TLS is disabled");
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(4)
                    .build()
                    .map_err(|e| MvrError::connect(e.to_string(), "creating PostgreSQL pool"))?
            }
            _ => {
                let tls_config = build_tls_config(&ssl_mode)?;
                let tls = MakeRustlsConnect::new(tls_config);
                let mgr = Manager::from_config(pg_config, tls, mgr_config);
                Pool::builder(mgr)
                    .max_size(4)
                    .build()
                    .map_err(|e| MvrError::connect(e.to_string(), "creating PostgreSQL pool"))?
            }
        };

        info!(
            host = url.host_str().unwrap_or_default(),
            db, "connected PostgreSQL pool"
        );
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MvrError::connect(e.to_string(), "getting PostgreSQL connection"))
    }
}

fn build_tls_config(ssl_mode: &str) -> Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = match ssl_mode {
        "require" | "prefer" => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
        "verify-ca" | "verify-full" => ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
        other => {
            return Err(MvrError::Config(format!(
                "invalid sslmode '{}': expected disable, require, verify-ca or verify-full",
                other
            )))
        }
    };
    Ok(config)
}

/// Map a reported pg type to the canonical vocabulary.
fn pg_type_to_canonical(ty: &PgType) -> CanonicalType {
    match ty.name() {
        "bool" => CanonicalType::Boolean,
        "int2" => CanonicalType::SmallInt,
        "int4" => CanonicalType::Integer,
        "int8" => CanonicalType::BigInt,
        "float4" => CanonicalType::Real,
        "float8" => CanonicalType::Double,
        "numeric" => CanonicalType::Numeric,
        "uuid" => CanonicalType::Uuid,
        "date" => CanonicalType::Date,
        "timestamp" => CanonicalType::Timestamp,
        "timestamptz" => CanonicalType::TimestampTz,
        "varchar" | "bpchar" => CanonicalType::Varchar,
        "json" => CanonicalType::Json,
        "jsonb" => CanonicalType::Jsonb,
        "bytea" => CanonicalType::Bytes,
        "_text" => CanonicalType::TextArray,
        _ => CanonicalType::Text,
    }
}

/// Typed bind parameter for the wire.
#[derive(Debug)]
struct PgParam(BindValue);

impl ToSql for PgParam {
    fn to_sql(
        &self,
        ty: &PgType,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match &self.0 {
            BindValue::Text(s) => s.to_sql(ty, out),
            BindValue::Int(i) => i.to_sql(ty, out),
            BindValue::Bool(b) => b.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_params(spec: &StreamSpec) -> Vec<PgParam> {
    build_bind_values(&spec.params)
        .into_iter()
        .map(|(_, v)| PgParam(v))
        .collect()
}

fn convert_row_value(row: &tokio_postgres::Row, idx: usize, canonical: CanonicalType) -> Value {
    match canonical {
        CanonicalType::Boolean => row.try_get::<_, Option<bool>>(idx).ok().flatten().into(),
        CanonicalType::SmallInt => row.try_get::<_, Option<i16>>(idx).ok().flatten().into(),
        CanonicalType::Integer => row.try_get::<_, Option<i32>>(idx).ok().flatten().into(),
        CanonicalType::BigInt => row.try_get::<_, Option<i64>>(idx).ok().flatten().into(),
        CanonicalType::Real => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::F32(v))
            .unwrap_or(Value::Null),
        CanonicalType::Double => row.try_get::<_, Option<f64>>(idx).ok().flatten().into(),
        CanonicalType::Numeric => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)
            .ok()
            .flatten()
            .map(Value::Decimal)
            .unwrap_or(Value::Null),
        CanonicalType::Uuid => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        CanonicalType::Date => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        CanonicalType::Timestamp => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        CanonicalType::TimestampTz => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTimeTz)
            .unwrap_or(Value::Null),
        CanonicalType::Json | CanonicalType::Jsonb => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),
        CanonicalType::Bytes => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        CanonicalType::TextArray => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Json(serde_json::json!(v)))
            .unwrap_or(Value::Null),
        CanonicalType::Varchar | CanonicalType::Text => {
            if let Ok(Some(s)) = row.try_get::<_, Option<String>>(idx) {
                return Value::Text(s);
            }
            // types outside the vocabulary fall back to TEXT but may not
            // decode as text on the wire; try the common shapes
            if let Ok(Some(t)) = row.try_get::<_, Option<chrono::NaiveTime>>(idx) {
                return Value::Time(t);
            }
            if let Ok(Some(b)) = row.try_get::<_, Option<Vec<u8>>>(idx) {
                return Value::Bytes(b);
            }
            Value::Null
        }
    }
}

#[async_trait]
impl DbReader for PostgresReader {
    async fn preflight(&self, spec: &StreamSpec) -> Result<DataStream> {
        let client = self.client().await?;

        let wrapped = format!("SELECT * FROM ({}) LIMIT 0 OFFSET 0", spec.sql);
        debug!(sql = %wrapped, "preflight");

        let stmt = client
            .prepare(&wrapped)
            .await
            .map_err(|e| MvrError::Preflight(e.to_string()))?;

        let columns: Vec<Column> = stmt
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let canonical = pg_type_to_canonical(col.type_());
                let mut column = Column::new(col.name(), canonical, i as i32);
                column.driver_type = col.type_().name().to_uppercase();
                column
            })
            .collect();

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
        // close in a deferred step so consumers unblock on any exit path
        ds.close_channel();
        debug!("closed batch channel");
        result
    }

    async fn close(&self) {
        self.pool.close();
    }
}

impl PostgresReader {
    async fn stream_inner(
        &self,
        cancel: &CancellationToken,
        ds: &Arc<DataStream>,
        spec: &StreamSpec,
    ) -> Result<()> {
        let client = self.client().await?;
        debug!(sql = %spec.sql, "executing data stream");

        let params = bind_params(spec);
        let stmt = client
            .prepare(&spec.sql)
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        let canonicals: Vec<CanonicalType> = ds.columns.iter().map(|c| c.canonical_type).collect();

        let row_stream = client
            .query_raw(&stmt, params.iter().map(|p| p as &dyn ToSql))
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        futures::pin_mut!(row_stream);

        let sender = ds.sender();
        let mut batch = Batch::with_capacity(ds.batch_size);

        loop {
            if cancel.is_cancelled() {
                return Err(MvrError::Cancelled);
            }

            let row = match row_stream.try_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(MvrError::Stream(format!("failed to scan row: {}", e))),
            };

            let mut values = Vec::with_capacity(canonicals.len());
            for (idx, canonical) in canonicals.iter().enumerate() {
                values.push(convert_row_value(&row, idx, *canonical));
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
}

#[async_trait]
impl DbExec for PostgresReader {
    async fn execute(&self, sql: &str) -> Result<String> {
        let client = self.client().await?;
        let affected = client
            .execute(sql, &[])
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        Ok(format!("OK, {} rows affected", affected))
    }
}

/// Certificate verifier for `sslmode=require`: TLS without verification.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
