//! Snowflake driver adapter over the SQL API v2.
//!
//! Authenticates with a key-pair JWT (RS256). The connection URL carries
//! the account as host, optional database/schema path segments, and the
//! URL-safe base64 PKCS#8 key in the `privateKey` query parameter (see
//! `config::keys`). Placeholders are `?`, bound positionally in key-sort
//! order through the API's `bindings` map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::StreamSpec;
use crate::core::{
    build_bind_values, snowflake_to_canonical, BindValue, Batch, CanonicalType, Column,
    DataStream, Value,
};
use crate::error::{MvrError, Result};

use super::{DbExec, DbReader};

/// Token lifetime: 59 minutes, Snowflake's maximum is 60.
const TOKEN_LIFETIME_SECS: u64 = 3540;

/// Refresh the token this long before expiry.
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(300);

const STATEMENT_TIMEOUT_SECS: u64 = 3600;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    /// `<account>.<user>.SHA256:<public_key_fingerprint>`
    iss: String,
    /// `<account>.<user>`
    sub: String,
    iat: u64,
    exp: u64,
}

/// JWT state: current token plus the key material to mint new ones.
struct SnowflakeAuth {
    token: String,
    expires_at: SystemTime,
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
}

impl SnowflakeAuth {
    fn new(account: &str, user: &str, private_key_der: &[u8]) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_der(private_key_der)
            .map_err(|e| MvrError::Config(format!("failed to parse private key: {}", e)))?;

        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| MvrError::Config(format!("failed to encode public key: {}", e)))?;
        let mut hasher = Sha256::new();
        hasher.update(public_key_der.as_bytes());
        let fingerprint =
            base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

        let account_upper = account.to_uppercase();
        let user_upper = user.to_uppercase();
        let issuer = format!("{}.{}.SHA256:{}", account_upper, user_upper, fingerprint);
        let subject = format!("{}.{}", account_upper, user_upper);

        let pkcs8 = private_key
            .to_pkcs8_der()
            .map_err(|e| MvrError::Config(format!("failed to encode private key: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_der(pkcs8.as_bytes());

        let mut auth = Self {
            token: String::new(),
            expires_at: UNIX_EPOCH,
            encoding_key,
            issuer,
            subject,
        };
        auth.refresh_token()?;
        Ok(auth)
    }

    fn needs_refresh(&self) -> bool {
        match SystemTime::now().checked_add(TOKEN_REFRESH_BUFFER) {
            Some(check) => check >= self.expires_at,
            None => true,
        }
    }

    fn refresh_token(&mut self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| MvrError::Config(format!("system time error: {}", e)))?;
        let iat = now.as_secs();
        let exp = iat + TOKEN_LIFETIME_SECS;

        let claims = JwtClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };

        self.token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| MvrError::Config(format!("failed to generate JWT: {}", e)))?;
        self.expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        debug!("generated new snowflake JWT");
        Ok(())
    }

    fn token(&mut self) -> Result<String> {
        if self.needs_refresh() {
            self.refresh_token()?;
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatementRequest {
    statement: String,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    bindings: BTreeMap<String, Binding>,
}

#[derive(Debug, Clone, Serialize)]
struct Binding {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    precision: Option<i64>,
    #[serde(default)]
    scale: Option<i64>,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    nullable: bool,
}

/// Partition entries only matter by count; rows are fetched by index.
#[derive(Debug, Deserialize)]
struct PartitionInfo {}

pub struct SnowflakeReader {
    client: reqwest::Client,
    base_url: String,
    auth: Mutex<SnowflakeAuth>,
    database: Option<String>,
    schema: Option<String>,
    warehouse: Option<String>,
    role: Option<String>,
}

impl SnowflakeReader {
    /// Build an adapter from a `snowflake://` connection URL.
    pub async fn connect(url: &Url) -> Result<Self> {
        let account = url
            .host_str()
            .ok_or_else(|| MvrError::Config("snowflake url is missing an account".to_string()))?
            .to_string();
        let user = url.username().to_string();
        if user.is_empty() {
            return Err(MvrError::Config(
                "snowflake url is missing a user".to_string(),
            ));
        }

        let query: BTreeMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let authenticator = query.get("authenticator").map(String::as_str);
        if authenticator != Some("SNOWFLAKE_JWT") {
            return Err(MvrError::Config(
                "snowflake connections require authenticator=SNOWFLAKE_JWT \
                 (set MVR_PEM_KEY or MVR_PEM_FILE)"
                    .to_string(),
            ));
        }
        let private_key = query.get("privateKey").ok_or_else(|| {
            MvrError::Config("snowflake url is missing the privateKey parameter".to_string())
        })?;
        let der = base64::engine::general_purpose::URL_SAFE
            .decode(private_key)
            .map_err(|e| MvrError::Config(format!("invalid privateKey encoding: {}", e)))?;

        let auth = SnowflakeAuth::new(&account, &user, &der)?;

        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect::<Vec<_>>())
            .unwrap_or_default();
        let database = (!segments.is_empty()).then(|| segments.remove(0));
        let schema = (!segments.is_empty()).then(|| segments.remove(0));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| MvrError::connect(e.to_string(), "building snowflake http client"))?;

        info!(account = %account, "prepared snowflake SQL API client");

        Ok(Self {
            client,
            base_url: format!("https://{}.snowflakecomputing.com", account.to_lowercase()),
            auth: Mutex::new(auth),
            database,
            schema,
            warehouse: query.get("warehouse").cloned(),
            role: query.get("role").cloned(),
        })
    }

    fn bearer_token(&self) -> Result<String> {
        self.auth
            .lock()
            .expect("snowflake auth poisoned")
            .token()
    }

    fn statement_request(&self, sql: &str, spec: Option<&StreamSpec>) -> StatementRequest {
        let bindings = spec
            .map(|spec| {
                build_bind_values(&spec.params)
                    .into_iter()
                    .enumerate()
                    .map(|(i, (_, value))| {
                        let type_name = match &value {
                            BindValue::Int(_) => "FIXED",
                            BindValue::Bool(_) => "BOOLEAN",
                            BindValue::Text(_) => "TEXT",
                        };
                        (
                            (i + 1).to_string(),
                            Binding {
                                type_name: type_name.to_string(),
                                value: match value {
                                    BindValue::Text(s) => s,
                                    BindValue::Int(i) => i.to_string(),
                                    BindValue::Bool(b) => b.to_string(),
                                },
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        StatementRequest {
            statement: sql.to_string(),
            timeout: STATEMENT_TIMEOUT_SECS,
            database: self.database.clone(),
            schema: self.schema.clone(),
            warehouse: self.warehouse.clone(),
            role: self.role.clone(),
            bindings,
        }
    }

    async fn submit(&self, request: &StatementRequest) -> Result<StatementResponse> {
        let url = format!("{}/api/v2/statements", self.base_url);
        let mut backoff = Duration::from_secs(1);

        for attempt in 0..=MAX_RETRIES {
            let token = self.bearer_token()?;
            let response = self
                .client
                .post(&url)
                .bearer_auth(&token)
                .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
                .header("Accept", "application/json")
                .json(request)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let mut parsed: StatementResponse = resp
                        .json()
                        .await
                        .map_err(|e| MvrError::Stream(format!("snowflake response: {}", e)))?;
                    if parsed.result_set_meta_data.is_none() {
                        if let Some(handle) = parsed.statement_handle.clone() {
                            parsed = self.poll_statement(&handle).await?;
                        }
                    }
                    return Ok(parsed);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let retryable =
                        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504);
                    if retryable && attempt < MAX_RETRIES {
                        warn!(%status, attempt, "snowflake API returned retryable error");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    return Err(MvrError::Stream(format!(
                        "snowflake API error ({}): {}",
                        status, body
                    )));
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        warn!(error = %e, attempt, "snowflake request failed, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    return Err(MvrError::connect(e.to_string(), "snowflake statement"));
                }
            }
        }
        unreachable!("retry loop returns on final attempt")
    }

    /// Poll an async statement handle until the result set is ready.
    async fn poll_statement(&self, handle: &str) -> Result<StatementResponse> {
        let url = format!("{}/api/v2/statements/{}", self.base_url, handle);
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let token = self.bearer_token()?;
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
                .send()
                .await
                .map_err(|e| MvrError::Stream(e.to_string()))?;
            if resp.status().as_u16() == 202 {
                continue;
            }
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(MvrError::Stream(format!(
                    "snowflake statement {} failed ({}): {}",
                    handle, status, body
                )));
            }
            return resp
                .json()
                .await
                .map_err(|e| MvrError::Stream(format!("snowflake response: {}", e)));
        }
        Err(MvrError::Stream(format!(
            "snowflake statement {} did not complete",
            handle
        )))
    }

    async fn fetch_partition(
        &self,
        handle: &str,
        partition: usize,
    ) -> Result<Vec<Vec<Option<String>>>> {
        let url = format!(
            "{}/api/v2/statements/{}?partition={}",
            self.base_url, handle, partition
        );
        let token = self.bearer_token()?;
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .send()
            .await
            .map_err(|e| MvrError::Stream(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MvrError::Stream(format!(
                "snowflake partition {} fetch failed ({}): {}",
                partition, status, body
            )));
        }
        let parsed: StatementResponse = resp
            .json()
            .await
            .map_err(|e| MvrError::Stream(format!("snowflake response: {}", e)))?;
        Ok(parsed.data.unwrap_or_default())
    }
}

fn columns_from_row_type(row_type: &[RowType]) -> Vec<Column> {
    row_type
        .iter()
        .enumerate()
        .map(|(i, rt)| {
            let normalized = snowflake_to_canonical(
                &rt.type_name,
                rt.length.unwrap_or(0),
                rt.precision.unwrap_or(0),
                rt.scale.unwrap_or(0),
            );
            let mut column = Column::new(&rt.name, normalized.canonical, i as i32);
            column.driver_type = rt.type_name.to_uppercase();
            column.precision = normalized.precision;
            column.scale = normalized.scale;
            column.length = rt.length.unwrap_or(0);
            column.nullable = rt.nullable;
            column
        })
        .collect()
}

/// Parse the API's `<epoch>.<fraction>` timestamp encoding.
fn parse_epoch_fraction(raw: &str) -> Option<(i64, u32)> {
    let mut parts = raw.splitn(2, '.');
    let secs: i64 = parts.next()?.parse().ok()?;
    let nanos = match parts.next() {
        Some(frac) => {
            let padded = format!("{:0<9}", frac);
            padded[..9].parse().ok()?
        }
        None => 0,
    };
    Some((secs, nanos))
}

fn convert_cell(raw: Option<&str>, col: &Column) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };

    match col.canonical_type {
        CanonicalType::Boolean => Value::Bool(matches!(raw, "true" | "TRUE" | "1")),
        CanonicalType::SmallInt | CanonicalType::Integer | CanonicalType::BigInt => raw
            .parse::<i64>()
            .map(Value::I64)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        CanonicalType::Real | CanonicalType::Double => raw
            .parse::<f64>()
            .map(Value::F64)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        CanonicalType::Numeric => rust_decimal::Decimal::from_str_exact(raw)
            .map(Value::Decimal)
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
        CanonicalType::Date => raw
            .parse::<i64>()
            .ok()
            .and_then(|days| {
                chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                    .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days)))
            })
            .map(Value::Date)
            .unwrap_or_else(|| Value::Text(raw.to_string())),
        CanonicalType::Timestamp => parse_epoch_fraction(raw)
            .and_then(|(secs, nanos)| chrono::DateTime::from_timestamp(secs, nanos))
            .map(|dt| Value::DateTime(dt.naive_utc()))
            .unwrap_or_else(|| Value::Text(raw.to_string())),
        CanonicalType::TimestampTz => {
            // `<epoch>.<fraction> <offset>` where offset is minutes + 1440
            let mut parts = raw.split_whitespace();
            let epoch = parts.next().unwrap_or_default();
            let offset_minutes: i32 = parts
                .next()
                .and_then(|s| s.parse::<i32>().ok())
                .map(|m| m - 1440)
                .unwrap_or(0);
            parse_epoch_fraction(epoch)
                .and_then(|(secs, nanos)| chrono::DateTime::from_timestamp(secs, nanos))
                .and_then(|dt| {
                    chrono::FixedOffset::east_opt(offset_minutes * 60)
                        .map(|tz| Value::DateTimeTz(dt.with_timezone(&tz)))
                })
                .unwrap_or_else(|| Value::Text(raw.to_string()))
        }
        CanonicalType::Json | CanonicalType::Jsonb | CanonicalType::TextArray => {
            serde_json::from_str(raw)
                .map(Value::Json)
                .unwrap_or_else(|_| Value::Text(raw.to_string()))
        }
        CanonicalType::Bytes => Value::Bytes(decode_hex(raw)),
        _ => Value::Text(raw.to_string()),
    }
}

/// Binary columns arrive hex-encoded.
fn decode_hex(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    let mut i = 0;
    while i + 1 < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16);
        let lo = (bytes[i + 1] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push(((hi << 4) | lo) as u8),
            _ => return raw.as_bytes().to_vec(),
        }
        i += 2;
    }
    out
}

#[async_trait]
impl DbReader for SnowflakeReader {
    async fn preflight(&self, spec: &StreamSpec) -> Result<DataStream> {
        let wrapped = format!("SELECT * FROM ({}) LIMIT 0 OFFSET 0", spec.sql);
        debug!(sql = %wrapped, "preflight");

        let request = self.statement_request(&wrapped, Some(spec));
        let response = self
            .submit(&request)
            .await
            .map_err(|e| MvrError::Preflight(e.to_string()))?;

        let meta = response.result_set_meta_data.ok_or_else(|| {
            MvrError::Preflight("snowflake response carried no result metadata".to_string())
        })?;

        let columns = columns_from_row_type(&meta.row_type);
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
        // reqwest pools close as the client drops
    }
}

impl SnowflakeReader {
    async fn stream_inner(
        &self,
        cancel: &CancellationToken,
        ds: &Arc<DataStream>,
        spec: &StreamSpec,
    ) -> Result<()> {
        debug!(sql = %spec.sql, "executing data stream");
        let request = self.statement_request(&spec.sql, Some(spec));
        let response = self.submit(&request).await?;

        let meta = response.result_set_meta_data.as_ref();
        let partition_count = meta.map(|m| m.partition_info.len()).unwrap_or(0);
        let handle = response.statement_handle.clone();

        let sender = ds.sender();
        let mut batch = Batch::with_capacity(ds.batch_size);

        // first partition rides on the statement response
        let mut pending = response.data.unwrap_or_default();
        let mut next_partition = 1;

        loop {
            for row in pending.drain(..) {
                if cancel.is_cancelled() {
                    return Err(MvrError::Cancelled);
                }
                let mut values = Vec::with_capacity(ds.columns.len());
                for (idx, col) in ds.columns.iter().enumerate() {
                    values.push(convert_cell(row.get(idx).and_then(|v| v.as_deref()), col));
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

            if next_partition >= partition_count.max(1) {
                break;
            }
            if cancel.is_cancelled() {
                return Err(MvrError::Cancelled);
            }
            let handle = handle.as_ref().ok_or_else(|| {
                MvrError::Stream("partitioned result without a statement handle".to_string())
            })?;
            pending = self.fetch_partition(handle, next_partition).await?;
            next_partition += 1;
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
impl DbExec for SnowflakeReader {
    async fn execute(&self, sql: &str) -> Result<String> {
        let request = self.statement_request(sql, None);
        let response = self.submit(&request).await?;
        Ok(response
            .message
            .unwrap_or_else(|| "Statement executed successfully.".to_string()))
    }
}
