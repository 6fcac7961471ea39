//! Core data model: canonical types, columns, values, params, streams.

pub mod column;
pub mod param;
pub mod stream;
pub mod types;
pub mod value;

pub use self::column::{override_columns, Column, ColumnMetadata, ColumnOverride};
pub use self::param::{build_bind_values, collect_mvr_vars, merge_env_params, BindValue, Param, Params};
pub use self::stream::DataStream;
pub use self::types::{
    mssql_to_canonical, snowflake_to_canonical, swap_uuid_fields, CanonicalType, NormalizedType,
};
pub use self::value::{Batch, Value};
