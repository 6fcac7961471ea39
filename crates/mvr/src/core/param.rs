//! Ordered bind parameters with per-driver placeholder conventions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single bind parameter as declared in config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Param {
    #[serde(default)]
    pub value: String,

    /// Declared type; empty means TEXT.
    #[serde(rename = "type", default)]
    pub type_name: String,
}

/// Parameters keyed by position key.
///
/// The BTreeMap keeps keys in lexicographic order, which is the binding
/// order for positional drivers ($n for PostgreSQL, ? for Snowflake).
pub type Params = BTreeMap<String, Param>;

/// A parameter coerced to its bind type.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl BindValue {
    pub fn as_json(&self) -> serde_json::Value {
        match self {
            BindValue::Text(s) => serde_json::Value::String(s.clone()),
            BindValue::Int(i) => serde_json::Value::String(i.to_string()),
            BindValue::Bool(b) => serde_json::Value::String(b.to_string()),
        }
    }
}

/// Coerce declared params into typed bind values, in key-sort order.
///
/// TEXT and empty declarations pass through as strings; INT2/INT4/INT8
/// parse as 64-bit integers (unparseable values bind as 0, matching the
/// lenient cast the original tool applied); BOOLEAN accepts the usual
/// true/1/yes spellings; anything else passes through as a string.
pub fn build_bind_values(params: &Params) -> Vec<(String, BindValue)> {
    params
        .iter()
        .map(|(key, param)| {
            let value = match param.type_name.to_uppercase().as_str() {
                "" | "TEXT" => BindValue::Text(param.value.clone()),
                "INT2" | "INT4" | "INT8" => {
                    BindValue::Int(param.value.trim().parse::<i64>().unwrap_or(0))
                }
                "BOOLEAN" => BindValue::Bool(matches!(
                    param.value.trim().to_lowercase().as_str(),
                    "true" | "t" | "1" | "yes" | "y"
                )),
                _ => BindValue::Text(param.value.clone()),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Merge `MVR_PARAM_<KEY>` environment values into the declared params.
///
/// An existing key keeps its declared type and takes the env value; a new
/// key is added as TEXT.
pub fn merge_env_params(params: &mut Params, env: &BTreeMap<String, String>) {
    for (key, value) in env {
        match params.get_mut(key) {
            Some(param) => {
                param.value = value.clone();
                if param.type_name.is_empty() {
                    param.type_name = "TEXT".to_string();
                }
            }
            None => {
                params.insert(
                    key.clone(),
                    Param {
                        value: value.clone(),
                        type_name: "TEXT".to_string(),
                    },
                );
            }
        }
    }
}

/// Collect `MVR_<PREFIX>_*` environment variables, stripped of the prefix.
pub fn collect_mvr_vars(prefix: &str) -> BTreeMap<String, String> {
    let full_prefix = format!("MVR_{}_", prefix);
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&full_prefix)
                .map(|k| (k.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(value: &str, ty: &str) -> Param {
        Param {
            value: value.into(),
            type_name: ty.into(),
        }
    }

    #[test]
    fn test_lexicographic_order() {
        let mut params = Params::new();
        params.insert("$3".into(), param("c", ""));
        params.insert("$2".into(), param("b", ""));
        params.insert("$4".into(), param("d", ""));
        let bound = build_bind_values(&params);
        let keys: Vec<&str> = bound.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["$2", "$3", "$4"]);
    }

    #[test]
    fn test_typed_coercion() {
        let mut params = Params::new();
        params.insert("a".into(), param("42", "INT8"));
        params.insert("b".into(), param("true", "BOOLEAN"));
        params.insert("c".into(), param("plain", ""));
        params.insert("d".into(), param("1.5", "FLOAT8"));
        let bound = build_bind_values(&params);
        assert_eq!(bound[0].1, BindValue::Int(42));
        assert_eq!(bound[1].1, BindValue::Bool(true));
        assert_eq!(bound[2].1, BindValue::Text("plain".into()));
        assert_eq!(bound[3].1, BindValue::Text("1.5".into()));
    }

    #[test]
    fn test_env_merge_keeps_declared_type() {
        let mut params = Params::new();
        params.insert("start".into(), param("2020-01-01", "TEXT"));
        params.insert("limit".into(), param("10", "INT4"));

        let mut env = BTreeMap::new();
        env.insert("limit".to_string(), "50".to_string());
        env.insert("extra".to_string(), "hello".to_string());

        merge_env_params(&mut params, &env);

        assert_eq!(params["limit"].value, "50");
        assert_eq!(params["limit"].type_name, "INT4");
        assert_eq!(params["extra"].type_name, "TEXT");
        assert_eq!(params["start"].value, "2020-01-01");
    }
}
