use super::JobConfig;
use crate::error::{ConfigError, ConfigResult};
use serde_json::{Number, Value};
use std::str::FromStr;

/// Fields whose value is a free-form map, so overrides may add new keys.
const MAP_FIELDS: &[&str] = &["export.paths"];

/// A single `dotted.key=value` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub key: String,
    pub value: String,
}

impl Override {
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(ConfigError::Override {
                key: raw.to_string(),
                message: "expected `dotted.key=value`".to_string(),
            });
        };
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(ConfigError::Override { key: key.to_string(), message: "malformed key".to_string() });
        }
        Ok(Self { key: key.to_string(), value: value.trim().to_string() })
    }
}

impl FromStr for Override {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// How a raw value is read when the field it replaces is currently unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unset {
    /// Parse as JSON, so `3` becomes a number and `true` a boolean.
    Json,
    /// Take the raw text as a string.
    Literal,
}

/// Apply overrides on top of `base`, returning a new config.
///
/// Each override replaces exactly one leaf; the new value is coerced to the type of
/// the field it replaces. A literal `null` clears an optional field. Unknown keys
/// and type mismatches are rejected.
pub fn merge(base: &JobConfig, overrides: &[Override]) -> ConfigResult<JobConfig> {
    let mut merged = base.clone();

    for item in overrides {
        merged = match apply(&merged, item, Unset::Json) {
            Ok(config) => config,
            // An unset field gives no type hint; `2024` may be meant as a string.
            Err(err) => apply(&merged, item, Unset::Literal).map_err(|_| err)?,
        };
        tracing::info!(key = %item.key, value = %item.value, "override applied");
    }

    Ok(merged)
}

fn apply(config: &JobConfig, item: &Override, unset: Unset) -> ConfigResult<JobConfig> {
    let mut tree = serde_json::to_value(config)
        .map_err(|e| ConfigError::Override { key: item.key.clone(), message: e.to_string() })?;
    set_leaf(&mut tree, item, unset)?;
    serde_json::from_value(tree)
        .map_err(|e| ConfigError::Override { key: item.key.clone(), message: format!("type mismatch: {e}") })
}

fn set_leaf(tree: &mut Value, item: &Override, unset: Unset) -> ConfigResult<()> {
    let segments: Vec<&str> = item.key.split('.').collect();
    let (leaf, parents) = segments.split_last().ok_or_else(|| unknown(item))?;

    let mut node = tree;
    for segment in parents {
        node = node.get_mut(*segment).ok_or_else(|| unknown(item))?;
    }

    let parent_path = parents.join(".");
    let Value::Object(map) = node else {
        return Err(unknown(item));
    };

    let value = match map.get(*leaf) {
        Some(Value::Object(_)) => {
            return Err(ConfigError::Override {
                key: item.key.clone(),
                message: "is a section, not a value".to_string(),
            });
        }
        Some(current) => coerce(current, &item.value, unset).map_err(|message| ConfigError::Override {
            key: item.key.clone(),
            message,
        })?,
        None if MAP_FIELDS.contains(&parent_path.as_str()) => Value::String(item.value.clone()),
        None => return Err(unknown(item)),
    };

    map.insert((*leaf).to_string(), value);
    Ok(())
}

fn unknown(item: &Override) -> ConfigError {
    ConfigError::Override { key: item.key.clone(), message: "unknown configuration key".to_string() }
}

/// Coerce a raw override string to the JSON type of the value it replaces.
fn coerce(current: &Value, raw: &str, unset: Unset) -> Result<Value, String> {
    if raw == "null" {
        return Ok(Value::Null);
    }
    match current {
        Value::Bool(_) => parse_bool(raw).map(Value::Bool).ok_or_else(|| format!("expected a boolean, got `{raw}`")),
        Value::Number(n) if n.is_u64() => raw
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| format!("expected a non-negative integer, got `{raw}`")),
        Value::Number(n) if n.is_i64() => {
            raw.parse::<i64>().map(Value::from).map_err(|_| format!("expected an integer, got `{raw}`"))
        }
        Value::Number(_) => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected a number, got `{raw}`")),
        Value::String(_) => Ok(Value::String(unquote(raw).to_string())),
        Value::Array(_) => parse_list(raw),
        Value::Null if unset == Unset::Json => {
            Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(unquote(raw).to_string())))
        }
        Value::Null => Ok(Value::String(unquote(raw).to_string())),
        Value::Object(_) => Err("is a section, not a value".to_string()),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_list(raw: &str) -> Result<Value, String> {
    if raw.starts_with('[') {
        let value: Value = serde_json::from_str(raw).map_err(|e| format!("invalid list: {e}"))?;
        return if value.is_array() { Ok(value) } else { Err("expected a list".to_string()) };
    }
    Ok(Value::Array(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(unquote(s).to_string()))
            .collect(),
    ))
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(raw)
}
