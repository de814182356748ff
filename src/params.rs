//! Typed parameter bag
//!
//! Requests and probe calls carry loosely-typed parameters (`@address`,
//! `snmp.version`, ...). `Params` keeps them as JSON values and offers
//! accessors that convert on read. Numeric accessors accept either JSON
//! numbers or numeric strings, since parameters frequently arrive from query
//! strings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("'{0}' is required.")]
    NotFound(String),

    #[error("'{key}' isn't a {expected}.")]
    TypeMismatch { key: String, expected: &'static str },
}

pub type ParamResult<T> = Result<T, ParamError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn require(&self, key: &str) -> ParamResult<&Value> {
        self.get(key).ok_or_else(|| ParamError::NotFound(key.to_string()))
    }

    pub fn get_string(&self, key: &str) -> ParamResult<String> {
        match self.require(key)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(mismatch(key, "string")),
        }
    }

    /// Missing and empty values both fall back to `default`
    pub fn get_string_with_default(&self, key: &str, default: &str) -> String {
        match self.get_string(key) {
            Ok(s) if !s.is_empty() => s,
            _ => default.to_string(),
        }
    }

    pub fn get_i64(&self, key: &str) -> ParamResult<i64> {
        match self.require(key)? {
            Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(key, "integer")),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch(key, "integer")),
            _ => Err(mismatch(key, "integer")),
        }
    }

    pub fn get_i32_with_default(&self, key: &str, default: i32) -> ParamResult<i32> {
        match self.get_i64(key) {
            Ok(v) => i32::try_from(v).map_err(|_| mismatch(key, "32-bit integer")),
            Err(ParamError::NotFound(_)) => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub fn get_u64_with_default(&self, key: &str, default: u64) -> ParamResult<u64> {
        match self.get_i64(key) {
            Ok(v) => u64::try_from(v).map_err(|_| mismatch(key, "unsigned integer")),
            Err(ParamError::NotFound(_)) => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub fn get_bool_with_default(&self, key: &str, default: bool) -> ParamResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(mismatch(key, "boolean")),
            },
            Some(_) => Err(mismatch(key, "boolean")),
        }
    }

    /// Seconds given as a number, or a string with an `ms`/`s`/`m` suffix
    pub fn get_duration_with_default(&self, key: &str, default: Duration) -> ParamResult<Duration> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| mismatch(key, "duration")),
            Some(Value::String(s)) => parse_duration(s).ok_or_else(|| mismatch(key, "duration")),
            Some(_) => Err(mismatch(key, "duration")),
        }
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

fn mismatch(key: &str, expected: &'static str) -> ParamError {
    ParamError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.trim().parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs);
    }
    s.parse().ok().map(Duration::from_secs)
}
