//! Reader over the `{cat, name, value}` triples of a stored configuration.
//!
//! Unknown or ill-typed values never abort a worker start: they fall back to
//! the default and produce a warning, which the worker writes to its module
//! log.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::ConfigEntry;

pub struct ConfigReader {
    values: HashMap<(String, String), Value>,
    warnings: Vec<String>,
}

impl ConfigReader {
    pub fn new(entries: &[ConfigEntry]) -> Self {
        let mut values = HashMap::new();
        for entry in entries {
            values.insert((entry.cat.clone(), entry.name.clone()), entry.value.clone());
        }
        Self {
            values,
            warnings: Vec::new(),
        }
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn take(&mut self, cat: &str, names: &[&str]) -> Option<(String, Value)> {
        for name in names {
            if let Some(value) = self.values.remove(&(cat.to_string(), name.to_string())) {
                return Some((format!("{cat}.{name}"), value));
            }
        }
        None
    }

    fn warn_type(&mut self, key: &str, expected: &str, value: &Value) {
        self.warnings
            .push(format!("ignored '{key}': expected {expected}, got {value}"));
    }

    pub fn bool(&mut self, cat: &str, name: &str, default: bool) -> bool {
        self.bool_alias(cat, &[name], default)
    }

    /// Boolean option under one of several accepted names (aliases).
    pub fn bool_alias(&mut self, cat: &str, names: &[&str], default: bool) -> bool {
        match self.take(cat, names) {
            Some((_, Value::Bool(b))) => b,
            Some((key, value)) => {
                self.warn_type(&key, "boolean", &value);
                default
            }
            None => default,
        }
    }

    pub fn u64(&mut self, cat: &str, name: &str, default: u64) -> u64 {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_u64() {
                Some(n) => n,
                None => {
                    self.warn_type(&key, "unsigned integer", &value);
                    default
                }
            },
            None => default,
        }
    }

    pub fn i64(&mut self, cat: &str, name: &str, default: i64) -> i64 {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_i64() {
                Some(n) => n,
                None => {
                    self.warn_type(&key, "integer", &value);
                    default
                }
            },
            None => default,
        }
    }

    pub fn string(&mut self, cat: &str, name: &str, default: &str) -> String {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_str() {
                Some(s) => s.to_string(),
                None => {
                    self.warn_type(&key, "string", &value);
                    default.to_string()
                }
            },
            None => default.to_string(),
        }
    }

    pub fn strings(&mut self, cat: &str, name: &str) -> Vec<String> {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_array() {
                Some(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                None => {
                    self.warn_type(&key, "array of strings", &value);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    pub fn u64s(&mut self, cat: &str, name: &str) -> Vec<u64> {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_array() {
                Some(items) => items.iter().filter_map(Value::as_u64).collect(),
                None => {
                    self.warn_type(&key, "array of unsigned integers", &value);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    pub fn i64s(&mut self, cat: &str, name: &str) -> Vec<i64> {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_array() {
                Some(items) => items.iter().filter_map(Value::as_i64).collect(),
                None => {
                    self.warn_type(&key, "array of integers", &value);
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    pub fn u64s_default(&mut self, cat: &str, name: &str, default: &[u64]) -> Vec<u64> {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_array() {
                Some(items) => items.iter().filter_map(Value::as_u64).collect(),
                None => {
                    self.warn_type(&key, "array of unsigned integers", &value);
                    default.to_vec()
                }
            },
            None => default.to_vec(),
        }
    }

    pub fn strings_default(&mut self, cat: &str, name: &str, default: &[&str]) -> Vec<String> {
        match self.take(cat, &[name]) {
            Some((key, value)) => match value.as_array() {
                Some(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                None => {
                    self.warn_type(&key, "array of strings", &value);
                    default.iter().map(|s| s.to_string()).collect()
                }
            },
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Warn about leftover keys in the given categories.
    pub fn warn_unknown(&mut self, cats: &[&str]) {
        let mut unknown: Vec<String> = self
            .values
            .keys()
            .filter(|(cat, _)| cats.contains(&cat.as_str()))
            .map(|(cat, name)| format!("{cat}.{name}"))
            .collect();
        unknown.sort();
        for key in unknown {
            self.warnings.push(format!("unknown configuration entry '{key}'"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<ConfigEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn reads_typed_values_with_defaults() {
        let entries = entries(
            r#"[
                {"cat":"crawler","name":"retries","value":2},
                {"cat":"crawler","name":"timing","value":true},
                {"cat":"crawler","name":"start","value":"/index.html"},
                {"cat":"crawler","name":"retry.http","value":[500,503]}
            ]"#,
        );
        let mut reader = ConfigReader::new(&entries);
        assert_eq!(reader.i64("crawler", "retries", -1), 2);
        assert!(reader.bool("crawler", "timing", false));
        assert_eq!(reader.string("crawler", "start", "/"), "/index.html");
        assert_eq!(reader.u64s("crawler", "retry.http"), vec![500, 503]);
        // absent key falls back
        assert_eq!(reader.u64("crawler", "lock", 300), 300);
        assert!(reader.take_warnings().is_empty());
    }

    #[test]
    fn type_mismatch_warns_and_defaults() {
        let entries = entries(r#"[{"cat":"crawler","name":"retries","value":"two"}]"#);
        let mut reader = ConfigReader::new(&entries);
        assert_eq!(reader.i64("crawler", "retries", -1), -1);
        assert_eq!(reader.take_warnings().len(), 1);
    }

    #[test]
    fn aliases_resolve_in_order() {
        let entries = entries(r#"[{"cat":"network","name":"proxy.tunnelling","value":true}]"#);
        let mut reader = ConfigReader::new(&entries);
        assert!(reader.bool_alias("network", &["proxyy.tunnelling", "proxy.tunnelling"], false));
    }

    #[test]
    fn unknown_keys_reported() {
        let entries = entries(r#"[{"cat":"crawler","name":"no.such.key","value":1}]"#);
        let mut reader = ConfigReader::new(&entries);
        reader.warn_unknown(&["crawler"]);
        assert_eq!(reader.take_warnings().len(), 1);
    }
}
