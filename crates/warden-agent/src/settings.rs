use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{Result, SupervisorError};

pub const CONSOLE_VISIBLE: &str = "console_visible";
pub const INSTALL_ROOT: &str = "install_root";

pub fn server_key(server_id: &str, field: &str) -> String {
    format!("server.{server_id}.{field}")
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Immediate child segment names under `prefix` (e.g. server ids under `server`).
    fn children(&self, prefix: &str) -> Vec<String>;

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| parse_bool(&v))
            .unwrap_or(default)
    }
}

fn children_of<'a>(keys: impl Iterator<Item = &'a String>, prefix: &str) -> Vec<String> {
    let head = format!("{prefix}.");
    let mut out = BTreeSet::new();
    for k in keys {
        if let Some(rest) = k.strip_prefix(&head)
            && let Some(seg) = rest.split('.').next()
            && !seg.is_empty()
        {
            out.insert(seg.to_string());
        }
    }
    out.into_iter().collect()
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.values.write().insert(key.to_string(), value.to_string());
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn children(&self, prefix: &str) -> Vec<String> {
        children_of(self.values.read().keys(), prefix)
    }
}

/// Settings persisted as a TOML document. Nested tables map to dotted keys.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (k, v) in table {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            toml::Value::Table(t) => flatten(&key, t, out),
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|i| match i {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                out.insert(key, joined);
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

fn insert_path(table: &mut toml::Table, segs: &[&str], value: &str) {
    match segs {
        [] => {}
        [leaf] => {
            table.insert(leaf.to_string(), toml::Value::String(value.to_string()));
        }
        [head, rest @ ..] => {
            let entry = table
                .entry(head.to_string())
                .or_insert(toml::Value::Table(toml::Table::new()));
            if !entry.is_table() {
                *entry = toml::Value::Table(toml::Table::new());
            }
            if let toml::Value::Table(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

fn unflatten(values: &BTreeMap<String, String>) -> toml::Table {
    let mut root = toml::Table::new();
    for (key, value) in values {
        let segs: Vec<&str> = key.split('.').collect();
        insert_path(&mut root, &segs, value);
    }
    root
}

impl FileSettings {
    /// Loads `path`; a missing file yields empty settings.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.into();
        let mut values = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let table: toml::Table = raw
                    .parse()
                    .with_context(|| format!("parse settings {}", path.display()))?;
                flatten("", &table, &mut values);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("read settings {}", path.display()));
            }
        }
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> std::io::Result<()> {
        let doc = toml::to_string_pretty(&unflatten(values)).map_err(std::io::Error::other)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, doc.as_bytes())?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values).map_err(|e| {
            SupervisorError::Settings(format!("persist {}: {e}", self.path.display()))
        })
    }

    fn children(&self, prefix: &str) -> Vec<String> {
        children_of(self.values.read().keys(), prefix)
    }
}
