use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;

/// Shared view of the JSON configuration tree.
///
/// Values are addressed by dotted paths (`mqtt.pubTopics.events.qos`).
/// Overrides persisted in the settings store are applied on top of the file
/// before any component reads the tree. Reloads bump a generation counter on
/// a watch channel; owners of derived state (whitelist, sampler, periodicity)
/// recompute when they observe a change.
#[derive(Clone)]
pub struct Config {
    inner: Arc<RwLock<Value>>,
    path: Arc<PathBuf>,
    reload_tx: Arc<watch::Sender<u64>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let tree = read_tree(path)?;
        let (reload_tx, _) = watch::channel(0);
        Ok(Config {
            inner: Arc::new(RwLock::new(tree)),
            path: Arc::new(path.to_owned()),
            reload_tx: Arc::new(reload_tx),
        })
    }

    /// Builds a config from an in-memory tree. Used by tests and embedders
    /// that manage the file themselves.
    pub fn from_value(tree: Value) -> Config {
        let (reload_tx, _) = watch::channel(0);
        Config {
            inner: Arc::new(RwLock::new(tree)),
            path: Arc::new(PathBuf::new()),
            reload_tx: Arc::new(reload_tx),
        }
    }

    /// Re-reads the configuration file and notifies subscribers.
    pub fn reload(&self) -> Result<()> {
        let tree = read_tree(&self.path)?;
        *self.inner.write().expect("config lock poisoned") = tree;
        self.notify_updated();
        Ok(())
    }

    /// Applies a single dotted-path override. Values that parse as JSON are
    /// stored typed; everything else is stored as a string.
    pub fn apply_override(&self, dotted: &str, raw: &str) {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
        let mut tree = self.inner.write().expect("config lock poisoned");
        set_path(&mut tree, dotted, value);
    }

    pub fn notify_updated(&self) {
        self.reload_tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.reload_tx.subscribe()
    }

    pub fn get_json(&self, dotted: &str) -> Value {
        let tree = self.inner.read().expect("config lock poisoned");
        lookup(&tree, dotted).cloned().unwrap_or(Value::Null)
    }

    pub fn get_string(&self, dotted: &str, default: &str) -> String {
        match self.get_json(dotted) {
            Value::String(s) => s,
            _ => default.to_owned(),
        }
    }

    pub fn get_i64(&self, dotted: &str, default: i64) -> i64 {
        self.get_json(dotted).as_i64().unwrap_or(default)
    }

    pub fn get_bool(&self, dotted: &str, default: bool) -> bool {
        self.get_json(dotted).as_bool().unwrap_or(default)
    }

    pub fn get_string_list(&self, dotted: &str) -> Vec<String> {
        match self.get_json(dotted) {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn read_tree(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read configuration file {path:?}"))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Configuration file {path:?} is not valid JSON"))
}

fn lookup<'a>(tree: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = tree;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_path(tree: &mut Value, dotted: &str, value: Value) {
    let mut current = tree;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            if let Value::Object(map) = current {
                map.insert(part.to_owned(), value);
            }
            return;
        }
        if !current.get(part).map(Value::is_object).unwrap_or(false) {
            if let Value::Object(map) = current {
                map.insert(part.to_owned(), Value::Object(Default::default()));
            } else {
                return;
            }
        }
        current = current
            .get_mut(part)
            .expect("intermediate node inserted above");
    }
}
