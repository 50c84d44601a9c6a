//! Persistence port.
//!
//! A flat key-value map of JSON values.  Writes merge into the existing map
//! key by key (last write wins); no transactional coupling between keys.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

/// Persisted keys.  These names are part of the on-disk format.
pub mod keys {
    pub const USER_ID: &str = "userId";
    pub const ALGO_TYPE: &str = "algoType";
    pub const SIDEBAR_POS: &str = "sidebarPos";
    pub const LISTENING_TIME: &str = "listeningTime";
    pub const AUTOPLAY_PENDING: &str = "autoplayPending";
    pub const CURRENT_TRACK_ID: &str = "currentTrackId";
    pub const SESSION_STATUS: &str = "sessionStatus";

    pub const ALL: [&str; 7] = [
        USER_ID,
        ALGO_TYPE,
        SIDEBAR_POS,
        LISTENING_TIME,
        AUTOPLAY_PENDING,
        CURRENT_TRACK_ID,
        SESSION_STATUS,
    ];
}

pub type Entries = Map<String, Value>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Values for the requested keys.  Absent keys are omitted.
    async fn load(&self, keys: &[&str]) -> anyhow::Result<Entries>;

    async fn save(&self, entries: Entries) -> anyhow::Result<()>;
}

/// Build an `Entries` map from `(key, value)` pairs.
pub fn entries<I>(pairs: I) -> Entries
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn select(map: &Entries, keys: &[&str]) -> Entries {
    keys.iter()
        .filter_map(|k| map.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// JSON object file, cached in memory and rewritten on every save.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<Entries>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Self {
        let cache = Self::read_file(&path);
        Self {
            path,
            cache: RwLock::new(cache),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_file(path: &PathBuf) -> Entries {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Entries::new(),
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("store: {:?} is not a JSON object, starting empty", path);
                Entries::new()
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load(&self, keys: &[&str]) -> anyhow::Result<Entries> {
        let cache = self.cache.read().await;
        Ok(select(&cache, keys))
    }

    async fn save(&self, entries: Entries) -> anyhow::Result<()> {
        let json = {
            let mut cache = self.cache.write().await;
            cache.extend(entries);
            serde_json::to_string_pretty(&*cache)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// In-process store with the same merge semantics.  Nothing touches disk.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Entries) -> Self {
        Self {
            map: RwLock::new(entries),
        }
    }

    pub async fn snapshot(&self) -> Entries {
        self.map.read().await.clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load(&self, keys: &[&str]) -> anyhow::Result<Entries> {
        let map = self.map.read().await;
        Ok(select(&map, keys))
    }

    async fn save(&self, entries: Entries) -> anyhow::Result<()> {
        self.map.write().await.extend(entries);
        Ok(())
    }
}
