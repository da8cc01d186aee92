//! Durable key/value state bridging Kubernetes pods and remote flows.
//!
//! All entries of one node live in a single persisted record. Every operation
//! loads the record (and saves it back for writes) while holding one lock, so
//! operations on a bridge are serialized and a freshly opened bridge sees
//! everything a previous process wrote.
//!
//! Values are stored as tagged, versioned JSON envelopes. A value written by
//! another type or another format version is reported as corruption instead of
//! being decoded into garbage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Types that can be stored in a [`StateBridge`].
pub trait Versioned {
    /// Type tag written into every envelope
    const KIND: &'static str;
    /// Bumped whenever the stored layout changes incompatibly
    const VERSION: u32;
}

/// Snapshot of the persisted record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub entries: BTreeMap<String, Vec<u8>>,
    /// Opaque version of the record as loaded, used as a write precondition
    pub version: Option<String>,
}

/// Persistence for the single record behind a [`StateBridge`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load the record, creating an empty one if it does not exist yet.
    async fn load(&self) -> Result<Record>;

    /// Replace the record. Fails with [`Error::Conflict`] if it changed since
    /// `record` was loaded.
    async fn save(&self, record: Record) -> Result<()>;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    kind: &'a str,
    version: u32,
    value: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    kind: String,
    version: u32,
    value: serde_json::Value,
}

fn encode<T: Versioned + Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&EnvelopeRef {
        kind: T::KIND,
        version: T::VERSION,
        value,
    })?)
}

fn decode<T: Versioned + DeserializeOwned>(key: &str, data: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(data)
        .map_err(|e| Error::corruption(format!("entry {}: {}", key, e)))?;
    if envelope.kind != T::KIND || envelope.version != T::VERSION {
        return Err(Error::corruption(format!(
            "entry {} holds {} v{}, expected {} v{}",
            key,
            envelope.kind,
            envelope.version,
            T::KIND,
            T::VERSION
        )));
    }
    serde_json::from_value(envelope.value)
        .map_err(|e| Error::corruption(format!("entry {}: {}", key, e)))
}

/// Serialized key/value store over a [`RecordStore`].
pub struct StateBridge {
    store: Arc<dyn RecordStore>,
    lock: Mutex<()>,
}

impl StateBridge {
    /// Open the bridge, creating the backing record if needed.
    pub async fn open(store: Arc<dyn RecordStore>) -> Result<Self> {
        let record = store.load().await?;
        debug!("opened state bridge with {} entries", record.entries.len());
        Ok(Self {
            store,
            lock: Mutex::new(()),
        })
    }

    /// Value stored under `key`, or `None` if there is none.
    pub async fn get<T: Versioned + DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let _guard = self.lock.lock().await;
        let record = self.store.load().await?;
        match record.entries.get(key) {
            Some(data) => decode(key, data).map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous value.
    pub async fn put<T: Versioned + Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let data = encode(value)?;
        let _guard = self.lock.lock().await;
        let mut record = self.store.load().await?;
        record.entries.insert(key.to_string(), data);
        self.store.save(record).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut record = self.store.load().await?;
        if record.entries.remove(key).is_none() {
            return Ok(());
        }
        self.store.save(record).await
    }

    pub async fn keys(&self) -> Result<BTreeSet<String>> {
        let _guard = self.lock.lock().await;
        let record = self.store.load().await?;
        Ok(record.entries.into_keys().collect())
    }

    pub async fn size(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let record = self.store.load().await?;
        Ok(record.entries.len())
    }

    /// Every entry decoded, in key order, from a single load.
    pub async fn values<T: Versioned + DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let _guard = self.lock.lock().await;
        let record = self.store.load().await?;
        record
            .entries
            .iter()
            .map(|(key, data)| decode(key, data).map(|value| (key.clone(), value)))
            .collect()
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    [("app.kubernetes.io/managed-by".to_string(), "fog-kubelet".to_string())]
        .into_iter()
        .collect()
}

/// [`RecordStore`] backed by the `binaryData` of a ConfigMap.
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    async fn create(&self) -> Result<ConfigMap> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(managed_labels()),
                ..Default::default()
            },
            binary_data: Some(BTreeMap::new()),
            ..Default::default()
        };
        match self.api.create(&PostParams::default(), &config_map).await {
            Ok(created) => {
                info!("created state config map {}", self.name);
                Ok(created)
            }
            Err(e) => match Error::from_kube(e, &format!("configmap/{}", self.name)) {
                // Lost a creation race; whoever won created the same empty map.
                Error::AlreadyExists(_) => Ok(self.api.get(&self.name).await?),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl RecordStore for ConfigMapStore {
    async fn load(&self) -> Result<Record> {
        let config_map = match self.api.get_opt(&self.name).await? {
            Some(config_map) => config_map,
            None => self.create().await?,
        };
        let entries = config_map
            .binary_data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, ByteString(data))| (key, data))
            .collect();
        Ok(Record {
            entries,
            version: config_map.metadata.resource_version,
        })
    }

    async fn save(&self, record: Record) -> Result<()> {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(managed_labels()),
                resource_version: record.version,
                ..Default::default()
            },
            binary_data: Some(
                record
                    .entries
                    .into_iter()
                    .map(|(key, data)| (key, ByteString(data)))
                    .collect(),
            ),
            ..Default::default()
        };
        self.api
            .replace(&self.name, &PostParams::default(), &config_map)
            .await
            .map_err(|e| Error::from_kube(e, &format!("configmap/{}", self.name)))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Association {
        flow_id: i64,
        pod: String,
    }

    impl Versioned for Association {
        const KIND: &'static str = "Association";
        const VERSION: u32 = 1;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other {
        flow_id: i64,
    }

    impl Versioned for Other {
        const KIND: &'static str = "Other";
        const VERSION: u32 = 1;
    }

    async fn bridge(store: &MemoryStore) -> StateBridge {
        StateBridge::open(Arc::new(store.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_survives_reopen() {
        let store = MemoryStore::default();
        let value = Association {
            flow_id: 12,
            pod: "app1".to_string(),
        };
        bridge(&store).await.put("app1", &value).await.unwrap();

        let reopened = bridge(&store).await;
        assert_eq!(reopened.get::<Association>("app1").await.unwrap(), Some(value));
        assert_eq!(reopened.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_previous_value() {
        let store = MemoryStore::default();
        let bridge = bridge(&store).await;
        for flow_id in [1, 2] {
            let value = Association {
                flow_id,
                pod: "app1".to_string(),
            };
            bridge.put("app1", &value).await.unwrap();
        }
        let stored: Association = bridge.get("app1").await.unwrap().unwrap();
        assert_eq!(stored.flow_id, 2);
        assert_eq!(bridge.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_absent_not_an_error() {
        let store = MemoryStore::default();
        assert_eq!(bridge(&store).await.get::<Association>("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_then_get_is_absent() {
        let store = MemoryStore::default();
        let bridge = bridge(&store).await;
        let value = Association {
            flow_id: 3,
            pod: "app2".to_string(),
        };
        bridge.put("app2", &value).await.unwrap();
        bridge.remove("app2").await.unwrap();
        assert_eq!(bridge.get::<Association>("app2").await.unwrap(), None);
        assert!(bridge.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_a_missing_key_does_not_write() {
        let store = MemoryStore::default();
        bridge(&store).await.remove("ghost").await.unwrap();
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test]
    async fn keys_lists_every_entry() {
        let store = MemoryStore::default();
        let bridge = bridge(&store).await;
        for name in ["b", "a"] {
            let value = Association {
                flow_id: 1,
                pod: name.to_string(),
            };
            bridge.put(name, &value).await.unwrap();
        }
        let keys: Vec<_> = bridge.keys().await.unwrap().into_iter().collect();
        assert_eq!(keys, vec!["a", "b"]);

        let values = bridge.values::<Association>().await.unwrap();
        assert_eq!(values[0].1.pod, "a");
    }

    #[tokio::test]
    async fn garbage_is_reported_as_corruption() {
        let store = MemoryStore::default();
        store.insert_raw("bad", b"\x00\x01gob");
        let value = Association {
            flow_id: 5,
            pod: "good".to_string(),
        };
        let bridge = bridge(&store).await;
        bridge.put("good", &value).await.unwrap();

        let err = bridge.get::<Association>("bad").await.unwrap_err();
        assert!(matches!(err, Error::Corruption(_)), "unexpected error: {}", err);
        // the rest of the record is still readable
        assert_eq!(bridge.get::<Association>("good").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn entry_of_another_kind_is_corruption() {
        let store = MemoryStore::default();
        let bridge = bridge(&store).await;
        bridge.put("x", &Other { flow_id: 1 }).await.unwrap();
        assert!(matches!(
            bridge.get::<Association>("x").await,
            Err(Error::Corruption(_))
        ));
    }
}
