use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use cdnrelay_transfer::DeletionRecord;
use tokio::sync::RwLock;

use crate::ScheduleStore;

/// Process-local schedule store. Does not persist custom filename mappings.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn save(&self, record: &DeletionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.file_name.clone(), record.delete_at_ms);
        Ok(())
    }

    async fn get(&self, file_name: &str) -> Result<Option<DeletionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(file_name)
            .map(|delete_at_ms| DeletionRecord {
                file_name: file_name.to_string(),
                delete_at_ms: *delete_at_ms,
            }))
    }

    async fn delete(&self, file_name: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(file_name).is_some())
    }

    async fn find_expired(&self, before_ms: i64) -> Result<Vec<DeletionRecord>> {
        let mut expired: Vec<DeletionRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, delete_at_ms)| **delete_at_ms <= before_ms)
            .map(|(file_name, delete_at_ms)| DeletionRecord {
                file_name: file_name.clone(),
                delete_at_ms: *delete_at_ms,
            })
            .collect();
        expired.sort_by(|a, b| {
            a.delete_at_ms
                .cmp(&b.delete_at_ms)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(expired)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_keeps_one_record_per_name() {
        let store = MemoryStore::new();
        for at in [10, 20, 30] {
            store
                .save(&DeletionRecord {
                    file_name: "a.png".to_string(),
                    delete_at_ms: at,
                })
                .await
                .expect("save");
        }

        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.get("a.png").await.expect("get").map(|r| r.delete_at_ms),
            Some(30)
        );
    }

    #[tokio::test]
    async fn expired_records_come_back_soonest_first() {
        let store = MemoryStore::new();
        for (name, at) in [("z.png", 5), ("a.png", 50), ("m.png", 5)] {
            store
                .save(&DeletionRecord {
                    file_name: name.to_string(),
                    delete_at_ms: at,
                })
                .await
                .expect("save");
        }

        let names: Vec<_> = store
            .find_expired(10)
            .await
            .expect("expired")
            .into_iter()
            .map(|r| r.file_name)
            .collect();
        assert_eq!(names, vec!["m.png", "z.png"]);
    }
}
