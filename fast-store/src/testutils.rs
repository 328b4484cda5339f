//! In-memory fakes for the cache store and the relational store, used by
//! tests here and in the ingest router.

use crate::kv::{KvCache, KvError};
use crate::model::ApiKey;
use crate::store::{
    ConfigStore, LinkCursor, LinkPage, LinkRow, ObjectPage, ObjectRow, StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Map-of-maps cache fake. `publish` swaps a whole map under one lock, which
/// gives the same whole-generation visibility as the real store's rename.
#[derive(Default)]
pub struct InMemoryKv {
    maps: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryKv {
    /// Snapshot of one map, for assertions.
    pub fn dump(&self, map: &str) -> HashMap<String, String> {
        self.maps
            .lock()
            .unwrap()
            .get(map)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl KvCache for InMemoryKv {
    async fn hset(&self, map: &str, key: &str, value: &str) -> Result<(), KvError> {
        self.maps
            .lock()
            .unwrap()
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, map: &str, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .maps
            .lock()
            .unwrap()
            .get(map)
            .and_then(|fields| fields.get(key))
            .cloned())
    }

    async fn del(&self, map: &str) -> Result<(), KvError> {
        self.maps.lock().unwrap().remove(map);
        Ok(())
    }

    async fn publish(&self, temp_map: &str, final_map: &str) -> Result<(), KvError> {
        let mut maps = self.maps.lock().unwrap();
        match maps.remove(temp_map) {
            Some(fields) => {
                maps.insert(final_map.to_string(), fields);
            }
            None => {
                maps.remove(final_map);
            }
        }
        Ok(())
    }
}

/// Relational-store fake with the same keyset-pagination semantics as the
/// Postgres implementation.
#[derive(Default)]
pub struct MemConfigStore {
    objects: Vec<ObjectRow>,
    links: Vec<LinkRow>,
    backup_workspaces: HashSet<String>,
}

impl MemConfigStore {
    pub fn add_stream(
        &mut self,
        id: &str,
        workspace_id: &str,
        domains: &[&str],
        public_keys: Vec<ApiKey>,
        private_keys: Vec<ApiKey>,
    ) {
        let config = json!({
            "name": id,
            "domains": domains,
            "publicKeys": public_keys,
            "privateKeys": private_keys,
        });
        self.add_object(id, workspace_id, "stream", config);
    }

    pub fn add_destination(&mut self, id: &str, workspace_id: &str, config: Value) {
        self.add_object(id, workspace_id, "destination", config);
    }

    pub fn add_object(&mut self, id: &str, workspace_id: &str, object_type: &str, config: Value) {
        let now = Utc::now();
        self.objects.push(ObjectRow {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            object_type: object_type.to_string(),
            config,
            created_at: now,
            updated_at: now,
        });
        self.objects.sort_by(|a, b| a.id.cmp(&b.id));
    }

    /// Joins the link against previously added stream/destination objects.
    pub fn add_link(&mut self, id: &str, stream_id: &str, destination_id: &str, options: Value) {
        let stream = self
            .objects
            .iter()
            .find(|o| o.object_type == "stream" && o.id == stream_id)
            .expect("link references unknown stream")
            .clone();
        let destination = self
            .objects
            .iter()
            .find(|o| o.object_type == "destination" && o.id == destination_id)
            .expect("link references unknown destination")
            .clone();
        self.links.push(LinkRow {
            id: id.to_string(),
            workspace_id: stream.workspace_id.clone(),
            stream_id: stream_id.to_string(),
            destination_id: destination_id.to_string(),
            options,
            stream,
            destination,
        });
        self.links.sort_by(|a, b| {
            (a.stream_id.as_str(), a.destination_id.as_str())
                .cmp(&(b.stream_id.as_str(), b.destination_id.as_str()))
        });
    }

    pub fn enable_backup(&mut self, workspace_id: &str) {
        self.backup_workspaces.insert(workspace_id.to_string());
    }
}

#[async_trait]
impl ConfigStore for MemConfigStore {
    async fn fetch_objects_page(
        &self,
        object_type: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ObjectPage, StoreError> {
        let rows: Vec<ObjectRow> = self
            .objects
            .iter()
            .filter(|row| row.object_type == object_type)
            .filter(|row| cursor.is_none_or(|c| row.id.as_str() > c))
            .take(limit as usize)
            .cloned()
            .collect();
        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|row| row.id.clone())
        } else {
            None
        };
        Ok(ObjectPage { rows, next_cursor })
    }

    async fn fetch_links_page(
        &self,
        cursor: Option<&LinkCursor>,
        limit: u32,
    ) -> Result<LinkPage, StoreError> {
        let rows: Vec<LinkRow> = self
            .links
            .iter()
            .filter(|row| {
                cursor.is_none_or(|c| {
                    (row.stream_id.as_str(), row.destination_id.as_str())
                        > (c.stream_id.as_str(), c.destination_id.as_str())
                })
            })
            .take(limit as usize)
            .cloned()
            .collect();
        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|row| LinkCursor {
                stream_id: row.stream_id.clone(),
                destination_id: row.destination_id.clone(),
            })
        } else {
            None
        };
        Ok(LinkPage { rows, next_cursor })
    }

    async fn backup_enabled_workspaces(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.backup_workspaces.clone())
    }
}
