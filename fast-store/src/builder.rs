//! Cache projection builder ("fast store refresh").
//!
//! Produces a consistent snapshot of the routing-relevant configuration in
//! the cache without blocking readers of the previous snapshot. Every
//! projection is written into a temporary map and atomically published over
//! its canonical name; a failed cycle leaves the previously published
//! snapshot serving.

use crate::kv::{KvCache, KvError};
use crate::maps;
use crate::metrics_defs::{REFRESH_DURATION, REFRESH_FAILURES, REFRESH_LINKS, REFRESH_STREAMS};
use crate::model::{
    ApiKeyBinding, DestinationConfig, DestinationKind, EnrichedConnection, EnrichedDestination,
    KeyClass, LinkOptions, StreamConfig, StreamWithDestinations, credentials_hash, flatten_config,
};
use crate::store::{ConfigStore, LinkCursor, ObjectRow, StoreError};
use serde_json::{Map, Value, json};
use shared::{counter, gauge, histogram};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entity types that get a plain "flattened object by id" projection.
pub const RAW_OBJECT_TYPES: &[&str] = &["stream", "destination", "function"];

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("cache error: {0}")]
    Kv(#[from] KvError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A row whose payload does not decode, e.g. a destination type outside
    /// the static catalog. Fatal for the cycle, not a skip.
    #[error("row {id} failed to decode: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default, Clone)]
pub struct RefreshStats {
    pub streams: usize,
    pub links: usize,
    pub api_keys: usize,
    pub duration: Duration,
}

/// In-memory by-domain index built during a cycle. Inner map is keyed by
/// stream id so a join-pass flush replaces the pre-pass placeholder instead
/// of appending a duplicate.
type DomainIndex = HashMap<String, BTreeMap<String, StreamWithDestinations>>;

pub struct FastStoreRefresh {
    store: Arc<dyn ConfigStore>,
    kv: Arc<dyn KvCache>,
    batch_size: u32,
}

impl FastStoreRefresh {
    pub fn new(store: Arc<dyn ConfigStore>, kv: Arc<dyn KvCache>) -> Self {
        FastStoreRefresh {
            store,
            kv,
            batch_size: 1000,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs one full refresh cycle.
    ///
    /// May run concurrently with readers at any time. Must not run
    /// concurrently with another refresh of the same scope; the caller
    /// (scheduler or mutation notifier) is expected to serialize cycles.
    pub async fn refresh(&self) -> Result<RefreshStats, RefreshError> {
        let started = Instant::now();
        match self.run_cycle().await {
            Ok(mut stats) => {
                stats.duration = started.elapsed();
                gauge!(REFRESH_STREAMS).set(stats.streams as f64);
                gauge!(REFRESH_LINKS).set(stats.links as f64);
                histogram!(REFRESH_DURATION).record(stats.duration.as_secs_f64());
                tracing::info!(
                    streams = stats.streams,
                    links = stats.links,
                    api_keys = stats.api_keys,
                    duration_ms = stats.duration.as_millis() as u64,
                    "fast store refresh complete"
                );
                Ok(stats)
            }
            Err(err) => {
                counter!(REFRESH_FAILURES).increment(1);
                tracing::error!("fast store refresh failed, previous snapshot stays live: {err}");
                Err(err)
            }
        }
    }

    async fn run_cycle(&self) -> Result<RefreshStats, RefreshError> {
        let backup_workspaces = self.store.backup_enabled_workspaces().await?;

        // Discard temp maps left behind by an interrupted cycle.
        for name in [
            maps::STREAMS_BY_ID,
            maps::STREAMS_BY_DOMAIN,
            maps::API_KEYS,
            maps::CONNECTIONS,
        ] {
            self.kv.del(&maps::temp(name)).await?;
        }

        for object_type in RAW_OBJECT_TYPES {
            self.project_raw_objects(object_type).await?;
        }

        let mut index = DomainIndex::new();
        let mut backup_synthesized: HashSet<String> = HashSet::new();
        let (streams, api_keys) = self
            .seed_streams(&mut index, &backup_workspaces, &mut backup_synthesized)
            .await?;
        let links = self
            .project_links(&mut index, &backup_workspaces, &mut backup_synthesized)
            .await?;

        let by_domain_tmp = maps::temp(maps::STREAMS_BY_DOMAIN);
        for (domain, streams) in &index {
            let list: Vec<&StreamWithDestinations> = streams.values().collect();
            self.kv
                .hset(&by_domain_tmp, domain, &serde_json::to_string(&list)?)
                .await?;
        }

        // Each publish is independently atomic; readers may briefly observe
        // the old generation of one map next to the new generation of
        // another across a refresh.
        for name in [
            maps::API_KEYS,
            maps::STREAMS_BY_ID,
            maps::STREAMS_BY_DOMAIN,
            maps::CONNECTIONS,
        ] {
            self.kv.publish(&maps::temp(name), name).await?;
        }

        Ok(RefreshStats {
            streams,
            links,
            api_keys,
            duration: Duration::ZERO,
        })
    }

    /// Streams rows of one entity type in batches and projects each as a
    /// flattened object keyed by id.
    async fn project_raw_objects(&self, object_type: &str) -> Result<(), RefreshError> {
        let map = maps::raw_objects(object_type);
        let tmp = maps::temp(&map);
        self.kv.del(&tmp).await?;

        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .fetch_objects_page(object_type, cursor.as_deref(), self.batch_size)
                .await?;
            for row in &page.rows {
                // The catalog check applies to every destination row, linked
                // or not; one unknown type aborts the whole cycle.
                if object_type == "destination" {
                    parse_destination(row)?;
                }
                let flat = flatten_config(&envelope_fields(row), &row.config);
                self.kv
                    .hset(&tmp, &row.id, &serde_json::to_string(&flat)?)
                    .await?;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.kv.publish(&tmp, &map).await?;
        Ok(())
    }

    /// Pre-pass over all streams, regardless of whether they have
    /// destinations: seeds the by-id projection and the by-domain index with
    /// empty-destination entries (plus the synthetic backup destination for
    /// backup-enabled workspaces) and populates the API-key bindings. This is
    /// what guarantees that a lookup by id never misses due to the join.
    async fn seed_streams(
        &self,
        index: &mut DomainIndex,
        backup_workspaces: &HashSet<String>,
        backup_synthesized: &mut HashSet<String>,
    ) -> Result<(usize, usize), RefreshError> {
        let by_id_tmp = maps::temp(maps::STREAMS_BY_ID);
        let api_keys_tmp = maps::temp(maps::API_KEYS);
        let connections_tmp = maps::temp(maps::CONNECTIONS);

        let mut cursor: Option<String> = None;
        let mut streams = 0;
        let mut api_keys = 0;

        loop {
            let page = self
                .store
                .fetch_objects_page("stream", cursor.as_deref(), self.batch_size)
                .await?;
            for row in &page.rows {
                let stream = parse_stream(row)?;

                for (keys, class) in [
                    (&stream.public_keys, KeyClass::Browser),
                    (&stream.private_keys, KeyClass::S2s),
                ] {
                    for key in keys {
                        let Some(hash) = &key.hash else { continue };
                        let binding = ApiKeyBinding {
                            hash: hash.clone(),
                            key_class: class,
                            stream_id: stream.id.clone(),
                        };
                        self.kv
                            .hset(&api_keys_tmp, &key.id, &serde_json::to_string(&binding)?)
                            .await?;
                        api_keys += 1;
                    }
                }

                let backup_enabled = backup_workspaces.contains(&stream.workspace_id);
                let mut swd = StreamWithDestinations::without_destinations(stream, backup_enabled);
                if backup_enabled {
                    let backup = self
                        .synthesize_backup(
                            &connections_tmp,
                            &swd.stream.workspace_id,
                            &swd.stream.id,
                            backup_synthesized,
                        )
                        .await?;
                    swd.asynchronous_destinations.push(backup);
                }
                self.kv
                    .hset(&by_id_tmp, &swd.stream.id, &serde_json::to_string(&swd)?)
                    .await?;
                index_stream(index, swd);
                streams += 1;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok((streams, api_keys))
    }

    /// Single ordered pass over the link join. Destinations are buffered per
    /// stream; when the stream id changes the buffered record replaces the
    /// pre-pass placeholder in the by-id projection and the domain index.
    async fn project_links(
        &self,
        index: &mut DomainIndex,
        backup_workspaces: &HashSet<String>,
        backup_synthesized: &mut HashSet<String>,
    ) -> Result<usize, RefreshError> {
        let by_id_tmp = maps::temp(maps::STREAMS_BY_ID);
        let connections_tmp = maps::temp(maps::CONNECTIONS);

        let mut cursor: Option<LinkCursor> = None;
        let mut links = 0;
        let mut current: Option<StreamWithDestinations> = None;

        loop {
            let page = self
                .store
                .fetch_links_page(cursor.as_ref(), self.batch_size)
                .await?;

            for row in &page.rows {
                let stream_changed = current
                    .as_ref()
                    .is_none_or(|swd| swd.stream.id != row.stream_id);
                if stream_changed {
                    if let Some(finished) = current.take() {
                        self.flush_stream(&by_id_tmp, index, finished).await?;
                    }
                    let stream = parse_stream(&row.stream)?;
                    let backup_enabled = backup_workspaces.contains(&row.workspace_id);
                    let mut swd =
                        StreamWithDestinations::without_destinations(stream, backup_enabled);
                    if backup_enabled {
                        let backup = self
                            .synthesize_backup(
                                &connections_tmp,
                                &row.workspace_id,
                                &row.stream_id,
                                backup_synthesized,
                            )
                            .await?;
                        swd.asynchronous_destinations.push(backup);
                    }
                    current = Some(swd);
                }

                let destination = parse_destination(&row.destination)?;
                let options: LinkOptions = serde_json::from_value(row.options.clone())
                    .map_err(|e| RefreshError::Decode {
                        id: row.id.clone(),
                        source: e,
                    })?;

                let connection = EnrichedConnection {
                    id: row.id.clone(),
                    workspace_id: row.workspace_id.clone(),
                    stream_id: row.stream_id.clone(),
                    destination_id: destination.id.clone(),
                    destination_type: destination.destination_type,
                    options: options.clone(),
                    credentials_hash: credentials_hash(&destination.credentials),
                    credentials: destination.credentials.clone(),
                };
                self.kv
                    .hset(
                        &connections_tmp,
                        &connection.id,
                        &serde_json::to_string(&connection)?,
                    )
                    .await?;

                let enriched = EnrichedDestination {
                    id: destination.id,
                    connection_id: row.id.clone(),
                    destination_type: destination.destination_type,
                    options,
                    credentials: destination.credentials,
                };
                if let Some(buffered) = current.as_mut() {
                    if enriched.destination_type.is_device() {
                        buffered.synchronous_destinations.push(enriched);
                    } else {
                        buffered.asynchronous_destinations.push(enriched);
                    }
                }
                links += 1;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(finished) = current.take() {
            self.flush_stream(&by_id_tmp, index, finished).await?;
        }

        Ok(links)
    }

    async fn flush_stream(
        &self,
        by_id_tmp: &str,
        index: &mut DomainIndex,
        swd: StreamWithDestinations,
    ) -> Result<(), RefreshError> {
        self.kv
            .hset(by_id_tmp, &swd.stream.id, &serde_json::to_string(&swd)?)
            .await?;
        index_stream(index, swd);
        Ok(())
    }

    /// Synthesizes the block-storage backup destination for a workspace. The
    /// connection record is written once per workspace per cycle, no matter
    /// how many streams the workspace owns.
    async fn synthesize_backup(
        &self,
        connections_tmp: &str,
        workspace_id: &str,
        stream_id: &str,
        synthesized: &mut HashSet<String>,
    ) -> Result<EnrichedDestination, RefreshError> {
        let id = format!("{workspace_id}_backup");

        if synthesized.insert(workspace_id.to_string()) {
            let connection = EnrichedConnection {
                id: id.clone(),
                workspace_id: workspace_id.to_string(),
                stream_id: stream_id.to_string(),
                destination_id: id.clone(),
                destination_type: DestinationKind::BlockStorage,
                options: LinkOptions::default(),
                credentials: Map::new(),
                credentials_hash: credentials_hash(&Map::new()),
            };
            self.kv
                .hset(connections_tmp, &id, &serde_json::to_string(&connection)?)
                .await?;
        }

        Ok(EnrichedDestination {
            id: id.clone(),
            connection_id: id,
            destination_type: DestinationKind::BlockStorage,
            options: LinkOptions::default(),
            credentials: Map::new(),
        })
    }
}

fn index_stream(index: &mut DomainIndex, swd: StreamWithDestinations) {
    let domains: Vec<String> = if swd.stream.domains.is_empty() {
        vec![maps::NO_DOMAIN.to_string()]
    } else {
        swd.stream
            .domains
            .iter()
            .map(|d| d.to_lowercase())
            .collect()
    };
    for domain in domains {
        index
            .entry(domain)
            .or_default()
            .insert(swd.stream.id.clone(), swd.clone());
    }
}

fn envelope_fields(row: &ObjectRow) -> Map<String, Value> {
    let mut envelope = Map::new();
    envelope.insert("id".into(), json!(row.id));
    envelope.insert("workspaceId".into(), json!(row.workspace_id));
    envelope.insert("type".into(), json!(row.object_type));
    envelope.insert("createdAt".into(), json!(row.created_at.to_rfc3339()));
    envelope.insert("updatedAt".into(), json!(row.updated_at.to_rfc3339()));
    envelope
}

fn parse_stream(row: &ObjectRow) -> Result<StreamConfig, RefreshError> {
    let flat = flatten_config(&envelope_fields(row), &row.config);
    serde_json::from_value(flat).map_err(|e| RefreshError::Decode {
        id: row.id.clone(),
        source: e,
    })
}

fn parse_destination(row: &ObjectRow) -> Result<DestinationConfig, RefreshError> {
    let flat = flatten_config(&envelope_fields(row), &row.config);
    serde_json::from_value(flat).map_err(|e| RefreshError::Decode {
        id: row.id.clone(),
        source: e,
    })
}
