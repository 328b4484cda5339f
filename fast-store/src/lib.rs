pub mod builder;
pub mod kv;
pub mod model;
pub mod reader;
pub mod store;
pub mod testutils;

pub mod metrics_defs;

/// Canonical cache map names shared by the builder and the reader.
///
/// The builder writes each projection into `temp(name)` and atomically
/// publishes it over the canonical name, so readers only ever observe whole
/// generations of a map.
pub mod maps {
    pub const STREAMS_BY_ID: &str = "streams-by-id";
    pub const STREAMS_BY_DOMAIN: &str = "streams-by-domain";
    pub const API_KEYS: &str = "api-keys";
    pub const CONNECTIONS: &str = "connections-by-id";

    /// Bucket under which streams with no configured domains are filed in the
    /// by-domain projection.
    pub const NO_DOMAIN: &str = "no-domain";

    pub fn raw_objects(object_type: &str) -> String {
        format!("objects-{object_type}")
    }

    pub fn temp(name: &str) -> String {
        format!("{name}-tmp")
    }
}
