//! Ephemeral presence shared among the live members of a channel.
//!
//! Each replica owns one entry (its identity, cursor, color and whatever
//! else the host puts there) and mirrors everyone else's. Nothing here is
//! part of the document or ever persisted.
//!
//! ```text
//! set_local_field("cursor", 12)
//!       │
//!       ▼
//! AwarenessUpdate { client 7: {"cursor": 12} }   ── broadcast ──▶ peers
//!                                                                  │
//!                                        AwarenessStore::apply_update()
//!                                          (per-field, last arrival wins)
//! ```
//!
//! Remote entries disappear when their owner leaves the channel, when the
//! connection drops, or when no patch has been seen for the heartbeat
//! timeout.

use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tandem_core::ClientId;
use tokio::time::Instant;

/// Interval at which a Session re-broadcasts its own presence.
pub const AWARENESS_RENEW_INTERVAL: Duration = Duration::from_secs(15);

/// Remote entries older than this are evicted.
pub const AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Presence fields of one client.
pub type Fields = BTreeMap<String, Value>;

/// A remote client's presence.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub fields: Fields,
    /// Arrival time of the most recent patch
    pub last_seen: Instant,
}

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

/// Change to one client's entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessPatch {
    /// JSON object of changed fields; a `null` value deletes the field
    Fields(String),
    /// Owner went away
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub client_id: ClientId,
    pub patch: AwarenessPatch,
}

/// Payload of a `MessageType::Awareness` frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessRecord>,
}

impl AwarenessUpdate {
    fn fields(client_id: ClientId, changed: &Map<String, Value>) -> Self {
        let json = Value::Object(changed.clone()).to_string();
        Self {
            entries: vec![AwarenessRecord {
                client_id,
                patch: AwarenessPatch::Fields(json),
            }],
        }
    }

    pub fn removed(client_id: ClientId) -> Self {
        Self {
            entries: vec![AwarenessRecord {
                client_id,
                patch: AwarenessPatch::Removed,
            }],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Local presence plus a mirror of every remote member's presence.
#[derive(Debug, Clone)]
pub struct AwarenessStore {
    local_client_id: ClientId,
    local: Fields,
    peers: HashMap<ClientId, AwarenessEntry>,
}

impl AwarenessStore {
    pub fn new(local_client_id: ClientId) -> Self {
        Self {
            local_client_id,
            local: Fields::new(),
            peers: HashMap::new(),
        }
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }

    pub fn local_fields(&self) -> &Fields {
        &self.local
    }

    /// Set (or with `Value::Null`, clear) one local field and return the
    /// patch to broadcast.
    pub fn set_local_field(&mut self, key: impl Into<String>, value: Value) -> AwarenessUpdate {
        let key = key.into();
        if value.is_null() {
            self.local.remove(&key);
        } else {
            self.local.insert(key.clone(), value.clone());
        }
        let mut changed = Map::new();
        changed.insert(key, value);
        AwarenessUpdate::fields(self.local_client_id, &changed)
    }

    /// Replace the whole local entry. Fields missing from `fields` are sent
    /// as deletions.
    pub fn set_local(&mut self, fields: Fields) -> AwarenessUpdate {
        let mut changed: Map<String, Value> = self
            .local
            .keys()
            .filter(|k| !fields.contains_key(*k))
            .map(|k| (k.clone(), Value::Null))
            .collect();
        for (k, v) in &fields {
            changed.insert(k.clone(), v.clone());
        }
        self.local = fields.into_iter().filter(|(_, v)| !v.is_null()).collect();
        AwarenessUpdate::fields(self.local_client_id, &changed)
    }

    /// Full local state, used for heartbeats and to greet newcomers.
    pub fn local_update(&self) -> AwarenessUpdate {
        let all: Map<String, Value> = self
            .local
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        AwarenessUpdate::fields(self.local_client_id, &all)
    }

    /// Patch announcing that the local client is going away.
    pub fn removal_update(&self) -> AwarenessUpdate {
        AwarenessUpdate::removed(self.local_client_id)
    }

    /// Merge an inbound patch. Records about the local client are ignored;
    /// the local replica is the only writer of its own entry.
    ///
    /// Returns the remote clients whose entry changed.
    pub fn apply_update(
        &mut self,
        update: &AwarenessUpdate,
        now: Instant,
    ) -> Result<Vec<ClientId>, ProtocolError> {
        let mut changed = Vec::new();
        for record in &update.entries {
            if record.client_id == self.local_client_id {
                continue;
            }
            match &record.patch {
                AwarenessPatch::Removed => {
                    if self.peers.remove(&record.client_id).is_some() {
                        changed.push(record.client_id);
                    }
                }
                AwarenessPatch::Fields(json) => {
                    let patch: Map<String, Value> = serde_json::from_str(json)
                        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                    let entry = self
                        .peers
                        .entry(record.client_id)
                        .or_insert_with(|| AwarenessEntry {
                            client_id: record.client_id,
                            fields: Fields::new(),
                            last_seen: now,
                        });
                    entry.last_seen = now;
                    for (k, v) in patch {
                        if v.is_null() {
                            entry.fields.remove(&k);
                        } else {
                            entry.fields.insert(k, v);
                        }
                    }
                    changed.push(record.client_id);
                }
            }
        }
        Ok(changed)
    }

    /// Drop a remote entry. Returns whether one existed.
    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.peers.remove(&client_id).is_some()
    }

    /// Drop every remote entry, keeping local presence. Returns the count
    /// removed.
    pub fn clear_remote(&mut self) -> usize {
        let n = self.peers.len();
        self.peers.clear();
        n
    }

    /// Remove remote entries not refreshed within `timeout`.
    pub fn evict_stale(&mut self, timeout: Duration, now: Instant) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .peers
            .values()
            .filter(|e| now.saturating_duration_since(e.last_seen) >= timeout)
            .map(|e| e.client_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn peer(&self, client_id: ClientId) -> Option<&AwarenessEntry> {
        self.peers.get(&client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Every known client's fields, local included.
    pub fn states(&self) -> BTreeMap<ClientId, Fields> {
        let mut states: BTreeMap<ClientId, Fields> = self
            .peers
            .values()
            .map(|e| (e.client_id, e.fields.clone()))
            .collect();
        states.insert(self.local_client_id, self.local.clone());
        states
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity colors
// ───────────────────────────────────────────────────────────────────

/// Presence field holding the client's display color
pub const COLOR_FIELD: &str = "color";

/// `fields` with [`COLOR_FIELD`] set to the identity color of `client_id`
/// unless the host picked one.
pub fn with_identity_color(mut fields: Fields, client_id: ClientId) -> Fields {
    fields
        .entry(COLOR_FIELD.to_string())
        .or_insert_with(|| Value::String(identity_color(client_id)));
    fields
}

/// Stable, visually distinct `#rrggbb` color for a client id.
///
/// Saturated HSL with the hue picked from the id, so every replica paints
/// the same peer the same way without coordinating.
pub fn identity_color(client_id: ClientId) -> String {
    let hue = ((client_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
