use crate::domain::capture::{
    paginate, CaptureFilter, CaptureKind, CaptureRecord, CursorError, EnhancedAction, LogEntry,
    NetworkBody, Page, PageRequest, PerformanceSnapshot, RingBuffer, WaterfallEntry,
    WebSocketEvent,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

pub const MAX_OBSERVE_LIMIT: usize = 1000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("unknown capture kind: {0}")]
    UnknownKind(String),
    #[error("invalid {kind} entry: {message}")]
    InvalidEntry { kind: CaptureKind, message: String },
}

/// Entry types that have a home in [`CaptureBuffers`].
pub trait Captured: CaptureRecord + Serialize + DeserializeOwned {
    const KIND: CaptureKind;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>>;

    /// Hook applied before an entry is stored.
    fn prepare(&mut self, _buffers: &CaptureBuffers) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub len: usize,
    pub capacity: usize,
    pub total_added: u64,
    pub evicted: u64,
    pub approx_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub kinds: BTreeMap<&'static str, KindStats>,
    pub total_entries: usize,
    pub total_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub received: usize,
    pub rejected: usize,
    pub entries: usize,
}

/// In-memory telemetry captured from the tracked tab, one ring per kind.
///
/// Writers to a kind serialize on that kind's lock; readers share it.
#[derive(Debug)]
pub struct CaptureBuffers {
    logs: RwLock<RingBuffer<LogEntry>>,
    waterfall: RwLock<RingBuffer<WaterfallEntry>>,
    bodies: RwLock<RingBuffer<NetworkBody>>,
    websocket: RwLock<RingBuffer<WebSocketEvent>>,
    actions: RwLock<RingBuffer<EnhancedAction>>,
    performance: RwLock<RingBuffer<PerformanceSnapshot>>,
    max_body_bytes: usize,
}

impl Default for CaptureBuffers {
    fn default() -> Self {
        Self::new()
    }
}

fn ring<T>(kind: CaptureKind) -> RwLock<RingBuffer<T>> {
    RwLock::new(RingBuffer::with_capacity(kind.default_capacity()))
}

impl CaptureBuffers {
    pub fn new() -> Self {
        Self::with_body_limit(DEFAULT_MAX_BODY_BYTES)
    }

    pub fn with_body_limit(max_body_bytes: usize) -> Self {
        Self {
            logs: ring(CaptureKind::Logs),
            waterfall: ring(CaptureKind::NetworkWaterfall),
            bodies: ring(CaptureKind::NetworkBodies),
            websocket: ring(CaptureKind::WebsocketEvents),
            actions: ring(CaptureKind::Actions),
            performance: ring(CaptureKind::Performance),
            max_body_bytes,
        }
    }

    pub fn append<T: Captured>(&self, mut entry: T) {
        entry.prepare(self);
        T::slot(self)
            .write()
            .expect("capture buffer poisoned")
            .push(entry);
    }

    pub fn append_batch<T: Captured>(&self, entries: Vec<T>) -> usize {
        let prepared: Vec<T> = entries
            .into_iter()
            .map(|mut entry| {
                entry.prepare(self);
                entry
            })
            .collect();
        let count = prepared.len();
        let mut ring = T::slot(self).write().expect("capture buffer poisoned");
        for entry in prepared {
            ring.push(entry);
        }
        count
    }

    /// Parses raw JSON entries for one kind. Malformed entries are counted and skipped.
    pub fn ingest<T: Captured>(&self, values: Vec<Value>) -> IngestOutcome {
        let received = values.len();
        let parsed: Vec<T> = values
            .into_iter()
            .filter_map(|value| serde_json::from_value::<T>(value).ok())
            .collect();
        let rejected = received - parsed.len();
        self.append_batch(parsed);
        IngestOutcome {
            received,
            rejected,
            entries: self.len(T::KIND),
        }
    }

    /// Single entry addressed by kind name.
    pub fn append_value(&self, kind: &str, value: Value) -> Result<(), CaptureError> {
        let kind: CaptureKind = kind.parse().map_err(CaptureError::UnknownKind)?;
        let invalid = |err: serde_json::Error| CaptureError::InvalidEntry {
            kind,
            message: err.to_string(),
        };
        match kind {
            CaptureKind::Logs => self.append(serde_json::from_value::<LogEntry>(value).map_err(invalid)?),
            CaptureKind::NetworkWaterfall => {
                self.append(serde_json::from_value::<WaterfallEntry>(value).map_err(invalid)?)
            }
            CaptureKind::NetworkBodies => {
                self.append(serde_json::from_value::<NetworkBody>(value).map_err(invalid)?)
            }
            CaptureKind::WebsocketEvents => {
                self.append(serde_json::from_value::<WebSocketEvent>(value).map_err(invalid)?)
            }
            CaptureKind::Actions => {
                self.append(serde_json::from_value::<EnhancedAction>(value).map_err(invalid)?)
            }
            CaptureKind::Performance => {
                self.append(serde_json::from_value::<PerformanceSnapshot>(value).map_err(invalid)?)
            }
        }
        Ok(())
    }

    /// Up to `limit` most recent matching entries, newest first.
    pub fn snapshot<T: Captured>(&self, filter: &CaptureFilter, limit: usize) -> Vec<T> {
        let limit = limit.clamp(1, MAX_OBSERVE_LIMIT);
        let mut matched: Vec<T> = {
            let ring = T::slot(self).read().expect("capture buffer poisoned");
            ring.iter_newest()
                .filter(|entry| entry.matches(filter))
                .cloned()
                .collect()
        };
        // producers may report out-of-order clocks; insertion order breaks ties
        matched.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        matched.truncate(limit);
        matched
    }

    /// One cursor page of matching entries; positions are ring positions.
    pub fn page<T: Captured>(
        &self,
        filter: &CaptureFilter,
        mut request: PageRequest,
    ) -> Result<Page<T>, CursorError> {
        request.limit = request.limit.clamp(1, MAX_OBSERVE_LIMIT);
        let (matched, oldest) = {
            let ring = T::slot(self).read().expect("capture buffer poisoned");
            let matched: Vec<(u64, T)> = ring
                .iter_positioned()
                .filter(|(_, entry)| entry.matches(filter))
                .map(|(position, entry)| (position, entry.clone()))
                .collect();
            (matched, ring.oldest_position())
        };
        paginate(matched, oldest, request)
    }

    pub fn newest_timestamp<T: Captured>(&self) -> Option<DateTime<Utc>> {
        let ring = T::slot(self).read().expect("capture buffer poisoned");
        ring.iter().map(CaptureRecord::timestamp).max()
    }

    pub fn len(&self, kind: CaptureKind) -> usize {
        match kind {
            CaptureKind::Logs => read_len(&self.logs),
            CaptureKind::NetworkWaterfall => read_len(&self.waterfall),
            CaptureKind::NetworkBodies => read_len(&self.bodies),
            CaptureKind::WebsocketEvents => read_len(&self.websocket),
            CaptureKind::Actions => read_len(&self.actions),
            CaptureKind::Performance => read_len(&self.performance),
        }
    }

    pub fn set_capacity(&self, kind: CaptureKind, capacity: usize) -> usize {
        match kind {
            CaptureKind::Logs => resize(&self.logs, capacity),
            CaptureKind::NetworkWaterfall => resize(&self.waterfall, capacity),
            CaptureKind::NetworkBodies => resize(&self.bodies, capacity),
            CaptureKind::WebsocketEvents => resize(&self.websocket, capacity),
            CaptureKind::Actions => resize(&self.actions, capacity),
            CaptureKind::Performance => resize(&self.performance, capacity),
        }
    }

    /// Returns the number of entries dropped.
    pub fn clear(&self, kind: CaptureKind) -> usize {
        match kind {
            CaptureKind::Logs => wipe(&self.logs),
            CaptureKind::NetworkWaterfall => wipe(&self.waterfall),
            CaptureKind::NetworkBodies => wipe(&self.bodies),
            CaptureKind::WebsocketEvents => wipe(&self.websocket),
            CaptureKind::Actions => wipe(&self.actions),
            CaptureKind::Performance => wipe(&self.performance),
        }
    }

    pub fn clear_all(&self) -> usize {
        CaptureKind::ALL.iter().map(|kind| self.clear(*kind)).sum()
    }

    pub fn stats(&self) -> CaptureStats {
        let kinds: BTreeMap<&'static str, KindStats> = [
            (CaptureKind::Logs, kind_stats(&self.logs)),
            (CaptureKind::NetworkWaterfall, kind_stats(&self.waterfall)),
            (CaptureKind::NetworkBodies, kind_stats(&self.bodies)),
            (CaptureKind::WebsocketEvents, kind_stats(&self.websocket)),
            (CaptureKind::Actions, kind_stats(&self.actions)),
            (CaptureKind::Performance, kind_stats(&self.performance)),
        ]
        .into_iter()
        .map(|(kind, stats)| (kind.as_str(), stats))
        .collect();
        let total_entries = kinds.values().map(|s| s.len).sum();
        let total_bytes = kinds.values().map(|s| s.approx_bytes).sum();
        CaptureStats {
            kinds,
            total_entries,
            total_bytes,
        }
    }
}

fn read_len<T>(lock: &RwLock<RingBuffer<T>>) -> usize {
    lock.read().expect("capture buffer poisoned").len()
}

fn resize<T>(lock: &RwLock<RingBuffer<T>>, capacity: usize) -> usize {
    lock.write()
        .expect("capture buffer poisoned")
        .set_capacity(capacity)
}

fn wipe<T>(lock: &RwLock<RingBuffer<T>>) -> usize {
    let mut ring = lock.write().expect("capture buffer poisoned");
    let dropped = ring.len();
    ring.clear();
    dropped
}

fn kind_stats<T: CaptureRecord>(lock: &RwLock<RingBuffer<T>>) -> KindStats {
    let ring = lock.read().expect("capture buffer poisoned");
    KindStats {
        len: ring.len(),
        capacity: ring.capacity(),
        total_added: ring.total_added(),
        evicted: ring.evicted(),
        approx_bytes: ring.iter().map(CaptureRecord::approx_bytes).sum(),
        newest: ring.iter().map(CaptureRecord::timestamp).max(),
    }
}

impl Captured for LogEntry {
    const KIND: CaptureKind = CaptureKind::Logs;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.logs
    }
}

impl Captured for WaterfallEntry {
    const KIND: CaptureKind = CaptureKind::NetworkWaterfall;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.waterfall
    }

    fn prepare(&mut self, _buffers: &CaptureBuffers) {
        self.timestamp = Utc::now();
    }
}

impl Captured for NetworkBody {
    const KIND: CaptureKind = CaptureKind::NetworkBodies;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.bodies
    }

    fn prepare(&mut self, buffers: &CaptureBuffers) {
        self.truncate_bodies(buffers.max_body_bytes);
    }
}

impl Captured for WebSocketEvent {
    const KIND: CaptureKind = CaptureKind::WebsocketEvents;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.websocket
    }
}

impl Captured for EnhancedAction {
    const KIND: CaptureKind = CaptureKind::Actions;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.actions
    }
}

impl Captured for PerformanceSnapshot {
    const KIND: CaptureKind = CaptureKind::Performance;

    fn slot(buffers: &CaptureBuffers) -> &RwLock<RingBuffer<Self>> {
        &buffers.performance
    }
}
