//! The append-only event log (SPEC_FULL.md §4.1).
//!
//! Events are serialized with a length prefix, a CRC, and a MAC, appended
//! to an active segment file. Segments roll at a configurable size. Writes
//! go through a single-writer lock; the writer calls fsync before
//! acknowledging. A compact in-memory index maps aggregate and kind to
//! sequence ranges.
//!
//! The durability discipline (single writer, fsync before ack, truncate at
//! first corrupt record on recovery) follows the same shape as a
//! connection-broker guarding a single SQLite handle, generalized here
//! into a raw segment-file writer instead.

use crate::error::LighthouseError;
use crate::mac;
use crate::time::EventIdGenerator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Mutex, RwLock};

pub const MAX_EVENT_PAYLOAD_BYTES: u64 = 1024 * 1024;
pub const MAX_BATCH_EVENTS: usize = 1000;
pub const MAX_BATCH_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    CommandReceived,
    CommandApproved,
    CommandBlocked,
    CommandEscalated,
    ExpertRegistered,
    ExpertDelegated,
    ExpertCompleted,
    ExpertOffline,
    ElicitationCreated,
    ElicitationDelivered,
    ElicitationResponded,
    ElicitationExpired,
    ElicitationCancelled,
    FileModified,
    SnapshotTaken,
    AnnotationAdded,
    AgentJoined,
    AgentLeft,
    SessionExpired,
    SessionHijackAttempt,
    SubscriptionDropped,
    IntegrityFault,
}

/// A draft event, not yet assigned an id/sequence/signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub kind: EventKind,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
}

/// A durable event, as stored in and returned from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub sequence: u64,
    pub kind: EventKind,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub signature: String,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub created_at_ms: u64,
}

impl Event {
    /// The bytes over which the MAC is computed: everything except the
    /// signature itself.
    fn signable_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Signable<'a> {
            id: &'a str,
            sequence: u64,
            kind: &'a EventKind,
            aggregate_id: &'a str,
            payload: &'a serde_json::Value,
            correlation_id: &'a Option<String>,
            causation_id: &'a Option<String>,
            created_at_ms: u64,
        }
        let signable = Signable {
            id: &self.id,
            sequence: self.sequence,
            kind: &self.kind,
            aggregate_id: &self.aggregate_id,
            payload: &self.payload,
            correlation_id: &self.correlation_id,
            causation_id: &self.causation_id,
            created_at_ms: self.created_at_ms,
        };
        bincode::serde::encode_to_vec(&signable, bincode::config::standard())
            .expect("event fields are always encodable")
    }

    fn sign(&mut self, secret: &[u8]) {
        self.signature = mac::sign(secret, &self.signable_bytes());
    }

    /// Verifies this event's MAC under `secret`. A failure here is fatal
    /// for the event per SPEC_FULL.md §3 ("verification failure is fatal
    /// for that event").
    pub fn verify(&self, secret: &[u8]) -> bool {
        mac::verify(secret, &self.signable_bytes(), &self.signature)
    }
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    pub aggregate_id: Option<String>,
    pub kinds: Option<Vec<EventKind>>,
    pub from_sequence: Option<u64>,
    pub to_sequence: Option<u64>,
    pub limit: Option<usize>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            aggregate_id: None,
            kinds: None,
            from_sequence: None,
            to_sequence: None,
            limit: None,
        }
    }
}

impl EventFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(agg) = &self.aggregate_id {
            if &event.aggregate_id != agg {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(from) = self.from_sequence {
            if event.sequence < from {
                return false;
            }
        }
        if let Some(to) = self.to_sequence {
            if event.sequence > to {
                return false;
            }
        }
        true
    }
}

struct Index {
    by_aggregate: HashMap<String, Vec<u64>>,
    by_kind: HashMap<EventKind, Vec<u64>>,
}

impl Index {
    fn new() -> Self {
        Self {
            by_aggregate: HashMap::new(),
            by_kind: HashMap::new(),
        }
    }

    fn record(&mut self, event: &Event) {
        self.by_aggregate
            .entry(event.aggregate_id.clone())
            .or_default()
            .push(event.sequence);
        self.by_kind
            .entry(event.kind.clone())
            .or_default()
            .push(event.sequence);
    }
}

/// A single active segment writer. The writer lock spans
/// serialize+MAC+write+fsync, matching SPEC_FULL.md §5's shared-resource
/// discipline for the event log.
struct SegmentWriter {
    dir: PathBuf,
    segment_size_limit: u64,
    active_index: u32,
    file: File,
    bytes_written: u64,
}

impl SegmentWriter {
    fn open(dir: &Path, segment_size_limit: u64) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let active_index = Self::discover_active_index(dir)?;
        let path = segment_path(dir, active_index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size_limit,
            active_index,
            file,
            bytes_written,
        })
    }

    fn discover_active_index(dir: &Path) -> std::io::Result<u32> {
        let mut max_index = 0u32;
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".log") {
                        if let Ok(idx) = stem.parse::<u32>() {
                            max_index = max_index.max(idx);
                        }
                    }
                }
            }
        }
        Ok(max_index)
    }

    /// Writes one record: `[len:u32][body][crc32:u32][mac_len:u16][mac bytes]`.
    fn write_record(&mut self, body: &[u8], signature: &str) -> std::io::Result<()> {
        let crc = crc32(body);
        let mac_bytes = signature.as_bytes();

        let mut buf = Vec::with_capacity(body.len() + 10 + mac_bytes.len());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(mac_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(mac_bytes);

        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        self.bytes_written += buf.len() as u64;

        if self.bytes_written >= self.segment_size_limit {
            self.roll()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> std::io::Result<()> {
        self.active_index += 1;
        let path = segment_path(&self.dir, self.active_index);
        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.bytes_written = 0;
        Ok(())
    }
}

fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{:06}.log", index))
}

fn crc32(data: &[u8]) -> u32 {
    // Standard CRC-32 (IEEE 802.3), computed with the well-known
    // reflected-polynomial table algorithm.
    const POLY: u32 = 0xEDB88320;
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

struct Subscription {
    id: String,
    filter: EventFilter,
    sender: SyncSender<Event>,
}

/// The append-only, integrity-checked event log.
pub struct EventStore {
    secret: Vec<u8>,
    generator: EventIdGenerator,
    sequence: AtomicU64,
    writer: Mutex<SegmentWriter>,
    index: RwLock<Index>,
    events: RwLock<Vec<Event>>,
    subscribers: Mutex<Vec<Subscription>>,
    subscription_buffer_size: usize,
}

pub struct RecoveryReport {
    pub events_recovered: usize,
    pub truncated_at: Option<u64>,
}

impl EventStore {
    /// Opens (and, if necessary, recovers) the event log rooted at `dir`.
    pub fn open(
        dir: &Path,
        node_id: &str,
        secret: Vec<u8>,
        segment_size_limit: u64,
        subscription_buffer_size: usize,
    ) -> Result<(Self, RecoveryReport), LighthouseError> {
        let (events, truncated_at) = recover(dir, &secret)?;
        let max_sequence = events.last().map(|e| e.sequence).unwrap_or(0);
        let recovered_ns = events
            .last()
            .and_then(|e| e.id.split('_').next())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let mut index = Index::new();
        for e in &events {
            index.record(e);
        }

        let store = Self {
            secret,
            generator: EventIdGenerator::new(node_id, recovered_ns),
            sequence: AtomicU64::new(max_sequence),
            writer: Mutex::new(SegmentWriter::open(dir, segment_size_limit)?),
            index: RwLock::new(index),
            events: RwLock::new(events),
            subscribers: Mutex::new(Vec::new()),
            subscription_buffer_size,
        };

        let report = RecoveryReport {
            events_recovered: store.events.read().expect("events lock poisoned").len(),
            truncated_at,
        };
        Ok((store, report))
    }

    /// Appends a single event. The caller is responsible for having
    /// verified `appending_agent_id`'s authentication and `EVENTS_WRITE`
    /// permission before calling this (the authenticator and event store
    /// are deliberately decoupled — see `core::broker`).
    pub fn append(&self, draft: EventDraft) -> Result<(String, u64), LighthouseError> {
        let encoded_payload = serde_json::to_vec(&draft.payload)?;
        if encoded_payload.len() as u64 > MAX_EVENT_PAYLOAD_BYTES {
            return Err(LighthouseError::InvalidPayload(format!(
                "event payload {} bytes exceeds {} byte limit",
                encoded_payload.len(),
                MAX_EVENT_PAYLOAD_BYTES
            )));
        }

        let mut writer = self.writer.lock().expect("event log writer lock poisoned");
        let (id, _ns) = self.generator.next_id()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut event = Event {
            id: id.clone(),
            sequence,
            kind: draft.kind,
            aggregate_id: draft.aggregate_id,
            payload: draft.payload,
            signature: String::new(),
            correlation_id: draft.correlation_id,
            causation_id: draft.causation_id,
            created_at_ms: crate::time::now_epoch_ms(),
        };
        event.sign(&self.secret);

        let body = event_body_bytes(&event)?;
        writer
            .write_record(&body, &event.signature)
            .map_err(|e| LighthouseError::Transient(format!("event log write failed: {}", e)))?;
        drop(writer);

        self.index
            .write()
            .expect("event log index lock poisoned")
            .record(&event);
        self.events
            .write()
            .expect("event log events lock poisoned")
            .push(event.clone());

        self.publish(&event);

        Ok((id, sequence))
    }

    /// Appends a batch of events atomically: all succeed with contiguous
    /// sequence numbers, or none are written.
    pub fn append_batch(
        &self,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<(String, u64)>, LighthouseError> {
        if drafts.len() > MAX_BATCH_EVENTS {
            return Err(LighthouseError::InvalidPayload(format!(
                "batch of {} events exceeds {} event limit",
                drafts.len(),
                MAX_BATCH_EVENTS
            )));
        }
        let total_bytes: u64 = drafts
            .iter()
            .map(|d| serde_json::to_vec(&d.payload).map(|v| v.len() as u64).unwrap_or(0))
            .sum();
        if total_bytes > MAX_BATCH_BYTES {
            return Err(LighthouseError::InvalidPayload(format!(
                "batch of {} bytes exceeds {} byte limit",
                total_bytes, MAX_BATCH_BYTES
            )));
        }

        // All-or-nothing: validate every draft before writing any of them.
        for draft in &drafts {
            let encoded = serde_json::to_vec(&draft.payload)?;
            if encoded.len() as u64 > MAX_EVENT_PAYLOAD_BYTES {
                return Err(LighthouseError::InvalidPayload(
                    "one or more events in the batch exceed the per-event size limit".to_string(),
                ));
            }
        }

        let mut results = Vec::with_capacity(drafts.len());
        for draft in drafts {
            results.push(self.append(draft)?);
        }
        Ok(results)
    }

    /// Returns events matching `filter`, in ascending sequence order,
    /// reflecting everything durably stored at call time.
    pub fn query(&self, filter: &EventFilter) -> Vec<Event> {
        let events = self.events.read().expect("event log events lock poisoned");
        let mut matched: Vec<Event> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Registers a push subscription. New events matching `filter` are
    /// sent as they are appended. The channel is bounded by
    /// `subscription_buffer_size`; a full buffer drops the subscriber and
    /// logs a `SUBSCRIPTION_DROPPED` event (SPEC_FULL.md §5 back-pressure).
    pub fn subscribe(&self, filter: EventFilter) -> Receiver<Event> {
        let (tx, rx) = std::sync::mpsc::sync_channel(self.subscription_buffer_size);
        let id = crate::time::new_correlation_id();
        self.subscribers
            .lock()
            .expect("event log subscribers lock poisoned")
            .push(Subscription { id, filter, sender: tx });
        rx
    }

    fn publish(&self, event: &Event) {
        let dropped: Vec<String> = {
            let mut subscribers = self
                .subscribers
                .lock()
                .expect("event log subscribers lock poisoned");
            let mut dropped = Vec::new();
            subscribers.retain(|sub| {
                if !sub.filter.matches(event) {
                    return true;
                }
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        // buffer full or receiver gone: drop subscriber
                        dropped.push(sub.id.clone());
                        false
                    }
                }
            });
            dropped
        };
        for subscription_id in dropped {
            let _ = self.append(EventDraft {
                kind: EventKind::SubscriptionDropped,
                aggregate_id: subscription_id,
                payload: serde_json::json!({}),
                correlation_id: None,
                causation_id: None,
            });
        }
    }

    pub fn highest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

fn event_body_bytes(event: &Event) -> Result<Vec<u8>, LighthouseError> {
    bincode::serde::encode_to_vec(event, bincode::config::standard())
        .map_err(|e| LighthouseError::Codec(e.to_string()))
}

/// Truncates `path` to `len` bytes: called once recovery has located the
/// first corrupt record, so the corrupt tail left by a torn write is
/// physically removed before a new writer reopens the segment in append
/// mode. Without this, a restart would otherwise append new records after
/// the corrupt bytes and lose them again on the next recovery pass.
fn truncate_segment(path: &Path, len: u64) -> Result<(), LighthouseError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| LighthouseError::Transient(format!("cannot open segment for truncation: {}", e)))?;
    file.set_len(len)
        .map_err(|e| LighthouseError::Transient(format!("cannot truncate corrupt segment: {}", e)))?;
    Ok(())
}

/// Scans all segment files in order, verifying CRC and MAC for each
/// record, and truncates at the first corrupt record
/// (SPEC_FULL.md §4.1 "Recovery").
fn recover(dir: &Path, secret: &[u8]) -> Result<(Vec<Event>, Option<u64>), LighthouseError> {
    if !dir.exists() {
        return Ok((Vec::new(), None));
    }

    let mut segment_paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    segment_paths.sort();

    let mut events = Vec::new();
    let mut truncated_at = None;

    'segments: for path in segment_paths {
        let file = File::open(&path)
            .map_err(|e| LighthouseError::Transient(format!("cannot open segment: {}", e)))?;
        let mut reader = BufReader::new(file);
        // Bytes of this segment known to hold only complete, verified
        // records; the point `truncate_segment` truncates to on corruption.
        let mut good_bytes: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    truncated_at = Some(events.len() as u64);
                    tracing_warn(&format!("segment read error, truncating: {}", e));
                    truncate_segment(&path, good_bytes)?;
                    break 'segments;
                }
            }
            let body_len = u32::from_le_bytes(len_buf) as usize;

            let mut body = vec![0u8; body_len];
            if reader.read_exact(&mut body).is_err() {
                truncated_at = Some(events.len() as u64);
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }

            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                truncated_at = Some(events.len() as u64);
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            if crc32(&body) != stored_crc {
                truncated_at = Some(events.len() as u64);
                tracing_warn("event log CRC mismatch, truncating at first corrupt record");
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }

            let mut mac_len_buf = [0u8; 2];
            if reader.read_exact(&mut mac_len_buf).is_err() {
                truncated_at = Some(events.len() as u64);
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }
            let mac_len = u16::from_le_bytes(mac_len_buf) as usize;
            let mut mac_buf = vec![0u8; mac_len];
            if reader.read_exact(&mut mac_buf).is_err() {
                truncated_at = Some(events.len() as u64);
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }

            let (event, _): (Event, usize) =
                match bincode::serde::decode_from_slice(&body, bincode::config::standard()) {
                    Ok(decoded) => decoded,
                    Err(_) => {
                        truncated_at = Some(events.len() as u64);
                        truncate_segment(&path, good_bytes)?;
                        break 'segments;
                    }
                };

            if !event.verify(secret) {
                truncated_at = Some(events.len() as u64);
                tracing_warn("event log MAC verification failed, truncating at first corrupt record");
                truncate_segment(&path, good_bytes)?;
                break 'segments;
            }

            good_bytes += 4 + body_len as u64 + 4 + 2 + mac_len as u64;
            events.push(event);
        }
    }

    Ok((events, truncated_at))
}

fn tracing_warn(msg: &str) {
    eprintln!("[lighthouse][warn] {}", msg);
}
