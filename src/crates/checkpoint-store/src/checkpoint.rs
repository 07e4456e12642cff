//! Core checkpoint data structures
//!
//! This module defines the types exchanged between the execution engine and a
//! [`CheckpointSaver`](crate::traits::CheckpointSaver):
//!
//! - [`Checkpoint`] - state snapshot at a step boundary (channel values + versions)
//! - [`ThreadKey`] - `(thread_id, checkpoint_ns, checkpoint_id?)` addressing a checkpoint
//! - [`CheckpointMetadata`] - why/how the checkpoint was produced
//! - [`CheckpointRecord`] - what a read returns: checkpoint, metadata, own and parent key
//! - [`PendingWrite`] - a write produced mid-step, persisted before the next checkpoint
//! - [`ListFilter`] - query parameters for [`list`](crate::traits::CheckpointSaver::list)
//!
//! # Storage layout
//!
//! ```text
//! ┌──────────────────────────────┐     channel_versions      ┌─────────────────────────┐
//! │ checkpoint row               │ ────────────────────────▶ │ blob rows               │
//! │ (thread, ns, id) parent_id   │   "messages" → v3         │ (thread, ns, chan, ver) │
//! │ channel_versions, metadata   │   "count"    → v1         │ type_tag, payload       │
//! └──────────────────────────────┘                           └─────────────────────────┘
//!            ▲ parent_id
//!            │                                               ┌─────────────────────────┐
//! ┌──────────┴───────────────────┐                           │ write rows              │
//! │ parent checkpoint row        │ ◀──────────────────────── │ (thread, ns, id,        │
//! └──────────────────────────────┘   "__pregel_tasks" writes │  task_id, idx)          │
//!                                    become the child's      └─────────────────────────┘
//!                                    pending sends
//! ```
//!
//! Checkpoints never embed channel values in their own row. Values live in the
//! blob table, one row per `(channel, version)`, and are reattached on read.
//!
//! # Versions
//!
//! A checkpoint only records *which* version of each channel it saw. When a step
//! changes channels, the engine asks for fresh tokens (see
//! [`Checkpoint::apply_updates`]) and passes exactly the changed channels as
//! `new_versions` to `put`, so unchanged channels keep pointing at blobs written
//! by an ancestor.

use crate::error::{DecodeError, Result};
use crate::value::StateValue;
use crate::version::{ChannelVersion, VersionGenerator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Checkpoint ID type
pub type CheckpointId = String;

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Channel holding work queued by a step for the next one
pub const TASKS: &str = "__pregel_tasks";
/// Control-flow bookkeeping channels
pub const ERROR: &str = "__error__";
pub const SCHEDULED: &str = "__scheduled__";
pub const INTERRUPT: &str = "__interrupt__";
pub const RESUME: &str = "__resume__";

/// Channels whose pending writes may be replaced on re-submission.
/// Writes to every other channel are append-only.
pub const OVERWRITABLE_CHANNELS: [&str; 4] = [ERROR, SCHEDULED, INTERRUPT, RESUME];

pub fn is_overwritable(channel: &str) -> bool {
    OVERWRITABLE_CHANNELS.contains(&channel)
}

/// Metadata source type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from an input to invoke/stream/batch
    Input,
    /// Checkpoint created from inside the execution loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint
    /// 0 for the first "loop" checkpoint
    /// n for the nth checkpoint afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i32>,

    /// Mapping from checkpoint namespace to parent checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i32) -> Self {
        self.step = Some(step);
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Sub-match against a filter: every filter key must be present with an
    /// equal value; nested objects match by containment.
    pub fn matches(&self, filter: &Map<String, Value>) -> bool {
        let json = match serde_json::to_value(self) {
            Ok(json) => json,
            Err(_) => return false,
        };
        filter
            .iter()
            .all(|(key, expected)| json.get(key).is_some_and(|actual| contains(actual, expected)))
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| contains(a, v))),
        _ => actual == expected,
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format
    pub v: i32,

    /// The ID of the checkpoint (unique and time-sortable)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// The values of the channels at the time of the checkpoint.
    /// Channels versioned without a value are absent from this map.
    pub channel_values: HashMap<String, StateValue>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node ID to map from channel name to version seen
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Work queued by the parent step, resolved from its pending writes on read.
    /// Never stored inline.
    pub pending_sends: Vec<StateValue>,

    /// The channels that were updated in this checkpoint
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a new checkpoint
    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, StateValue>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            pending_sends: Vec::new(),
            updated_channels: None,
        }
    }

    /// Create an empty checkpoint with a fresh time-ordered ID
    pub fn empty() -> Self {
        Self::new(new_checkpoint_id(), HashMap::new(), HashMap::new(), HashMap::new())
    }

    /// Copy of this checkpoint under a fresh ID, ready to be stored as its child
    pub fn successor(&self) -> Self {
        Self {
            id: new_checkpoint_id(),
            ts: Utc::now(),
            pending_sends: Vec::new(),
            updated_channels: None,
            ..self.clone()
        }
    }

    /// Apply channel updates and bump their versions.
    ///
    /// `None` records the channel as versioned but empty. Returns the changed
    /// channels with their new versions, suitable as `new_versions` for `put`.
    /// The checkpoint is left untouched if any channel's counter is exhausted.
    pub fn apply_updates(
        &mut self,
        updates: impl IntoIterator<Item = (String, Option<StateValue>)>,
        generator: &VersionGenerator,
    ) -> Result<ChannelVersions> {
        let updates = updates
            .into_iter()
            .map(|(channel, value)| {
                let next = generator.next(self.channel_versions.get(&channel))?;
                Ok((channel, value, next))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut new_versions = ChannelVersions::new();
        for (channel, value, next) in updates {
            match value {
                Some(value) => {
                    self.channel_values.insert(channel.clone(), value);
                }
                None => {
                    self.channel_values.remove(&channel);
                }
            }
            self.channel_versions.insert(channel.clone(), next.clone());
            new_versions.insert(channel, next);
        }
        let mut updated: Vec<String> = new_versions.keys().cloned().collect();
        updated.sort();
        self.updated_channels = Some(updated);
        Ok(new_versions)
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }

    /// Row form: everything except channel values and pending sends
    pub fn to_row(&self) -> CheckpointRow {
        CheckpointRow {
            v: self.v,
            id: self.id.clone(),
            ts: self.ts,
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            pending_sends: Vec::new(),
            updated_channels: self.updated_channels.clone(),
        }
    }

    /// Reassemble from a stored row plus values resolved from blobs
    pub fn from_row(
        row: CheckpointRow,
        channel_values: HashMap<String, StateValue>,
        pending_sends: Vec<StateValue>,
    ) -> Self {
        Self {
            v: row.v,
            id: row.id,
            ts: row.ts,
            channel_values,
            channel_versions: row.channel_versions,
            versions_seen: row.versions_seen,
            pending_sends,
            updated_channels: row.updated_channels,
        }
    }
}

/// Time-sortable checkpoint ID
pub fn new_checkpoint_id() -> CheckpointId {
    Uuid::now_v7().to_string()
}

/// Stored JSON shape of a checkpoint row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub v: i32,
    pub id: CheckpointId,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub channel_versions: ChannelVersions,
    #[serde(default)]
    pub versions_seen: HashMap<String, ChannelVersions>,
    /// Always written empty; sends live in the write log
    #[serde(default)]
    pub pending_sends: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

/// Address of a checkpoint: thread, namespace and optionally a specific ID.
/// Without an ID it refers to the latest checkpoint of the thread/namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub thread_id: String,

    /// Namespace of the producing sub-graph; `""` is the root graph
    #[serde(default)]
    pub checkpoint_ns: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,
}

impl ThreadKey {
    /// Key for the latest checkpoint of a thread's root namespace
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    /// Set the checkpoint namespace
    pub fn with_namespace(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Same thread and namespace, pointing at another checkpoint
    pub fn at(&self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.clone().with_checkpoint_id(checkpoint_id)
    }
}

/// A write produced mid-step
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: StateValue,
}

/// Everything a read returns for one checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Key of this checkpoint (with its ID)
    pub key: ThreadKey,

    /// The checkpoint, with channel values and pending sends resolved
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Key of the parent checkpoint, if any
    pub parent_key: Option<ThreadKey>,

    /// Writes recorded against this checkpoint by in-flight tasks
    pub pending_writes: Vec<PendingWrite>,

    /// Channels (or `"<task_id>/<idx>"` writes) whose stored form was upgraded on read
    pub migrated_channels: BTreeSet<String>,

    /// Values that could not be decoded; siblings are still returned
    pub decode_failures: BTreeMap<String, DecodeError>,
}

impl CheckpointRecord {
    /// Create a new record
    pub fn new(key: ThreadKey, checkpoint: Checkpoint, metadata: CheckpointMetadata) -> Self {
        Self {
            key,
            checkpoint,
            metadata,
            parent_key: None,
            pending_writes: Vec::new(),
            migrated_channels: BTreeSet::new(),
            decode_failures: BTreeMap::new(),
        }
    }

    /// Set the parent key
    pub fn with_parent_key(mut self, parent_key: ThreadKey) -> Self {
        self.parent_key = Some(parent_key);
        self
    }

    /// Whether any value in this record was read from an older schema
    pub fn was_migrated(&self) -> bool {
        !self.migrated_channels.is_empty()
    }

    pub fn pending_sends(&self) -> &[StateValue] {
        &self.checkpoint.pending_sends
    }

    pub fn value(&self, channel: &str) -> Option<&StateValue> {
        self.checkpoint.channel_values.get(channel)
    }
}

/// Query parameters for listing checkpoints
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict to one thread; `None` lists every thread
    pub thread_id: Option<String>,
    /// Restrict to one namespace
    pub checkpoint_ns: Option<String>,
    /// Metadata sub-match
    pub metadata: Option<Map<String, Value>>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter matching the thread (and namespace) of a key
    pub fn for_key(key: &ThreadKey) -> Self {
        Self {
            thread_id: Some(key.thread_id.clone()),
            checkpoint_ns: Some(key.checkpoint_ns.clone()),
            metadata: None,
        }
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_namespace(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}
