//! Reassembly of stored rows into [`CheckpointRecord`]s
//!
//! Both backends store the same row shapes and hand them here, so decoding,
//! migration and write-back decisions behave identically regardless of where
//! the rows came from.

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointMetadata, CheckpointRecord, CheckpointRow, ListFilter,
    PendingWrite, ThreadKey, TASKS,
};
use crate::error::{CheckpointError, DecodeError, Result};
use crate::serializer::{SerializerProtocol, TypedPayload};
use crate::value::StateValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// A checkpoint row as stored
#[derive(Debug, Clone)]
pub(crate) struct StoredCheckpoint {
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    /// JSON of [`CheckpointRow`]
    pub checkpoint: String,
    /// JSON of [`CheckpointMetadata`]
    pub metadata: String,
}

impl StoredCheckpoint {
    pub fn parse_checkpoint(&self) -> Result<CheckpointRow> {
        Ok(serde_json::from_str(&self.checkpoint)?)
    }

    /// Whether the row passes a list query. Rows with unreadable metadata are
    /// kept so the read reports the error instead of hiding the checkpoint.
    pub fn matches(&self, filter: &ListFilter, before: Option<&str>) -> bool {
        if filter.thread_id.as_ref().is_some_and(|t| *t != self.thread_id) {
            return false;
        }
        if filter.checkpoint_ns.as_ref().is_some_and(|ns| *ns != self.checkpoint_ns) {
            return false;
        }
        if before.is_some_and(|before| self.checkpoint_id.as_str() >= before) {
            return false;
        }
        match &filter.metadata {
            Some(wanted) => match serde_json::from_str::<CheckpointMetadata>(&self.metadata) {
                Ok(metadata) => metadata.matches(wanted),
                Err(_) => true,
            },
            None => true,
        }
    }

    /// Parent whose writes must be read for pending sends
    pub fn sends_parent(&self) -> Option<&str> {
        self.parent_id
            .as_deref()
            .filter(|parent| *parent != self.checkpoint_id)
    }

    /// Pending sends from the writes loaded for [`sends_parent`](Self::sends_parent)
    pub fn parent_sends(&self, parent_writes: Vec<StoredWrite>) -> ParentSends {
        match &self.parent_id {
            None => ParentSends::None,
            Some(parent) if *parent == self.checkpoint_id => ParentSends::SelfReference,
            Some(parent) => ParentSends::Writes(parent.clone(), tasks_only(parent_writes)),
        }
    }
}

/// A pending write row as stored
#[derive(Debug, Clone)]
pub(crate) struct StoredWrite {
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub payload: TypedPayload,
}

/// Blob to rewrite at the current schema
#[derive(Debug, Clone)]
pub(crate) struct BlobUpgrade {
    pub channel: String,
    pub version: String,
    pub upgraded: TypedPayload,
}

/// Pending write to rewrite at the current schema, only if still holding `original`
#[derive(Debug, Clone)]
pub(crate) struct WriteUpgrade {
    pub checkpoint_id: String,
    pub task_id: String,
    pub idx: i64,
    pub original: TypedPayload,
    pub upgraded: TypedPayload,
}

/// Rows whose stored form should be replaced by their upgraded encoding
#[derive(Debug, Default)]
pub(crate) struct Upgrades {
    pub blobs: Vec<BlobUpgrade>,
    pub writes: Vec<WriteUpgrade>,
}

impl Upgrades {
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty() && self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blobs.len() + self.writes.len()
    }
}

/// Sends queued by the parent step
#[derive(Debug)]
pub(crate) enum ParentSends {
    /// The checkpoint has no parent
    None,
    /// The checkpoint names itself as its parent
    SelfReference,
    /// Parent's writes to the tasks channel
    Writes(String, Vec<StoredWrite>),
}

pub(crate) struct Assembled {
    pub record: CheckpointRecord,
    pub upgrades: Upgrades,
}

/// Build a record from its rows.
///
/// `blobs` maps channel name to the stored blob at the version the checkpoint
/// references. A channel without a blob row resolves to "no value".
pub(crate) fn assemble(
    serializer: &dyn SerializerProtocol,
    row: StoredCheckpoint,
    checkpoint_row: CheckpointRow,
    mut blobs: HashMap<String, TypedPayload>,
    writes: Vec<StoredWrite>,
    parent_sends: ParentSends,
) -> Result<Assembled> {
    let metadata: CheckpointMetadata = serde_json::from_str(&row.metadata)?;

    let key = ThreadKey::new(&row.thread_id)
        .with_namespace(&row.checkpoint_ns)
        .with_checkpoint_id(&row.checkpoint_id);
    let parent_key = row.parent_id.as_ref().map(|id| key.at(id));

    let mut upgrades = Upgrades::default();
    let mut migrated_channels = BTreeSet::new();
    let mut decode_failures = BTreeMap::new();

    let mut channel_values = HashMap::new();
    for (channel, version) in &checkpoint_row.channel_versions {
        let Some(payload) = blobs.remove(channel) else {
            continue;
        };
        match serializer.loads_typed(&payload) {
            Ok(loaded) => {
                if loaded.was_migrated {
                    migrated_channels.insert(channel.clone());
                }
                if let Some(upgraded) = loaded.upgraded {
                    upgrades.blobs.push(BlobUpgrade {
                        channel: channel.clone(),
                        version: version.as_str().to_string(),
                        upgraded,
                    });
                }
                if let Some(value) = loaded.value {
                    channel_values.insert(channel.clone(), value);
                }
            }
            Err(err) => {
                debug!(channel = %channel, error = %err, "Failed to decode channel value");
                decode_failures.insert(channel.clone(), err.within(channel.clone()));
            }
        }
    }

    let mut pending_writes = Vec::with_capacity(writes.len());
    for write in writes {
        let label = format!("{}/{}", write.task_id, write.idx);
        match serializer.loads_typed(&write.payload) {
            Ok(loaded) => {
                if loaded.was_migrated {
                    migrated_channels.insert(label);
                }
                if let Some(upgraded) = loaded.upgraded {
                    upgrades.writes.push(WriteUpgrade {
                        checkpoint_id: row.checkpoint_id.clone(),
                        task_id: write.task_id.clone(),
                        idx: write.idx,
                        original: write.payload.clone(),
                        upgraded,
                    });
                }
                pending_writes.push(PendingWrite {
                    task_id: write.task_id,
                    channel: write.channel,
                    value: loaded.value.unwrap_or_default(),
                });
            }
            Err(err) => {
                decode_failures.insert(label.clone(), err.within(label));
            }
        }
    }

    let mut pending_sends: Vec<StateValue> = Vec::new();
    match parent_sends {
        ParentSends::None => {}
        ParentSends::SelfReference => {
            decode_failures.insert(
                TASKS.to_string(),
                DecodeError::new(
                    TASKS,
                    format!("checkpoint {} is its own parent", row.checkpoint_id),
                ),
            );
        }
        ParentSends::Writes(parent_id, sends) => {
            for send in sends {
                let label = format!("{}/{}/{}", TASKS, send.task_id, send.idx);
                match serializer.loads_typed(&send.payload) {
                    Ok(loaded) => {
                        if loaded.was_migrated {
                            migrated_channels.insert(label);
                        }
                        if let Some(upgraded) = loaded.upgraded {
                            upgrades.writes.push(WriteUpgrade {
                                checkpoint_id: parent_id.clone(),
                                task_id: send.task_id,
                                idx: send.idx,
                                original: send.payload,
                                upgraded,
                            });
                        }
                        if let Some(value) = loaded.value {
                            pending_sends.push(value);
                        }
                    }
                    Err(err) => {
                        decode_failures.insert(label.clone(), err.within(label));
                    }
                }
            }
        }
    }

    let checkpoint = Checkpoint::from_row(checkpoint_row, channel_values, pending_sends);
    let mut record = CheckpointRecord::new(key, checkpoint, metadata);
    record.parent_key = parent_key;
    record.pending_writes = pending_writes;
    record.migrated_channels = migrated_channels;
    record.decode_failures = decode_failures;

    Ok(Assembled { record, upgrades })
}

/// Checks on a `put` that need no storage access
pub(crate) fn validate_put(
    key: &ThreadKey,
    checkpoint: &Checkpoint,
    new_versions: &ChannelVersions,
) -> Result<()> {
    if key.thread_id.is_empty() {
        return Err(CheckpointError::Invalid("thread_id is required".to_string()));
    }
    if key.checkpoint_id.as_deref() == Some(checkpoint.id.as_str()) {
        return Err(CheckpointError::Invalid(format!(
            "checkpoint {} cannot be its own parent",
            checkpoint.id
        )));
    }
    for (channel, version) in new_versions {
        if checkpoint.channel_versions.get(channel) != Some(version) {
            return Err(CheckpointError::Invalid(format!(
                "new version of channel '{}' is not recorded in the checkpoint",
                channel
            )));
        }
    }
    Ok(())
}

/// Versions the checkpoint reuses from earlier checkpoints; their blobs must already exist
pub(crate) fn referenced_versions(
    checkpoint: &Checkpoint,
    new_versions: &ChannelVersions,
) -> ChannelVersions {
    checkpoint
        .channel_versions
        .iter()
        .filter(|(channel, _)| !new_versions.contains_key(*channel))
        .map(|(channel, version)| (channel.clone(), version.clone()))
        .collect()
}

/// Writes that become the child's pending sends, in task order
pub(crate) fn tasks_only(mut writes: Vec<StoredWrite>) -> Vec<StoredWrite> {
    writes.retain(|w| w.channel == TASKS);
    writes.sort_by(|a, b| (&a.task_id, a.idx).cmp(&(&b.task_id, b.idx)));
    writes
}
