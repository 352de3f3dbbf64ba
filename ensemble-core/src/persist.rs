//! Session export and import.
//!
//! A snapshot holds every instance with its full memory log, every scene
//! with its turn log, and a description of each type in use. Backends and
//! behaviors are code, not data, so types are not recreated on import: the
//! importing session must already have them registered with the same schema.
//!
//! Writing snapshots to disk is up to the caller; this module stops at JSON.

use crate::character::{CharacterAgentInstance, CharacterProfile, LifecycleStatus, Provenance};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError, SnapshotError};
use crate::id::{InstanceId, SessionId, TypeId};
use crate::memory::{MemoryEntry, MemoryStore};
use crate::scene::Scene;
use crate::schema::{PropertyMap, TraitSchema};
use crate::session::StorySession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Description of a registered type, enough to check compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub id: TypeId,
    pub provenance: Provenance,
    pub description: String,
    pub schema: TraitSchema,
    pub instruction_template: String,
}

/// A persisted instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub profile: CharacterProfile,
    pub type_id: TypeId,
    pub properties: PropertyMap,
    pub instructions: String,
    pub status: LifecycleStatus,
    pub created_at: DateTime<Utc>,
    pub memory: Vec<MemoryEntry>,
}

/// Summary readable without restoring anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub instance_count: usize,
    pub scene_count: usize,
    pub open_scene_count: usize,
    pub memory_entry_count: usize,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Creation time of the exporting session
    #[serde(default)]
    pub session_created_at: Option<DateTime<Utc>>,
}

/// Complete exported state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Format version for compatibility checking.
    pub version: u32,
    pub session_id: SessionId,
    pub saved_at: DateTime<Utc>,
    pub config: RuntimeConfig,
    pub types: Vec<TypeRecord>,
    pub instances: Vec<InstanceRecord>,
    pub scenes: Vec<Scene>,
    pub metadata: SnapshotMetadata,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> std::result::Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> std::result::Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, rejecting other format versions.
    pub fn from_json(json: &str) -> std::result::Result<Self, SnapshotError> {
        let snapshot: SessionSnapshot = serde_json::from_str(json)?;
        check_version(snapshot.version)?;
        Ok(snapshot)
    }

    /// Read only the metadata block.
    pub fn peek_metadata(json: &str) -> std::result::Result<SnapshotMetadata, SnapshotError> {
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            saved_at: DateTime<Utc>,
            metadata: SnapshotMetadata,
        }

        let partial: Partial = serde_json::from_str(json)?;
        check_version(partial.version)?;
        Ok(SnapshotMetadata {
            saved_at: Some(partial.saved_at),
            ..partial.metadata
        })
    }
}

fn check_version(found: u32) -> std::result::Result<(), SnapshotError> {
    if found != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found,
        });
    }
    Ok(())
}

impl StorySession {
    /// Capture the whole session.
    ///
    /// Each memory log is copied atomically. Queries still in flight may or
    /// may not be included, but never partially.
    pub fn export_state(&self) -> SessionSnapshot {
        let instances: Vec<InstanceRecord> = self
            .instances
            .list()
            .iter()
            .map(|instance| InstanceRecord {
                id: instance.id(),
                profile: instance.profile().clone(),
                type_id: instance.agent_type().id().clone(),
                properties: instance.properties().clone(),
                instructions: instance.instructions(),
                status: instance.status(),
                created_at: instance.created_at(),
                memory: instance.memory().export(),
            })
            .collect();

        let used: HashSet<&TypeId> = instances.iter().map(|i| &i.type_id).collect();
        let types = self
            .types
            .list()
            .into_iter()
            .filter(|t| used.contains(t.id()))
            .map(|t| TypeRecord {
                id: t.id().clone(),
                provenance: t.provenance(),
                description: t.description().to_string(),
                schema: t.schema().clone(),
                instruction_template: t.instruction_template().to_string(),
            })
            .collect();

        let scenes = self.scenes.list();
        let saved_at = Utc::now();
        let metadata = SnapshotMetadata {
            instance_count: instances.len(),
            scene_count: scenes.len(),
            open_scene_count: scenes.iter().filter(|s| s.is_open()).count(),
            memory_entry_count: instances.iter().map(|i| i.memory.len()).sum(),
            saved_at: Some(saved_at),
            session_created_at: Some(self.created_at),
        };

        info!(
            session = %self.id,
            created_at = %self.created_at,
            instances = metadata.instance_count,
            scenes = metadata.scene_count,
            "Exported session state"
        );

        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: self.id,
            saved_at,
            config: self.config.clone(),
            types,
            instances,
            scenes,
            metadata,
        }
    }

    /// Restore a snapshot into this session.
    ///
    /// The session must hold no instances, and every type the snapshot uses
    /// must already be registered with an identical schema. Nothing is
    /// changed unless the whole snapshot is accepted.
    pub fn import_state(&self, snapshot: SessionSnapshot) -> Result<()> {
        check_version(snapshot.version)?;
        // Fail fast here; the insert below re-checks under the registry lock.
        if !self.instances.is_empty() {
            return Err(SnapshotError::SessionNotEmpty(self.instances.len()).into());
        }

        for record in &snapshot.types {
            let registered = self.types.get(&record.id)?;
            if registered.schema() != &record.schema {
                return Err(RuntimeError::TypeConflict {
                    type_id: record.id.clone(),
                    reason: "registered schema differs from the snapshot".to_string(),
                });
            }
        }

        let mut restored = BTreeMap::new();
        for record in snapshot.instances {
            if restored.contains_key(&record.id) {
                return Err(SnapshotError::Inconsistent(format!(
                    "instance {} appears twice",
                    record.id
                ))
                .into());
            }
            let agent_type = self.types.get(&record.type_id)?;
            let memory = MemoryStore::from_entries(record.id, record.memory)?;
            let instance = CharacterAgentInstance::restore(
                record.id,
                agent_type,
                record.profile,
                record.properties,
                record.instructions,
                record.status,
                record.created_at,
                memory,
            )?;
            restored.insert(record.id, instance);
        }

        let mut claimed = HashSet::new();
        for scene in snapshot.scenes.iter().filter(|s| s.is_open()) {
            for participant in &scene.participants {
                if !restored.contains_key(participant) {
                    return Err(SnapshotError::Inconsistent(format!(
                        "scene {} names unknown instance {participant}",
                        scene.id
                    ))
                    .into());
                }
                if !claimed.insert(*participant) {
                    return Err(SnapshotError::Inconsistent(format!(
                        "instance {participant} is in more than one open scene"
                    ))
                    .into());
                }
            }
        }

        let count = self
            .instances
            .insert_all_if_empty(restored.into_values())?;
        self.scenes
            .restore(snapshot.scenes, |id| self.instances.get(id).ok())?;

        info!(session = %self.id, from = %snapshot.session_id, instances = count, "Imported session state");
        Ok(())
    }
}
