//! Scenes: bounded episodes with a fixed participant set.
//!
//! An instance can be in at most one open scene. Opening a scene checks and
//! claims every participant while holding the scene table's write lock, so
//! two scenes racing for the same character cannot both win.

use crate::capability::Operation;
use crate::character::CharacterAgentInstance;
use crate::dispatch::{Response, ResponseStatus};
use crate::error::{Result, RuntimeError};
use crate::id::{InstanceId, QueryId, SceneId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// How turns within a scene are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Participants act whenever they are asked, concurrently if need be
    #[default]
    Free,
    /// One turn at a time; rounds go in participant order
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneStatus {
    Open,
    Closed,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Ok,
    Failed,
    Cancelled,
    /// Refused before reaching the backend
    Rejected,
}

/// One entry in a scene's turn log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub instance: InstanceId,
    pub query: QueryId,
    pub operation: Operation,
    pub outcome: TurnOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TurnRecord {
    pub(crate) fn new(
        instance: InstanceId,
        query: QueryId,
        operation: Operation,
        result: &Result<Response>,
    ) -> Self {
        let (outcome, error) = match result {
            Ok(response) => {
                let outcome = match response.status {
                    ResponseStatus::Ok => TurnOutcome::Ok,
                    ResponseStatus::Failed => TurnOutcome::Failed,
                    ResponseStatus::Cancelled => TurnOutcome::Cancelled,
                };
                (outcome, response.error.as_ref().map(ToString::to_string))
            }
            Err(err) => (TurnOutcome::Rejected, Some(err.to_string())),
        };
        Self {
            instance,
            query,
            operation,
            outcome,
            error,
            at: Utc::now(),
        }
    }
}

/// A scene and its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,
    pub title: String,
    /// Participants in the order they were given
    pub participants: Vec<InstanceId>,
    pub turn_policy: TurnPolicy,
    pub status: SceneStatus,
    pub turns: Vec<TurnRecord>,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Scene {
    pub fn is_open(&self) -> bool {
        self.status == SceneStatus::Open
    }

    pub fn has_participant(&self, instance: InstanceId) -> bool {
        self.participants.contains(&instance)
    }

    /// Participants other than `instance`.
    pub fn others(&self, instance: InstanceId) -> Vec<InstanceId> {
        self.participants
            .iter()
            .copied()
            .filter(|id| *id != instance)
            .collect()
    }
}

/// What a caller needs to take a turn in a scene.
pub(crate) struct TurnTicket {
    pub others: Vec<InstanceId>,
    pub policy: TurnPolicy,
    pub turn_lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
struct SceneSlot {
    scene: Scene,
    turn_lock: Arc<Mutex<()>>,
}

impl SceneSlot {
    fn new(scene: Scene) -> Self {
        Self {
            scene,
            turn_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Table of every scene in a session, open and closed.
#[derive(Debug, Default)]
pub struct SceneBook {
    scenes: RwLock<HashMap<SceneId, SceneSlot>>,
}

impl SceneBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a scene, claiming every participant atomically.
    pub(crate) fn open(
        &self,
        title: String,
        participants: Vec<Arc<CharacterAgentInstance>>,
        turn_policy: TurnPolicy,
    ) -> Result<SceneId> {
        if participants.is_empty() {
            return Err(RuntimeError::InvalidRequest(
                "a scene needs at least one participant".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for instance in &participants {
            if !seen.insert(instance.id()) {
                return Err(RuntimeError::InvalidRequest(format!(
                    "instance {} is listed twice",
                    instance.id()
                )));
            }
        }

        let mut scenes = self.scenes.write();
        for instance in &participants {
            instance.check_can_join()?;
        }

        let id = SceneId::new();
        for instance in &participants {
            instance.join_scene(id);
        }
        let scene = Scene {
            id,
            title,
            participants: participants.iter().map(|i| i.id()).collect(),
            turn_policy,
            status: SceneStatus::Open,
            turns: Vec::new(),
            opened_at: Utc::now(),
            closed_at: None,
        };
        info!(scene = %id, title = %scene.title, participants = scene.participants.len(), "Scene opened");
        scenes.insert(id, SceneSlot::new(scene));
        Ok(id)
    }

    /// Close an open scene and release its participants.
    pub(crate) fn close(
        &self,
        id: SceneId,
        lookup: impl Fn(InstanceId) -> Option<Arc<CharacterAgentInstance>>,
    ) -> Result<()> {
        let mut scenes = self.scenes.write();
        let slot = scenes.get_mut(&id).ok_or(RuntimeError::UnknownScene(id))?;
        if !slot.scene.is_open() {
            return Err(RuntimeError::InvalidTransition(format!(
                "scene {id} is already closed"
            )));
        }
        slot.scene.status = SceneStatus::Closed;
        slot.scene.closed_at = Some(Utc::now());
        for instance in slot.scene.participants.iter().filter_map(|p| lookup(*p)) {
            instance.leave_scene(id);
        }
        info!(scene = %id, turns = slot.scene.turns.len(), "Scene closed");
        Ok(())
    }

    pub fn get(&self, id: SceneId) -> Result<Scene> {
        self.scenes
            .read()
            .get(&id)
            .map(|slot| slot.scene.clone())
            .ok_or(RuntimeError::UnknownScene(id))
    }

    /// Every scene, oldest first. Scenes opened in the same instant are
    /// ordered by id.
    pub fn list(&self) -> Vec<Scene> {
        let mut all: Vec<Scene> = self
            .scenes
            .read()
            .values()
            .map(|slot| slot.scene.clone())
            .collect();
        all.sort_by_key(|s| (s.opened_at, s.id));
        all
    }

    pub fn len(&self) -> usize {
        self.scenes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that `instance` may act in scene `id` right now.
    pub(crate) fn ticket(&self, id: SceneId, instance: InstanceId) -> Result<TurnTicket> {
        let scenes = self.scenes.read();
        let slot = scenes.get(&id).ok_or(RuntimeError::UnknownScene(id))?;
        if !slot.scene.is_open() {
            return Err(RuntimeError::InvalidTransition(format!(
                "scene {id} is closed"
            )));
        }
        if !slot.scene.has_participant(instance) {
            return Err(RuntimeError::NotParticipant { scene: id, instance });
        }
        Ok(TurnTicket {
            others: slot.scene.others(instance),
            policy: slot.scene.turn_policy,
            turn_lock: slot.turn_lock.clone(),
        })
    }

    pub(crate) fn record_turn(&self, id: SceneId, turn: TurnRecord) {
        if let Some(slot) = self.scenes.write().get_mut(&id) {
            slot.scene.turns.push(turn);
        }
    }

    /// Put back scenes from a snapshot. Open scenes reclaim their participants.
    pub(crate) fn restore(
        &self,
        scenes: Vec<Scene>,
        lookup: impl Fn(InstanceId) -> Option<Arc<CharacterAgentInstance>>,
    ) -> Result<()> {
        let mut table = self.scenes.write();
        for scene in scenes {
            if scene.is_open() {
                for participant in &scene.participants {
                    let instance = lookup(*participant).ok_or(RuntimeError::UnknownInstance(*participant))?;
                    instance.join_scene(scene.id);
                }
            }
            table.insert(scene.id, SceneSlot::new(scene));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_others() {
        let a = InstanceId::new();
        let b = InstanceId::new();
        let scene = Scene {
            id: SceneId::new(),
            title: "Market".to_string(),
            participants: vec![a, b],
            turn_policy: TurnPolicy::Free,
            status: SceneStatus::Open,
            turns: Vec::new(),
            opened_at: Utc::now(),
            closed_at: None,
        };
        assert_eq!(scene.others(a), vec![b]);
        assert!(scene.has_participant(b));
        assert!(!scene.has_participant(InstanceId::new()));
    }

    #[test]
    fn test_turn_record_from_rejection() {
        let record = TurnRecord::new(
            InstanceId::new(),
            QueryId::new(),
            Operation::Speak,
            &Err(RuntimeError::InvalidRequest("nope".to_string())),
        );
        assert_eq!(record.outcome, TurnOutcome::Rejected);
        assert_eq!(record.error.as_deref(), Some("Invalid request: nope"));
    }

    #[test]
    fn test_unknown_scene() {
        let book = SceneBook::new();
        assert!(matches!(
            book.get(SceneId::new()),
            Err(RuntimeError::UnknownScene(_))
        ));
        assert!(matches!(
            book.ticket(SceneId::new(), InstanceId::new()),
            Err(RuntimeError::UnknownScene(_))
        ));
    }

    #[test]
    fn test_list_breaks_opening_ties_by_id() {
        let opened_at = Utc::now();
        let scenes: Vec<Scene> = (0..6)
            .map(|i| Scene {
                id: SceneId::new(),
                title: format!("Chapter {i}"),
                participants: Vec::new(),
                turn_policy: TurnPolicy::Free,
                status: SceneStatus::Closed,
                turns: Vec::new(),
                opened_at,
                closed_at: Some(opened_at),
            })
            .collect();
        let mut expected: Vec<SceneId> = scenes.iter().map(|s| s.id).collect();
        expected.sort();

        let book = SceneBook::new();
        book.restore(scenes, |_| None).unwrap();
        for _ in 0..5 {
            let listed: Vec<SceneId> = book.list().iter().map(|s| s.id).collect();
            assert_eq!(listed, expected);
        }
    }
}
