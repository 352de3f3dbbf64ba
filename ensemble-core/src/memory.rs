//! Per-instance memory and state store.
//!
//! Each character owns an append-only log of what it said, thought, decided
//! and learned. Entries never change once appended; forgetting is modeled as
//! a redaction marker that supersedes an earlier entry without deleting it, so
//! the full history stays auditable across scenes.
//!
//! Reads are lazy: [`MemoryStore::read`] captures the log length at call time
//! and walks entries on demand. A read can be iterated any number of times and
//! never observes entries appended after it was taken.

use crate::capability::Operation;
use crate::error::{Result, RuntimeError, SnapshotError};
use crate::id::{CallerId, InstanceId, QueryId, SceneId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What kind of memory an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Something the character said aloud
    Dialogue,
    /// A private thought
    Thought,
    /// A decision between options
    Decision,
    /// A fact the character learned during play
    Fact,
    /// Knowledge placed into memory by an authoring collaborator
    InjectedKnowledge,
    /// A question this character asked another character
    Question,
    /// A question this character was asked, with its reply
    Answer,
    /// Marks an earlier entry as superseded
    Redaction,
}

impl MemoryKind {
    /// Whether `payload` has the shape this kind records.
    pub fn accepts(self, payload: &MemoryPayload) -> bool {
        use MemoryKind::*;
        match payload {
            MemoryPayload::Text { .. } => matches!(self, Dialogue | Thought | Fact | InjectedKnowledge),
            MemoryPayload::Decision { .. } => self == Decision,
            MemoryPayload::Exchange { .. } => matches!(self, Question | Answer),
            MemoryPayload::Redaction { .. } => self == Redaction,
        }
    }
}

/// Who may see an entry when context is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Only the owning character
    Private,
    /// Everyone present in the scene it happened in
    ScenePublic,
}

/// Content of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryPayload {
    Text {
        text: String,
    },
    Decision {
        options: Vec<String>,
        selected: usize,
        rationale: String,
    },
    /// A question and its reply, seen from one side of the exchange
    Exchange {
        counterpart: CallerId,
        question: String,
        reply: String,
    },
    Redaction {
        target: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// An immutable, sequenced memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Position in the owner's log, starting at 0
    pub sequence: u64,
    /// Scene the entry belongs to, if any
    pub scene: Option<SceneId>,
    pub kind: MemoryKind,
    pub payload: MemoryPayload,
    pub visibility: Visibility,
    pub recorded_at: DateTime<Utc>,
    /// Query that produced this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryId>,
}

impl MemoryEntry {
    /// One-line rendering used when building backend context.
    pub fn summary(&self) -> String {
        match &self.payload {
            MemoryPayload::Text { text } => match self.kind {
                MemoryKind::Dialogue => format!("I said: {text}"),
                MemoryKind::Thought => format!("I thought: {text}"),
                MemoryKind::Fact => format!("I learned: {text}"),
                MemoryKind::InjectedKnowledge => format!("I know: {text}"),
                _ => text.clone(),
            },
            MemoryPayload::Decision {
                options,
                selected,
                rationale,
            } => {
                let choice = options.get(*selected).map(String::as_str).unwrap_or("?");
                format!("I chose \"{choice}\": {rationale}")
            }
            MemoryPayload::Exchange {
                counterpart,
                question,
                reply,
            } => match self.kind {
                MemoryKind::Question => {
                    format!("I asked {counterpart} \"{question}\" and was told: {reply}")
                }
                _ => format!("{counterpart} asked me \"{question}\" and I answered: {reply}"),
            },
            MemoryPayload::Redaction { target, .. } => format!("I set aside memory #{target}"),
        }
    }

    pub fn is_redaction(&self) -> bool {
        matches!(self.payload, MemoryPayload::Redaction { .. })
    }
}

/// An entry waiting to be appended; the store assigns sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub scene: Option<SceneId>,
    pub kind: MemoryKind,
    pub payload: MemoryPayload,
    pub visibility: Visibility,
    pub query: Option<QueryId>,
}

impl NewMemory {
    fn text(kind: MemoryKind, text: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            scene: None,
            kind,
            payload: MemoryPayload::Text { text: text.into() },
            visibility,
            query: None,
        }
    }

    pub fn dialogue(text: impl Into<String>) -> Self {
        Self::text(MemoryKind::Dialogue, text, Visibility::ScenePublic)
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::text(MemoryKind::Thought, text, Visibility::Private)
    }

    pub fn fact(text: impl Into<String>) -> Self {
        Self::text(MemoryKind::Fact, text, Visibility::Private)
    }

    pub fn injected_knowledge(text: impl Into<String>) -> Self {
        Self::text(MemoryKind::InjectedKnowledge, text, Visibility::Private)
    }

    pub fn decision(options: Vec<String>, selected: usize, rationale: impl Into<String>) -> Self {
        Self {
            scene: None,
            kind: MemoryKind::Decision,
            payload: MemoryPayload::Decision {
                options,
                selected,
                rationale: rationale.into(),
            },
            visibility: Visibility::Private,
            query: None,
        }
    }

    /// The asked side of an exchange.
    pub fn answer(
        asked_by: CallerId,
        question: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self {
            scene: None,
            kind: MemoryKind::Answer,
            payload: MemoryPayload::Exchange {
                counterpart: asked_by,
                question: question.into(),
                reply: reply.into(),
            },
            visibility: Visibility::Private,
            query: None,
        }
    }

    /// The asking side of an exchange.
    pub fn question(
        asked: CallerId,
        question: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self {
            kind: MemoryKind::Question,
            ..Self::answer(asked, question, reply)
        }
    }

    pub fn in_scene(mut self, scene: Option<SceneId>) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn from_query(mut self, query: QueryId) -> Self {
        self.query = Some(query);
        self
    }
}

/// Scope filter for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeFilter {
    #[default]
    All,
    Private,
    Public,
}

/// Scene filter for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneFilter {
    #[default]
    Any,
    /// Only entries recorded in this scene
    Scene(SceneId),
    /// Entries recorded in this scene plus entries recorded outside any scene
    SceneOrUnscoped(SceneId),
    /// Only entries recorded outside any scene
    Unscoped,
}

/// Selects entries for [`MemoryStore::read`] and [`MemoryStore::window`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFilter {
    pub scope: ScopeFilter,
    pub scene: SceneFilter,
    /// Restrict to these kinds; `None` means every kind
    pub kinds: Option<BTreeSet<MemoryKind>>,
    /// Include entries superseded by a redaction marker
    pub include_superseded: bool,
    /// Include the redaction markers themselves
    pub include_markers: bool,
}

impl Default for MemoryFilter {
    /// The audit view: every entry, in order.
    fn default() -> Self {
        Self {
            scope: ScopeFilter::All,
            scene: SceneFilter::Any,
            kinds: None,
            include_superseded: true,
            include_markers: true,
        }
    }
}

impl MemoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Live memories only: no superseded entries and no markers.
    pub fn current() -> Self {
        Self {
            include_superseded: false,
            include_markers: false,
            ..Self::default()
        }
    }

    /// The context a character draws on for an operation.
    ///
    /// Speaking and choosing stay grounded in the current scene (plus
    /// knowledge recorded outside any scene); thinking and answering draw on
    /// everything the character remembers.
    pub fn for_operation(operation: Operation, scene: Option<SceneId>) -> Self {
        let scene = match (operation, scene) {
            (Operation::Speak | Operation::Choose, Some(scene)) => SceneFilter::SceneOrUnscoped(scene),
            _ => SceneFilter::Any,
        };
        Self {
            scene,
            ..Self::current()
        }
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_scene(mut self, scene: SceneFilter) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = MemoryKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        let scope_ok = match self.scope {
            ScopeFilter::All => true,
            ScopeFilter::Private => entry.visibility == Visibility::Private,
            ScopeFilter::Public => entry.visibility == Visibility::ScenePublic,
        };
        let scene_ok = match self.scene {
            SceneFilter::Any => true,
            SceneFilter::Scene(id) => entry.scene == Some(id),
            SceneFilter::SceneOrUnscoped(id) => entry.scene.is_none() || entry.scene == Some(id),
            SceneFilter::Unscoped => entry.scene.is_none(),
        };
        let kind_ok = self
            .kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&entry.kind));
        let marker_ok = self.include_markers || !entry.is_redaction();
        scope_ok && scene_ok && kind_ok && marker_ok
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<Arc<MemoryEntry>>,
    /// Superseded sequence -> sequence of the redaction marker
    superseded: HashMap<u64, u64>,
}

impl LogState {
    fn push(&mut self, draft: NewMemory) -> Arc<MemoryEntry> {
        let entry = Arc::new(MemoryEntry {
            sequence: self.entries.len() as u64,
            scene: draft.scene,
            kind: draft.kind,
            payload: draft.payload,
            visibility: draft.visibility,
            recorded_at: Utc::now(),
            query: draft.query,
        });
        if let MemoryPayload::Redaction { target, .. } = entry.payload {
            self.superseded.insert(target, entry.sequence);
        }
        self.entries.push(entry.clone());
        entry
    }
}

/// Append-only memory partition owned by one instance.
///
/// The store takes its own short write lock per append so a batch lands
/// atomically. Ordering between appends is the dispatcher's job: it only
/// appends while holding the owner's execution slot.
#[derive(Debug)]
pub struct MemoryStore {
    owner: InstanceId,
    state: RwLock<LogState>,
}

impl MemoryStore {
    pub fn new(owner: InstanceId) -> Self {
        Self {
            owner,
            state: RwLock::new(LogState::default()),
        }
    }

    /// Rebuild a store from previously exported entries.
    ///
    /// The log must hold exactly what `append` and `redact` could have
    /// produced. Anything else is reported as an inconsistent snapshot.
    pub fn from_entries(owner: InstanceId, entries: Vec<MemoryEntry>) -> Result<Self> {
        let inconsistent = |detail: String| -> RuntimeError {
            SnapshotError::Inconsistent(format!("memory of {owner}: {detail}")).into()
        };

        let mut state = LogState::default();
        for (position, entry) in entries.into_iter().enumerate() {
            let sequence = entry.sequence;
            if sequence != position as u64 {
                return Err(inconsistent(format!(
                    "entry #{sequence} at position {position}"
                )));
            }
            if !entry.kind.accepts(&entry.payload) {
                return Err(inconsistent(format!(
                    "entry #{sequence} of kind {:?} carries the wrong payload",
                    entry.kind
                )));
            }
            match &entry.payload {
                MemoryPayload::Decision {
                    options, selected, ..
                } if *selected >= options.len() => {
                    return Err(inconsistent(format!(
                        "entry #{sequence} selects option {selected} of {}",
                        options.len()
                    )));
                }
                MemoryPayload::Redaction { target, .. } => {
                    let target = *target;
                    match state.entries.get(target as usize) {
                        None => {
                            return Err(inconsistent(format!(
                                "entry #{sequence} redacts #{target}, which does not precede it"
                            )))
                        }
                        Some(redacted) if redacted.is_redaction() => {
                            return Err(inconsistent(format!(
                                "entry #{sequence} redacts the marker #{target}"
                            )))
                        }
                        Some(_) => {}
                    }
                    if let Some(earlier) = state.superseded.insert(target, sequence) {
                        return Err(inconsistent(format!(
                            "entry #{target} is redacted by both #{earlier} and #{sequence}"
                        )));
                    }
                }
                _ => {}
            }
            state.entries.push(Arc::new(entry));
        }
        Ok(Self {
            owner,
            state: RwLock::new(state),
        })
    }

    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one entry and return it with its assigned sequence number.
    pub(crate) fn append(&self, draft: NewMemory) -> Result<Arc<MemoryEntry>> {
        Self::check_draft(&draft)?;
        Ok(self.state.write().push(draft))
    }

    /// Append several entries under one lock; either all land or none do.
    pub(crate) fn append_all(&self, drafts: Vec<NewMemory>) -> Result<Vec<Arc<MemoryEntry>>> {
        for draft in &drafts {
            Self::check_draft(draft)?;
        }
        let mut state = self.state.write();
        Ok(drafts.into_iter().map(|d| state.push(d)).collect())
    }

    /// Append a marker superseding entry `target`.
    pub(crate) fn redact(&self, target: u64, reason: Option<String>) -> Result<Arc<MemoryEntry>> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .get(target as usize)
            .cloned()
            .ok_or(RuntimeError::UnknownMemoryEntry {
                instance: self.owner,
                sequence: target,
            })?;
        if entry.is_redaction() {
            return Err(RuntimeError::InvalidTransition(format!(
                "memory #{target} of {} is a redaction marker",
                self.owner
            )));
        }
        if state.superseded.contains_key(&target) {
            return Err(RuntimeError::InvalidTransition(format!(
                "memory #{target} of {} is already redacted",
                self.owner
            )));
        }
        let marker = NewMemory {
            scene: entry.scene,
            kind: MemoryKind::Redaction,
            payload: MemoryPayload::Redaction { target, reason },
            visibility: Visibility::Private,
            query: None,
        };
        Ok(state.push(marker))
    }

    fn check_draft(draft: &NewMemory) -> Result<()> {
        let is_marker = matches!(draft.payload, MemoryPayload::Redaction { .. });
        if is_marker || draft.kind == MemoryKind::Redaction {
            return Err(RuntimeError::InvalidRequest(
                "redaction markers are appended through redact".to_string(),
            ));
        }
        if !draft.kind.accepts(&draft.payload) {
            return Err(RuntimeError::InvalidRequest(format!(
                "{:?} memory cannot carry this payload",
                draft.kind
            )));
        }
        Ok(())
    }

    /// Lazy, restartable read over the entries present right now.
    pub fn read(self: &Arc<Self>, filter: MemoryFilter) -> MemoryRead {
        MemoryRead {
            store: self.clone(),
            end: self.len(),
            filter,
        }
    }

    /// The most recent `limit` entries matching `filter`, oldest first.
    pub fn window(&self, filter: &MemoryFilter, limit: usize) -> Vec<Arc<MemoryEntry>> {
        let state = self.state.read();
        let end = state.entries.len() as u64;
        let mut recent: Vec<_> = state
            .entries
            .iter()
            .rev()
            .filter(|e| Self::visible(&state, filter, e, end))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Whether entry `sequence` has been redacted.
    pub fn is_superseded(&self, sequence: u64) -> bool {
        self.state.read().superseded.contains_key(&sequence)
    }

    /// Copy of every entry, for export.
    pub fn export(&self) -> Vec<MemoryEntry> {
        self.state
            .read()
            .entries
            .iter()
            .map(|e| MemoryEntry::clone(e))
            .collect()
    }

    fn visible(state: &LogState, filter: &MemoryFilter, entry: &MemoryEntry, end: u64) -> bool {
        if !filter.include_superseded {
            if let Some(marker) = state.superseded.get(&entry.sequence) {
                if *marker < end {
                    return false;
                }
            }
        }
        filter.matches(entry)
    }

    fn entry_at(&self, position: usize, filter: &MemoryFilter, end: usize) -> Option<Arc<MemoryEntry>> {
        let state = self.state.read();
        let entry = state.entries.get(position)?;
        Self::visible(&state, filter, entry, end as u64).then(|| entry.clone())
    }
}

/// A finite view of a memory log taken at one point in time.
#[derive(Debug, Clone)]
pub struct MemoryRead {
    store: Arc<MemoryStore>,
    end: usize,
    filter: MemoryFilter,
}

impl MemoryRead {
    /// Start (or restart) iteration from the first entry.
    pub fn iter(&self) -> MemoryIter<'_> {
        MemoryIter {
            read: self,
            position: 0,
        }
    }

    /// Number of log entries covered by this read, before filtering.
    pub fn log_len(&self) -> usize {
        self.end
    }

    pub fn to_vec(&self) -> Vec<Arc<MemoryEntry>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a MemoryRead {
    type Item = Arc<MemoryEntry>;
    type IntoIter = MemoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`MemoryRead`].
#[derive(Debug)]
pub struct MemoryIter<'a> {
    read: &'a MemoryRead,
    position: usize,
}

impl Iterator for MemoryIter<'_> {
    type Item = Arc<MemoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.read.end {
            let position = self.position;
            self.position += 1;
            if let Some(entry) = self
                .read
                .store
                .entry_at(position, &self.read.filter, self.read.end)
            {
                return Some(entry);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(InstanceId::new()))
    }

    #[test]
    fn test_sequence_numbers() {
        let store = store();
        let a = store.append(NewMemory::dialogue("Hello")).unwrap();
        let b = store.append(NewMemory::thought("Hmm")).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_read_is_restartable_and_bounded() {
        let store = store();
        store.append(NewMemory::dialogue("one")).unwrap();
        let read = store.read(MemoryFilter::all());
        store.append(NewMemory::dialogue("two")).unwrap();

        assert_eq!(read.iter().count(), 1);
        assert_eq!(read.iter().count(), 1);
        assert_eq!(store.read(MemoryFilter::all()).iter().count(), 2);
    }

    #[test]
    fn test_redaction_supersedes_without_deleting() {
        let store = store();
        store.append(NewMemory::fact("The key is under the mat")).unwrap();
        let marker = store.redact(0, Some("retcon".to_string())).unwrap();
        assert_eq!(marker.sequence, 1);
        assert!(store.is_superseded(0));

        let audit = store.read(MemoryFilter::all()).to_vec();
        assert_eq!(audit.len(), 2);
        assert_eq!(
            audit[0].payload,
            MemoryPayload::Text {
                text: "The key is under the mat".to_string()
            }
        );

        assert!(store.read(MemoryFilter::current()).to_vec().is_empty());
    }

    #[test]
    fn test_redaction_errors() {
        let store = store();
        assert!(matches!(
            store.redact(0, None),
            Err(RuntimeError::UnknownMemoryEntry { sequence: 0, .. })
        ));
        store.append(NewMemory::fact("x")).unwrap();
        store.redact(0, None).unwrap();
        assert!(matches!(
            store.redact(0, None),
            Err(RuntimeError::InvalidTransition(_))
        ));
        assert!(matches!(
            store.redact(1, None),
            Err(RuntimeError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_redaction_not_appendable_directly() {
        let store = store();
        let draft = NewMemory {
            kind: MemoryKind::Redaction,
            ..NewMemory::fact("sneaky")
        };
        assert!(store.append(draft).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_read_predates_redaction() {
        let store = store();
        store.append(NewMemory::fact("x")).unwrap();
        let before = store.read(MemoryFilter::current());
        store.redact(0, None).unwrap();
        assert_eq!(before.iter().count(), 1);
    }

    #[test]
    fn test_batch_append_all_or_nothing() {
        let store = store();
        let bad = NewMemory {
            kind: MemoryKind::Redaction,
            ..NewMemory::fact("x")
        };
        assert!(store
            .append_all(vec![NewMemory::dialogue("ok"), bad])
            .is_err());
        assert!(store.is_empty());

        let entries = store
            .append_all(vec![NewMemory::dialogue("a"), NewMemory::thought("b")])
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].sequence, 1);
    }

    #[test]
    fn test_filters() {
        let store = store();
        let scene = SceneId::new();
        let other = SceneId::new();
        store.append(NewMemory::dialogue("here").in_scene(Some(scene))).unwrap();
        store.append(NewMemory::dialogue("there").in_scene(Some(other))).unwrap();
        store.append(NewMemory::injected_knowledge("lore")).unwrap();
        store.append(NewMemory::thought("secret").in_scene(Some(scene))).unwrap();

        let count = |filter: MemoryFilter| store.read(filter).iter().count();
        assert_eq!(count(MemoryFilter::all().with_scene(SceneFilter::Scene(scene))), 2);
        assert_eq!(count(MemoryFilter::all().with_scene(SceneFilter::SceneOrUnscoped(scene))), 3);
        assert_eq!(count(MemoryFilter::all().with_scene(SceneFilter::Unscoped)), 1);
        assert_eq!(count(MemoryFilter::all().with_scope(ScopeFilter::Public)), 2);
        assert_eq!(count(MemoryFilter::all().with_kinds([MemoryKind::Thought])), 1);
    }

    #[test]
    fn test_window_is_bounded_and_ordered() {
        let store = store();
        for i in 0..10 {
            store.append(NewMemory::dialogue(format!("line {i}"))).unwrap();
        }
        store.redact(9, None).unwrap();
        let window = store.window(&MemoryFilter::current(), 3);
        let seqs: Vec<u64> = window.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![6, 7, 8]);
    }

    #[test]
    fn test_operation_filters() {
        let scene = SceneId::new();
        let speak = MemoryFilter::for_operation(Operation::Speak, Some(scene));
        assert_eq!(speak.scene, SceneFilter::SceneOrUnscoped(scene));
        assert!(!speak.include_superseded);
        let think = MemoryFilter::for_operation(Operation::Think, Some(scene));
        assert_eq!(think.scene, SceneFilter::Any);
    }

    #[test]
    fn test_export_and_restore() {
        let owner = InstanceId::new();
        let store = MemoryStore::new(owner);
        store.append(NewMemory::fact("a")).unwrap();
        store.append(NewMemory::fact("b")).unwrap();
        store.redact(0, None).unwrap();

        let restored = MemoryStore::from_entries(owner, store.export()).unwrap();
        assert_eq!(restored.len(), 3);
        assert!(restored.is_superseded(0));
        assert_eq!(restored.append(NewMemory::fact("c")).unwrap().sequence, 3);
    }

    #[test]
    fn test_restore_rejects_gaps() {
        let owner = InstanceId::new();
        let store = MemoryStore::new(owner);
        store.append(NewMemory::fact("a")).unwrap();
        store.append(NewMemory::fact("b")).unwrap();
        let mut entries = store.export();
        entries.remove(0);
        assert!(matches!(
            MemoryStore::from_entries(owner, entries),
            Err(RuntimeError::Snapshot(SnapshotError::Inconsistent(_)))
        ));
    }

    #[test]
    fn test_restore_applies_redaction_rules() {
        let owner = InstanceId::new();
        let store = MemoryStore::new(owner);
        store.append(NewMemory::fact("a")).unwrap();
        store.append(NewMemory::fact("b")).unwrap();
        store.redact(0, None).unwrap();
        let entries = store.export();
        let inconsistent = |entries: Vec<MemoryEntry>| {
            matches!(
                MemoryStore::from_entries(owner, entries),
                Err(RuntimeError::Snapshot(SnapshotError::Inconsistent(_)))
            )
        };

        // A second marker for #0.
        let mut doubled = entries.clone();
        doubled.push(MemoryEntry {
            sequence: 3,
            ..entries[2].clone()
        });
        assert!(inconsistent(doubled));

        // A marker redacting the marker.
        let mut nested = entries.clone();
        nested.push(MemoryEntry {
            sequence: 3,
            payload: MemoryPayload::Redaction {
                target: 2,
                reason: None,
            },
            ..entries[2].clone()
        });
        assert!(inconsistent(nested));

        // A marker pointing forward.
        let mut forward = entries.clone();
        forward[2].payload = MemoryPayload::Redaction {
            target: 5,
            reason: None,
        };
        assert!(inconsistent(forward));

        // Redaction kind with a text payload.
        let mut mismatched = entries.clone();
        mismatched[1].kind = MemoryKind::Redaction;
        assert!(inconsistent(mismatched));

        // A fact carrying a decision.
        let mut mismatched = entries;
        mismatched[0].payload = MemoryPayload::Decision {
            options: vec!["stay".to_string()],
            selected: 0,
            rationale: String::new(),
        };
        assert!(inconsistent(mismatched));
    }

    #[test]
    fn test_summaries() {
        let store = store();
        let asked = store
            .append(NewMemory::answer(
                CallerId::agent("narrator"),
                "Do you trust Lizzy?",
                "Not entirely.",
            ))
            .unwrap();
        assert_eq!(
            asked.summary(),
            "agent:narrator asked me \"Do you trust Lizzy?\" and I answered: Not entirely."
        );
        let decided = store
            .append(NewMemory::decision(
                vec!["fight".to_string(), "flee".to_string()],
                1,
                "Too many of them",
            ))
            .unwrap();
        assert_eq!(decided.summary(), "I chose \"flee\": Too many of them");
    }

    proptest! {
        /// Earlier reads are always a prefix of later reads, redactions included.
        #[test]
        fn prop_log_is_prefix_extending(ops in proptest::collection::vec(0u8..4, 1..40)) {
            let store = store();
            let mut previous: Vec<MemoryEntry> = Vec::new();
            for op in ops {
                match op {
                    0 => { store.append(NewMemory::dialogue("d")).unwrap(); }
                    1 => { store.append(NewMemory::thought("t")).unwrap(); }
                    2 => { store.append(NewMemory::fact("f")).unwrap(); }
                    _ => {
                        let len = store.len() as u64;
                        if len > 0 {
                            let _ = store.redact(len / 2, None);
                        }
                    }
                }
                let current: Vec<MemoryEntry> = store
                    .read(MemoryFilter::all())
                    .iter()
                    .map(|e| MemoryEntry::clone(&e))
                    .collect();
                prop_assert!(current.len() >= previous.len());
                prop_assert_eq!(&current[..previous.len()], &previous[..]);
                for (i, entry) in current.iter().enumerate() {
                    prop_assert_eq!(entry.sequence, i as u64);
                }
                previous = current;
            }
        }
    }
}
