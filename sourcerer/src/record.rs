//! The persisted record shapes: commands, events and snapshots, plus the
//! bookkeeping types the aggregate repository uses to resolve and replay
//! multiple child streams.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::id::{ActorId, EventId};
use crate::identifiers::Identifiers;
use crate::{Error, Event, Result};

/// A persisted command, kept for audit. Commands are never replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// A generated id for this command instance.
    pub id: EventId,
    /// The type-name of the command.
    pub type_name: String,
    /// Namespace the command was received under.
    pub namespace: String,
    /// When the command was constructed by the caller.
    pub created_on: time_stamp::Timestamp,
    /// When the repository received the command.
    pub received_on: time_stamp::Timestamp,
    /// When the command was actually handled.
    pub handled_on: time_stamp::Timestamp,
    /// The actor-id that handled the command.
    pub handled_by: ActorId,
    /// The baseline snapshot version the command was applied to.
    pub handled_version: u64,
    /// The serialized command payload.
    pub payload: serde_json::Value,
}

impl CommandRecord {
    /// Builds a new command record with an id and `created_on`/`received_on`
    /// stamped to now; `handled_by`/`handled_version`/`handled_on` are filled
    /// in by the repository once a baseline actor has been resolved.
    pub fn new(type_name: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = time_stamp::now();
        Self {
            id: EventId::new(),
            type_name: type_name.into(),
            namespace: String::new(),
            created_on: now,
            received_on: now,
            handled_on: now,
            handled_by: ActorId::nil(),
            handled_version: 0,
            payload,
        }
    }
}

/// A persisted event belonging to exactly one stream (`actor_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "E: Serialize",
    deserialize = "E: serde::de::DeserializeOwned"
))]
pub struct EventRecord<E: Event> {
    /// A generated, monotonic id for this event.
    pub id: EventId,
    /// The type-name of the event.
    pub type_name: String,
    /// Namespace inferred from the emitting actor.
    pub actor_namespace: String,
    /// The stream (actor-id) this event belongs to.
    pub actor_id: ActorId,
    /// The type name of the stream's actor. For events emitted by an
    /// aggregate on behalf of a child, this is the child's actor-name.
    pub actor_name: String,
    /// When the event was created.
    pub created_on: time_stamp::Timestamp,
    /// The actor-name that originated the event (the handling actor, which
    /// for aggregates is always the aggregate's own name regardless of which
    /// stream the event targets).
    pub created_by: String,
    /// The actor-id that originated the event.
    pub created_by_id: ActorId,
    /// The baseline version of the originating actor.
    pub created_by_version: u64,
    /// The command type-name that triggered this event.
    pub initiated_by: String,
    /// The command id that triggered this event.
    pub initiated_by_id: EventId,
    /// The event payload.
    pub payload: E,
}

impl<E: Event> EventRecord<E> {
    /// Returns `true` when this record has a freshly-minted, non-nil id.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
    }
}

/// A materialized actor state, serving as a rehydration shortcut.
///
/// `vector`/`ancestor` are reserved for a future CRDT-style causal merge;
/// the source this crate is ported from defines but never populates them,
/// so they stay empty here too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: serde::de::DeserializeOwned"
))]
pub struct Snapshot<S> {
    /// A generated id for this snapshot instance. A snapshot is "valid" iff
    /// this is non-nil.
    pub id: EventId,
    /// The actor-id this snapshot belongs to.
    pub actor_id: ActorId,
    /// The type-name of the actor.
    pub type_name: String,
    /// Reserved causal-tracking vector. Never populated.
    pub vector: String,
    /// Monotonic version, incremented once per fetch/handle that applies
    /// at least one event.
    pub version: u64,
    /// Reserved causal-tracking ancestor pointer. Never populated.
    pub ancestor: String,
    /// When this snapshot was created.
    pub created_on: time_stamp::Timestamp,
    /// Cumulative count of events ever applied to reach this state.
    pub events_applied: u64,
    /// Count of events applied since the last snapshot write; reset to zero
    /// whenever a snapshot is actually persisted.
    pub events_since_snapshot: u64,
    /// The id of the last event played against this snapshot.
    pub last_event_id: EventId,
    /// When the last event was created.
    pub last_event_on: time_stamp::Timestamp,
    /// The id of the last command handled.
    pub last_command_id: EventId,
    /// When the last command was handled.
    pub last_command_on: time_stamp::Timestamp,
    /// For aggregate snapshots: per-child resume point, child-name ->
    /// child-id -> last-seen event-id. Unused by plain actor snapshots.
    pub last_events: LastEventMap,
    /// The materialized actor state.
    pub payload: S,
}

impl<S> Snapshot<S> {
    /// Builds a fresh, *invalid* (nil-id) snapshot wrapping `payload`, bound
    /// to no actor-id yet. The repository assigns `id`/`actor_id` once it
    /// knows whether this is a brand new stream or an existing one.
    pub fn empty(type_name: impl Into<String>, payload: S) -> Self {
        Self {
            id: EventId::nil(),
            actor_id: ActorId::nil(),
            type_name: type_name.into(),
            vector: String::new(),
            version: 0,
            ancestor: String::new(),
            created_on: time_stamp::now(),
            events_applied: 0,
            events_since_snapshot: 0,
            last_event_id: EventId::nil(),
            last_event_on: time_stamp::Timestamp::default(),
            last_command_id: EventId::nil(),
            last_command_on: time_stamp::Timestamp::default(),
            last_events: LastEventMap::default(),
            payload,
        }
    }

    /// Returns `true` if this snapshot was actually loaded from storage
    /// (has a non-nil id) rather than freshly constructed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
    }
}

/// Per-child resume point for aggregate replay: child-name -> child-id ->
/// last-seen event-id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastEventMap(pub HashMap<String, HashMap<ActorId, EventId>>);

impl LastEventMap {
    /// Records the last-seen event-id for a given child stream.
    pub fn set(&mut self, child_name: impl Into<String>, child_id: ActorId, event_id: EventId) {
        self.0.entry(child_name.into()).or_default().insert(child_id, event_id);
    }

    /// Returns the last-seen event-id for a child stream, if any.
    #[must_use]
    pub fn get(&self, child_name: &str, child_id: ActorId) -> Option<EventId> {
        self.0.get(child_name).and_then(|m| m.get(&child_id)).copied()
    }

    /// Merges every child-id from `id_map` that isn't already tracked,
    /// inserting it with a nil last-event-id (replay from the beginning).
    pub fn merge_new_children(&mut self, id_map: &AggregateIdMap) {
        for (child_name, ids) in &id_map.aggregated {
            let entry = self.0.entry(child_name.clone()).or_default();
            for id in ids {
                entry.entry(*id).or_insert_with(EventId::nil);
            }
        }
    }
}

/// Enumerates the child streams participating in an aggregate, as produced
/// by the map store on lookup.
#[derive(Debug, Clone, Default)]
pub struct AggregateIdMap {
    /// The aggregate's own actor-name.
    pub actor_name: String,
    /// The aggregate's own actor-id.
    pub actor_id: ActorId,
    /// child-name -> set of child-ids.
    pub aggregated: BTreeMap<String, Vec<ActorId>>,
}

impl AggregateIdMap {
    /// Creates an id map for an aggregate with no children registered yet.
    #[must_use]
    pub fn new(actor_name: impl Into<String>, actor_id: ActorId) -> Self {
        Self {
            actor_name: actor_name.into(),
            actor_id,
            aggregated: BTreeMap::new(),
        }
    }

    /// Registers child-ids under `child_name`, deduplicating.
    pub fn add_ids_for(&mut self, child_name: impl Into<String>, ids: impl IntoIterator<Item = ActorId>) {
        let entry = self.aggregated.entry(child_name.into()).or_default();
        for id in ids {
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
    }
}

/// A single (name, identifiers) -> actor-id resolution made during the
/// id-assignment pass of an aggregate command.
#[derive(Debug, Clone)]
pub struct IdAssignment {
    /// The actor-name this assignment is for.
    pub actor_name: String,
    /// The resolved (or freshly minted) actor-id.
    pub assigned_id: ActorId,
    /// The identifiers that were resolved.
    pub identifiers: Identifiers,
    /// The canonical string form of `identifiers`, used for lookup.
    pub canonical: String,
}

/// All id resolutions made within a single aggregate command scope, indexed
/// by both canonical-identifiers-string and actor-id.
#[derive(Debug, Clone, Default)]
pub struct IdAssignments {
    aggregate_name: String,
    aggregate_assignment: Option<IdAssignment>,
    by_identifier: HashMap<String, IdAssignment>,
    by_id: HashMap<ActorId, IdAssignment>,
    by_actor_name: HashMap<String, Vec<ActorId>>,
}

impl IdAssignments {
    /// Creates an empty assignment table for the given aggregate actor-name.
    #[must_use]
    pub fn new(aggregate_name: impl Into<String>) -> Self {
        Self {
            aggregate_name: aggregate_name.into(),
            aggregate_assignment: None,
            by_identifier: HashMap::new(),
            by_id: HashMap::new(),
            by_actor_name: HashMap::new(),
        }
    }

    /// Records a resolved assignment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `identifiers` cannot be
    /// canonicalized.
    pub fn add(&mut self, actor_name: &str, identifiers: &Identifiers, id: ActorId) -> Result<()> {
        let canonical = identifiers.canonical()?;
        let assignment = IdAssignment {
            actor_name: actor_name.to_string(),
            assigned_id: id,
            identifiers: identifiers.clone(),
            canonical: canonical.clone(),
        };
        if actor_name == self.aggregate_name {
            self.aggregate_assignment = Some(assignment.clone());
        }
        self.by_actor_name.entry(actor_name.to_string()).or_default().push(id);
        self.by_id.insert(id, assignment.clone());
        self.by_identifier.insert(canonical, assignment);
        Ok(())
    }

    /// Returns the distinguished aggregate-id, if it has been assigned yet.
    #[must_use]
    pub fn aggregate_id(&self) -> Option<ActorId> {
        self.aggregate_assignment.as_ref().map(|a| a.assigned_id)
    }

    /// Looks up the actor-id assigned to a given (name, identifiers) pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `identifiers` cannot be
    /// canonicalized.
    pub fn get_for(&self, identifiers: &Identifiers) -> Result<Option<ActorId>> {
        let canonical = identifiers.canonical()?;
        Ok(self.by_identifier.get(&canonical).map(|a| a.assigned_id))
    }

    /// Returns the actor-id assigned under `actor_name` during this
    /// command's id-assignment pass.
    ///
    /// This is a fallback for events whose [`crate::EventMetadata`] names a
    /// target actor but not its identifiers (`created_for` without
    /// `created_for_ids`): when a command registers more than one identity
    /// under the same child actor-name (e.g. two vehicles in one command),
    /// the most recently assigned one wins. Prefer [`Self::get_for`] with
    /// the event's own identifiers whenever they're available — it resolves
    /// the exact child, not just the last one assigned under that name.
    #[must_use]
    pub fn by_identifier_name(&self, actor_name: &str) -> Option<ActorId> {
        self.by_actor_name.get(actor_name).and_then(|ids| ids.last().copied())
    }
}

/// An event record as a storage back-end actually persists and retrieves
/// it, before the type registry (§4.1) decodes `payload` into a concrete
/// event type.
///
/// A back-end that stores several actors' events in one physical
/// table/stream (or, within this crate, an aggregate's shared store that
/// holds both its own and its children's events) works in terms of this
/// shape, then decodes to `EventRecord<A::Event>` at the `Storage<A>`
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEventRecord {
    /// A generated, monotonic id for this event.
    pub id: EventId,
    /// The type-name of the event.
    pub type_name: String,
    /// Namespace inferred from the emitting actor.
    pub actor_namespace: String,
    /// The stream (actor-id) this event belongs to.
    pub actor_id: ActorId,
    /// The type name of the stream's actor.
    pub actor_name: String,
    /// When the event was created.
    pub created_on: time_stamp::Timestamp,
    /// The actor-name that originated the event.
    pub created_by: String,
    /// The actor-id that originated the event.
    pub created_by_id: ActorId,
    /// The baseline version of the originating actor.
    pub created_by_version: u64,
    /// The command type-name that triggered this event.
    pub initiated_by: String,
    /// The command id that triggered this event.
    pub initiated_by_id: EventId,
    /// The undecoded event payload.
    pub payload: serde_json::Value,
}

impl RawEventRecord {
    /// Encodes a typed [`EventRecord`] into its storage shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the event payload cannot be
    /// serialized to JSON.
    pub fn from_typed<E: Event>(record: &EventRecord<E>) -> Result<Self> {
        Ok(Self {
            id: record.id,
            type_name: record.type_name.clone(),
            actor_namespace: record.actor_namespace.clone(),
            actor_id: record.actor_id,
            actor_name: record.actor_name.clone(),
            created_on: record.created_on,
            created_by: record.created_by.clone(),
            created_by_id: record.created_by_id,
            created_by_version: record.created_by_version,
            initiated_by: record.initiated_by.clone(),
            initiated_by_id: record.initiated_by_id,
            payload: serde_json::to_value(&record.payload)
                .map_err(|e| Error::Validation(format!("failed to encode event payload: {e}")))?,
        })
    }

    /// Decodes this record's payload via `registry`, producing a typed
    /// [`EventRecord`].
    ///
    /// When `registry` has no decoder registered for this record's
    /// `type_name` (the common case: a single-aggregate-enum caller never
    /// registers anything), decoding falls back to
    /// `serde_json::from_value::<E>`, the monomorphic path every `E: Event`
    /// already supports via its `DeserializeOwned` bound. The registry stays
    /// a narrower escape hatch for back-ends that store more than one
    /// concrete type under one `type_name` namespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if neither the registry nor the
    /// structural fallback can decode the payload.
    pub fn decode<E: Event>(&self, registry: &crate::registry::TypeRegistry<E>) -> Result<EventRecord<E>> {
        let payload = match registry.decode(&self.type_name, self.payload.clone()) {
            Ok(payload) => payload,
            Err(Error::UnknownType(_)) => serde_json::from_value::<E>(self.payload.clone())
                .map_err(|e| Error::Validation(format!("failed to decode event payload: {e}")))?,
            Err(e) => return Err(e),
        };
        Ok(EventRecord {
            id: self.id,
            type_name: self.type_name.clone(),
            actor_namespace: self.actor_namespace.clone(),
            actor_id: self.actor_id,
            actor_name: self.actor_name.clone(),
            created_on: self.created_on,
            created_by: self.created_by.clone(),
            created_by_id: self.created_by_id,
            created_by_version: self.created_by_version,
            initiated_by: self.initiated_by.clone(),
            initiated_by_id: self.initiated_by_id,
            payload,
        })
    }
}

/// A [`Snapshot`] as a storage back-end persists it, before its `payload`
/// has been deserialized into the actor's concrete snapshot type. Unlike
/// events, a snapshot's payload is always the single concrete type the
/// owning actor declares, so decoding it needs no type registry lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    /// A generated id for this snapshot instance.
    pub id: EventId,
    /// The actor-id this snapshot belongs to.
    pub actor_id: ActorId,
    /// The type-name of the actor.
    pub type_name: String,
    /// Reserved causal-tracking vector. Never populated.
    pub vector: String,
    /// Monotonic version.
    pub version: u64,
    /// Reserved causal-tracking ancestor pointer. Never populated.
    pub ancestor: String,
    /// When this snapshot was created.
    pub created_on: time_stamp::Timestamp,
    /// Cumulative count of events ever applied to reach this state.
    pub events_applied: u64,
    /// Count of events applied since the last snapshot write.
    pub events_since_snapshot: u64,
    /// The id of the last event played against this snapshot.
    pub last_event_id: EventId,
    /// When the last event was created.
    pub last_event_on: time_stamp::Timestamp,
    /// The id of the last command handled.
    pub last_command_id: EventId,
    /// When the last command was handled.
    pub last_command_on: time_stamp::Timestamp,
    /// Per-child resume point; empty for plain actor snapshots.
    pub last_events: LastEventMap,
    /// The undecoded actor state payload.
    pub payload: serde_json::Value,
}

impl RawSnapshot {
    /// Encodes a typed [`Snapshot`] into its storage shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the payload cannot be serialized.
    pub fn from_typed<S: Serialize>(snapshot: &Snapshot<S>) -> Result<Self> {
        Ok(Self {
            id: snapshot.id,
            actor_id: snapshot.actor_id,
            type_name: snapshot.type_name.clone(),
            vector: snapshot.vector.clone(),
            version: snapshot.version,
            ancestor: snapshot.ancestor.clone(),
            created_on: snapshot.created_on,
            events_applied: snapshot.events_applied,
            events_since_snapshot: snapshot.events_since_snapshot,
            last_event_id: snapshot.last_event_id,
            last_event_on: snapshot.last_event_on,
            last_command_id: snapshot.last_command_id,
            last_command_on: snapshot.last_command_on,
            last_events: snapshot.last_events.clone(),
            payload: serde_json::to_value(&snapshot.payload)
                .map_err(|e| Error::Validation(format!("failed to encode snapshot payload: {e}")))?,
        })
    }

    /// Decodes this record's payload, producing a typed [`Snapshot`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the payload cannot be deserialized
    /// into `S`.
    pub fn decode<S: serde::de::DeserializeOwned>(&self) -> Result<Snapshot<S>> {
        let payload = serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Validation(format!("failed to decode snapshot payload: {e}")))?;
        Ok(Snapshot {
            id: self.id,
            actor_id: self.actor_id,
            type_name: self.type_name.clone(),
            vector: self.vector.clone(),
            version: self.version,
            ancestor: self.ancestor.clone(),
            created_on: self.created_on,
            events_applied: self.events_applied,
            events_since_snapshot: self.events_since_snapshot,
            last_event_id: self.last_event_id,
            last_event_on: self.last_event_on,
            last_command_id: self.last_command_id,
            last_command_on: self.last_command_on,
            last_events: self.last_events.clone(),
            payload,
        })
    }
}

/// Minimal UTC timestamp wrapper so the crate doesn't need to pick a
/// particular date/time crate; stores milliseconds since the Unix epoch.
///
/// Kept deliberately tiny: the teacher stack has no `chrono`/`time`
/// dependency in `sourcerer` itself, and pulling one in for plain
/// "record when this happened" bookkeeping would be disproportionate.
pub mod time_stamp {
    use serde::{Deserialize, Serialize};
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Milliseconds since the Unix epoch, UTC.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct Timestamp(pub i64);

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timestamp(millis)
    }
}
