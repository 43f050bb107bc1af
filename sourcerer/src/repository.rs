//! The fetch/handle pipelines that tie the record model, type registry,
//! snapshot policy and storage contract together.
//!
//! [`ActorRepository`] implements §4.3/§4.4 of the design for a plain,
//! single-identity [`Actor`]. [`AggregateRepository`] extends it with the
//! id-assignment protocol (§4.6) and cross-stream replay (§4.7) for an
//! [`Aggregate`].
//!
//! Error-handling policy (§7): any storage write error rolls back the
//! enclosing transaction and returns early. If events had already been
//! applied in memory before the failing write, `Results::modified` still
//! carries that in-memory outcome — only persistence failed, not
//! computation. A handler that returns both events and errors persists
//! nothing; this is the safer of the two behaviors the source code takes on
//! different paths (§9 open question), chosen here as the default.
use std::sync::Arc;

use tracing::instrument;

use crate::id::ActorId;
use crate::identifiers::Identifiers;
use crate::record::{CommandRecord, EventRecord, IdAssignments, Snapshot};
use crate::snapshot::SnapshotPolicy;
use crate::store::Storage;
use crate::{Aggregate, AggregateCommand, Actor, ActorCommand, Error, Event, Result, Results};

/// Fetches and commands a single-identity [`Actor`] against a [`Storage`]
/// back-end.
pub struct ActorRepository<A: Actor, S: Storage<A>> {
    storage: Arc<S>,
    policy: SnapshotPolicy,
}

impl<A: Actor, S: Storage<A>> Clone for ActorRepository<A, S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            policy: self.policy,
        }
    }
}

impl<A: Actor, S: Storage<A>> ActorRepository<A, S> {
    /// Creates a repository with the default [`SnapshotPolicy`].
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            policy: SnapshotPolicy::default(),
        }
    }

    /// Overrides the snapshot policy used for this actor.
    #[must_use]
    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolves the actor-id for `ids`, minting and registering a fresh one
    /// if this is the first time these identifiers have been seen.
    async fn resolve_id(&self, tx: &mut S::Tx, ids: &Identifiers) -> Result<(ActorId, bool)> {
        match self
            .storage
            .fetch_id(A::type_name(), ids)
            .await
            .map_err(wrap(Error::IdentifierResolution))?
        {
            Some(id) => Ok((id, false)),
            None => {
                let id = ActorId::new();
                self.storage
                    .add_map(tx, A::type_name(), ids, id)
                    .await
                    .map_err(wrap(Error::MapWrite))?;
                Ok((id, true))
            }
        }
    }

    /// Loads the baseline snapshot and replays events since it, returning
    /// the rehydrated actor, the baseline snapshot (carrying bookkeeping
    /// fields ready for the next version) and the count of events applied
    /// during this call.
    async fn rehydrate(&self, actor_id: ActorId) -> Result<(A, Snapshot<A::Snapshot>, u64)> {
        let snapshot = self
            .storage
            .fetch_latest_snapshot(A::type_name(), actor_id)
            .await
            .map_err(wrap(Error::SnapshotFetch))?;

        let mut snapshot = match snapshot {
            Some(s) if s.is_valid() => s,
            _ => {
                let mut empty = Snapshot::empty(A::type_name(), A::default().snapshot());
                empty.actor_id = actor_id;
                empty
            }
        };

        let events = self
            .storage
            .fetch_events_since(A::type_name(), actor_id, non_nil(snapshot.last_event_id))
            .await
            .map_err(wrap(Error::EventFetch))?;

        let mut actor = A::from_snapshot(snapshot.payload.clone());
        let applied = events.len() as u64;
        for record in &events {
            record.payload.apply(&mut actor);
        }
        if let Some(last) = events.last() {
            snapshot.last_event_id = last.id;
            snapshot.last_event_on = last.created_on;
        }
        if applied > 0 {
            snapshot.events_applied += applied;
            snapshot.events_since_snapshot += applied;
            snapshot.version += 1;
        }
        snapshot.payload = actor.snapshot();

        Ok((actor, snapshot, applied))
    }

    /// Fetches the current state addressed by `ids` (§4.3).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails to resolve the
    /// actor-id, fetch the latest snapshot, or fetch events since it.
    /// Snapshot-*write* errors incurred as a side effect of this call are
    /// swallowed per §7's propagation policy.
    #[instrument(skip(self), fields(actor = A::type_name()))]
    pub async fn fetch(&self, ids: &Identifiers) -> Result<A> {
        let mut tx = self.storage.begin().await?;
        let (actor_id, _minted) = self.resolve_id(&mut tx, ids).await?;
        let (actor, snapshot, applied) = self.rehydrate(actor_id).await?;

        if self.policy.should_snapshot_on_read(applied) {
            let _ = self
                .storage
                .add_snapshot(&mut tx, A::type_name(), snapshot, self.policy.during_partition)
                .await;
        }

        self.storage.commit(tx).await?;
        Ok(actor)
    }

    /// Dispatches `command` to the actor addressed by its identifiers
    /// (§4.4).
    ///
    /// # Errors
    ///
    /// Returns an error on any storage failure; see the module docs for the
    /// rollback/partial-result policy.
    #[instrument(skip(self, command), fields(actor = A::type_name()))]
    pub async fn handle<C: ActorCommand<A>>(&self, command: C) -> Results<A> {
        match self.handle_inner(command).await {
            Ok(results) => results,
            Err((original, modified, events, error)) => Results {
                original,
                modified,
                events,
                errors: vec![error],
            },
        }
    }

    #[allow(clippy::type_complexity)]
    async fn handle_inner<C: ActorCommand<A>>(
        &self,
        command: C,
    ) -> std::result::Result<Results<A>, (A, A, Vec<A::Event>, Error)> {
        let ids = command.get_identifiers();
        let mut tx = self.storage.begin().await.map_err(|e| (A::default(), A::default(), vec![], e))?;

        let (actor_id, _minted) = match self.resolve_id(&mut tx, &ids).await {
            Ok(v) => v,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                return Err((A::default(), A::default(), vec![], e));
            }
        };
        let (baseline, mut snapshot, _applied) = match self.rehydrate(actor_id).await {
            Ok(v) => v,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                return Err((A::default(), A::default(), vec![], e));
            }
        };

        let command_payload = match serde_json::to_value(&command) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                let validation = Error::Validation(format!("failed to serialize command: {e}"));
                return Err((baseline, A::default(), vec![], validation));
            }
        };
        let mut command_record = CommandRecord::new(command.command_type(), command_payload);
        command_record.handled_by = actor_id;
        command_record.handled_version = snapshot.version;

        let (events, handler_errors) = command.handle(&baseline);
        let modified = A::apply_all(&baseline, &events);

        if !handler_errors.is_empty() {
            let _ = self.storage.rollback(tx).await;
            return Ok(Results {
                original: baseline,
                modified,
                events,
                errors: handler_errors,
            });
        }

        if events.is_empty() {
            if let Err(e) = self.storage.commit(tx).await {
                return Err((baseline, modified, events, e));
            }
            return Ok(Results {
                original: baseline,
                modified,
                events,
                errors: vec![],
            });
        }

        let event_records = build_event_records(A::type_name(), actor_id, &command_record, &events);
        apply_event_bookkeeping(&mut snapshot, &event_records, &modified, command_record.id);

        if let Err(e) = self.storage.add_command(&mut tx, A::type_name(), command_record).await {
            let _ = self.storage.rollback(tx).await;
            return Err((baseline, modified, events, Error::CommandWrite(e.to_string())));
        }
        if let Err(e) = self.storage.add_events(&mut tx, event_records).await {
            let _ = self.storage.rollback(tx).await;
            return Err((baseline, modified, events, Error::EventWrite(e.to_string())));
        }
        if self.policy.should_snapshot_on_write(snapshot.events_since_snapshot) {
            snapshot.events_since_snapshot = 0;
            if let Err(e) = self
                .storage
                .add_snapshot(&mut tx, A::type_name(), snapshot, self.policy.during_partition)
                .await
            {
                let _ = self.storage.rollback(tx).await;
                return Err((baseline, modified, events, Error::SnapshotWrite(e.to_string())));
            }
        }

        if let Err(e) = self.storage.commit(tx).await {
            return Err((baseline, modified, events, e));
        }

        Ok(Results {
            original: baseline,
            modified,
            events,
            errors: vec![],
        })
    }
}

/// Fetches and commands an [`Aggregate`], resolving every participating
/// identity up front (§4.6) and merging child-stream replay into a single
/// fetch (§4.7).
pub struct AggregateRepository<A: Aggregate, S: Storage<A>> {
    storage: Arc<S>,
    policy: SnapshotPolicy,
}

impl<A: Aggregate, S: Storage<A>> Clone for AggregateRepository<A, S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            policy: self.policy,
        }
    }
}

impl<A: Aggregate, S: Storage<A>> AggregateRepository<A, S> {
    /// Creates a repository with the default [`SnapshotPolicy`].
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            policy: SnapshotPolicy::default(),
        }
    }

    /// Overrides the snapshot policy used for this aggregate.
    #[must_use]
    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolves (or mints) a stable actor-id for every (name, identifiers)
    /// pair named by `set`, in the deterministic order required by §4.6:
    /// the aggregate's own id first, then every child in insertion order.
    async fn assign_ids(&self, tx: &mut S::Tx, root_ids: &Identifiers, set: &IdentifierSetRef<'_>) -> Result<IdAssignments> {
        let mut assignments = IdAssignments::new(A::type_name());

        let aggregate_id = match self
            .storage
            .fetch_id(A::type_name(), root_ids)
            .await
            .map_err(wrap(Error::IdentifierResolution))?
        {
            Some(id) => id,
            None => {
                let id = ActorId::new();
                self.storage
                    .add_map(tx, A::type_name(), root_ids, id)
                    .await
                    .map_err(wrap(Error::MapWrite))?;
                id
            }
        };
        assignments.add(A::type_name(), root_ids, aggregate_id)?;

        for (child_name, ids_list) in set.iter() {
            if child_name.as_str() == A::type_name() {
                continue;
            }
            for ids in ids_list {
                let child_id = match self
                    .storage
                    .fetch_id(child_name, ids)
                    .await
                    .map_err(wrap(Error::IdentifierResolution))?
                {
                    Some(id) => id,
                    None => {
                        let id = ActorId::new();
                        self.storage
                            .add_map(tx, child_name, ids, id)
                            .await
                            .map_err(wrap(Error::MapWrite))?;
                        id
                    }
                };
                self.storage
                    .add_link(tx, A::type_name(), aggregate_id, child_name, child_id)
                    .await
                    .map_err(wrap(Error::LinkWrite))?;
                assignments.add(child_name, ids, child_id)?;
            }
        }

        Ok(assignments)
    }

    /// Loads the baseline snapshot and replays the merged union of the
    /// aggregate's own stream and every linked child's stream (§4.7).
    async fn rehydrate(&self, aggregate_id: ActorId) -> Result<(A, Snapshot<A::Snapshot>, u64)> {
        let id_map = self
            .storage
            .fetch_id_map(A::type_name(), aggregate_id)
            .await
            .map_err(wrap(Error::IdentifierResolution))?;

        let snapshot = self
            .storage
            .fetch_latest_snapshot(A::type_name(), aggregate_id)
            .await
            .map_err(wrap(Error::SnapshotFetch))?;

        let mut snapshot = match snapshot {
            Some(s) if s.is_valid() => s,
            _ => {
                let mut empty = Snapshot::empty(A::type_name(), A::default().snapshot());
                empty.actor_id = aggregate_id;
                empty
            }
        };
        snapshot.last_events.merge_new_children(&id_map);

        let events = self
            .storage
            .fetch_aggregated_events_since(
                A::type_name(),
                aggregate_id,
                non_nil(snapshot.last_event_id),
                &snapshot.last_events,
            )
            .await
            .map_err(wrap(Error::EventFetch))?;

        let mut actor = A::from_snapshot(snapshot.payload.clone());
        let applied = events.len() as u64;
        for record in &events {
            record.payload.apply(&mut actor);
            if record.actor_name != A::type_name() {
                snapshot.last_events.set(record.actor_name.clone(), record.actor_id, record.id);
            }
        }
        if let Some(last) = events.last() {
            snapshot.last_event_id = last.id;
            snapshot.last_event_on = last.created_on;
        }
        if applied > 0 {
            snapshot.events_applied += applied;
            snapshot.events_since_snapshot += applied;
            snapshot.version += 1;
        }
        snapshot.payload = actor.snapshot();

        Ok((actor, snapshot, applied))
    }

    /// Fetches the current aggregate state addressed by the root identity's
    /// `ids` (§4.7).
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails to resolve the id, fetch the
    /// linked child id map, fetch the latest snapshot, or fetch the merged
    /// event union.
    #[instrument(skip(self), fields(actor = A::type_name()))]
    pub async fn fetch(&self, ids: &Identifiers) -> Result<A> {
        let mut tx = self.storage.begin().await?;
        let aggregate_id = match self
            .storage
            .fetch_id(A::type_name(), ids)
            .await
            .map_err(wrap(Error::IdentifierResolution))?
        {
            Some(id) => id,
            None => {
                let id = ActorId::new();
                self.storage
                    .add_map(&mut tx, A::type_name(), ids, id)
                    .await
                    .map_err(wrap(Error::MapWrite))?;
                id
            }
        };

        let (actor, snapshot, applied) = self.rehydrate(aggregate_id).await?;

        if self.policy.should_snapshot_on_read(applied) {
            let _ = self
                .storage
                .add_snapshot(&mut tx, A::type_name(), snapshot, self.policy.during_partition)
                .await;
        }

        self.storage.commit(tx).await?;
        Ok(actor)
    }

    /// Dispatches `command` to the aggregate, resolving every identity the
    /// command names before rehydration (§4.6), then proceeding as
    /// [`ActorRepository::handle`] with the divergence in §4.7: events
    /// tagged [`crate::EventMetadata`] for a child stream are recorded and
    /// replayed against that child instead of the aggregate's own stream.
    ///
    /// # Errors
    ///
    /// See the module docs; failures during id assignment abort before any
    /// command handler runs.
    #[instrument(skip(self, command), fields(actor = A::type_name()))]
    pub async fn handle<C: AggregateCommand<A>>(&self, command: C) -> Results<A> {
        match self.handle_inner(command).await {
            Ok(results) => results,
            Err((original, modified, events, error)) => Results {
                original,
                modified,
                events,
                errors: vec![error],
            },
        }
    }

    #[allow(clippy::type_complexity)]
    async fn handle_inner<C: AggregateCommand<A>>(
        &self,
        command: C,
    ) -> std::result::Result<Results<A>, (A, A, Vec<A::Event>, Error)> {
        let id_set = command.get_identifier_set();
        let root_ids = id_set.get(A::type_name()).first().cloned().unwrap_or_default();

        let mut tx = self.storage.begin().await.map_err(|e| (A::default(), A::default(), vec![], e))?;

        let assignments = match self
            .assign_ids(&mut tx, &root_ids, &IdentifierSetRef(&id_set))
            .await
        {
            Ok(a) => a,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                return Err((A::default(), A::default(), vec![], e));
            }
        };
        let aggregate_id = match assignments.aggregate_id() {
            Some(id) => id,
            None => {
                let _ = self.storage.rollback(tx).await;
                return Err((
                    A::default(),
                    A::default(),
                    vec![],
                    Error::IdentifierResolution("aggregate id was not assigned".into()),
                ));
            }
        };

        let (baseline, mut snapshot, _applied) = match self.rehydrate(aggregate_id).await {
            Ok(v) => v,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                return Err((A::default(), A::default(), vec![], e));
            }
        };

        let command_payload = match serde_json::to_value(&command) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.storage.rollback(tx).await;
                let validation = Error::Validation(format!("failed to serialize command: {e}"));
                return Err((baseline, A::default(), vec![], validation));
            }
        };
        let mut command_record = CommandRecord::new(command.command_type(), command_payload);
        command_record.handled_by = aggregate_id;
        command_record.handled_version = snapshot.version;

        let (events, handler_errors) = command.handle(&baseline);
        let modified = A::apply_all(&baseline, &events);

        if !handler_errors.is_empty() {
            let _ = self.storage.rollback(tx).await;
            return Ok(Results {
                original: baseline,
                modified,
                events,
                errors: handler_errors,
            });
        }

        if events.is_empty() {
            if let Err(e) = self.storage.commit(tx).await {
                return Err((baseline, modified, events, e));
            }
            return Ok(Results {
                original: baseline,
                modified,
                events,
                errors: vec![],
            });
        }

        let event_records = build_aggregate_event_records(aggregate_id, &command_record, &events, &assignments);
        apply_event_bookkeeping(&mut snapshot, &event_records, &modified, command_record.id);
        for record in &event_records {
            if record.actor_name != A::type_name() {
                snapshot.last_events.set(record.actor_name.clone(), record.actor_id, record.id);
            }
        }

        if let Err(e) = self.storage.add_command(&mut tx, A::type_name(), command_record).await {
            let _ = self.storage.rollback(tx).await;
            return Err((baseline, modified, events, Error::CommandWrite(e.to_string())));
        }
        if let Err(e) = self.storage.add_events(&mut tx, event_records).await {
            let _ = self.storage.rollback(tx).await;
            return Err((baseline, modified, events, Error::EventWrite(e.to_string())));
        }
        if self.policy.should_snapshot_on_write(snapshot.events_since_snapshot) {
            snapshot.events_since_snapshot = 0;
            if let Err(e) = self
                .storage
                .add_snapshot(&mut tx, A::type_name(), snapshot, self.policy.during_partition)
                .await
            {
                let _ = self.storage.rollback(tx).await;
                return Err((baseline, modified, events, Error::SnapshotWrite(e.to_string())));
            }
        }

        if let Err(e) = self.storage.commit(tx).await {
            return Err((baseline, modified, events, e));
        }

        Ok(Results {
            original: baseline,
            modified,
            events,
            errors: vec![],
        })
    }
}

/// Borrowed view over an [`crate::IdentifierSet`], kept out of the public
/// API surface of `record`/`identifiers` since it only exists to let
/// `assign_ids` iterate without taking ownership.
struct IdentifierSetRef<'a>(&'a crate::IdentifierSet);

impl<'a> IdentifierSetRef<'a> {
    fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Identifiers>)> {
        self.0.iter()
    }
}

fn build_event_records<A: Actor>(
    actor_name: &'static str,
    actor_id: ActorId,
    command: &CommandRecord,
    events: &[A::Event],
) -> Vec<EventRecord<A::Event>> {
    events
        .iter()
        .map(|event| EventRecord {
            id: crate::id::EventId::new(),
            type_name: event.event_type().to_string(),
            actor_namespace: String::new(),
            actor_id,
            actor_name: actor_name.to_string(),
            created_on: crate::record::time_stamp::now(),
            created_by: actor_name.to_string(),
            created_by_id: actor_id,
            created_by_version: command.handled_version,
            initiated_by: command.type_name.clone(),
            initiated_by_id: command.id,
            payload: event.clone(),
        })
        .collect()
}

fn build_aggregate_event_records<A: Aggregate>(
    aggregate_id: ActorId,
    command: &CommandRecord,
    events: &[A::Event],
    assignments: &IdAssignments,
) -> Vec<EventRecord<A::Event>> {
    events
        .iter()
        .map(|event| {
            let meta = event.event_meta();
            let (target_name, target_id) = if meta.is_root() {
                (A::type_name(), aggregate_id)
            } else {
                // Prefer resolving by the event's own identifiers (§4.7: "the
                // child-id previously assigned for the event's identifiers"),
                // since a command naming more than one child of the same
                // actor-name would otherwise collide on the by-name lookup.
                let id = meta
                    .created_for_ids
                    .as_ref()
                    .and_then(|ids| assignments.get_for(ids).ok().flatten())
                    .or_else(|| assignments.by_identifier_name(meta.created_for))
                    .unwrap_or(aggregate_id);
                (meta.created_for, id)
            };
            EventRecord {
                id: crate::id::EventId::new(),
                type_name: event.event_type().to_string(),
                actor_namespace: String::new(),
                actor_id: target_id,
                actor_name: target_name.to_string(),
                created_on: crate::record::time_stamp::now(),
                created_by: A::type_name().to_string(),
                created_by_id: aggregate_id,
                created_by_version: command.handled_version,
                initiated_by: command.type_name.clone(),
                initiated_by_id: command.id,
                payload: event.clone(),
            }
        })
        .collect()
}

fn apply_event_bookkeeping<A: Actor>(
    snapshot: &mut Snapshot<A::Snapshot>,
    records: &[EventRecord<A::Event>],
    modified: &A,
    command_id: crate::id::EventId,
) {
    snapshot.version += 1;
    snapshot.events_applied += records.len() as u64;
    snapshot.events_since_snapshot += records.len() as u64;
    if let Some(last) = records.last() {
        snapshot.last_event_id = last.id;
        snapshot.last_event_on = last.created_on;
    }
    snapshot.last_command_id = command_id;
    snapshot.last_command_on = crate::record::time_stamp::now();
    snapshot.payload = modified.snapshot();
}

fn non_nil(id: ActorId) -> Option<ActorId> {
    if id.is_nil() { None } else { Some(id) }
}

fn wrap(variant: impl Fn(String) -> Error) -> impl Fn(Error) -> Error {
    move |e| variant(e.to_string())
}
