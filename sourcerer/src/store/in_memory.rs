//! A reference, in-process [`Storage`] implementation used by tests and
//! suitable for development.
//!
//! The physical tables ([`InMemoryDb`]) are kept separate from the typed
//! [`InMemoryStorage`] facade so that an aggregate and its child actor can
//! share one underlying database: events are persisted in a single
//! actor-id-keyed table regardless of which actor-name they belong to, the
//! same way a real back-end would share one `events` table across an
//! aggregate's own rows and its children's (distinguished by the
//! `actor_name`/`actor_id` columns, not by physical table). [`TypeRegistry`]
//! decodes each row's generic payload into the caller's concrete event type
//! at the boundary (§4.1).
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::id::{ActorId, EventId};
use crate::identifiers::Identifiers;
use crate::record::{
    AggregateIdMap, CommandRecord, EventRecord, LastEventMap, RawEventRecord, RawSnapshot, Snapshot,
};
use crate::registry::TypeRegistry;
use crate::{Actor, Result};

use super::Storage;

/// The physical tables backing one or more [`InMemoryStorage`] facades.
///
/// Clone and share an `Arc<InMemoryDb>` across the facades for an aggregate
/// and each of its child actor types so that events and id maps are
/// visible to all of them, exactly as a real back-end's shared connection
/// pool would be.
#[derive(Default)]
pub struct InMemoryDb {
    id_map: DashMap<(String, String), ActorId>,
    links: DashMap<(String, ActorId), Vec<(String, ActorId)>>,
    events: DashMap<ActorId, Vec<RawEventRecord>>,
    snapshots: DashMap<ActorId, RawSnapshot>,
    commands: DashMap<ActorId, Vec<CommandRecord>>,
}

impl InMemoryDb {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Buffers the writes made within one transactional scope; applied to the
/// [`InMemoryDb`] atomically on [`Storage::commit`], discarded on
/// [`Storage::rollback`].
#[derive(Default)]
pub struct InMemoryTx {
    commands: Vec<(ActorId, CommandRecord)>,
    events: Vec<RawEventRecord>,
    maps: Vec<(String, String, ActorId)>,
    links: Vec<(String, ActorId, String, ActorId)>,
    snapshots: Vec<RawSnapshot>,
}

/// An in-memory, thread-safe [`Storage`] implementation.
///
/// Useful for testing and for applications that do not require a
/// persistent store.
pub struct InMemoryStorage<A: Actor> {
    db: Arc<InMemoryDb>,
    registry: Arc<TypeRegistry<A::Event>>,
    _marker: PhantomData<A>,
}

impl<A: Actor> Clone for InMemoryStorage<A> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            registry: Arc::clone(&self.registry),
            _marker: PhantomData,
        }
    }
}

impl<A: Actor> InMemoryStorage<A> {
    /// Creates a storage facade over a fresh, private database.
    #[must_use]
    pub fn new(registry: TypeRegistry<A::Event>) -> Self {
        Self::with_db(InMemoryDb::new(), registry)
    }

    /// Creates a storage facade sharing `db` with any other facade already
    /// constructed over it — the mechanism by which an aggregate and its
    /// children see the same physical event/id-map/link tables.
    #[must_use]
    pub fn with_db(db: Arc<InMemoryDb>, registry: TypeRegistry<A::Event>) -> Self {
        Self {
            db,
            registry: Arc::new(registry),
            _marker: PhantomData,
        }
    }

    /// Returns the shared database handle, for constructing another
    /// actor-type's facade over the same tables.
    #[must_use]
    pub fn db(&self) -> Arc<InMemoryDb> {
        Arc::clone(&self.db)
    }
}

impl<A: Actor> Default for InMemoryStorage<A> {
    fn default() -> Self {
        Self::new(TypeRegistry::new())
    }
}

#[async_trait]
impl<A: Actor> Storage<A> for InMemoryStorage<A> {
    type Tx = InMemoryTx;

    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTx::default())
    }

    #[instrument(skip(self, tx))]
    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        for (name, canonical, id) in tx.maps {
            self.db.id_map.entry((name, canonical)).or_insert(id);
        }
        for (parent_name, parent_id, child_name, child_id) in tx.links {
            let mut entry = self.db.links.entry((parent_name, parent_id)).or_default();
            if !entry.iter().any(|(n, i)| *n == child_name && *i == child_id) {
                entry.push((child_name, child_id));
            }
        }
        for (actor_id, command) in tx.commands {
            self.db.commands.entry(actor_id).or_default().push(command);
        }
        if !tx.events.is_empty() {
            let mut by_stream: BTreeMap<ActorId, Vec<RawEventRecord>> = BTreeMap::new();
            for event in tx.events {
                by_stream.entry(event.actor_id).or_default().push(event);
            }
            for (actor_id, mut batch) in by_stream {
                let mut stream = self.db.events.entry(actor_id).or_default();
                stream.append(&mut batch);
                stream.sort_by_key(|e| e.id);
            }
        }
        for snapshot in tx.snapshots {
            self.db.snapshots.insert(snapshot.actor_id, snapshot);
        }
        Ok(())
    }

    #[instrument(skip(self, _tx))]
    async fn rollback(&self, _tx: Self::Tx) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self, tx, command), fields(actor_name))]
    async fn add_command(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        command: CommandRecord,
    ) -> Result<()> {
        tx.commands.push((command.handled_by, command));
        Ok(())
    }

    #[instrument(skip(self, tx, events))]
    async fn add_events(&self, tx: &mut Self::Tx, events: Vec<EventRecord<A::Event>>) -> Result<()> {
        for event in &events {
            tx.events.push(RawEventRecord::from_typed(event)?);
        }
        Ok(())
    }

    #[instrument(skip(self, tx, ids), fields(actor_name))]
    async fn add_map(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        ids: &Identifiers,
        id: ActorId,
    ) -> Result<()> {
        let canonical = ids.canonical()?;
        tx.maps.push((actor_name.to_string(), canonical, id));
        Ok(())
    }

    #[instrument(skip(self, tx), fields(parent_name, child_name))]
    async fn add_link(
        &self,
        tx: &mut Self::Tx,
        parent_name: &str,
        parent_id: ActorId,
        child_name: &str,
        child_id: ActorId,
    ) -> Result<()> {
        tx.links.push((
            parent_name.to_string(),
            parent_id,
            child_name.to_string(),
            child_id,
        ));
        Ok(())
    }

    #[instrument(skip(self, tx, snapshot), fields(actor_name, allow_during_partition))]
    async fn add_snapshot(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        snapshot: Snapshot<A::Snapshot>,
        allow_during_partition: bool,
    ) -> Result<()> {
        // The in-memory back-end has no partition concept; the hint is
        // accepted but never changes behavior.
        let _ = allow_during_partition;
        tx.snapshots.push(RawSnapshot::from_typed(&snapshot)?);
        Ok(())
    }

    #[instrument(skip(self, ids), fields(actor_name))]
    async fn fetch_id(&self, actor_name: &str, ids: &Identifiers) -> Result<Option<ActorId>> {
        let canonical = ids.canonical()?;
        Ok(self.db.id_map.get(&(actor_name.to_string(), canonical)).map(|e| *e))
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_id_map(&self, actor_name: &str, id: ActorId) -> Result<AggregateIdMap> {
        let mut map = AggregateIdMap::new(actor_name, id);
        if let Some(children) = self.db.links.get(&(actor_name.to_string(), id)) {
            for (child_name, child_id) in children.iter() {
                map.add_ids_for(child_name.clone(), std::iter::once(*child_id));
            }
        }
        Ok(map)
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_latest_snapshot(
        &self,
        actor_name: &str,
        id: ActorId,
    ) -> Result<Option<Snapshot<A::Snapshot>>> {
        match self.db.snapshots.get(&id) {
            Some(raw) => Ok(Some(raw.decode()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(actor_name))]
    async fn fetch_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
    ) -> Result<Vec<EventRecord<A::Event>>> {
        let Some(stream) = self.db.events.get(&id) else {
            return Ok(Vec::new());
        };
        stream
            .iter()
            .filter(|e| last_event_id.map_or(true, |last| e.id > last))
            .map(|e| e.decode(&self.registry))
            .collect()
    }

    #[instrument(skip(self, last_events), fields(actor_name))]
    async fn fetch_aggregated_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
        last_events: &LastEventMap,
    ) -> Result<Vec<EventRecord<A::Event>>> {
        let mut merged: Vec<RawEventRecord> = Vec::new();

        if let Some(stream) = self.db.events.get(&id) {
            merged.extend(
                stream
                    .iter()
                    .filter(|e| last_event_id.map_or(true, |last| e.id > last))
                    .cloned(),
            );
        }

        for (child_name, child_ids) in &last_events.0 {
            for (child_id, resume_point) in child_ids {
                if let Some(stream) = self.db.events.get(child_id) {
                    merged.extend(
                        stream
                            .iter()
                            .filter(|e| &e.actor_name == child_name)
                            .filter(|e| resume_point.is_nil() || e.id > *resume_point)
                            .cloned(),
                    );
                }
            }
        }

        merged.sort_by_key(|e| e.id);
        merged.into_iter().map(|e| e.decode(&self.registry)).collect()
    }
}
