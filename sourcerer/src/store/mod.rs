//! The storage contract and its implementations.
//!
//! [`Storage`] is the abstraction the repository pipelines (§4.3/§4.4/§4.6
//! of the design) depend on. A transaction is an explicit, owned handle
//! (`Storage::Tx`) obtained from [`Storage::begin`] and threaded through
//! every write call — the idiomatic Rust realization of the original
//! design's "transaction handle carried in an ambient context" (a `Tx`
//! argument composes with borrow-checking in a way a thread-local or
//! context map does not).
use async_trait::async_trait;

use crate::id::{ActorId, EventId};
use crate::identifiers::Identifiers;
use crate::record::{AggregateIdMap, CommandRecord, EventRecord, LastEventMap, Snapshot};
use crate::{Actor, Result};

// The in-memory implementation is compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory storage back-end, useful for testing and development.
pub mod in_memory;

// The persistent `sled` implementation is compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent storage back-end using `sled`.
pub mod sled;

// SQLx / Postgres implementation compiled when the `postgres-storage`
// feature is enabled.
#[cfg(feature = "postgres-storage")]
/// A `sqlx`/PostgreSQL-backed storage back-end.
pub mod sqlx_postgres;

/// The storage contract a repository depends on.
///
/// Implementors back one [`Actor`] type's command/event/id-map/link/snapshot
/// tables (or their equivalent). All write operations must be atomic within
/// a single transaction: either every write committed in that scope lands,
/// or none does.
#[async_trait]
pub trait Storage<A: Actor>: Send + Sync {
    /// An owned handle to an in-flight transaction. Dropping it without
    /// calling [`Storage::commit`] or [`Storage::rollback`] is a logic
    /// error in callers, mirrored by most back-ends rolling back on drop.
    type Tx: Send + Sync;

    /// Opens a new transactional scope.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Commits every write made against `tx`.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    /// Discards every write made against `tx`.
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// Persists a command record for audit. Commands are never replayed.
    async fn add_command(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        command: CommandRecord,
    ) -> Result<()>;

    /// Appends a batch of events atomically; partial failure must roll the
    /// whole batch back.
    async fn add_events(&self, tx: &mut Self::Tx, events: Vec<EventRecord<A::Event>>) -> Result<()>;

    /// Idempotently associates `ids` with `id` under `actor_name`. Calling
    /// this twice with the same arguments must be a no-op equivalent.
    async fn add_map(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        ids: &Identifiers,
        id: ActorId,
    ) -> Result<()>;

    /// Records a parent→child relationship for aggregate composition.
    async fn add_link(
        &self,
        tx: &mut Self::Tx,
        parent_name: &str,
        parent_id: ActorId,
        child_name: &str,
        child_id: ActorId,
    ) -> Result<()>;

    /// Persists a new snapshot. `allow_during_partition` forwards the
    /// actor's `SnapshotPolicy::during_partition` hint; back-ends that
    /// cannot honor it are free to ignore it.
    async fn add_snapshot(
        &self,
        tx: &mut Self::Tx,
        actor_name: &str,
        snapshot: Snapshot<A::Snapshot>,
        allow_during_partition: bool,
    ) -> Result<()>;

    /// Resolves the actor-id previously mapped to `ids`, if any.
    async fn fetch_id(&self, actor_name: &str, ids: &Identifiers) -> Result<Option<ActorId>>;

    /// Returns the set of child streams linked under `id`.
    async fn fetch_id_map(&self, actor_name: &str, id: ActorId) -> Result<AggregateIdMap>;

    /// Returns the latest snapshot for `id`, if one has ever been written.
    async fn fetch_latest_snapshot(
        &self,
        actor_name: &str,
        id: ActorId,
    ) -> Result<Option<Snapshot<A::Snapshot>>>;

    /// Returns every event for `id` with an id greater than
    /// `last_event_id`, ascending by event-id.
    async fn fetch_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
    ) -> Result<Vec<EventRecord<A::Event>>>;

    /// Returns the union of the aggregate's own events since
    /// `last_event_id` and each child's events since its resume point in
    /// `last_events`, sorted ascending by event-id.
    async fn fetch_aggregated_events_since(
        &self,
        actor_name: &str,
        id: ActorId,
        last_event_id: Option<EventId>,
        last_events: &LastEventMap,
    ) -> Result<Vec<EventRecord<A::Event>>>;
}
