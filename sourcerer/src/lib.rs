//! # Actor/Aggregate Event-Sourcing Runtime
//!
//! `sourcerer` is a Rust framework for building event-sourced domain models
//! organized as *actors* and *aggregates*.
//!
//! ## Core Concepts
//!
//! - **[`Actor`]**: a single-identity entity whose state is derived by
//!   folding its event stream onto an empty instance.
//! - **[`Aggregate`]**: a root actor that composes a child actor type by
//!   identity; commands dispatched to the aggregate can emit events that
//!   belong to — and are replayed from — both the root and child streams.
//! - **[`Event`]**: an immutable fact. Implements [`Apply<T>`] for every
//!   actor shape it can mutate.
//! - **[`Storage`]**: the pluggable persistence contract: commands, events,
//!   id maps, parent/child links and snapshots.
//! - **[`repository::ActorRepository`] / [`repository::AggregateRepository`]**:
//!   the fetch/handle pipelines that tie the above together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sourcerer::{Actor, ActorCommand, Apply, CommandType, Error, Event, EventMetadata, Identifiers};
//! use sourcerer::store::in_memory::InMemoryStorage;
//! use sourcerer::repository::ActorRepository;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
//! enum PlayerEvent {
//!     Created { name: String },
//!     Damaged { amount: u32 },
//! }
//! impl Event for PlayerEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             PlayerEvent::Created { .. } => "Created",
//!             PlayerEvent::Damaged { .. } => "Damaged",
//!         }
//!     }
//! }
//! impl Apply<Player> for PlayerEvent {
//!     fn apply(&self, player: &mut Player) {
//!         match self {
//!             PlayerEvent::Created { name } => player.name = name.clone(),
//!             PlayerEvent::Damaged { amount } => player.hit_points -= *amount as i64,
//!         }
//!     }
//! }
//!
//! #[derive(Debug, Default, Clone, Serialize, Deserialize)]
//! struct Player {
//!     name: String,
//!     hit_points: i64,
//! }
//! impl Actor for Player {
//!     type Event = PlayerEvent;
//!     type Snapshot = Player;
//!     fn type_name() -> &'static str { "Player" }
//!     fn from_snapshot(snapshot: Self::Snapshot) -> Self { snapshot }
//!     fn snapshot(&self) -> Self::Snapshot { self.clone() }
//! }
//!
//! #[derive(Debug, Serialize)]
//! struct CreatePlayer { name: String }
//! impl CommandType for CreatePlayer {
//!     fn command_type(&self) -> &'static str { "CreatePlayer" }
//! }
//! impl ActorCommand<Player> for CreatePlayer {
//!     fn get_identifiers(&self) -> Identifiers {
//!         Identifiers::new().with("Name", self.name.clone())
//!     }
//!     fn handle(&self, _actor: &Player) -> (Vec<PlayerEvent>, Vec<Error>) {
//!         (vec![PlayerEvent::Created { name: self.name.clone() }], vec![])
//!     }
//! }
//!
//! async fn player_example() {
//!     let storage = Arc::new(InMemoryStorage::<Player>::default());
//!     let repo = ActorRepository::<Player, _>::new(storage);
//!     let results = repo.handle(CreatePlayer { name: "Bob".into() }).await;
//!     assert_eq!(results.modified.name, "Bob");
//! }
//! ```
#![deny(missing_docs)]

use std::fmt::Debug;

pub use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub mod id;
pub mod identifiers;
pub mod record;
pub mod registry;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod upcaster;

pub use id::{ActorId, EventId, Id};
pub use identifiers::{IdentifierSet, IdentifierValue, Identifiers};
pub use record::{
    AggregateIdMap, CommandRecord, EventRecord, IdAssignment, IdAssignments, LastEventMap, Snapshot,
};
pub use registry::TypeRegistry;
pub use store::Storage;

/// The error type for this crate.
///
/// Variants distinguish the storage step that produced them (per the
/// design's error-handling policy): a caller can tell a snapshot-write
/// failure from an event-write failure without string-matching a message.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// The map store failed to resolve, or produced an ambiguous, id.
    #[error("identifier resolution failed: {0}")]
    IdentifierResolution(String),
    /// Fetching the latest snapshot failed.
    #[error("snapshot fetch failed: {0}")]
    SnapshotFetch(String),
    /// Fetching events failed.
    #[error("event fetch failed: {0}")]
    EventFetch(String),
    /// Writing the id map failed.
    #[error("map write failed: {0}")]
    MapWrite(String),
    /// Writing a parent/child link failed.
    #[error("link write failed: {0}")]
    LinkWrite(String),
    /// Writing events failed.
    #[error("event write failed: {0}")]
    EventWrite(String),
    /// Writing a snapshot failed.
    #[error("snapshot write failed: {0}")]
    SnapshotWrite(String),
    /// Writing a command record failed.
    #[error("command write failed: {0}")]
    CommandWrite(String),
    /// The type registry could not decode a record.
    #[error("unknown type: {0}")]
    UnknownType(String),
    /// A user-supplied command handler returned one or more errors.
    #[error("handler error: {0}")]
    HandlerError(String),
    /// Commit or rollback of the enclosing transaction failed.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
    /// An aggregate's expected version did not match the actual version,
    /// indicating a concurrency conflict.
    #[error("aggregate conflict")]
    Conflict,
    /// The requested actor could not be found.
    #[error("aggregate not found")]
    NotFound,
    /// A value failed validation (e.g. could not be canonicalized or
    /// serialized).
    #[error("validation error: {0}")]
    Validation(String),
    /// A storage back-end's own driver reported a failure (connection,
    /// encoding, or query error) not yet attributable to one of the
    /// specific read/write steps above.
    #[error("storage backend error: {0}")]
    Store(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Describes which stream an event belongs to when emitted by an
/// aggregate on behalf of one of its children.
///
/// `created_for` empty means the event belongs to the aggregate's own root
/// stream; otherwise it names the child actor-type the event should be
/// recorded and replayed against. When a command addresses more than one
/// child of the same actor-name (two vehicles in one `RegisterVehicle`-like
/// command, say), `created_for` alone can't tell them apart — `created_for_ids`
/// carries the specific child's identifiers so the repository can resolve
/// the exact actor-id that was assigned for them during id-assignment (§4.6),
/// rather than falling back to "whichever child of that name was assigned
/// last".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    /// The actor-name that originated the event (always the aggregate's
    /// own name, even when the event targets a child stream).
    pub created_by: &'static str,
    /// The actor-name of the stream this event should be recorded against.
    /// Empty means "the aggregate's own stream".
    pub created_for: &'static str,
    /// The target child's identifiers, when known. Lets the repository
    /// resolve the exact child actor-id assigned for this event instead of
    /// guessing from `created_for` alone.
    pub created_for_ids: Option<Identifiers>,
}

impl EventMetadata {
    /// Returns `true` if this event targets the aggregate's own stream.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.created_for.is_empty()
    }
}

/// A marker trait for events.
///
/// Events must be serializable, deserializable, clonable, and debuggable.
/// The `Event` derive macro in `sourcerer-derive` implements `event_type`
/// for you from each enum variant's name.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns a static string slice representing the type of the event.
    fn event_type(&self) -> &'static str;

    /// Returns metadata describing which stream this event belongs to.
    /// The default (`EventMetadata::default()`) targets the aggregate's own
    /// root stream; events constructed on behalf of a child override this.
    fn event_meta(&self) -> EventMetadata {
        EventMetadata::default()
    }
}

/// Applies an event to a target actor shape, mutating it in place.
///
/// A plain [`Actor`]'s event implements `Apply<Self>` once. An
/// [`Aggregate`]'s event additionally implements `Apply<Self::Child>` for
/// events that target a child stream — this is the statically typed
/// replacement for runtime type-switching over the actor's shape.
pub trait Apply<T> {
    /// Mutates `target` to reflect this event having occurred.
    fn apply(&self, target: &mut T);
}

/// A single-identity entity whose state is derived by folding an ordered
/// sequence of domain events onto an empty instance.
pub trait Actor: Default + Clone + Debug + Send + Sync + 'static {
    /// The events this actor's stream is made of.
    type Event: Event + Apply<Self>;
    /// The materialized snapshot payload for this actor.
    type Snapshot: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// The stable type-name this actor is registered and stored under.
    fn type_name() -> &'static str;

    /// Restores this actor's state from a snapshot payload.
    fn from_snapshot(snapshot: Self::Snapshot) -> Self;

    /// Produces a snapshot payload capturing this actor's current state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Folds `events` onto a copy of `actor`, left to right, without
    /// mutating the caller's copy (the baseline is retained separately for
    /// `Results::original`).
    fn apply_all(actor: &Self, events: &[Self::Event]) -> Self {
        let mut next = actor.clone();
        for event in events {
            event.apply(&mut next);
        }
        next
    }
}

/// A stable type-name carried by a command, independent of which actor
/// type it targets.
///
/// Split out from [`ActorCommand`]/[`AggregateCommand`] because both of
/// those traits are generic over the actor they command, while a command's
/// own name never is — this is what the `#[derive(Command)]` macro in
/// `sourcerer-derive` implements for you, mirroring how `#[derive(Event)]`
/// implements [`Event::event_type`].
pub trait CommandType {
    /// Returns a static string slice naming this command's type.
    fn command_type(&self) -> &'static str;
}

/// A command dispatched to a single-identity [`Actor`].
pub trait ActorCommand<A: Actor>: CommandType + Serialize + Debug + Send + Sync {
    /// The identifiers naming the actor instance this command addresses.
    fn get_identifiers(&self) -> Identifiers;

    /// Validates the command against the current baseline and produces the
    /// events (and/or errors) it results in. Receives a read-only view of
    /// the baseline actor; never mutates it directly.
    fn handle(&self, actor: &A) -> (Vec<A::Event>, Vec<Error>);
}

/// A root actor that composes a single child actor type by identity.
///
/// Commands dispatched to an aggregate may emit events that belong to, and
/// are replayed from, either the aggregate's own stream or one of its
/// children's streams (see [`EventMetadata`]).
pub trait Aggregate: Actor {
    /// The child actor type this aggregate composes.
    type Child: Actor;

    /// The actor-name child identities are registered and linked under.
    fn child_actor_name() -> &'static str;
}

/// A command dispatched to an [`Aggregate`], naming every participating
/// identity (the aggregate's own, plus every child's) up front.
pub trait AggregateCommand<A: Aggregate>: CommandType + Serialize + Debug + Send + Sync {
    /// Every identity this command touches, keyed by actor-name. Must
    /// include an entry for the aggregate's own actor-name.
    fn get_identifier_set(&self) -> IdentifierSet;

    /// Validates the command against the current baseline and produces the
    /// events (and/or errors) it results in.
    fn handle(&self, actor: &A) -> (Vec<A::Event>, Vec<Error>);
}

/// The outcome of a `fetch` or `handle` call: the actor before and after,
/// the events produced (empty for a plain fetch), and any errors.
#[derive(Debug, Clone)]
pub struct Results<A: Actor> {
    /// The actor state before this call's events were applied.
    pub original: A,
    /// The actor state after this call's events were applied. Reflects the
    /// in-memory outcome even when persistence ultimately failed, so
    /// callers can inspect what would have happened.
    pub modified: A,
    /// The events produced by this call, in application order.
    pub events: Vec<A::Event>,
    /// Errors encountered. A non-empty list does not necessarily mean
    /// nothing was persisted — see the error-handling policy in the crate
    /// docs for `repository`.
    pub errors: Vec<Error>,
}
