//! Opaque, time-ordered 128-bit identifiers.
//!
//! Both actor-ids and event-ids are minted from this single type. The
//! property the rest of the crate relies on (§3, §5 of the design) is that
//! sorting a set of [`Id`]s by their string form yields the same order they
//! were generated in — this is what lets an aggregate fetch merge several
//! child streams by just sorting event-ids lexicographically.
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A monotonically-increasing, time-ordered 128-bit identifier.
///
/// Used both as an actor-id (the stream key) and an event-id. Generated via
/// UUIDv7, whose layout embeds a millisecond timestamp in the high bits, so
/// string-sorting a batch of ids reproduces generation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(Uuid);

impl Id {
    /// Mints a fresh, time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The nil id, used as a sentinel meaning "no id yet" (e.g. the starting
    /// point for replay when a stream has never been snapshotted).
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns `true` if this is the nil id.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Wraps an existing UUID, e.g. one loaded back from storage.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifies an actor stream. Distinct type alias from [`EventId`] purely
/// for call-site readability; both are [`Id`] under the hood.
pub type ActorId = Id;

/// Identifies a single event within a stream.
pub type EventId = Id;
