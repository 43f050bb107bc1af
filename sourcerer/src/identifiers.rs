//! User-facing natural keys and their canonical encoding.
//!
//! An [`Identifiers`] value is how callers address an actor: a small map of
//! named scalars (`"VIN" => "1FTFW1ET...")`. The map store translates this
//! into an opaque [`crate::id::Id`]. Canonicalization matters because the
//! same logical identifier must hash/compare equal regardless of the order
//! fields were inserted in — we rely on [`BTreeMap`]'s sorted iteration to
//! get deterministic JSON out of `serde_json` without an explicit sort step.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single identifier field value.
///
/// Closed over the scalar shapes natural keys are built from; arbitrary
/// nested structures are deliberately not supported so that canonicalization
/// stays trivial and total.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentifierValue {
    /// A string field, e.g. a VIN or license number.
    String(String),
    /// An integer field.
    Int(i64),
    /// A floating point field.
    Float(f64),
    /// A boolean field.
    Bool(bool),
}

impl Eq for IdentifierValue {}

impl Ord for IdentifierValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Total order over the canonical JSON rendering; identifier values
        // are never compared for anything but equality/dedup in practice.
        self.partial_cmp(other).unwrap_or_else(|| {
            format!("{self:?}").cmp(&format!("{other:?}"))
        })
    }
}

impl fmt::Display for IdentifierValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for IdentifierValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for IdentifierValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for IdentifierValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for IdentifierValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A mapping from string key to scalar value that addresses a single actor
/// instance. Keys are kept sorted (`BTreeMap`) so two `Identifiers` built
/// from the same fields in different insertion orders canonicalize to the
/// same string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers(BTreeMap<String, IdentifierValue>);

impl Identifiers {
    /// Creates an empty identifier map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field, returning `self` for chained construction.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<IdentifierValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns the deterministic canonical string used as a map-store key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the value cannot be serialized,
    /// which cannot happen for the closed set of scalar `IdentifierValue`
    /// variants but is surfaced rather than unwrapped at this boundary.
    pub fn canonical(&self) -> Result<String> {
        serde_json::to_string(&self.0)
            .map_err(|e| Error::Validation(format!("failed to canonicalize identifiers: {e}")))
    }

    /// Iterates over the fields in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &IdentifierValue)> {
        self.0.iter()
    }

    /// Returns `true` if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, IdentifierValue)> for Identifiers {
    fn from_iter<I: IntoIterator<Item = (String, IdentifierValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A mapping from actor-name to the ordered sequence of [`Identifiers`]
/// participating in a command. Aggregates use this to describe every
/// identity — their own and every child's — touched by a single command.
#[derive(Debug, Clone, Default)]
pub struct IdentifierSet(BTreeMap<String, Vec<Identifiers>>);

impl IdentifierSet {
    /// Creates an empty identifier set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one or more identifiers under the given actor-name.
    pub fn add_for(&mut self, actor_name: impl Into<String>, ids: impl IntoIterator<Item = Identifiers>) {
        self.0.entry(actor_name.into()).or_default().extend(ids);
    }

    /// Returns the identifiers registered for `actor_name`, in insertion
    /// order, or an empty slice if none were registered.
    #[must_use]
    pub fn get(&self, actor_name: &str) -> &[Identifiers] {
        self.0.get(actor_name).map_or(&[], Vec::as_slice)
    }

    /// Iterates over `(actor_name, identifiers)` pairs in actor-name sorted
    /// order, matching the deterministic assignment order required by the
    /// id-assignment protocol.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Identifiers>)> {
        self.0.iter()
    }
}
