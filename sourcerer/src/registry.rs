//! Maps type-names to decode functions so a generic, untyped payload coming
//! back from storage can be turned into a concrete event or command value.
//!
//! Because this crate's [`crate::Storage`] trait is generic over a single
//! [`crate::Actor`]'s associated `Event`/`Command` type, decode in the
//! common path is just `serde_json::from_value::<A::Event>` — the compiler
//! already knows the target type. [`crate::record::RawEventRecord::decode`]
//! takes exactly this path whenever no decoder is registered here, so a
//! caller that never touches this registry still decodes correctly. The
//! registry exists for the boundary cases spec'd in the original design: a
//! storage adapter that persists several different actors' events in one
//! physical table/stream and must decide, from the `type_name` column
//! alone, which concrete decoder to invoke before nesting the result back
//! into an `A::Event` enum variant.
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

type DecodeFn<T> = Arc<dyn Fn(serde_json::Value) -> Result<T> + Send + Sync>;

/// A registry of name -> decode-function mappings for a single target type
/// `T` (typically an aggregate's event enum or command enum).
///
/// Registration is expected to happen once at startup, before any
/// `Repository::handle`/`fetch` call — mutating the registry afterwards is
/// unsynchronized and its effects on in-flight decodes are undefined.
pub struct TypeRegistry<T> {
    decoders: HashMap<String, DecodeFn<T>>,
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }
}

impl<T> TypeRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder under `type_name`. Re-registering the same name
    /// overwrites the previous decoder.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        decode: impl Fn(serde_json::Value) -> Result<T> + Send + Sync + 'static,
    ) {
        self.decoders.insert(type_name.into(), Arc::new(decode));
    }

    /// Registers a decoder for any `T: DeserializeOwned`, using
    /// `serde_json::from_value` directly. This is the common case: most
    /// concrete variants decode structurally with no custom logic.
    pub fn register_structural<U>(&mut self, type_name: impl Into<String>)
    where
        U: serde::de::DeserializeOwned + Into<T> + 'static,
    {
        self.register(type_name, |payload| {
            serde_json::from_value::<U>(payload)
                .map(Into::into)
                .map_err(|e| Error::Validation(format!("failed to decode payload: {e}")))
        });
    }

    /// Decodes `payload` using the decoder registered under `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownType`] if no decoder is registered for
    /// `type_name`, or whatever error the decoder itself returns.
    pub fn decode(&self, type_name: &str, payload: serde_json::Value) -> Result<T> {
        match self.decoders.get(type_name) {
            Some(decode) => decode(payload),
            None => Err(Error::UnknownType(type_name.to_string())),
        }
    }

    /// Returns `true` if a decoder is registered for `type_name`.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }
}
