//! # Engine interface
//!
//! An [`Engine`] is an execution backend identity: it mints unique relation
//! names, declares which operations preserve row order when it runs them,
//! and supplies payloads for the special leaf relations (the join identity
//! and doomed relations).
//!
//! Engines compare by reference, never by value: two engines with the same
//! name are still two different engines. [`EngineRef`] is the shared handle
//! the core stores in relation trees, with pointer-identity equality.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::column::{is_standard_function, ColumnSet};
use crate::operations::UnaryOperation;

// ============================================================================
// Payloads
// ============================================================================

/// Engine-specific cached content attached to leaves and materializations.
///
/// The core treats payloads as opaque; the blanket impl makes any
/// `Any + Debug + Send + Sync` type usable.
pub trait EnginePayload: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> EnginePayload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared handle to an engine payload.
pub type Payload = Arc<dyn EnginePayload>;

/// Downcast a payload to the concrete type an engine stored in it.
pub fn payload_downcast<T: 'static>(payload: &Payload) -> Option<&T> {
    payload.as_any().downcast_ref::<T>()
}

// ============================================================================
// Engine trait
// ============================================================================

/// Operation whose order-preservation behavior an engine must declare.
///
/// `Join` never preserves order and cannot be queried; `Chain` is the only
/// binary operation that can.
#[derive(Clone, Copy, Debug)]
pub enum OrderedOperation<'a> {
    Unary(&'a UnaryOperation),
    Chain,
}

/// An execution backend identity and policy object.
pub trait Engine: fmt::Debug + Send + Sync {
    /// Name of the engine; primarily for display purposes.
    fn name(&self) -> &str;

    /// Return a name for a new relation, unique within this engine.
    fn get_relation_name(&self, prefix: &str) -> String;

    /// Whether `operation` preserves the row order of its target(s) when it
    /// acts in this engine.
    ///
    /// Reordering operations are never considered to preserve order. For
    /// `Transfer` the answer depends on both ends: implementations should
    /// delegate to the destination unless the destination is this engine.
    fn preserves_order(&self, operation: OrderedOperation<'_>) -> bool;

    /// Whether this engine can evaluate the named column function.
    fn supports_function(&self, name: &str) -> bool {
        is_standard_function(name)
    }

    /// Payload for a leaf relation that is the join identity.
    fn get_join_identity_payload(&self) -> Option<Payload> {
        None
    }

    /// Payload for a leaf relation that has no rows.
    fn get_doomed_payload(&self, _columns: &ColumnSet) -> Option<Payload> {
        None
    }
}

// ============================================================================
// EngineRef
// ============================================================================

/// Shared engine handle with pointer-identity equality.
#[derive(Clone)]
pub struct EngineRef(Arc<dyn Engine>);

impl EngineRef {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        EngineRef(Arc::new(engine))
    }

    pub fn from_arc(engine: Arc<dyn Engine>) -> Self {
        EngineRef(engine)
    }

    /// Whether this handle points at exactly `engine`.
    pub fn refers_to(&self, engine: &dyn Engine) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0).cast::<u8>(),
            (engine as *const dyn Engine).cast::<u8>(),
        )
    }

    fn identity(&self) -> *const u8 {
        Arc::as_ptr(&self.0).cast::<u8>()
    }
}

impl std::ops::Deref for EngineRef {
    type Target = dyn Engine;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for EngineRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.identity(), other.identity())
    }
}

impl Eq for EngineRef {}

impl Hash for EngineRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.identity() as usize).hash(state);
    }
}

impl fmt::Display for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineRef({:?})", &self.0)
    }
}

// ============================================================================
// GenericEngine
// ============================================================================

/// Implementation core shared by the provided engines.
///
/// Holds the engine name, the relation-name counter, and a map of named
/// column functions of engine-specific type `F`. Name lookups through
/// [`GenericEngine::get_function`] are only consulted after the standard
/// operator vocabulary, which engines are expected to handle natively.
pub struct GenericEngine<F> {
    name: String,
    relation_name_counter: AtomicU64,
    functions: HashMap<String, F>,
}

impl<F> GenericEngine<F> {
    pub fn new(name: impl Into<String>) -> Self {
        GenericEngine {
            name: name.into(),
            relation_name_counter: AtomicU64::new(0),
            functions: HashMap::new(),
        }
    }

    pub fn with_functions(name: impl Into<String>, functions: HashMap<String, F>) -> Self {
        GenericEngine {
            name: name.into(),
            relation_name_counter: AtomicU64::new(0),
            functions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a named column function.
    pub fn insert_function(&mut self, name: impl Into<String>, function: F) {
        self.functions.insert(name.into(), function);
    }

    /// Return a name unique within this engine: the prefix, the current
    /// counter value, and a random hexadecimal suffix.
    pub fn get_relation_name(&self, prefix: &str) -> String {
        let counter = self.relation_name_counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{counter:04}_{}", Uuid::new_v4().simple())
    }

    /// Look up a registered column function by name.
    pub fn get_function(&self, name: &str) -> Option<&F> {
        self.functions.get(name)
    }

    /// Standard operators first, then the functions map.
    pub fn supports_function(&self, name: &str) -> bool {
        is_standard_function(name) || self.functions.contains_key(name)
    }
}

impl<F> fmt::Debug for GenericEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("GenericEngine")
            .field("name", &self.name)
            .field(
                "relation_name_counter",
                &self.relation_name_counter.load(Ordering::Relaxed),
            )
            .field("functions", &names)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::IterationEngine;

    #[test]
    fn test_relation_name_format() {
        let engine: GenericEngine<()> = GenericEngine::new("test");
        let first = engine.get_relation_name("leaf");
        let second = engine.get_relation_name("leaf");
        assert!(first.starts_with("leaf_0000_"));
        assert!(second.starts_with("leaf_0001_"));
        assert_ne!(first, second);
        // 32 hex characters of suffix
        assert_eq!(first.len(), "leaf_0000_".len() + 32);
    }

    #[test]
    fn test_engine_identity_is_by_reference() {
        let a = EngineRef::new(IterationEngine::new("same"));
        let b = EngineRef::new(IterationEngine::new("same"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_generic_engine_function_lookup() {
        let mut engine: GenericEngine<u32> = GenericEngine::new("test");
        engine.insert_function("custom", 7);
        assert!(engine.supports_function("add"));
        assert!(engine.supports_function("custom"));
        assert!(!engine.supports_function("missing"));
        assert_eq!(engine.get_function("custom"), Some(&7));
        assert_eq!(engine.get_function("add"), None);
    }

    #[test]
    fn test_payload_downcast() {
        let payload: Payload = Arc::new(vec![1u64, 2, 3]);
        assert_eq!(
            payload_downcast::<Vec<u64>>(&payload),
            Some(&vec![1u64, 2, 3])
        );
        assert!(payload_downcast::<String>(&payload).is_none());
    }
}
