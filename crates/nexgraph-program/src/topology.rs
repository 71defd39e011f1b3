//! Topology - Declarative Primitive Graph
//!
//! A `Topology` maps primitive ids to immutable primitive descriptions. The
//! caller builds it incrementally; dependencies are referenced by id and only
//! resolved when a program is built from it.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::sync::Arc;

use nexgraph_core::{Error, Primitive, PrimitiveId, Result};
use rustc_hash::FxHashMap;

// =============================================================================
// Topology
// =============================================================================

/// Insertion-ordered set of primitive descriptions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    primitives: Vec<Arc<Primitive>>,
    index: FxHashMap<PrimitiveId, usize>,
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a primitive.
    ///
    /// Adding an identical description under an existing id does nothing;
    /// adding a different one fails with `DuplicateDefinition`.
    pub fn add(&mut self, primitive: Primitive) -> Result<()> {
        if let Some(&slot) = self.index.get(&primitive.id) {
            if *self.primitives[slot] == primitive {
                return Ok(());
            }
            return Err(Error::duplicate_definition(primitive.id));
        }
        self.index.insert(primitive.id.clone(), self.primitives.len());
        self.primitives.push(Arc::new(primitive));
        Ok(())
    }

    /// Adds a primitive and returns the topology, for chained construction.
    pub fn with(mut self, primitive: Primitive) -> Result<Self> {
        self.add(primitive)?;
        Ok(self)
    }

    /// Looks up a primitive by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Primitive>> {
        self.index.get(id).map(|&slot| &self.primitives[slot])
    }

    /// Returns true if `id` is defined.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of primitives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    /// Returns true if the topology holds no primitives.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    /// Iterates primitives in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Primitive>> {
        self.primitives.iter()
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.primitives.iter().map(|p| p.id.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
