//! Backends - Compute Engine Interfaces
//!
//! This module defines what the program builder and the network need from a
//! compute engine: buffer allocation, completion events and per-primitive
//! executable implementations. Implementations are looked up in an explicit
//! registry keyed by primitive type and output format.
//!
//! # Available Backends
//! - `cpu` - reference host backend (always available)
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::device::DeviceProfile;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::memory::Memory;
use crate::primitive::{Primitive, PrimitiveType};
use crate::tensor::Format;

// =============================================================================
// Backend Modules
// =============================================================================

pub mod cpu;

pub use cpu::{register_reference_implementations, CpuBackend};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Default)]
struct EventState {
    done: Mutex<bool>,
    signal: Condvar,
}

/// Completion flag shared between the producer of a result and its consumers.
#[derive(Debug, Clone, Default)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    /// Creates an event that is not yet set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event that is already set.
    #[must_use]
    pub fn completed() -> Self {
        let event = Self::new();
        event.set();
        event
    }

    /// Marks the event as complete and wakes all waiters.
    pub fn set(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.signal.notify_all();
    }

    /// Returns true once the event has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.state.done.lock()
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.signal.wait(&mut done);
        }
    }

    /// Blocks until every event in `events` is set.
    pub fn wait_all(events: &[Self]) {
        for event in events {
            event.wait();
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

/// Memory engine a weights reorder should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// Host side conversion.
    Host,
    /// Device side conversion.
    Device,
}

/// Weights layout an implementation needs, as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderSpec {
    /// Layout the weights must be converted to.
    pub target: Layout,
    /// Where the conversion runs.
    pub engine: EngineKind,
    /// Host conversions may require passing through this layout first.
    pub intermediate: Option<Layout>,
}

/// Everything a backend needs to pick an implementation for one node.
#[derive(Debug, Clone, Copy)]
pub struct ImplementationRequest<'a> {
    /// The primitive to execute.
    pub primitive: &'a Primitive,
    /// Inferred output layout.
    pub output_layout: &'a Layout,
    /// Layouts of every dependency, in dependency order.
    pub input_layouts: &'a [Layout],
    /// Capabilities of the target device.
    pub profile: &'a DeviceProfile,
    /// Whether kernel tuning was requested.
    pub tuning: bool,
}

/// An executable kernel bound to one primitive.
pub trait Implementation: Send + Sync + fmt::Debug {
    /// Returns a short name for logging.
    fn name(&self) -> &'static str;

    /// Runs the kernel once every event in `wait_events` is set.
    ///
    /// `inputs` holds one memory per dependency, in dependency order.
    fn execute(&self, inputs: &[Memory], output: &Memory, wait_events: &[Event]) -> Result<Event>;

    /// Layout the kernel needs its weights in, if different from the current one.
    fn weights_reorder_requirements(&self) -> Option<ReorderSpec> {
        None
    }
}

/// Creates an implementation for a request.
pub type ImplementationFactory = fn(&ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>>;

/// Lookup table of implementation factories keyed by (primitive type, output format).
#[derive(Default)]
pub struct ImplementationRegistry {
    factories: FxHashMap<(PrimitiveType, Option<Format>), ImplementationFactory>,
}

impl ImplementationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for `kind`; `format: None` matches every output format.
    pub fn register(&mut self, kind: PrimitiveType, format: Option<Format>, factory: ImplementationFactory) {
        self.factories.insert((kind, format), factory);
    }

    /// Returns true if some factory handles `kind` in `format`.
    #[must_use]
    pub fn supports(&self, kind: PrimitiveType, format: Format) -> bool {
        self.factories.contains_key(&(kind, Some(format))) || self.factories.contains_key(&(kind, None))
    }

    /// Number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Creates the implementation for a request, preferring a format-specific factory.
    pub fn create(&self, request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>> {
        let kind = request.primitive.kind();
        let format = request.output_layout.format();
        let factory = self
            .factories
            .get(&(kind, Some(format)))
            .or_else(|| self.factories.get(&(kind, None)))
            .ok_or_else(|| {
                Error::not_implemented(format!("no implementation of {kind} for output format {format}"))
            })?;
        factory(request)
    }
}

impl fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplementationRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

// =============================================================================
// Compute Backend Trait
// =============================================================================

/// Common trait for compute engines.
pub trait ComputeBackend: Send + Sync {
    /// Returns the name of this backend.
    fn name(&self) -> &'static str;

    /// Returns the device capabilities.
    fn profile(&self) -> DeviceProfile;

    /// Allocates a buffer for `layout`.
    fn allocate(&self, layout: &Layout) -> Result<Memory>;

    /// Creates an event the host sets manually.
    fn create_user_event(&self) -> Event {
        Event::new()
    }

    /// Picks the implementation for one node.
    fn select_implementation(&self, request: &ImplementationRequest<'_>) -> Result<Arc<dyn Implementation>>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_wakes_waiters() {
        let event = Event::new();
        assert!(!event.is_set());

        let waiter = {
            let event = event.clone();
            thread::spawn(move || {
                event.wait();
                event.is_set()
            })
        };
        event.set();
        assert!(waiter.join().unwrap());
        assert!(Event::completed().is_set());
    }

    #[test]
    fn test_registry_prefers_format_specific_factory() {
        let mut registry = ImplementationRegistry::new();
        register_reference_implementations(&mut registry);
        assert!(!registry.is_empty());
        assert!(registry.supports(PrimitiveType::Convolution, Format::Yxfb));
        assert!(registry.supports(PrimitiveType::Reorder, Format::OsIyxOsv16));
    }

    #[test]
    fn test_registry_reports_missing_kind() {
        let registry = ImplementationRegistry::new();
        let layout = Layout::new(crate::dtype::DataType::F32, crate::tensor::Tensor::bfyx(1, 1, 1, 1));
        let primitive = Primitive::input_layout("in", layout);
        let profile = DeviceProfile::host();
        let request = ImplementationRequest {
            primitive: &primitive,
            output_layout: &layout,
            input_layouts: &[],
            profile: &profile,
            tuning: false,
        };
        assert!(matches!(registry.create(&request), Err(Error::NotImplemented { .. })));
    }
}
