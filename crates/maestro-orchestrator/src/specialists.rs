use maestro_core::{SpecialistHandler, Specialty};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Typed map from specialty to the handler that serves it.
///
/// Every agent of a specialty shares the registered handler, so handlers
/// must be safe to call concurrently.
#[derive(Clone, Default)]
pub struct SpecialistRegistry {
    handlers: BTreeMap<Specialty, Arc<dyn SpecialistHandler>>,
}

impl SpecialistRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the specialty it reports. A second handler
    /// for the same specialty replaces the first.
    pub fn register(&mut self, handler: Arc<dyn SpecialistHandler>) -> &mut Self {
        self.handlers.insert(handler.specialty(), handler);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, handler: Arc<dyn SpecialistHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Handler registered for `specialty`.
    pub fn get(&self, specialty: &Specialty) -> Option<Arc<dyn SpecialistHandler>> {
        self.handlers.get(specialty).cloned()
    }

    /// Whether any handler serves `specialty`.
    pub fn contains(&self, specialty: &Specialty) -> bool {
        self.handlers.contains_key(specialty)
    }

    /// Registered specialties, sorted.
    pub fn specialties(&self) -> Vec<Specialty> {
        self.handlers.keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for SpecialistRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecialistRegistry")
            .field("specialties", &self.specialties())
            .finish()
    }
}
