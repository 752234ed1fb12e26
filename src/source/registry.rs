use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::{Source, SourceDescriptor};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Source '{0}' is already registered")]
    Duplicate(String),
}

struct Entry {
    descriptor: SourceDescriptor,
    adapter: Arc<dyn Source>,
}

/// Static table of sources, built once at startup and read-only afterwards.
#[derive(Default)]
pub struct SourceRegistry {
    entries: BTreeMap<String, Entry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: SourceDescriptor,
        adapter: Arc<dyn Source>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        tracing::debug!(source = %descriptor.name, title = %descriptor.title, "Registered source");
        self.entries
            .insert(descriptor.name.clone(), Entry { descriptor, adapter });
        Ok(())
    }

    /// Registered names in sorted order.
    pub fn list_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn resolve(&self, name: &str) -> Option<(&SourceDescriptor, Arc<dyn Source>)> {
        self.entries
            .get(name)
            .map(|entry| (&entry.descriptor, Arc::clone(&entry.adapter)))
    }

    pub fn descriptor(&self, name: &str) -> Option<&SourceDescriptor> {
        self.entries.get(name).map(|entry| &entry.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
