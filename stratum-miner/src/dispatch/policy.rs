//! Which pool a worker mines for.

use super::registry::RegistryEntry;

/// Chooses among registry entries. Called with the registry lock held.
pub trait PoolSelectionPolicy: Send + Sync {
    fn select<'a>(&self, entries: &'a [RegistryEntry]) -> Option<&'a RegistryEntry>;
}

/// The first registered pool that has work.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstPoolWithWork;

impl PoolSelectionPolicy for FirstPoolWithWork {
    fn select<'a>(&self, entries: &'a [RegistryEntry]) -> Option<&'a RegistryEntry> {
        entries.iter().find(|e| e.factory.is_some())
    }
}
