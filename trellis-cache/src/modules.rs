//! Registry refresh hook.
//!
//! Tracks the activated modules last seen per database and calls the
//! framework's [`ModuleRegistry`] when they change, or when a peer asks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{Database, ModuleRegistry};

#[derive(Default)]
pub(crate) struct ModuleTracker {
    registry: RwLock<Option<Arc<dyn ModuleRegistry>>>,
    seen: Mutex<HashMap<String, Vec<String>>>,
}

impl ModuleTracker {
    pub(crate) fn set_registry(&self, registry: Arc<dyn ModuleRegistry>) {
        *self.registry.write() = Some(registry);
    }

    /// Read the activated modules and refresh the class registry when they
    /// differ from the last read, or unconditionally with `force`.
    /// Returns whether the registry was refreshed.
    pub(crate) fn refresh(&self, database: &dyn Database, force: bool) -> bool {
        let mut modules = match database.active_modules() {
            Ok(modules) => modules,
            Err(e) => {
                tracing::warn!(
                    database = %database.name(),
                    error = %e,
                    "Failed to read activated modules"
                );
                return false;
            }
        };
        modules.sort();
        modules.dedup();

        let changed = {
            let mut seen = self.seen.lock();
            let changed = seen.get(database.name()) != Some(&modules);
            if changed {
                seen.insert(database.name().to_string(), modules.clone());
            }
            changed
        };
        if !(changed || force) {
            return false;
        }

        let registry = self.registry.read().clone();
        match registry {
            Some(registry) => {
                tracing::info!(
                    database = %database.name(),
                    modules = modules.len(),
                    "Refreshing class registry"
                );
                registry.refresh(database.name(), &modules);
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget(&self, database: &str) {
        self.seen.lock().remove(database);
    }
}
