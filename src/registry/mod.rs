// src/registry/mod.rs
//! The set of monitored targets.
//!
//! Readers take an immutable [`RegistrySnapshot`]; a reload swaps in a new
//! snapshot instead of mutating the current one, so an in-flight cycle keeps
//! seeing the targets it started with.

mod target;

pub use target::{
    parse_sha256, Address, HttpCheck, Protocol, StompLogin, Target, TargetId, TlsPolicy,
    WebSocketCheck,
};

use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate target id: {0}")]
    DuplicateTarget(TargetId),
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    targets: BTreeMap<TargetId, Arc<Target>>,
}

impl RegistrySnapshot {
    fn build(generation: u64, targets: Vec<Target>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for target in targets {
            if map.contains_key(&target.id) {
                return Err(RegistryError::DuplicateTarget(target.id));
            }
            map.insert(target.id.clone(), Arc::new(target));
        }
        Ok(Self {
            generation,
            targets: map,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Target>> {
        self.targets.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.targets.contains_key(id)
    }

    /// Targets in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.targets.keys()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// What changed between two registry snapshots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<TargetId>,
    pub removed: Vec<TargetId>,
    pub changed: Vec<TargetId>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub struct TargetRegistry {
    current: ArcSwap<RegistrySnapshot>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<Target>) -> Result<Self, RegistryError> {
        let snapshot = RegistrySnapshot::build(0, targets)?;
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Target>> {
        self.current.load().get(id).cloned()
    }

    /// Install a new target set and report the difference from the previous one.
    pub fn replace(&self, targets: Vec<Target>) -> Result<RegistryDiff, RegistryError> {
        let previous = self.current.load_full();
        let next = RegistrySnapshot::build(previous.generation + 1, targets)?;

        let mut diff = RegistryDiff::default();
        for (id, target) in &next.targets {
            match previous.targets.get(id) {
                None => diff.added.push(id.clone()),
                Some(old) if old.as_ref() != target.as_ref() => diff.changed.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in previous.targets.keys() {
            if !next.targets.contains_key(id) {
                diff.removed.push(id.clone());
            }
        }

        self.current.store(Arc::new(next));

        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Target registry reloaded"
        );

        Ok(diff)
    }
}
