//! Reverse index from referenced objects to the ingresses that use them
//!
//! Populated on every reconciliation pass from the ingress's [`References`].
//! Watch mappers for Services, Endpoints, Secrets and ConfigMaps consult it
//! to requeue exactly the ingresses a change affects.

use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::compiler::{ObjectKey, References};

/// Kind of a referenced object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefKind {
    Service,
    Endpoints,
    Secret,
    ConfigMap,
}

type RefKey = (RefKind, ObjectKey);

/// Concurrent reference index shared between reconciler and watch mappers
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    by_ref: DashMap<RefKey, BTreeSet<ObjectKey>>,
    by_ingress: DashMap<ObjectKey, BTreeSet<RefKey>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything recorded for `ingress` with `refs`.
    ///
    /// Every referenced Service also registers its Endpoints, which share the
    /// Service's key.
    pub fn update(&self, ingress: &ObjectKey, refs: &References) {
        let mut wanted: BTreeSet<RefKey> = BTreeSet::new();
        for svc in &refs.services {
            wanted.insert((RefKind::Service, svc.clone()));
            wanted.insert((RefKind::Endpoints, svc.clone()));
        }
        wanted.extend(refs.secrets.iter().map(|k| (RefKind::Secret, k.clone())));
        wanted.extend(refs.config_maps.iter().map(|k| (RefKind::ConfigMap, k.clone())));

        let previous = self
            .by_ingress
            .insert(ingress.clone(), wanted.clone())
            .unwrap_or_default();
        for stale in previous.difference(&wanted) {
            self.unlink(stale, ingress);
        }
        for key in wanted.difference(&previous) {
            self.by_ref
                .entry(key.clone())
                .or_default()
                .insert(ingress.clone());
        }
    }

    /// Forget an ingress entirely
    pub fn remove(&self, ingress: &ObjectKey) {
        if let Some((_, refs)) = self.by_ingress.remove(ingress) {
            for key in &refs {
                self.unlink(key, ingress);
            }
        }
    }

    /// Ingresses referencing the object `kind`/`key`, sorted
    pub fn ingresses_for(&self, kind: RefKind, key: &ObjectKey) -> Vec<ObjectKey> {
        self.by_ref
            .get(&(kind, key.clone()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn unlink(&self, key: &RefKey, ingress: &ObjectKey) {
        let now_empty = match self.by_ref.get_mut(key) {
            Some(mut set) => {
                set.remove(ingress);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_ref.remove_if(key, |_, set| set.is_empty());
        }
    }
}
