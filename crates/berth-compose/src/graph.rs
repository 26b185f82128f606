//! Dependency layering for a spec set.
//!
//! Kahn's algorithm, one layer at a time: every service in wave `n`
//! depends only on services in waves `< n`. Services inside a wave are
//! independent and may be rolled out concurrently.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::GraphError;
use crate::spec::{ServiceId, ServiceSpec};

/// Partition `specs` into dependency-ordered waves.
///
/// Ordering within a wave follows `ServiceId` ordering, so the result is
/// deterministic for a given spec set.
pub fn rollout_waves(specs: &[ServiceSpec]) -> Result<Vec<Vec<ServiceId>>, GraphError> {
    let mut in_degree: BTreeMap<ServiceId, usize> = BTreeMap::new();
    for spec in specs {
        if in_degree.insert(spec.id, 0).is_some() {
            return Err(GraphError::DuplicateService(spec.id.to_string()));
        }
    }

    // dependency -> dependents
    let mut dependents: BTreeMap<ServiceId, BTreeSet<ServiceId>> = BTreeMap::new();
    for spec in specs {
        for dep in &spec.depends_on {
            if !in_degree.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    service: spec.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            if dependents.entry(*dep).or_default().insert(spec.id) {
                *in_degree.entry(spec.id).or_default() += 1;
            }
        }
    }

    let mut waves = Vec::new();
    let mut ready: Vec<ServiceId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut placed = 0;

    while !ready.is_empty() {
        let mut next = BTreeSet::new();
        for id in &ready {
            in_degree.remove(id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        waves.push(ready);
        ready = next.into_iter().collect();
    }

    if placed != specs.len() {
        let stuck = in_degree.keys().map(ServiceId::to_string).collect();
        return Err(GraphError::Cycle(stuck));
    }

    Ok(waves)
}

/// All transitive dependents of `failed` within `specs`.
pub fn dependents_of(specs: &[ServiceSpec], failed: &ServiceId) -> BTreeSet<ServiceId> {
    let mut blocked = BTreeSet::new();
    let mut frontier = vec![*failed];
    while let Some(current) = frontier.pop() {
        for spec in specs {
            if spec.depends_on.contains(&current) && blocked.insert(spec.id) {
                frontier.push(spec.id);
            }
        }
    }
    blocked
}
