//! Schema upcasting
//!
//! Upcasters rewrite historical raw documents so that old events decode
//! against the current event schema. They are ordered by their declared
//! dependencies and applied one full pass at a time by [`UpcastRunner`].

mod runner;

use std::collections::HashSet;
use std::sync::Arc;

use crate::types::RawEventEnvelope;

pub use runner::{UpcastPass, UpcastReport, UpcastRunner};

/// A migration of historical raw events
///
/// `upcast` returns `None` to keep the event unchanged. `Some` replaces the
/// event with the returned envelopes: an empty list deletes it, several
/// split it. Versions of the returned envelopes are ignored; the runner
/// renumbers them.
pub trait Upcaster: Send + Sync {
    /// Unique name other upcasters refer to in `dependencies`
    fn name(&self) -> &'static str;

    /// Names of upcasters that must run before this one
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    fn upcast(&self, raw: &RawEventEnvelope) -> Option<Vec<RawEventEnvelope>>;
}

/// Upcasters that cannot be put in dependency order
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SortError {
    #[error("upcaster {0} is registered twice")]
    Duplicate(&'static str),

    #[error("upcaster {upcaster} depends on unknown upcaster {dependency}")]
    MissingDependency {
        upcaster: &'static str,
        dependency: &'static str,
    },

    #[error("upcasters cannot be ordered (dependency cycle): {}", .unresolved.join(", "))]
    Cycle { unresolved: Vec<&'static str> },
}

/// Order upcasters so every one runs after its dependencies
///
/// Upcasters without dependencies come first, in the order given. Each
/// further round adds every remaining upcaster whose dependencies are all
/// placed. Every round must place at least one, so more rounds than there
/// are upcasters means a cycle.
pub fn sort_by_dependencies(
    upcasters: Vec<Arc<dyn Upcaster>>,
) -> Result<Vec<Arc<dyn Upcaster>>, SortError> {
    let mut names = HashSet::new();
    for upcaster in &upcasters {
        if !names.insert(upcaster.name()) {
            return Err(SortError::Duplicate(upcaster.name()));
        }
    }
    for upcaster in &upcasters {
        if let Some(dependency) = upcaster
            .dependencies()
            .iter()
            .find(|dependency| !names.contains(*dependency))
        {
            return Err(SortError::MissingDependency {
                upcaster: upcaster.name(),
                dependency: *dependency,
            });
        }
    }

    let (mut sorted, mut remaining): (Vec<_>, Vec<_>) = upcasters
        .into_iter()
        .partition(|upcaster| upcaster.dependencies().is_empty());
    let mut placed: HashSet<&'static str> = sorted.iter().map(|u| u.name()).collect();

    let budget = remaining.len() + 1;
    for _ in 0..budget {
        if remaining.is_empty() {
            return Ok(sorted);
        }

        let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|upcaster| {
            upcaster
                .dependencies()
                .iter()
                .all(|dependency| placed.contains(dependency))
        });
        if ready.is_empty() {
            return Err(SortError::Cycle {
                unresolved: blocked.iter().map(|u| u.name()).collect(),
            });
        }

        placed.extend(ready.iter().map(|u| u.name()));
        sorted.extend(ready);
        remaining = blocked;
    }

    if remaining.is_empty() {
        Ok(sorted)
    } else {
        Err(SortError::Cycle {
            unresolved: remaining.iter().map(|u| u.name()).collect(),
        })
    }
}
