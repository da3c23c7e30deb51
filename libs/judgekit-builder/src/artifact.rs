/// Artifact Store - Typed Bag Threaded Through One Pipeline Run
///
/// **Core Responsibility:**
/// Hold at most one value per artifact type while build steps run.
///
/// **Critical Properties:**
/// - Keyed by type: `Vec<T>` is a different artifact than `T`
/// - `add` replaces any prior value of exactly that type
/// - `require` fails loudly; a missing artifact is a step-ordering bug
/// - `get` is for optional artifacts (e.g. an external library)
/// - Owned by a single run; dropping the store releases its resources
///   (temporary directories are artifacts too)

use crate::error::PipelineError;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Type-level key of an artifact, used by steps to declare their inputs
/// and outputs.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactKind {
    id: TypeId,
    name: &'static str,
}

impl ArtifactKind {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ArtifactKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ArtifactKind {}

impl Hash for ArtifactKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

struct Entry {
    name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct ArtifactStore {
    artifacts: HashMap<TypeId, Entry>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under its type, returning the value it replaced.
    pub fn add<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        let previous = self.artifacts.insert(
            TypeId::of::<T>(),
            Entry {
                name: type_name::<T>(),
                value: Box::new(value),
            },
        )?;
        previous.value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.artifacts
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_ref::<T>())
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.artifacts
            .get_mut(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_mut::<T>())
    }

    /// Fetch an artifact that `step` cannot run without.
    pub fn require<T: 'static>(&self, step: &'static str) -> Result<&T, PipelineError> {
        self.get::<T>().ok_or(PipelineError::MissingArtifact {
            step,
            artifact: type_name::<T>(),
        })
    }

    pub fn require_mut<T: 'static>(&mut self, step: &'static str) -> Result<&mut T, PipelineError> {
        self.get_mut::<T>().ok_or(PipelineError::MissingArtifact {
            step,
            artifact: type_name::<T>(),
        })
    }

    pub fn take<T: 'static>(&mut self) -> Option<T> {
        let entry = self.artifacts.remove(&TypeId::of::<T>())?;
        entry.value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.artifacts.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.artifacts.values().map(|e| e.name).collect();
        names.sort_unstable();
        f.debug_struct("ArtifactStore").field("artifacts", &names).finish()
    }
}
