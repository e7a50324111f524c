use std::collections::BTreeSet;
use std::sync::Arc;

use super::handle::SharedBundle;

/// A single kind of reference held on a bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum Reference {
    /// A direct request through [`BundleLoader::load`](super::BundleLoader::load).
    Root,
    /// The named bundle depends on this one.
    Dependency(String),
    /// A load of this bundle is in progress.
    Loading,
}

/// Tracks all references held on a single bundle.
///
/// Every `release_*` method returns `true` once no reference of any kind is left, at which
/// point the owner has to drop this record and unload the bundle.
#[derive(Default)]
pub(super) struct RefCount {
    bundle: Option<SharedBundle>,
    dependents: BTreeSet<String>,
    loading: usize,
    root: bool,
}

impl RefCount {
    pub fn add(&mut self, reference: &Reference) {
        match reference {
            Reference::Root => self.add_root(),
            Reference::Dependency(dependent) => self.add_dependency(dependent),
            Reference::Loading => self.add_loading(),
        }
    }

    pub fn release(&mut self, reference: &Reference) -> bool {
        match reference {
            Reference::Root => self.release_root(),
            Reference::Dependency(dependent) => self.release_dependency(dependent),
            Reference::Loading => self.release_loading(),
        }
    }

    pub fn set_bundle(&mut self, bundle: SharedBundle) {
        debug_assert!(
            self.bundle
                .as_ref()
                .is_none_or(|current| Arc::ptr_eq(current, &bundle)),
            "a different bundle was assigned to the same record"
        );
        self.bundle = Some(bundle);
    }

    pub fn take_bundle(&mut self) -> Option<SharedBundle> {
        self.bundle.take()
    }

    pub fn is_root_loaded(&self) -> bool {
        self.root
    }

    pub fn add_root(&mut self) {
        self.root = true;
    }

    pub fn release_root(&mut self) -> bool {
        self.root = false;
        self.is_unreferenced()
    }

    /// Adding the same dependent twice only registers it once.
    pub fn add_dependency(&mut self, dependent: &str) {
        if !self.dependents.contains(dependent) {
            self.dependents.insert(dependent.to_owned());
        }
    }

    pub fn release_dependency(&mut self, dependent: &str) -> bool {
        self.dependents.remove(dependent);
        self.is_unreferenced()
    }

    pub fn add_loading(&mut self) {
        self.loading += 1;
    }

    /// # Panics
    ///
    /// Panics if no loading reference is held, which means loads and their completions got
    /// out of sync.
    pub fn release_loading(&mut self) -> bool {
        assert!(self.loading >= 1, "released a loading reference that was never added");
        self.loading -= 1;
        self.is_unreferenced()
    }

    pub fn is_unreferenced(&self) -> bool {
        !self.root && self.dependents.is_empty() && self.loading == 0
    }

    pub fn snapshot(&self) -> RefCountSnapshot {
        RefCountSnapshot {
            root: self.root,
            dependents: self.dependents.iter().cloned().collect(),
            loading: self.loading,
            has_bundle: self.bundle.is_some(),
        }
    }
}

/// A point-in-time view of the references held on a bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefCountSnapshot {
    /// Whether a root reference is held.
    pub root: bool,
    /// The names of all bundles holding a dependency reference, in sorted order.
    pub dependents: Vec<String>,
    /// The number of loads in progress.
    pub loading: usize,
    /// Whether the bundle finished loading.
    pub has_bundle: bool,
}
