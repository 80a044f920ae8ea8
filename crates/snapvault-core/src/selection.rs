//! # Active-Selection Registry
//!
//! The operator-controlled record naming which identity downstream
//! automation should use. Independent of every identity's own pointer:
//! selecting never touches history, and ingesting never touches the
//! selection.

use crate::store::ActiveSelection;
use crate::{IdentityId, VaultError, VaultStore};
use chrono::{DateTime, Utc};

/// Registry view over a store's selection record.
#[derive(Debug)]
pub struct SelectionRegistry<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: VaultStore + ?Sized> SelectionRegistry<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// The current selection, if any.
    pub fn get_active(&self) -> Result<Option<ActiveSelection>, VaultError> {
        self.store.load_selection()
    }

    /// Select `identity`. Fails with `IdentityNotFound` until the identity
    /// has a confirmed pointer.
    pub fn set_active(
        &self,
        identity: &IdentityId,
        at: DateTime<Utc>,
    ) -> Result<ActiveSelection, VaultError> {
        if self.store.read(identity)?.is_none() {
            return Err(VaultError::IdentityNotFound(identity.clone()));
        }
        let selection = ActiveSelection {
            selected_identity_id: identity.clone(),
            selected_at: at,
        };
        self.store.store_selection(&selection)?;
        tracing::info!(identity = %identity, "Active identity selected");
        Ok(selection)
    }

    /// Drop the selection. Returns whether one existed.
    pub fn clear(&self) -> Result<bool, VaultError> {
        self.store.clear_selection()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::{FileStore, PointerStore, Snapshot, SnapshotStore};
    use crate::{Canonicalizer, RawCookie, RawExtraction};
    use tempfile::tempdir;

    #[test]
    fn select_requires_pointer() {
        let temp = tempdir().expect("temp dir");
        let store = FileStore::open(temp.path()).unwrap();
        let registry = SelectionRegistry::new(&store);
        let id = IdentityId::new("u1").unwrap();

        assert!(matches!(
            registry.set_active(&id, Utc::now()),
            Err(VaultError::IdentityNotFound(_))
        ));
        assert!(registry.get_active().unwrap().is_none());

        let raw = RawExtraction::for_user("u1").with_cookie(RawCookie::new("sid", "a"));
        let state = Canonicalizer::default().canonicalize(&raw).unwrap();
        let snapshot = Snapshot::seal(state, Utc::now()).unwrap();
        store.put(&snapshot).unwrap();
        store
            .compare_and_swap(&id, None, &snapshot.hash, Utc::now())
            .unwrap();

        let selection = registry.set_active(&id, Utc::now()).unwrap();
        assert_eq!(selection.selected_identity_id, id);
        assert_eq!(registry.get_active().unwrap(), Some(selection));

        assert!(registry.clear().unwrap());
        assert!(registry.get_active().unwrap().is_none());
    }
}
