//! Profile bundles: compiled-in built-ins plus user bundles.
//!
//! Built-ins shadow same-named user bundles and cannot be overwritten
//! or deleted; persisted configs survive deactivation.

use std::sync::Arc;
use std::sync::OnceLock;

use swarm_core::errors::HubError;
use swarm_core::profile::ProfileBundle;
use swarm_store::Store;

static BUILTINS: OnceLock<Vec<ProfileBundle>> = OnceLock::new();

/// The compiled-in bundles.
#[must_use]
pub fn builtin_profiles() -> &'static [ProfileBundle] {
    BUILTINS.get_or_init(|| {
        let mut bundles: Vec<ProfileBundle> =
            serde_json::from_str(include_str!("profiles/builtin.json"))
                .expect("builtin profile descriptor is valid");
        for bundle in &mut bundles {
            bundle.builtin = true;
        }
        bundles
    })
}

/// Merged view over built-in and user bundles.
pub struct ProfileCatalog {
    store: Arc<Store>,
}

impl ProfileCatalog {
    /// Create a catalog over the given store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Built-ins first, then user bundles whose names are not shadowed.
    pub fn list(&self) -> Result<Vec<ProfileBundle>, HubError> {
        let mut merged: Vec<ProfileBundle> = builtin_profiles().to_vec();
        for user in self.store.list_profiles().map_err(HubError::from)? {
            if !merged.iter().any(|b| b.name == user.name) {
                merged.push(user);
            }
        }
        Ok(merged)
    }

    /// Look up one bundle; built-ins win over user bundles.
    pub fn get(&self, name: &str) -> Result<Option<ProfileBundle>, HubError> {
        if let Some(builtin) = builtin_profiles().iter().find(|b| b.name == name) {
            return Ok(Some(builtin.clone()));
        }
        Ok(self.store.get_profile(name).map_err(HubError::from)?)
    }

    /// Persist a user bundle. Refuses built-in names.
    pub fn create(&self, bundle: &ProfileBundle) -> Result<(), HubError> {
        bundle.validate()?;
        if builtin_profiles().iter().any(|b| b.name == bundle.name) {
            return Err(HubError::Conflict(format!(
                "'{}' is a built-in profile",
                bundle.name
            )));
        }
        self.store.save_profile(bundle).map_err(HubError::from)
    }

    /// Delete a user bundle. Built-ins are protected.
    pub fn delete(&self, name: &str) -> Result<(), HubError> {
        if builtin_profiles().iter().any(|b| b.name == name) {
            return Err(HubError::Conflict(format!(
                "built-in profile '{name}' is protected"
            )));
        }
        if !self.store.delete_profile(name).map_err(HubError::from)? {
            return Err(HubError::not_found(format!("profile '{name}'")));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use swarm_core::profile::ProfileEntry;

    fn catalog() -> ProfileCatalog {
        ProfileCatalog::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn user_bundle(name: &str) -> ProfileBundle {
        ProfileBundle {
            name: name.into(),
            description: "user bundle".into(),
            entries: vec![ProfileEntry {
                name: "fetch".into(),
                command: "uvx".into(),
                args: vec![],
                env: HashMap::new(),
                description: String::new(),
            }],
            builtin: false,
        }
    }

    #[test]
    fn builtins_parse_and_are_flagged() {
        let builtins = builtin_profiles();
        assert!(!builtins.is_empty());
        assert!(builtins.iter().all(|b| b.builtin));
        assert!(builtins.iter().all(|b| b.validate().is_ok()));
    }

    #[test]
    fn list_merges_user_bundles() {
        let cat = catalog();
        cat.create(&user_bundle("mine")).unwrap();
        let all = cat.list().unwrap();
        assert!(all.iter().any(|b| b.name == "mine" && !b.builtin));
        assert!(all.iter().any(|b| b.builtin));
    }

    #[test]
    fn builtin_shadows_same_named_user_bundle() {
        let cat = catalog();
        // Sneak a same-named bundle directly into the store.
        cat.store.save_profile(&user_bundle("web")).unwrap();
        let got = cat.get("web").unwrap().unwrap();
        assert!(got.builtin);
        let listed: Vec<_> = cat
            .list()
            .unwrap()
            .into_iter()
            .filter(|b| b.name == "web")
            .collect();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].builtin);
    }

    #[test]
    fn create_refuses_builtin_name() {
        let cat = catalog();
        let err = cat.create(&user_bundle("web")).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn create_validates_bundle() {
        let cat = catalog();
        let mut empty = user_bundle("empty");
        empty.entries.clear();
        assert_eq!(cat.create(&empty).unwrap_err().code(), "BAD_INPUT");
    }

    #[test]
    fn delete_protects_builtins() {
        let cat = catalog();
        let err = cat.delete("web").unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn delete_missing_is_not_found() {
        let cat = catalog();
        assert_eq!(cat.delete("ghost").unwrap_err().code(), "NOT_FOUND");
    }

    #[test]
    fn delete_user_bundle() {
        let cat = catalog();
        cat.create(&user_bundle("mine")).unwrap();
        cat.delete("mine").unwrap();
        assert!(cat.get("mine").unwrap().is_none());
    }
}
