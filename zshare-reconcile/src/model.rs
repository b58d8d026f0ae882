// SPDX-License-Identifier: GPL-3.0-only

//! Desired-state model of pools, datasets and export bindings.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use zshare_types::{
    Dataset, DatasetKey, DeclaredConfig, ExportBinding, OptionChange, Pool, PoolHealth,
};

use crate::error::ModelError;

/// Result of writing a binding into the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    Created,
    Updated(Vec<OptionChange>),
    Unchanged,
}

impl BindingChange {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// In-memory view of the desired configuration.
///
/// Every mutation ticks one logical clock; the dataset touched records the
/// tick as its revision, so revisions are monotonic per dataset.
#[derive(Debug, Clone)]
pub struct PoolModel {
    pools: BTreeMap<String, Pool>,
    service_enabled: bool,
    clock: u64,
}

impl Default for PoolModel {
    fn default() -> Self {
        Self {
            pools: BTreeMap::new(),
            service_enabled: true,
            clock: 0,
        }
    }
}

impl PoolModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model holding exactly the declared configuration.
    pub fn from_declared(config: &DeclaredConfig) -> Self {
        let mut model = Self::new();
        model.service_enabled = config.service_enabled;

        for pool in config.pool_names() {
            model.insert_pool(&pool, PoolHealth::Unknown);
        }
        for key in config.dataset_keys() {
            // Pools were inserted above, so this cannot fail.
            let _ = model.upsert_dataset(&key);
        }
        for binding in config.bindings() {
            let dataset = binding.dataset.clone();
            let _ = model.apply_binding(&dataset, binding);
        }

        model
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn service_enabled(&self) -> bool {
        self.service_enabled
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_service_enabled(&mut self, enabled: bool) -> bool {
        if self.service_enabled == enabled {
            return false;
        }
        self.tick();
        self.service_enabled = enabled;
        true
    }

    pub fn get(&self, pool: &str) -> Option<&Pool> {
        self.pools.get(pool)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// Insert a pool, or refresh the health of a known one. Returns `true` if it was new.
    pub fn insert_pool(&mut self, name: &str, health: PoolHealth) -> bool {
        self.tick();
        match self.pools.get_mut(name) {
            Some(pool) => {
                pool.health = health;
                false
            }
            None => {
                self.pools.insert(name.to_string(), Pool::new(name, health));
                true
            }
        }
    }

    pub fn remove_pool(&mut self, name: &str) -> Option<Pool> {
        let removed = self.pools.remove(name);
        if removed.is_some() {
            self.tick();
        }
        removed
    }

    pub fn dataset(&self, key: &DatasetKey) -> Option<&Dataset> {
        self.pools.get(&key.pool)?.dataset(&key.path)
    }

    pub fn has_dataset(&self, key: &DatasetKey) -> bool {
        self.dataset(key).is_some()
    }

    /// Keys of every dataset in the model, in name order.
    pub fn dataset_keys(&self) -> Vec<DatasetKey> {
        self.pools
            .values()
            .flat_map(|pool| pool.datasets.values().map(|dataset| dataset.key.clone()))
            .collect()
    }

    /// Datasets belonging to one pool.
    pub fn datasets_in(&self, pool: &str) -> Vec<DatasetKey> {
        self.pools
            .get(pool)
            .map(|pool| {
                pool.datasets
                    .values()
                    .map(|dataset| dataset.key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create the dataset if it does not exist. Calling it again returns the
    /// same dataset untouched.
    pub fn upsert_dataset(&mut self, key: &DatasetKey) -> Result<&Dataset, ModelError> {
        if !self.pools.contains_key(&key.pool) {
            return Err(ModelError::PoolNotFound(key.pool.clone()));
        }

        let exists = self.has_dataset(key);
        let revision = if exists { 0 } else { self.tick() };

        let pool = self
            .pools
            .get_mut(&key.pool)
            .ok_or_else(|| ModelError::PoolNotFound(key.pool.clone()))?;
        let dataset = pool.datasets.entry(key.path.clone()).or_insert_with(|| {
            let mut dataset = Dataset::new(key.clone());
            dataset.revision = revision;
            dataset
        });

        Ok(dataset)
    }

    /// Remove a dataset together with its bindings.
    pub fn remove_dataset(&mut self, key: &DatasetKey) -> Option<Dataset> {
        let removed = self.pools.get_mut(&key.pool)?.datasets.remove(&key.path);
        if removed.is_some() {
            self.tick();
        }
        removed
    }

    fn dataset_mut(&mut self, key: &DatasetKey) -> Result<&mut Dataset, ModelError> {
        self.pools
            .get_mut(&key.pool)
            .ok_or_else(|| ModelError::PoolNotFound(key.pool.clone()))?
            .datasets
            .get_mut(&key.path)
            .ok_or_else(|| ModelError::DatasetNotFound(key.clone()))
    }

    /// Insert or replace the binding with the same export name on `dataset`.
    pub fn apply_binding(
        &mut self,
        dataset: &DatasetKey,
        binding: ExportBinding,
    ) -> Result<BindingChange, ModelError> {
        if &binding.dataset != dataset {
            return Err(ModelError::MismatchedBinding {
                dataset: dataset.clone(),
                target: binding.dataset,
                export: binding.name,
            });
        }

        let change = match self.dataset_mut(dataset)?.bindings.get(&binding.name) {
            None => BindingChange::Created,
            Some(current) => {
                let changes = current.options.diff(&binding.options);
                if changes.is_empty() {
                    BindingChange::Unchanged
                } else {
                    BindingChange::Updated(changes)
                }
            }
        };

        let revision = self.tick();
        let entry = self.dataset_mut(dataset)?;
        entry.revision = revision;
        entry.bindings.insert(binding.name.clone(), binding);

        Ok(change)
    }

    /// Remove a binding. `Ok(None)` means there was nothing to remove.
    pub fn remove_binding(
        &mut self,
        dataset: &DatasetKey,
        export_name: &str,
    ) -> Result<Option<ExportBinding>, ModelError> {
        let removed = self.dataset_mut(dataset)?.bindings.remove(export_name);
        if removed.is_some() {
            let revision = self.tick();
            self.dataset_mut(dataset)?.revision = revision;
        }
        Ok(removed)
    }
}

/// Model shared between the engine, supervisor and service surface.
///
/// Guards are never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedModel {
    inner: Arc<RwLock<PoolModel>>,
}

impl SharedModel {
    pub fn new(model: PoolModel) -> Self {
        Self {
            inner: Arc::new(RwLock::new(model)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PoolModel> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PoolModel> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in a whole new model, returning the previous one.
    pub fn replace(&self, model: PoolModel) -> PoolModel {
        std::mem::replace(&mut *self.write(), model)
    }

    pub fn snapshot(&self) -> PoolModel {
        self.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zshare_types::{AccessMode, DeclaredShare, ExportOptions};

    fn key() -> DatasetKey {
        DatasetKey::new("tank", "media")
    }

    fn model_with_dataset() -> PoolModel {
        let mut model = PoolModel::new();
        model.insert_pool("tank", PoolHealth::Online);
        model.upsert_dataset(&key()).unwrap();
        model
    }

    #[test]
    fn upsert_dataset_is_idempotent() {
        let mut model = model_with_dataset();
        let first = model.dataset(&key()).cloned().unwrap();
        let second = model.upsert_dataset(&key()).unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(model.dataset_keys(), vec![key()]);
    }

    #[test]
    fn upsert_dataset_requires_the_pool() {
        let mut model = PoolModel::new();
        assert_eq!(
            model.upsert_dataset(&key()).unwrap_err(),
            ModelError::PoolNotFound("tank".to_string())
        );
    }

    #[test]
    fn binding_names_are_unique_per_dataset() {
        let mut model = model_with_dataset();
        let binding = ExportBinding::new(key(), "media", ExportOptions::default());

        assert_eq!(
            model.apply_binding(&key(), binding.clone()).unwrap(),
            BindingChange::Created
        );
        assert_eq!(
            model.apply_binding(&key(), binding.clone()).unwrap(),
            BindingChange::Unchanged
        );

        let mut readonly = binding;
        readonly.options.access = AccessMode::ReadOnly;
        let change = model.apply_binding(&key(), readonly).unwrap();
        match change {
            BindingChange::Updated(changes) => assert_eq!(changes[0].field, "access"),
            other => panic!("expected update, got {other:?}"),
        }

        assert_eq!(model.dataset(&key()).unwrap().bindings.len(), 1);
    }

    #[test]
    fn revisions_increase_with_every_dataset_mutation() {
        let mut model = model_with_dataset();
        let created = model.dataset(&key()).unwrap().revision;

        model
            .apply_binding(&key(), ExportBinding::new(key(), "a", ExportOptions::default()))
            .unwrap();
        let bound = model.dataset(&key()).unwrap().revision;
        model.remove_binding(&key(), "a").unwrap();
        let unbound = model.dataset(&key()).unwrap().revision;

        assert!(created < bound);
        assert!(bound < unbound);
    }

    #[test]
    fn removing_an_absent_binding_is_not_an_error() {
        let mut model = model_with_dataset();
        assert_eq!(model.remove_binding(&key(), "missing").unwrap(), None);
    }

    #[test]
    fn binding_must_target_its_dataset() {
        let mut model = model_with_dataset();
        let stray = ExportBinding::new(DatasetKey::new("tank", "other"), "x", Default::default());
        assert!(matches!(
            model.apply_binding(&key(), stray),
            Err(ModelError::MismatchedBinding { .. })
        ));
    }

    #[test]
    fn declared_config_populates_every_layer() {
        let config = DeclaredConfig {
            service_enabled: false,
            shares: vec![DeclaredShare {
                dataset: key(),
                export: "media".to_string(),
                options: ExportOptions::for_client("10.0.0.0/24"),
            }],
            ..Default::default()
        };

        let model = PoolModel::from_declared(&config);
        assert!(!model.service_enabled());
        assert!(model.get("tank").is_some());
        assert_eq!(
            model
                .dataset(&key())
                .and_then(|dataset| dataset.binding("media"))
                .map(|binding| binding.options.client.as_str()),
            Some("10.0.0.0/24")
        );
    }

    #[test]
    fn removing_a_pool_drops_its_datasets() {
        let mut model = model_with_dataset();
        assert!(model.remove_pool("tank").is_some());
        assert!(model.dataset(&key()).is_none());
        assert!(model.remove_pool("tank").is_none());
    }
}
