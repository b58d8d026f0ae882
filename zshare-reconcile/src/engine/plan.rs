// SPDX-License-Identifier: GPL-3.0-only

//! Diffing desired dataset state against what was last applied to the backend.

use std::collections::{BTreeMap, BTreeSet};

use zshare_types::{
    ActualState, DatasetKey, DriftReport, ExportBinding, ExportOptions, ExportRef,
};

use crate::model::PoolModel;

/// What the model wants for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Desired {
    pub exists: bool,
    pub exports: BTreeMap<String, ExportBinding>,
}

impl Desired {
    /// Desired state of `key`. With the service disabled no export is desired,
    /// but bindings stay in the model.
    pub fn from_model(model: &PoolModel, key: &DatasetKey) -> Self {
        match model.dataset(key) {
            Some(dataset) => Self {
                exists: true,
                exports: if model.service_enabled() {
                    dataset.bindings.clone()
                } else {
                    BTreeMap::new()
                },
            },
            None => Self::default(),
        }
    }
}

/// What the engine last successfully applied for one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub exists: bool,
    pub exports: BTreeMap<String, ExportOptions>,
}

impl Applied {
    pub fn from_actual(actual: &ActualState, key: &DatasetKey) -> Self {
        Self {
            exists: actual.datasets.contains(key),
            exports: actual.exports_of(key),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.exists && self.exports.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDataset,
    Unbind(String),
    Bind(ExportBinding),
    DestroyDataset,
}

impl Action {
    pub fn describe(&self) -> String {
        match self {
            Self::CreateDataset => "create dataset".to_string(),
            Self::Unbind(name) => format!("unbind export {name}"),
            Self::Bind(binding) => format!("bind export {}", binding.name),
            Self::DestroyDataset => "destroy dataset".to_string(),
        }
    }
}

/// Backend calls that take `applied` to `desired`.
///
/// The dataset is created before anything is bound to it and destroyed only
/// after every export on it has been withdrawn.
pub fn plan(desired: &Desired, applied: &Applied) -> Vec<Action> {
    let mut actions = Vec::new();

    if desired.exists && !applied.exists {
        actions.push(Action::CreateDataset);
    }

    for name in applied.exports.keys() {
        if !desired.exports.contains_key(name) {
            actions.push(Action::Unbind(name.clone()));
        }
    }

    for (name, binding) in &desired.exports {
        if applied.exports.get(name) != Some(&binding.options) {
            actions.push(Action::Bind(binding.clone()));
        }
    }

    if !desired.exists && applied.exists {
        actions.push(Action::DestroyDataset);
    }

    actions
}

/// Compare the model against the backend.
///
/// Only pools the model manages are inspected and pool root datasets are never
/// reported as orphans.
pub fn drift(model: &PoolModel, actual: &ActualState) -> DriftReport {
    let desired_keys: BTreeSet<DatasetKey> = model.dataset_keys().into_iter().collect();
    let managed = |key: &DatasetKey| model.get(&key.pool).is_some();

    let mut report = DriftReport::default();

    for key in &desired_keys {
        if !actual.datasets.contains(key) {
            report.missing_datasets.push(key.clone());
        }
    }
    for key in &actual.datasets {
        if managed(key) && !key.is_pool_root() && !desired_keys.contains(key) {
            report.orphaned_datasets.push(key.clone());
        }
    }

    for key in &desired_keys {
        let desired = Desired::from_model(model, key);
        let present = actual.exports_of(key);

        for (name, binding) in &desired.exports {
            let export = ExportRef {
                dataset: key.clone(),
                export: name.clone(),
            };
            match present.get(name) {
                None => report.missing_exports.push(export),
                Some(options) if options != &binding.options => {
                    report.mismatched_exports.push(export)
                }
                Some(_) => {}
            }
        }
    }

    for export in &actual.exports {
        let desired = desired_keys.contains(&export.dataset)
            && Desired::from_model(model, &export.dataset)
                .exports
                .contains_key(&export.name);
        if managed(&export.dataset) && !desired {
            report.orphaned_exports.push(ExportRef {
                dataset: export.dataset.clone(),
                export: export.name.clone(),
            });
        }
    }

    report
}
