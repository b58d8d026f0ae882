// SPDX-License-Identifier: GPL-3.0-only

pub mod backend;
pub mod config_store;

pub use backend::BackendAdapter;
pub use config_store::ConfigStore;
