// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

lazy_static! {
    static ref CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);
}

/// Well-known filesystem locations used by the daemon.
///
/// These are fixed on a production system but configurable so that
/// tests can redirect the whole package tree into a temporary root.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Paths {
    /// Root under which package images are mounted.
    pub apex_root: PathBuf,
    /// Read-only, pre-baked packages shipped with the system image.
    pub system_dir: PathBuf,
    /// Installed active packages.
    pub active_dir: PathBuf,
    /// Per-session staging directories.
    pub sessions_dir: PathBuf,
    /// Directories holding trusted public keys, one file per package name.
    pub key_dirs: Vec<PathBuf>,
    /// Key/value file used to publish daemon lifecycle status.
    pub status_file: PathBuf,
    /// The loop control device used to allocate free loop devices.
    pub loop_control: PathBuf,
    /// Directory containing the loop device nodes.
    pub loop_dir: PathBuf,
    /// The device-mapper control device.
    pub dm_control: PathBuf,
    /// Directory containing device-mapper block device nodes.
    pub dm_dev_dir: PathBuf,
    /// Sysfs root for block device queue tuning.
    pub sysfs_block_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            apex_root: PathBuf::from("/apex"),
            system_dir: PathBuf::from("/system/apex"),
            active_dir: PathBuf::from("/data/apex/active"),
            sessions_dir: PathBuf::from("/data/apex/sessions"),
            key_dirs: vec![
                PathBuf::from("/system/etc/security/apex"),
                PathBuf::from("/product/etc/security/apex"),
            ],
            status_file: PathBuf::from("/dev/apexd.status"),
            loop_control: PathBuf::from("/dev/loop-control"),
            loop_dir: PathBuf::from("/dev/block"),
            dm_control: PathBuf::from("/dev/mapper/control"),
            dm_dev_dir: PathBuf::from("/dev/block"),
            sysfs_block_dir: PathBuf::from("/sys/block"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub paths: Paths,
    /// Force dm-verity even for packages that live under the
    /// verity-protected system partition.
    pub verity_on_system: bool,
    /// Debug builds unlock the direct activate/deactivate surface.
    pub debug: bool,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
        })?;

        Ok(lock.insert(Arc::new(self)).clone())
    }
}

pub fn get_config() -> Result<Arc<Config>> {
    let lock = CONFIG.read().map_err(|err| {
        crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
    })?;
    if let Some(config) = &*lock {
        return Ok(config.clone());
    }
    drop(lock);

    // there is still a possible race condition here
    // where someone loads the config between the first check and
    // acquiring this lock, but the redundant work is still
    // less than not having a cache at all
    let config = load_config()?;
    config.make_current()
}

/// Load the daemon configuration from disk, even if it's already been loaded.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, Environment, File};

    let config = RawConfig::builder()
        .add_source(File::with_name("/etc/apexd").required(false))
        .add_source(Environment::with_prefix("APEXD").separator("_"))
        .build()?;

    Ok(Config::deserialize(config)?)
}
