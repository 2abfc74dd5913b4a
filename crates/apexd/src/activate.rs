// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! The activation controller: mounts packages under the apex root,
//! maintains the latest view per package name, and tears the stack
//! down again on deactivation.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::apex_file::ApexFile;
use crate::config::Config;
use crate::database::{MountedApexData, MountedApexDatabase};
use crate::hooks::{ForkHookExecutor, InstallHookExecutor};
use crate::manifest::ApexManifest;
use crate::{loopdev, mount, util, Error, Result};

#[cfg(test)]
#[path = "./activate_test.rs"]
mod activate_test;

/// Identity of one active package, as reported to other processes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApexInfo {
    pub name: String,
    pub version: u64,
    pub path: PathBuf,
}

/// The daemon's shared state: configuration, the mounted-apex
/// registry, and the hook executor seam.
///
/// Every mutating flow serializes on one operation lock; the worker
/// pool may call read-only queries concurrently.
pub struct Apexd {
    config: Arc<Config>,
    db: MountedApexDatabase,
    hooks: Box<dyn InstallHookExecutor>,
    op_lock: Mutex<()>,
}

impl Apexd {
    pub fn new(config: Arc<Config>) -> Self {
        let hooks = Box::new(ForkHookExecutor::new(config.paths.apex_root.clone()));
        Self::with_hook_executor(config, hooks)
    }

    pub fn with_hook_executor(config: Arc<Config>, hooks: Box<dyn InstallHookExecutor>) -> Self {
        Self {
            config,
            db: MountedApexDatabase::default(),
            hooks,
            op_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn database(&self) -> &MountedApexDatabase {
        &self.db
    }

    pub(crate) fn hook_executor(&self) -> &dyn InstallHookExecutor {
        &*self.hooks
    }

    pub(crate) fn serialize_mutations(&self) -> std::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().expect("operation lock poisoned")
    }

    /// The versioned mount point, `<apex_root>/<name>@<version>`.
    pub fn package_mount_point(&self, manifest: &ApexManifest) -> PathBuf {
        self.config.paths.apex_root.join(manifest.package_id())
    }

    /// The latest view, `<apex_root>/<name>`.
    pub fn active_mount_point(&self, manifest: &ApexManifest) -> PathBuf {
        self.config.paths.apex_root.join(&manifest.name)
    }

    /// Activate the package image at the given path.
    ///
    /// The image is mounted under its versioned mount point and, when
    /// it is the highest version mounted for its name, published as
    /// the latest view.
    pub fn activate_package<P: AsRef<Path>>(&self, full_path: P) -> Result<()> {
        let full_path = full_path.as_ref();
        let _guard = self.serialize_mutations();
        tracing::info!(package = ?full_path, "trying to activate");

        let apex = ApexFile::open(full_path)?;
        let manifest = apex.manifest().clone();
        let new_version = manifest.version;

        let mut is_newest_version = true;
        let mut version_found_mounted = false;
        let mut version_found_active = false;
        self.db.for_each(&manifest.name, |data, latest| {
            let other = match ApexFile::open(&data.full_path) {
                Ok(other) => other,
                Err(err) => {
                    tracing::warn!(path = %data.full_path, ?err, "could not inspect mounted instance");
                    return;
                }
            };
            let other_version = other.manifest().version;
            if other_version == new_version {
                version_found_mounted = true;
                version_found_active = latest;
            }
            if other_version > new_version {
                is_newest_version = false;
            }
        });
        if version_found_active {
            return Err(Error::InvariantViolation(format!(
                "Package {} is already active",
                manifest.package_id()
            )));
        }

        let mount_point = self.package_mount_point(&manifest);
        if !version_found_mounted {
            let data = mount::mount_package(&self.config, &apex, &mount_point)?;
            self.db.add_mounted_apex(&manifest.name, false, data)?;
        }

        if is_newest_version {
            let active = self.active_mount_point(&manifest);
            match mount::bind_mount(&mount_point, &active) {
                Ok(()) => {
                    self.db
                        .set_latest(&manifest.name, &full_path.display().to_string())?;
                }
                Err(err) => {
                    // the versioned mount is still serviceable
                    tracing::error!(?err, "failed to update the latest view");
                }
            }
        }
        Ok(())
    }

    /// Deactivate the package image at the given path, tearing down
    /// its latest view, its versioned mount, and its loop device.
    pub fn deactivate_package<P: AsRef<Path>>(&self, full_path: P) -> Result<()> {
        let full_path = full_path.as_ref();
        let _guard = self.serialize_mutations();
        tracing::info!(package = ?full_path, "trying to deactivate");

        let apex = ApexFile::open(full_path)?;
        let manifest = apex.manifest();
        let full_path_str = full_path.display().to_string();

        let Some((data, _latest)) = self.db.find(&manifest.name, &full_path_str) else {
            return Err(Error::InvariantViolation(format!(
                "Did not find {}",
                full_path.display()
            )));
        };

        // the latest view goes first so no moment exists where it
        // points at an unmounted directory
        let active = self.active_mount_point(manifest);
        tracing::debug!(mount_point = ?active, "unmounting and deleting");
        if let Err(err) = mount::detach_mount(&active) {
            tracing::warn!(?err, "failed to unmount the latest view");
        } else if let Err(err) = std::fs::remove_dir(&active) {
            tracing::warn!(mount_point = ?active, ?err, "could not rmdir");
        }

        let mount_point = self.package_mount_point(manifest);
        tracing::debug!(?mount_point, "unmounting and deleting");
        let mut unmount_error = None;
        if let Err(err) = mount::detach_mount(&mount_point) {
            unmount_error = Some(err);
        } else if let Err(err) = std::fs::remove_dir(&mount_point) {
            // a retained directory would make the active-package
            // queries lie, report it
            unmount_error = Some(Error::wrap_io(
                err,
                format!("Failed to rmdir {}", mount_point.display()),
            ));
        }

        // remove the record even when the unmount failed: keeping it
        // would falsely advertise the package as active
        self.db.remove_mounted_apex(&manifest.name, &full_path_str);
        // TODO: repoint the latest view at the next-highest mounted
        // version instead of leaving the name without one
        if !data.loop_name.is_empty() {
            if let Err(err) = loopdev::destroy_loop(&data.loop_name) {
                tracing::warn!(device = %data.loop_name, ?err, "failed to free loop device");
            }
        }

        match unmount_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Unmount a non-latest instance of a package without touching the
    /// latest view.
    pub fn unmount_package<P: AsRef<Path>>(&self, full_path: P) -> Result<()> {
        let full_path = full_path.as_ref();
        let _guard = self.serialize_mutations();
        let apex = ApexFile::open(full_path)?;
        let manifest = apex.manifest();
        tracing::debug!(package = %manifest.package_id(), "unmounting");

        let full_path_str = full_path.display().to_string();
        let Some((data, latest)) = self.db.find(&manifest.name, &full_path_str) else {
            return Err(Error::InvariantViolation(format!(
                "Did not find {}",
                full_path.display()
            )));
        };
        if latest {
            return Err(Error::InvariantViolation(format!(
                "Package {} is active",
                full_path.display()
            )));
        }

        let mount_point = self.package_mount_point(manifest);
        mount::detach_mount(&mount_point)?;
        self.db.remove_mounted_apex(&manifest.name, &full_path_str);
        if let Err(err) = std::fs::remove_dir(&mount_point) {
            tracing::error!(?mount_point, ?err, "failed to rmdir");
        }
        if !data.loop_name.is_empty() {
            tracing::debug!(device = %data.loop_name, "freeing loop device for unmount");
            loopdev::destroy_loop(&data.loop_name)?;
        }
        Ok(())
    }

    /// List one entry per latest-flagged registry record.
    pub fn get_active_packages(&self) -> Vec<ApexInfo> {
        let mut active = Vec::new();
        self.db.for_each_all(|_, data, latest| {
            if !latest {
                return;
            }
            match ApexFile::open(&data.full_path) {
                Ok(apex) => active.push(ApexInfo {
                    name: apex.manifest().name.clone(),
                    version: apex.manifest().version,
                    path: apex.path().to_path_buf(),
                }),
                Err(err) => {
                    tracing::warn!(path = %data.full_path, ?err, "could not read active package")
                }
            }
        });
        active
    }

    /// Find the active package with the given name, if any.
    pub fn get_active_package(&self, name: &str) -> Result<ApexInfo> {
        self.get_active_packages()
            .into_iter()
            .find(|info| info.name == name)
            .ok_or_else(|| Error::String(format!("Cannot find matching package for: {name}")))
    }

    /// Activate everything that looks like a package in the given
    /// directory. Failures are logged per package and do not stop the
    /// scan.
    pub fn scan_packages_dir_and_activate<P: AsRef<Path>>(&self, dir: P) {
        let dir = dir.as_ref();
        tracing::info!(?dir, "scanning for packages");
        // flattened directory packages only make sense on the system partition
        let include_dirs = dir.starts_with(&self.config.paths.system_dir);
        let found = match util::find_apex_files(dir, include_dirs) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(?err, "package scan failed");
                return;
            }
        };
        for path in found {
            tracing::info!(package = ?path, "found");
            if let Err(err) = self.activate_package(&path) {
                tracing::error!(package = ?path, "{err}");
            }
        }
    }
}
