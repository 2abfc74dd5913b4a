// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! The in-memory registry of mounted package instances.
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./database_test.rs"]
mod database_test;

/// One mounted package instance.
///
/// `loop_name` is empty for flattened packages, which are bind-mounted
/// directly and own no loop device.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MountedApexData {
    pub loop_name: String,
    pub full_path: String,
}

impl MountedApexData {
    pub fn new<L: Into<String>, P: Into<String>>(loop_name: L, full_path: P) -> Self {
        Self {
            loop_name: loop_name.into(),
            full_path: full_path.into(),
        }
    }
}

/// Registry of mounted packages keyed by package name.
///
/// Holds an ordered set of mounted instances per name, with at most
/// one instance per name flagged as the latest. Mutation goes through
/// an internal lock so read-only iteration is always safe against
/// concurrent callers.
#[derive(Debug, Default)]
pub struct MountedApexDatabase {
    inner: Mutex<HashMap<String, BTreeMap<MountedApexData, bool>>>,
}

impl MountedApexDatabase {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<MountedApexData, bool>>> {
        // a poisoned registry lock means a panic while mutating shared
        // mount state, nothing sensible can continue from there
        self.inner.lock().expect("mounted apex registry poisoned")
    }

    /// Record a freshly mounted instance.
    ///
    /// Rejects a second record with the same backing file path.
    pub fn add_mounted_apex<S: Into<String>>(
        &self,
        package: S,
        latest: bool,
        data: MountedApexData,
    ) -> Result<()> {
        let package = package.into();
        let mut inner = self.lock();
        let entries = inner.entry(package.clone()).or_default();
        if entries.keys().any(|d| d.full_path == data.full_path) {
            return Err(Error::InvariantViolation(format!(
                "{} is already mounted for package {package}",
                data.full_path
            )));
        }
        if latest {
            for flag in entries.values_mut() {
                *flag = false;
            }
        }
        entries.insert(data, latest);
        Ok(())
    }

    /// Flag the record backed by `full_path` as the latest for its
    /// package, clearing any previous latest.
    pub fn set_latest(&self, package: &str, full_path: &str) -> Result<()> {
        let mut inner = self.lock();
        let entries = inner.get_mut(package).ok_or_else(|| {
            Error::InvariantViolation(format!("no mounted instances of package {package}"))
        })?;
        if !entries.keys().any(|d| d.full_path == full_path) {
            return Err(Error::InvariantViolation(format!(
                "{full_path} is not a mounted instance of package {package}"
            )));
        }
        for (data, flag) in entries.iter_mut() {
            *flag = data.full_path == full_path;
        }
        Ok(())
    }

    /// Remove the record backed by `full_path`, if present.
    ///
    /// If the record was the latest, its package has no latest
    /// instance afterwards.
    pub fn remove_mounted_apex(&self, package: &str, full_path: &str) {
        let mut inner = self.lock();
        if let Some(entries) = inner.get_mut(package) {
            entries.retain(|data, _| data.full_path != full_path);
            if entries.is_empty() {
                inner.remove(package);
            }
        }
    }

    /// Visit every mounted instance of one package.
    pub fn for_each<F>(&self, package: &str, mut f: F)
    where
        F: FnMut(&MountedApexData, bool),
    {
        let inner = self.lock();
        if let Some(entries) = inner.get(package) {
            for (data, latest) in entries.iter() {
                f(data, *latest);
            }
        }
    }

    /// Visit every mounted instance of every package.
    pub fn for_each_all<F>(&self, mut f: F)
    where
        F: FnMut(&str, &MountedApexData, bool),
    {
        let inner = self.lock();
        for (package, entries) in inner.iter() {
            for (data, latest) in entries.iter() {
                f(package, data, *latest);
            }
        }
    }

    /// Find the record for the given package and backing file path.
    pub fn find(&self, package: &str, full_path: &str) -> Option<(MountedApexData, bool)> {
        let inner = self.lock();
        inner.get(package).and_then(|entries| {
            entries
                .iter()
                .find(|(data, _)| data.full_path == full_path)
                .map(|(data, latest)| (data.clone(), *latest))
        })
    }
}
