// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Shared filesystem helpers used across the daemon.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./util_test.rs"]
mod util_test;

/// The filename suffix identifying a package image.
pub const APEX_PACKAGE_SUFFIX: &str = ".apex";

/// Recursively create dirname and all of its parent directories.
///
/// This is similar to std::fs::create_dir_all except that it uses
/// the given permissions for all newly created directories.
pub fn makedirs_with_perms<P: AsRef<Path>>(dirname: P, perms: u32) -> Result<()> {
    let dirname = dirname.as_ref();
    let perms = std::fs::Permissions::from_mode(perms);
    let mut path = PathBuf::from("/");
    for component in dirname.components() {
        path = match component {
            std::path::Component::Normal(component) => path.join(component),
            std::path::Component::ParentDir => path
                .parent()
                .ok_or_else(|| {
                    Error::String(
                        "cannot traverse below root, too many '..' references".to_string(),
                    )
                })?
                .to_path_buf(),
            _ => continue,
        };
        // even though checking existence first is not
        // needed, it is required to trigger the automounter
        // in cases when the desired path is in that location
        match std::fs::symlink_metadata(&path) {
            Ok(_) => {}
            Err(_) => {
                if let Err(err) = std::fs::create_dir(&path) {
                    match err.kind() {
                        std::io::ErrorKind::AlreadyExists => (),
                        _ => return Err(err.into()),
                    }
                }
                // not fatal, so it's worth allowing things to continue
                // even though it could cause permission issues later on
                let _ = std::fs::set_permissions(&path, perms.clone());
            }
        }
    }
    Ok(())
}

/// Ensure that the given directory exists with the given permissions.
///
/// Unlike [`makedirs_with_perms`] this enforces the mode even when the
/// directory already exists, because mkdir applies the process umask.
pub fn create_dir_if_needed<P: AsRef<Path>>(path: P, mode: u32) -> Result<()> {
    let path = path.as_ref();
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => (),
        Ok(_) => {
            return Err(Error::String(format!(
                "{} exists and is not a directory",
                path.display()
            )))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir(path)
                .map_err(|err| Error::wrap_io(err, format!("Could not mkdir {}", path.display())))?;
        }
        Err(err) => {
            return Err(Error::wrap_io(
                err,
                format!("Could not stat {}", path.display()),
            ))
        }
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| Error::wrap_io(err, format!("Could not chmod {}", path.display())))?;
    Ok(())
}

/// List the package files in the given directory, optionally
/// including flattened package directories.
pub fn find_apex_files<P: AsRef<Path>>(path: P, include_dirs: bool) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let read_dir = std::fs::read_dir(path)
        .map_err(|err| Error::wrap_io(err, format!("Can't open {} for reading", path.display())))?;

    let mut found = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        let is_apex = file_type.is_file()
            && name
                .to_str()
                .map(|n| n.ends_with(APEX_PACKAGE_SUFFIX))
                .unwrap_or(false);
        if is_apex || (file_type.is_dir() && include_dirs) {
            found.push(entry.path());
        }
    }
    Ok(found)
}

/// List the subdirectories of the given directory.
pub fn list_dirs<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in walkdir::WalkDir::new(path.as_ref()).min_depth(1).max_depth(1) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}
