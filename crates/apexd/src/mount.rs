// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! The mount engine: composes loop attachment, verity interposition
//! and the ext4 mount for package images, or a bind mount for
//! flattened packages.
use std::path::Path;

use nix::mount::{MntFlags, MsFlags};

use crate::apex_file::ApexFile;
use crate::config::Config;
use crate::database::MountedApexData;
use crate::{loopdev, verity, Error, Result};

#[cfg(test)]
#[path = "./mount_test.rs"]
mod mount_test;

const NONE: Option<&str> = None;

/// Mode for freshly created mount point directories.
pub const MKDIR_MODE: u32 = 0o755;

const LOOP_SETUP_ATTEMPTS: usize = 3;
const MOUNT_ATTEMPTS: usize = 5;
const MOUNT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// How a package gets attached to its mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Bind mount of a directory-layout package.
    Flattened,
    /// Loop-backed ext4 mount; the enclosing partition already
    /// provides block-level integrity.
    LoopOnly,
    /// Loop-backed ext4 mount through a dm-verity interposer.
    LoopWithVerity,
}

/// Decide the mount strategy for a package at its current location.
pub fn strategy_for(config: &Config, apex: &ApexFile) -> MountKind {
    if apex.is_flattened() {
        return MountKind::Flattened;
    }
    // images inside the system partition are covered by the partition's
    // own verity device, unless explicitly overridden
    let on_system = apex.path().starts_with(&config.paths.system_dir);
    if on_system && !config.verity_on_system {
        MountKind::LoopOnly
    } else {
        MountKind::LoopWithVerity
    }
}

/// Mount the given package at `mount_point`, creating the directory.
///
/// On success the kernel mount owns every intermediate resource and a
/// registry record describing the mount is returned. On failure the
/// mount point and any loop or verity device created by this call are
/// gone again.
pub fn mount_package(config: &Config, apex: &ApexFile, mount_point: &Path) -> Result<MountedApexData> {
    tracing::debug!(?mount_point, "creating mount point");
    crate::util::create_dir_if_needed(mount_point, MKDIR_MODE)
        .map_err(|err| err.wrap(format!("Could not create mount point {}", mount_point.display())))?;

    let result = match strategy_for(config, apex) {
        MountKind::Flattened => mount_flattened(config, apex, mount_point),
        kind => mount_image(config, apex, mount_point, kind),
    };
    if result.is_err() {
        if let Err(err) = std::fs::remove_dir(mount_point) {
            tracing::warn!(?mount_point, ?err, "could not remove mount point");
        }
    }
    result
}

fn mount_flattened(config: &Config, apex: &ApexFile, mount_point: &Path) -> Result<MountedApexData> {
    if !apex.path().starts_with(&config.paths.system_dir) {
        return Err(Error::String(format!(
            "Cannot activate flattened package {}",
            apex.path().display()
        )));
    }
    nix::mount::mount(Some(apex.path()), mount_point, NONE, MsFlags::MS_BIND, NONE).map_err(
        |err| {
            Error::wrap_nix(
                err,
                format!("Mounting failed for flattened package {}", apex.path().display()),
            )
        },
    )?;
    tracing::info!(package = ?apex.path(), ?mount_point, "bind mounted flattened package");
    // no loop device behind a flattened mount
    Ok(MountedApexData::new("", apex.path().display().to_string()))
}

fn mount_image(
    config: &Config,
    apex: &ApexFile,
    mount_point: &Path,
    kind: MountKind,
) -> Result<MountedApexData> {
    let full_path = apex.path().display().to_string();

    let mut loopback = None;
    for attempt in 1..=LOOP_SETUP_ATTEMPTS {
        match loopdev::create_loop(config, apex.path(), apex.image_offset(), apex.image_size()) {
            Ok(device) => {
                loopback = Some(device);
                break;
            }
            Err(err) if attempt < LOOP_SETUP_ATTEMPTS => {
                tracing::debug!(?err, attempt, "loop device setup failed, retrying");
            }
            Err(err) => {
                return Err(err.wrap(format!("Could not create loop device for {full_path}")))
            }
        }
    }
    let loopback = loopback.expect("loop device was just created");
    tracing::debug!(device = %loopback.name(), "loopback device created");

    // signature verification always runs, even when the mount will not
    // go through a verity target
    let verity_data = apex
        .verify_apex_verity(&config.paths.key_dirs)
        .map_err(|err| err.wrap(format!("Failed to verify verity data for {full_path}")))?;

    let mut verity_dev = None;
    let mut block_device = loopback.name().to_string();
    if let MountKind::LoopWithVerity = kind {
        let table = verity::VerityTable::new(&verity_data, loopback.name());
        let device = verity::create_verity(config, &apex.package_id(), &table)
            .map_err(|err| err.wrap(format!("Failed to create verity device for {full_path}")))?;
        block_device = device.dev_path().display().to_string();
        loopdev::configure_read_ahead(config, device.dev_path())?;
        verity_dev = Some(device);
    }

    let data = MountedApexData::new(loopback.name(), full_path.clone());
    for attempt in 1..=MOUNT_ATTEMPTS {
        match nix::mount::mount(
            Some(block_device.as_str()),
            mount_point,
            Some("ext4"),
            MsFlags::MS_NOATIME | MsFlags::MS_NODEV | MsFlags::MS_DIRSYNC | MsFlags::MS_RDONLY,
            NONE,
        ) {
            Ok(()) => {
                tracing::info!(package = %full_path, ?mount_point, "mounted package");
                // the mount now pins both devices
                if let Some(device) = verity_dev.take() {
                    device.release();
                }
                loopback.release();
                return Ok(data);
            }
            Err(err) => {
                // The device node is created by the userspace uevent
                // handler some time after the kernel object exists, so
                // the first attempts can race it.
                tracing::debug!(?err, attempt, device = %block_device, "mount attempt failed");
                std::thread::sleep(MOUNT_RETRY_DELAY);
            }
        }
    }
    Err(Error::ResourceBusy(format!(
        "Mounting failed for package {full_path}"
    )))
}

/// Bind `source` onto `target`, creating `target` if needed.
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    crate::util::create_dir_if_needed(target, MKDIR_MODE)?;
    nix::mount::mount(Some(source), target, NONE, MsFlags::MS_BIND, NONE).map_err(|err| {
        Error::wrap_nix(
            err,
            format!("Failed to bind {} onto {}", source.display(), target.display()),
        )
    })
}

/// Lazily detach whatever is mounted at the given path.
///
/// Paths that are not mounted (EINVAL) or do not exist (ENOENT) are
/// not an error.
pub fn detach_mount(target: &Path) -> Result<()> {
    match nix::mount::umount2(target, MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(err) => Err(Error::wrap_nix(
            err,
            format!("Failed to unmount {}", target.display()),
        )),
    }
}
