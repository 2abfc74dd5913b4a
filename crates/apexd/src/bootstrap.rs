// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Start-of-day sequence: tear down whatever a previous boot left
//! behind, then bring every known package up.
use crate::activate::Apexd;
use crate::status::{self, DaemonStatus};
use crate::{loopdev, mount, util, Result};

#[cfg(test)]
#[path = "./bootstrap_test.rs"]
mod bootstrap_test;

/// Detach every mount under the apex root and free every tagged loop
/// device left over from a previous boot.
///
/// Directories are processed in ascending name order so that a
/// package's latest view (`<name>`) is detached before its versioned
/// mount (`<name>@<version>`).
pub fn unmount_and_detach_existing_images(apexd: &Apexd) {
    let apex_root = &apexd.config().paths.apex_root;
    tracing::info!(?apex_root, "scanning for packages already mounted");
    let mut folders = match util::list_dirs(apex_root) {
        Ok(folders) => folders,
        Err(err) => {
            tracing::error!(?err, "could not scan the apex root");
            return;
        }
    };
    folders.sort();

    for full_path in folders {
        tracing::info!(mount = ?full_path, "unmounting");
        if let Err(err) = mount::detach_mount(&full_path) {
            tracing::error!(mount = ?full_path, ?err, "failed to unmount");
        }
        // a retained directory would shadow this boot's mounts
        if let Err(err) = std::fs::remove_dir(&full_path) {
            tracing::error!(dir = ?full_path, ?err, "failed to rmdir");
        }
    }

    if let Err(err) = loopdev::destroy_all(apexd.config()) {
        tracing::error!(?err, "failed to tear down stale loop devices");
    }
}

/// Run the full boot sequence: publish `starting`, tear down stale
/// state, activate system and data packages, stage pending sessions,
/// then publish `ready`.
pub fn run(apexd: &Apexd) -> Result<()> {
    status::publish(apexd.config(), DaemonStatus::Starting);

    unmount_and_detach_existing_images(apexd);

    apexd.scan_packages_dir_and_activate(apexd.config().paths.system_dir.clone());
    apexd.scan_packages_dir_and_activate(apexd.config().paths.active_dir.clone());

    apexd.scan_staged_sessions_and_stage();

    status::publish(apexd.config(), DaemonStatus::Ready);
    Ok(())
}
