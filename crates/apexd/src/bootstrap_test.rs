// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::sync::Arc;

use rstest::rstest;

use super::{run, unmount_and_detach_existing_images};
use crate::activate::Apexd;
use crate::status::{get_property, STATUS_PROPERTY};

fixtures!();

#[rstest]
fn test_stale_mount_points_are_removed(tmpdir: tempdir::TempDir) {
    let config = test_config(tmpdir.path());
    let apexd = Apexd::new(Arc::new(config.clone()));

    // leftovers of a previous boot: the latest view and the
    // versioned mount point
    std::fs::create_dir(config.paths.apex_root.join("com.foo")).unwrap();
    std::fs::create_dir(config.paths.apex_root.join("com.foo@1")).unwrap();

    unmount_and_detach_existing_images(&apexd);

    assert!(!config.paths.apex_root.join("com.foo").exists());
    assert!(!config.paths.apex_root.join("com.foo@1").exists());
}

#[rstest]
fn test_boot_sequence_publishes_ready(tmpdir: tempdir::TempDir) {
    let config = test_config(tmpdir.path());
    let apexd = Apexd::new(Arc::new(config.clone()));

    run(&apexd).expect("an empty system should boot");

    assert_eq!(
        get_property(&config, STATUS_PROPERTY).unwrap().as_deref(),
        Some("ready")
    );
}

#[rstest]
fn test_boot_sequence_survives_broken_packages(tmpdir: tempdir::TempDir) {
    let config = test_config(tmpdir.path());
    let apexd = Apexd::new(Arc::new(config.clone()));

    // a package that cannot even be opened must not stop the boot
    std::fs::write(config.paths.active_dir.join("garbage.apex"), b"junk").unwrap();

    run(&apexd).expect("scan failures are per package");
    assert_eq!(
        get_property(&config, STATUS_PROPERTY).unwrap().as_deref(),
        Some("ready")
    );
}
