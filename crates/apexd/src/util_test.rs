// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::os::unix::fs::PermissionsExt;

use rstest::rstest;

use super::{create_dir_if_needed, find_apex_files, list_dirs, makedirs_with_perms};

fixtures!();

#[rstest]
fn test_makedirs_with_perms(tmpdir: tempdir::TempDir) {
    let deep = tmpdir.path().join("a/b/c");
    makedirs_with_perms(&deep, 0o700).expect("nested creation should succeed");
    assert!(deep.is_dir());

    makedirs_with_perms(&deep, 0o700).expect("repeat creation should succeed");
}

#[rstest]
fn test_create_dir_if_needed(tmpdir: tempdir::TempDir) {
    let dir = tmpdir.path().join("active");
    create_dir_if_needed(&dir, 0o750).expect("creation should succeed");
    let mode = dir.metadata().unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o750);

    // existing directories get their mode enforced
    create_dir_if_needed(&dir, 0o700).expect("existing dir should be accepted");
    let mode = dir.metadata().unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);

    let file = tmpdir.path().join("file");
    std::fs::write(&file, b"").unwrap();
    create_dir_if_needed(&file, 0o750).expect_err("a file in the way is an error");
}

#[rstest]
fn test_find_apex_files(tmpdir: tempdir::TempDir) {
    let root = tmpdir.path();
    std::fs::write(root.join("a.apex"), b"").unwrap();
    std::fs::write(root.join("b.apex"), b"").unwrap();
    std::fs::write(root.join("ignored.txt"), b"").unwrap();
    std::fs::create_dir(root.join("flattened")).unwrap();

    let mut files = find_apex_files(root, false).unwrap();
    files.sort();
    assert_eq!(files, vec![root.join("a.apex"), root.join("b.apex")]);

    let mut with_dirs = find_apex_files(root, true).unwrap();
    with_dirs.sort();
    assert_eq!(
        with_dirs,
        vec![
            root.join("a.apex"),
            root.join("b.apex"),
            root.join("flattened")
        ]
    );

    find_apex_files(root.join("no-such-dir"), false).expect_err("missing dir is an error");
}

#[rstest]
fn test_list_dirs(tmpdir: tempdir::TempDir) {
    let root = tmpdir.path();
    std::fs::create_dir(root.join("one")).unwrap();
    std::fs::create_dir(root.join("two")).unwrap();
    std::fs::write(root.join("file"), b"").unwrap();

    let mut dirs = list_dirs(root).unwrap();
    dirs.sort();
    assert_eq!(dirs, vec![root.join("one"), root.join("two")]);
}
