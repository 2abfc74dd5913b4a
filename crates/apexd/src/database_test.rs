// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use rstest::rstest;

use super::{MountedApexData, MountedApexDatabase};

fn count_instances(db: &MountedApexDatabase) -> usize {
    let mut count = 0;
    db.for_each_all(|_, _, _| count += 1);
    count
}

fn contains(db: &MountedApexDatabase, package: &str, loop_name: &str, full_path: &str) -> bool {
    let mut found = false;
    db.for_each_all(|p, d, _| {
        if p == package && d.loop_name == loop_name && d.full_path == full_path {
            found = true;
        }
    });
    found
}

fn contains_package(
    db: &MountedApexDatabase,
    package: &str,
    loop_name: &str,
    full_path: &str,
) -> bool {
    let mut found = false;
    db.for_each(package, |d, _| {
        if d.loop_name == loop_name && d.full_path == full_path {
            found = true;
        }
    });
    found
}

fn latest_of(db: &MountedApexDatabase, package: &str) -> Option<String> {
    let mut latest = None;
    db.for_each(package, |d, l| {
        if l {
            latest = Some(d.full_path.clone());
        }
    });
    latest
}

#[rstest]
fn test_linear_order() {
    let loops = ["loop1", "loop1", "loop2", "loop2", "loop3", "loop3"];
    let paths = ["path1", "path2", "path1", "path2", "path1", "path3"];

    let data: Vec<_> = loops
        .iter()
        .zip(paths.iter())
        .map(|(l, p)| MountedApexData::new(*l, *p))
        .collect();

    for i in 0..data.len() {
        for j in i..data.len() {
            if i != j {
                assert!(data[i] < data[j], "expected {i} < {j}");
            }
            assert!(!(data[j] < data[i]), "expected ! {j} < {i}");
        }
    }
}

#[rstest]
fn test_add_remove_mounted_apex() {
    let db = MountedApexDatabase::default();
    assert_eq!(count_instances(&db), 0);

    db.add_mounted_apex("package", false, MountedApexData::new("loop", "path"))
        .expect("add should succeed on an empty database");
    assert!(contains(&db, "package", "loop", "path"));
    assert!(contains_package(&db, "package", "loop", "path"));

    db.remove_mounted_apex("package", "path");
    assert!(!contains(&db, "package", "loop", "path"));
    assert!(!contains_package(&db, "package", "loop", "path"));
}

#[rstest]
fn test_mount_multiple() {
    let packages = ["package", "package", "package", "package"];
    let loops = ["loop", "loop", "loop3", "loop4"];
    let paths = ["path", "path2", "path3", "path4"];

    let db = MountedApexDatabase::default();
    for i in 0..packages.len() {
        db.add_mounted_apex(packages[i], false, MountedApexData::new(loops[i], paths[i]))
            .expect("distinct paths should all be accepted");
    }
    assert_eq!(count_instances(&db), 4);
    for i in 0..packages.len() {
        assert!(contains(&db, packages[i], loops[i], paths[i]));
        assert!(contains_package(&db, packages[i], loops[i], paths[i]));
    }

    db.remove_mounted_apex(packages[0], paths[0]);
    assert!(!contains(&db, packages[0], loops[0], paths[0]));
    for i in 1..packages.len() {
        assert!(contains(&db, packages[i], loops[i], paths[i]));
    }
}

#[rstest]
fn test_duplicate_path_rejected() {
    let db = MountedApexDatabase::default();
    db.add_mounted_apex("package", false, MountedApexData::new("loop1", "path"))
        .unwrap();
    db.add_mounted_apex("package", false, MountedApexData::new("loop2", "path"))
        .expect_err("a second record with the same path must be rejected");
}

#[rstest]
fn test_at_most_one_latest() {
    let db = MountedApexDatabase::default();
    db.add_mounted_apex("pkg", true, MountedApexData::new("loop1", "path1"))
        .unwrap();
    db.add_mounted_apex("pkg", true, MountedApexData::new("loop2", "path2"))
        .unwrap();

    let mut latest_count = 0;
    db.for_each("pkg", |_, latest| {
        if latest {
            latest_count += 1;
        }
    });
    assert_eq!(latest_count, 1);
    assert_eq!(latest_of(&db, "pkg").as_deref(), Some("path2"));
}

#[rstest]
fn test_set_latest_moves_the_flag() {
    let db = MountedApexDatabase::default();
    db.add_mounted_apex("pkg", true, MountedApexData::new("loop1", "path1"))
        .unwrap();
    db.add_mounted_apex("pkg", false, MountedApexData::new("loop2", "path2"))
        .unwrap();
    assert_eq!(latest_of(&db, "pkg").as_deref(), Some("path1"));

    db.set_latest("pkg", "path2").unwrap();
    assert_eq!(latest_of(&db, "pkg").as_deref(), Some("path2"));

    db.set_latest("pkg", "no-such-path")
        .expect_err("latest must reference an existing record");
    db.set_latest("other", "path2")
        .expect_err("latest must reference an existing package");
}

#[rstest]
fn test_remove_latest_leaves_none() {
    let db = MountedApexDatabase::default();
    db.add_mounted_apex("pkg", false, MountedApexData::new("loop1", "path1"))
        .unwrap();
    db.add_mounted_apex("pkg", true, MountedApexData::new("loop2", "path2"))
        .unwrap();

    db.remove_mounted_apex("pkg", "path2");
    assert_eq!(latest_of(&db, "pkg"), None);
    assert!(contains_package(&db, "pkg", "loop1", "path1"));
}

#[rstest]
fn test_find() {
    let db = MountedApexDatabase::default();
    db.add_mounted_apex("pkg", true, MountedApexData::new("loop7", "path7"))
        .unwrap();

    let (data, latest) = db.find("pkg", "path7").expect("record should be found");
    assert_eq!(data.loop_name, "loop7");
    assert!(latest);
    assert!(db.find("pkg", "path8").is_none());
    assert!(db.find("other", "path7").is_none());
}
