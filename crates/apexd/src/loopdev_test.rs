// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::path::Path;

use rstest::rstest;

use super::{destroy_all, destroy_loop, encode_tag, tag_matches, LoopInfo64, LOOP_TAG_PREFIX};

fixtures!();

#[rstest]
fn test_loop_info64_layout() {
    // must match struct loop_info64 from <linux/loop.h>
    assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
}

#[rstest]
fn test_encode_tag() {
    let tag = encode_tag(Path::new("/data/apex/active/com.foo@1.apex"));
    assert!(tag_matches(&tag));
    let text = std::str::from_utf8(&tag[..tag.iter().position(|b| *b == 0).unwrap()]).unwrap();
    assert_eq!(text, "apex:/data/apex/active/com.foo@1.apex");
}

#[rstest]
fn test_encode_tag_truncates_long_paths() {
    let long = format!("/very/{}/long.apex", "x".repeat(128));
    let tag = encode_tag(Path::new(&long));
    assert!(tag_matches(&tag));
    // the last byte stays NUL so the kernel sees a terminated string
    assert_eq!(tag[tag.len() - 1], 0);
}

#[rstest]
fn test_tag_matches_rejects_foreign_names() {
    assert!(!tag_matches(&[0u8; 64]));
    assert!(!tag_matches(b"loop:/some/file\0"));
    assert!(tag_matches(LOOP_TAG_PREFIX.as_bytes()));
}

#[rstest]
fn test_destroy_loop_ignores_missing_devices(tmpdir: tempdir::TempDir) {
    destroy_loop(tmpdir.path().join("loop9")).expect("a vanished device is not an error");
}

#[rstest]
fn test_destroy_all_skips_foreign_entries(tmpdir: tempdir::TempDir) {
    let config = test_config(tmpdir.path());
    // these are not loop devices at all; teardown must not trip on them
    std::fs::write(config.paths.loop_dir.join("loop0"), b"").unwrap();
    std::fs::write(config.paths.loop_dir.join("loop-control"), b"").unwrap();
    std::fs::write(config.paths.loop_dir.join("sda1"), b"").unwrap();
    destroy_all(&config).expect("teardown should survive foreign directory entries");
}
