// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use std::sync::Mutex;

use rstest::rstest;

use super::{dispatch_hooks, HookKind, InstallHookExecutor};
use crate::apex_file::ApexFile;
use crate::{Error, Result};

fixtures!();

/// Records which phases ran, and optionally fails them.
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(HookKind, Vec<String>)>>,
    fail: bool,
}

impl RecordingExecutor {
    fn record(&self, kind: HookKind, apexes: &[ApexFile]) -> Result<()> {
        self.calls.lock().unwrap().push((
            kind,
            apexes.iter().map(|a| a.manifest().name.clone()).collect(),
        ));
        if self.fail {
            return Err(Error::Hook("injected failure".to_string()));
        }
        Ok(())
    }

    fn calls(&self) -> Vec<(HookKind, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl InstallHookExecutor for RecordingExecutor {
    fn stage_pre_install(&self, apexes: &[ApexFile]) -> Result<()> {
        self.record(HookKind::PreInstall, apexes)
    }

    fn stage_post_install(&self, apexes: &[ApexFile]) -> Result<()> {
        self.record(HookKind::PostInstall, apexes)
    }
}

fn apex_with_hooks(
    tmpdir: &tempdir::TempDir,
    name: &str,
    pre_hook: &str,
    post_hook: &str,
) -> ApexFile {
    let key = TestKey::generate();
    let path = tmpdir.path().join(format!("{name}.apex"));
    make_apex(&path, &key, name, 1, pre_hook, post_hook);
    ApexFile::open(&path).expect("test package should open")
}

#[rstest]
fn test_dispatch_skips_hookless_sets(tmpdir: tempdir::TempDir) {
    let executor = RecordingExecutor::default();
    let apexes = vec![
        apex_with_hooks(&tmpdir, "com.one", "", ""),
        apex_with_hooks(&tmpdir, "com.two", "", ""),
    ];

    dispatch_hooks(&apexes, HookKind::PreInstall, &executor).unwrap();
    assert!(executor.calls().is_empty(), "no hooks, no executor call");
}

#[rstest]
fn test_dispatch_runs_when_any_package_hooks(tmpdir: tempdir::TempDir) {
    let executor = RecordingExecutor::default();
    let apexes = vec![
        apex_with_hooks(&tmpdir, "com.one", "", ""),
        apex_with_hooks(&tmpdir, "com.two", "bin/preinstall", ""),
    ];

    dispatch_hooks(&apexes, HookKind::PreInstall, &executor).unwrap();
    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, HookKind::PreInstall);
    // the whole set is handed over, not just the hooked package
    assert_eq!(calls[0].1, vec!["com.one", "com.two"]);
}

#[rstest]
fn test_dispatch_selects_the_phase(tmpdir: tempdir::TempDir) {
    let executor = RecordingExecutor::default();
    let apexes = vec![apex_with_hooks(&tmpdir, "com.one", "bin/pre", "")];

    // only a pre-install hook is declared
    dispatch_hooks(&apexes, HookKind::PostInstall, &executor).unwrap();
    assert!(executor.calls().is_empty());

    dispatch_hooks(&apexes, HookKind::PreInstall, &executor).unwrap();
    assert_eq!(executor.calls().len(), 1);
}

#[rstest]
fn test_dispatch_propagates_executor_failure(tmpdir: tempdir::TempDir) {
    let executor = RecordingExecutor {
        fail: true,
        ..Default::default()
    };
    let apexes = vec![apex_with_hooks(&tmpdir, "com.one", "bin/pre", "")];

    let err = dispatch_hooks(&apexes, HookKind::PreInstall, &executor)
        .expect_err("executor failures must surface");
    assert!(matches!(err, Error::Hook(_)));
}

#[rstest]
fn test_dispatch_rejects_empty_sets() {
    let executor = RecordingExecutor::default();
    dispatch_hooks(&[], HookKind::PreInstall, &executor)
        .expect_err("an empty set of inputs is an error");
}
