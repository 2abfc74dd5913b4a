// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Dispatch of pre- and post-install hooks declared by package
//! manifests.
//!
//! The core only decides *when* hooks run; actually confining and
//! executing the hook child is the executor's business, behind the
//! [`InstallHookExecutor`] seam.
use std::path::PathBuf;

use crate::apex_file::ApexFile;
use crate::manifest::ApexManifest;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./hooks_test.rs"]
mod hooks_test;

/// The two hook phases a manifest may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    PreInstall,
    PostInstall,
}

impl HookKind {
    /// The manifest field carrying this phase's hook path.
    pub fn of(self, manifest: &ApexManifest) -> &str {
        match self {
            HookKind::PreInstall => &manifest.pre_install_hook,
            HookKind::PostInstall => &manifest.post_install_hook,
        }
    }
}

/// Runs hook children on behalf of the session engine.
pub trait InstallHookExecutor: Send + Sync {
    /// Run the pre-install hooks of the given packages.
    fn stage_pre_install(&self, apexes: &[ApexFile]) -> Result<()>;
    /// Run the post-install hooks of the given packages.
    fn stage_post_install(&self, apexes: &[ApexFile]) -> Result<()>;
}

/// Invoke the executor for the given phase if any package declares a
/// hook of that kind; a set with no hooks is skipped entirely.
pub fn dispatch_hooks(
    apexes: &[ApexFile],
    kind: HookKind,
    executor: &dyn InstallHookExecutor,
) -> Result<()> {
    if apexes.is_empty() {
        return Err("Empty set of inputs".into());
    }
    let has_hooks = apexes
        .iter()
        .any(|apex| !kind.of(apex.manifest()).is_empty());
    if !has_hooks {
        tracing::debug!(?kind, "no hooks declared, skipping");
        return Ok(());
    }
    match kind {
        HookKind::PreInstall => executor.stage_pre_install(apexes),
        HookKind::PostInstall => executor.stage_post_install(apexes),
    }
}

/// Default executor: spawns each declared hook as a child process
/// rooted at the package's mounted tree and fails on a non-zero exit.
#[derive(Debug, Default)]
pub struct ForkHookExecutor {
    /// Root under which package mounts are found.
    pub apex_root: PathBuf,
}

impl ForkHookExecutor {
    pub fn new(apex_root: PathBuf) -> Self {
        Self { apex_root }
    }

    fn run(&self, apexes: &[ApexFile], kind: HookKind) -> Result<()> {
        for apex in apexes {
            let hook = kind.of(apex.manifest());
            if hook.is_empty() {
                continue;
            }
            let executable = self.apex_root.join(apex.package_id()).join(hook);
            tracing::info!(hook = ?executable, package = %apex.package_id(), "running install hook");
            let status = std::process::Command::new(&executable)
                .status()
                .map_err(|err| {
                    Error::Hook(format!("failed to spawn {}: {err}", executable.display()))
                })?;
            if !status.success() {
                return Err(Error::Hook(format!(
                    "{} exited with {status}",
                    executable.display()
                )));
            }
        }
        Ok(())
    }
}

impl InstallHookExecutor for ForkHookExecutor {
    fn stage_pre_install(&self, apexes: &[ApexFile]) -> Result<()> {
        self.run(apexes, HookKind::PreInstall)
    }

    fn stage_post_install(&self, apexes: &[ApexFile]) -> Result<()> {
        self.run(apexes, HookKind::PostInstall)
    }
}
