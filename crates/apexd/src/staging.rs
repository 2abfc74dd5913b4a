// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! The staging engine: verifies submitted sessions, installs their
//! packages into the active directory, and drives the session state
//! machine.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::activate::Apexd;
use crate::apex_file::ApexFile;
use crate::hooks::{dispatch_hooks, HookKind};
use crate::session::{ApexSession, SessionState};
use crate::{util, Error, Result};

#[cfg(test)]
#[path = "./staging_test.rs"]
mod staging_test;

const ACTIVE_DIR_MODE: u32 = 0o750;

/// How packages are installed into the active directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Hard-link from the session directory, preserving the source.
    Link,
    /// Move the file and restore its security context.
    Rename,
}

/// Commits a session to ACTIVATION_FAILED on drop unless disarmed,
/// so that every early exit of the activation scan leaves the session
/// in a terminal state.
struct FailMarker<'a> {
    session: &'a mut ApexSession,
    armed: bool,
}

impl<'a> FailMarker<'a> {
    fn new(session: &'a mut ApexSession) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailMarker<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(session = self.session.id(), "marking session as failed");
        if let Err(err) = self
            .session
            .update_state_and_commit(SessionState::ActivationFailed)
        {
            tracing::error!(session = self.session.id(), ?err, "could not commit failure");
        }
    }
}

impl Apexd {
    /// Open and verify every package at the given paths.
    pub fn verify_packages(&self, paths: &[PathBuf]) -> Result<Vec<ApexFile>> {
        if paths.is_empty() {
            return Err("Empty set of inputs".into());
        }
        tracing::debug!(?paths, "verifying packages");
        let mut apexes = Vec::with_capacity(paths.len());
        for path in paths {
            let apex = ApexFile::open(path)?;
            apex.verify_apex_verity(&self.config().paths.key_dirs)?;
            apexes.push(apex);
        }
        Ok(apexes)
    }

    /// Verify the one package inside a single session directory.
    fn verify_session_dir(&self, session_id: u32) -> Result<ApexFile> {
        let dir = ApexSession::session_dir(&self.config().paths.sessions_dir, session_id);
        tracing::info!(?dir, "scanning for packages to be validated");
        let mut found = util::find_apex_files(&dir, false)?;
        if found.len() > 1 {
            return Err(Error::String(
                "More than one package found in the same session directory".to_string(),
            ));
        }
        let Some(path) = found.pop() else {
            return Err(Error::String(format!(
                "No packages found while scanning {}",
                dir.display()
            )));
        };
        let mut verified = self.verify_packages(&[path])?;
        Ok(verified.pop().expect("one package was just verified"))
    }

    /// Verify a submitted session (or its children), run the
    /// pre-install phase, and commit the session as VERIFIED.
    pub fn submit_staged_session(
        &self,
        session_id: u32,
        child_session_ids: &[u32],
    ) -> Result<Vec<ApexFile>> {
        let _guard = self.serialize_mutations();

        let ids_to_scan: Vec<u32> = if child_session_ids.is_empty() {
            vec![session_id]
        } else {
            child_session_ids.to_vec()
        };

        let mut apexes = Vec::with_capacity(ids_to_scan.len());
        for id in ids_to_scan {
            apexes.push(self.verify_session_dir(id)?);
        }

        dispatch_hooks(&apexes, HookKind::PreInstall, self.hook_executor())?;

        let mut session = ApexSession::create(&self.config().paths.sessions_dir, session_id)?;
        session.set_child_session_ids(child_session_ids);
        session.update_state_and_commit(SessionState::Verified)?;

        Ok(apexes)
    }

    /// Accept a VERIFIED session as ready for activation on the next
    /// boot. A no-op for sessions already STAGED.
    pub fn mark_staged_session_ready(&self, session_id: u32) -> Result<()> {
        let _guard = self.serialize_mutations();
        let mut session = ApexSession::get(&self.config().paths.sessions_dir, session_id)?;
        match session.state() {
            Some(SessionState::Staged) => Ok(()),
            Some(SessionState::Verified) => session.update_state_and_commit(SessionState::Staged),
            _ => Err(Error::SessionState(format!(
                "Invalid state for session {session_id}. Cannot mark it as ready"
            ))),
        }
    }

    /// Install every STAGED session's packages into the active
    /// directory, committing each session to ACTIVATED or
    /// ACTIVATION_FAILED.
    pub fn scan_staged_sessions_and_stage(&self) {
        let _guard = self.serialize_mutations();
        let sessions_dir = self.config().paths.sessions_dir.clone();
        tracing::info!(dir = ?sessions_dir, "scanning for sessions to be activated");

        for mut session in ApexSession::get_sessions_in_state(&sessions_dir, SessionState::Staged) {
            let session_id = session.id();
            let child_ids = session.child_session_ids().to_vec();
            let mut marker = FailMarker::new(&mut session);

            let dirs_to_scan: Vec<PathBuf> = if child_ids.is_empty() {
                vec![ApexSession::session_dir(&sessions_dir, session_id)]
            } else {
                child_ids
                    .iter()
                    .map(|id| ApexSession::session_dir(&sessions_dir, *id))
                    .collect()
            };

            let mut apexes = Vec::new();
            let mut scan_successful = true;
            for dir in dirs_to_scan {
                let mut found = match util::find_apex_files(&dir, false) {
                    Ok(found) => found,
                    Err(err) => {
                        tracing::warn!(?dir, ?err, "session scan failed");
                        scan_successful = false;
                        break;
                    }
                };
                if found.len() > 1 {
                    tracing::warn!(?dir, "more than one package in a session directory");
                    scan_successful = false;
                    break;
                }
                let Some(path) = found.pop() else {
                    tracing::warn!(?dir, session = session_id, "no packages found");
                    scan_successful = false;
                    break;
                };
                apexes.push(path);
            }
            if !scan_successful {
                continue;
            }

            if let Err(err) = self.post_install_packages(&apexes) {
                tracing::error!(session = session_id, ?err, "postinstall failed");
                continue;
            }

            if let Err(err) = self.stage_packages_impl(&apexes, LinkMode::Link) {
                tracing::error!(?apexes, ?err, "activation failed");
                continue;
            }

            marker.disarm();
            drop(marker);
            if let Err(err) = session.update_state_and_commit(SessionState::Activated) {
                tracing::error!(session = session_id, ?err, "could not commit activation");
            }
        }
    }

    /// Run the pre-install phase over the packages at the given paths.
    pub fn pre_install_packages(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Err("Empty set of inputs".into());
        }
        tracing::debug!(?paths, "preinstall");
        let apexes = self.open_packages(paths)?;
        dispatch_hooks(&apexes, HookKind::PreInstall, self.hook_executor())
    }

    /// Run the post-install phase over the packages at the given paths.
    pub fn post_install_packages(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Err("Empty set of inputs".into());
        }
        tracing::debug!(?paths, "postinstall");
        let apexes = self.open_packages(paths)?;
        dispatch_hooks(&apexes, HookKind::PostInstall, self.hook_executor())
    }

    fn open_packages(&self, paths: &[PathBuf]) -> Result<Vec<ApexFile>> {
        paths.iter().map(ApexFile::open).collect()
    }

    /// Verify and install the given packages into the active
    /// directory, superseding any older files of the same names.
    ///
    /// A failure part-way removes every file this call already
    /// installed and leaves pre-existing staged files alone.
    pub fn stage_packages(&self, tmp_paths: &[PathBuf], link_mode: LinkMode) -> Result<()> {
        let _guard = self.serialize_mutations();
        self.stage_packages_impl(tmp_paths, link_mode)
    }

    fn stage_packages_impl(&self, tmp_paths: &[PathBuf], link_mode: LinkMode) -> Result<()> {
        if tmp_paths.is_empty() {
            return Err("Empty set of inputs".into());
        }
        tracing::debug!(?tmp_paths, "staging packages");
        let active_dir = &self.config().paths.active_dir;

        let apexes = self.verify_packages(tmp_paths)?;

        util::makedirs_with_perms(active_dir, ACTIVE_DIR_MODE)?;

        let mut staged_files: HashSet<PathBuf> = HashSet::new();
        let mut staged_packages: HashSet<String> = HashSet::new();
        let result: Result<()> = (|| {
            for apex in &apexes {
                let dest_path = active_dir.join(format!(
                    "{}{}",
                    apex.package_id(),
                    util::APEX_PACKAGE_SUFFIX
                ));
                match link_mode {
                    LinkMode::Link => {
                        std::fs::hard_link(apex.path(), &dest_path).map_err(|err| {
                            Error::wrap_io(
                                err,
                                format!(
                                    "Unable to link {} to {}",
                                    apex.path().display(),
                                    dest_path.display()
                                ),
                            )
                        })?;
                    }
                    LinkMode::Rename => {
                        std::fs::rename(apex.path(), &dest_path).map_err(|err| {
                            Error::wrap_io(
                                err,
                                format!(
                                    "Unable to rename {} to {}",
                                    apex.path().display(),
                                    dest_path.display()
                                ),
                            )
                        })?;
                        restorecon(&dest_path)?;
                    }
                }
                staged_files.insert(dest_path.clone());
                staged_packages.insert(apex.manifest().name.clone());
                tracing::debug!(
                    from = ?apex.path(),
                    to = ?dest_path,
                    "successfully staged"
                );
            }
            Ok(())
        })();

        if let Err(err) = result {
            // undo only what this call produced
            for staged_path in &staged_files {
                if let Err(err) = std::fs::remove_file(staged_path) {
                    tracing::error!(path = ?staged_path, ?err, "unable to unlink");
                }
            }
            return Err(err);
        }

        self.remove_previously_active_apex_files(&staged_packages, &staged_files)
    }

    /// Delete every active package file that belongs to one of the
    /// affected packages but is not part of the just-staged set.
    fn remove_previously_active_apex_files(
        &self,
        affected_packages: &HashSet<String>,
        files_to_keep: &HashSet<PathBuf>,
    ) -> Result<()> {
        let all_active = util::find_apex_files(&self.config().paths.active_dir, false)?;
        for path in all_active {
            let apex = ApexFile::open(&path)?;
            if !affected_packages.contains(&apex.manifest().name) {
                // not part of this stage call, keep it
                continue;
            }
            if files_to_keep.contains(&path) {
                continue;
            }
            tracing::debug!(package = ?path, "deleting previously active package");
            std::fs::remove_file(&path)
                .map_err(|err| Error::wrap_io(err, format!("Failed to unlink {}", path.display())))?;
        }
        Ok(())
    }

    /// Revert the most recently staged session.
    pub fn rollback_last_session(&self) -> Result<()> {
        // intent only, nothing is unstaged yet
        tracing::info!("rolling back last session");
        Ok(())
    }
}

/// Restore the security context of a freshly renamed file.
fn restorecon(path: &Path) -> Result<()> {
    let status = std::process::Command::new("restorecon")
        .arg(path)
        .status()
        .map_err(|err| Error::wrap_io(err, "Failed to run restorecon"))?;
    if !status.success() {
        return Err(Error::String(format!(
            "Failed to restorecon {}: {status}",
            path.display()
        )));
    }
    Ok(())
}
