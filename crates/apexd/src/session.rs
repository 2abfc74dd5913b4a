// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Persisted staged-session records and their state machine.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{util, Error, Result};

#[cfg(test)]
#[path = "./session_test.rs"]
mod session_test;

const STATE_FILE: &str = "state.json";
const SESSION_DIR_PREFIX: &str = "session_";
const SESSION_DIR_MODE: u32 = 0o700;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Verified,
    Staged,
    Activated,
    ActivationFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SessionData {
    state: Option<SessionState>,
    #[serde(default)]
    child_session_ids: Vec<u32>,
}

/// One persisted staging transaction, keyed by its numeric id.
///
/// State only ever changes through [`ApexSession::update_state_and_commit`]
/// so that what the engine sees always matches what survives a restart.
#[derive(Clone, Debug)]
pub struct ApexSession {
    id: u32,
    dir: PathBuf,
    data: SessionData,
}

impl ApexSession {
    /// The directory holding this session's package and state file.
    pub fn session_dir<P: AsRef<Path>>(sessions_dir: P, id: u32) -> PathBuf {
        sessions_dir
            .as_ref()
            .join(format!("{SESSION_DIR_PREFIX}{id}"))
    }

    /// Create a fresh, uncommitted session record.
    pub fn create<P: AsRef<Path>>(sessions_dir: P, id: u32) -> Result<Self> {
        let sessions_dir = sessions_dir.as_ref();
        util::create_dir_if_needed(sessions_dir, SESSION_DIR_MODE)?;
        let dir = Self::session_dir(sessions_dir, id);
        util::create_dir_if_needed(&dir, SESSION_DIR_MODE)?;
        Ok(Self {
            id,
            dir,
            data: SessionData::default(),
        })
    }

    /// Load an existing session by id.
    pub fn get<P: AsRef<Path>>(sessions_dir: P, id: u32) -> Result<Self> {
        let dir = Self::session_dir(sessions_dir, id);
        let state_file = dir.join(STATE_FILE);
        let reader = std::fs::File::open(&state_file).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::SessionState(format!("unknown session {id}"))
            }
            _ => Error::wrap_io(err, format!("Failed to open {}", state_file.display())),
        })?;
        let data: SessionData = serde_json::from_reader(std::io::BufReader::new(reader))
            .map_err(|err| {
                Error::SessionState(format!("failed to parse {}: {err}", state_file.display()))
            })?;
        Ok(Self { id, dir, data })
    }

    /// Load every parsable session under the sessions directory.
    ///
    /// Entries that are not session directories or whose state cannot
    /// be read are skipped with a warning.
    pub fn get_sessions<P: AsRef<Path>>(sessions_dir: P) -> Vec<Self> {
        let sessions_dir = sessions_dir.as_ref();
        let dirs = match util::list_dirs(sessions_dir) {
            Ok(dirs) => dirs,
            Err(err) => {
                tracing::debug!(?sessions_dir, ?err, "no sessions to scan");
                return Vec::new();
            }
        };

        let mut sessions = Vec::new();
        for dir in dirs {
            let Some(id) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(SESSION_DIR_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                tracing::warn!(?dir, "could not parse a session id from directory");
                continue;
            };
            match Self::get(sessions_dir, id) {
                Ok(session) => sessions.push(session),
                Err(err) => tracing::warn!(session = id, ?err, "skipping unreadable session"),
            }
        }
        sessions
    }

    /// Load every session currently in the given state.
    pub fn get_sessions_in_state<P: AsRef<Path>>(sessions_dir: P, state: SessionState) -> Vec<Self> {
        let mut sessions = Self::get_sessions(sessions_dir);
        sessions.retain(|s| s.state() == Some(state));
        sessions
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The session's committed state, if any state was ever committed.
    pub fn state(&self) -> Option<SessionState> {
        self.data.state
    }

    pub fn child_session_ids(&self) -> &[u32] {
        &self.data.child_session_ids
    }

    pub fn set_child_session_ids(&mut self, child_session_ids: &[u32]) {
        self.data.child_session_ids = child_session_ids.to_vec();
    }

    /// Move to the given state and persist the whole record.
    pub fn update_state_and_commit(&mut self, state: SessionState) -> Result<()> {
        self.data.state = Some(state);
        let state_file = self.dir.join(STATE_FILE);
        let file = std::fs::File::create(&state_file).map_err(|err| {
            Error::wrap_io(err, format!("Failed to write {}", state_file.display()))
        })?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.data)?;
        std::io::Write::flush(&mut writer)?;
        tracing::debug!(session = self.id, ?state, "session state committed");
        Ok(())
    }
}
