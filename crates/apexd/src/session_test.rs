// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

use rstest::rstest;

use super::{ApexSession, SessionState};
use crate::Error;

fixtures!();

#[rstest]
fn test_create_and_commit(tmpdir: tempdir::TempDir) {
    let sessions_dir = tmpdir.path().join("sessions");
    let mut session = ApexSession::create(&sessions_dir, 42).expect("create should succeed");
    assert_eq!(session.id(), 42);
    assert_eq!(session.state(), None);

    session
        .update_state_and_commit(SessionState::Verified)
        .expect("commit should succeed");

    let reloaded = ApexSession::get(&sessions_dir, 42).expect("session should reload");
    assert_eq!(reloaded.state(), Some(SessionState::Verified));
}

#[rstest]
fn test_unknown_session(tmpdir: tempdir::TempDir) {
    let err = ApexSession::get(tmpdir.path(), 7).expect_err("session 7 was never created");
    assert!(matches!(err, Error::SessionState(_)));
}

#[rstest]
fn test_child_session_ids_round_trip(tmpdir: tempdir::TempDir) {
    let sessions_dir = tmpdir.path().join("sessions");
    let mut session = ApexSession::create(&sessions_dir, 10).unwrap();
    session.set_child_session_ids(&[20, 30, 40]);
    session
        .update_state_and_commit(SessionState::Staged)
        .unwrap();

    let reloaded = ApexSession::get(&sessions_dir, 10).unwrap();
    assert_eq!(reloaded.child_session_ids(), &[20, 30, 40]);
}

#[rstest]
fn test_get_sessions_skips_junk(tmpdir: tempdir::TempDir) {
    let sessions_dir = tmpdir.path().join("sessions");
    let mut session = ApexSession::create(&sessions_dir, 1).unwrap();
    session
        .update_state_and_commit(SessionState::Verified)
        .unwrap();
    // a directory with no parsable id, and one with no state
    std::fs::create_dir(sessions_dir.join("lost+found")).unwrap();
    std::fs::create_dir(sessions_dir.join("session_two")).unwrap();
    std::fs::create_dir(sessions_dir.join("session_3")).unwrap();

    let sessions = ApexSession::get_sessions(&sessions_dir);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id(), 1);
}

#[rstest]
fn test_get_sessions_in_state(tmpdir: tempdir::TempDir) {
    let sessions_dir = tmpdir.path().join("sessions");
    for (id, state) in [
        (1, SessionState::Verified),
        (2, SessionState::Staged),
        (3, SessionState::Staged),
        (4, SessionState::ActivationFailed),
    ] {
        let mut session = ApexSession::create(&sessions_dir, id).unwrap();
        session.update_state_and_commit(state).unwrap();
    }

    let mut staged: Vec<u32> = ApexSession::get_sessions_in_state(&sessions_dir, SessionState::Staged)
        .iter()
        .map(|s| s.id())
        .collect();
    staged.sort_unstable();
    assert_eq!(staged, vec![2, 3]);

    let empty = ApexSession::get_sessions_in_state(&sessions_dir, SessionState::Activated);
    assert!(empty.is_empty());
}

#[rstest]
fn test_state_serialization() {
    let json = serde_json::to_string(&SessionState::ActivationFailed).unwrap();
    assert_eq!(json, "\"ACTIVATION_FAILED\"");
    let state: SessionState = serde_json::from_str("\"STAGED\"").unwrap();
    assert_eq!(state, SessionState::Staged);
}
