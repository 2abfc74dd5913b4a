// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Publication of the daemon lifecycle status for other components.
//!
//! Rendered as a small key/value file replaced atomically on every
//! change, so readers never observe a half-written value.
use std::fmt::Display;

use crate::config::Config;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./status_test.rs"]
mod status_test;

/// The key under which the daemon lifecycle state is published.
pub const STATUS_PROPERTY: &str = "apexd.status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// Mounting is in progress, packages are not yet usable.
    Starting,
    /// All packages are mounted and ready to be used.
    Ready,
}

impl Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStatus::Starting => f.write_str("starting"),
            DaemonStatus::Ready => f.write_str("ready"),
        }
    }
}

/// Set a property in the status file, preserving other keys.
pub fn set_property(config: &Config, name: &str, value: &str) -> Result<()> {
    let path = &config.paths.status_file;
    let mut lines: Vec<String> = match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .filter(|line| line.split('=').next() != Some(name))
            .map(str::to_string)
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(Error::wrap_io(
                err,
                format!("Failed to read {}", path.display()),
            ))
        }
    };
    lines.push(format!("{name}={value}"));

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, lines.join("\n") + "\n")
        .map_err(|err| Error::wrap_io(err, format!("Failed to write {}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|err| Error::wrap_io(err, format!("Failed to replace {}", path.display())))?;
    Ok(())
}

/// Read a property back from the status file.
pub fn get_property(config: &Config, name: &str) -> Result<Option<String>> {
    let path = &config.paths.status_file;
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::wrap_io(
                err,
                format!("Failed to read {}", path.display()),
            ))
        }
    };
    Ok(content.lines().find_map(|line| {
        line.split_once('=')
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }))
}

/// Publish the daemon lifecycle state.
///
/// Failing to publish is logged but never fatal: the daemon is more
/// useful degraded than dead.
pub fn publish(config: &Config, status: DaemonStatus) {
    tracing::info!(%status, "marking daemon status");
    if let Err(err) = set_property(config, STATUS_PROPERTY, &status.to_string()) {
        tracing::error!(?err, "failed to publish {STATUS_PROPERTY}={status}");
    }
}
