// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    String(String),
    #[error(transparent)]
    Nix(#[from] nix::errno::Errno),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("[ERRNO {1}] {0}")]
    Errno(String, i32),
    #[error(transparent)]
    JSON(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    /// Signature mismatch, inconsistent verity metadata, or an
    /// unauthorized signing key.
    #[error("integrity failure: {0}")]
    Integrity(String),
    /// A loop, device-mapper, mount or umount operation was refused
    /// by the kernel.
    #[error("kernel resource busy: {0}")]
    ResourceBusy(String),
    /// The requested operation contradicts the mounted-apex registry
    /// (already active, duplicate mount, missing record).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// An illegal session transition or an unknown session id.
    #[error("session state: {0}")]
    SessionState(String),
    /// A pre- or post-install hook child exited with a failure.
    #[error("install hook failed: {0}")]
    Hook(String),
}

impl Error {
    pub fn new<S: AsRef<str>>(message: S) -> Error {
        Error::String(message.as_ref().to_string())
    }

    pub fn new_errno<E: Into<String>>(errno: i32, e: E) -> Error {
        let msg = e.into();
        Error::Errno(msg, errno)
    }

    pub fn wrap_io<E: Into<String>>(err: std::io::Error, prefix: E) -> Error {
        let err = Self::from(err);
        err.wrap(prefix)
    }

    pub fn wrap_nix<E: Into<String>>(err: nix::errno::Errno, prefix: E) -> Error {
        let err = Self::from(err);
        err.wrap(prefix)
    }

    pub fn wrap<E: Into<String>>(&self, prefix: E) -> Error {
        let msg = format!("{}: {}", prefix.into(), self);
        match self.raw_os_error() {
            Some(errno) => Error::new_errno(errno, msg),
            None => Error::new(msg),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::IO(err) => err.raw_os_error(),
            Error::Errno(_, errno) => Some(*errno),
            Error::Nix(errno) => Some(*errno as i32),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::String(msg.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::String(msg)
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        let msg = err.to_string();
        match err.into_io_error() {
            Some(err) => err.into(),
            None => Self::String(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
