// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Lifecycle management of signed, self-contained system package
//! images: verification, loop and dm-verity device construction,
//! mounting, and staged installation sessions.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
#[macro_use]
pub mod fixtures;

mod activate;
pub mod apex_file;
pub mod bootstrap;
pub mod config;
pub mod database;
mod error;
pub mod hooks;
pub mod loopdev;
pub mod manifest;
pub mod mount;
pub mod session;
pub mod staging;
pub mod status;
pub mod util;
pub mod verity;

pub use activate::{Apexd, ApexInfo};
pub use apex_file::{ApexFile, ApexVerityData};
pub use config::{get_config, load_config, Config};
pub use database::{MountedApexData, MountedApexDatabase};
pub use error::{Error, Result};
pub use manifest::ApexManifest;
pub use session::{ApexSession, SessionState};
pub use staging::LinkMode;
