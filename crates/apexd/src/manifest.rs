// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Parsing and validation of the package manifest.
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./manifest_test.rs"]
mod manifest_test;

/// The manifest embedded in every package, naming and versioning it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ApexManifest {
    pub name: String,
    pub version: u64,
    #[serde(default, rename = "preInstallHook")]
    pub pre_install_hook: String,
    #[serde(default, rename = "postInstallHook")]
    pub post_install_hook: String,
}

impl ApexManifest {
    /// Parse a manifest from its serialized JSON form.
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: ApexManifest = serde_json::from_str(content)
            .map_err(|err| Error::String(format!("Failed to parse manifest: {err}")))?;
        if manifest.name.is_empty() {
            return Err("Manifest names an empty package".into());
        }
        if !manifest
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(Error::String(format!(
                "Invalid package name: {}",
                manifest.name
            )));
        }
        Ok(manifest)
    }

    /// The canonical `name@version` identifier of this package.
    ///
    /// Used as the dm-verity device name and as the versioned
    /// mount point directory name.
    pub fn package_id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}
