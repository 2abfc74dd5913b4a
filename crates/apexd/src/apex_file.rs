// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Opening and verification of package image files.
//!
//! A package is a zip archive carrying a manifest, an ext4 payload
//! image and a signed verity descriptor. The payload entry must be
//! stored uncompressed so that its byte range inside the archive can
//! back a loop device directly.
use std::io::Read;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{Deserialize, Serialize};

use crate::manifest::ApexManifest;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./apex_file_test.rs"]
mod apex_file_test;

/// Zip entry holding the serialized manifest.
pub const MANIFEST_ENTRY: &str = "apex_manifest.json";
/// Zip entry holding the ext4 filesystem image.
pub const PAYLOAD_ENTRY: &str = "apex_payload.img";
/// Zip entry holding the serialized verity descriptor.
pub const VERITY_ENTRY: &str = "apex_verity.json";
/// Zip entry holding the signature over the verity descriptor bytes.
pub const VERITY_SIG_ENTRY: &str = "apex_verity.sig";

/// Parameters of the dm-verity hash tree appended to the payload image.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VerityDescriptor {
    /// Size in bytes of the verity-protected data region.
    pub image_size: u64,
    /// Byte offset of the hash tree within the payload image.
    pub tree_offset: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    /// Lowercase hash algorithm name, e.g. "sha256".
    pub hash_algorithm: String,
    /// dm-verity on-disk format version.
    pub version: u32,
    /// Lowercase hex rendering of the root digest.
    pub root_digest: String,
    /// Lowercase hex rendering of the salt.
    pub salt: String,
}

/// A verified verity descriptor with its digest material decoded.
#[derive(Clone, Debug)]
pub struct ApexVerityData {
    pub descriptor: VerityDescriptor,
    pub root_digest: Vec<u8>,
    pub salt: Vec<u8>,
}

#[derive(Clone, Debug)]
struct VerityMetadata {
    /// The exact serialized descriptor bytes as found in the archive,
    /// which is what the signature covers.
    descriptor_bytes: Vec<u8>,
    signature: Vec<u8>,
}

/// Manages the content of a package image and provides utilities to
/// navigate it.
#[derive(Debug, Clone)]
pub struct ApexFile {
    path: PathBuf,
    image_offset: u64,
    image_size: u64,
    manifest: ApexManifest,
    flattened: bool,
    verity: Option<VerityMetadata>,
}

impl ApexFile {
    /// Open a package from the given path.
    ///
    /// A regular `.apex` file is opened as a zip archive; a directory
    /// is treated as a flattened package and only needs to carry a
    /// manifest.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::symlink_metadata(path)
            .map_err(|err| Error::wrap_io(err, format!("Failed to open {}", path.display())))?;
        if meta.is_dir() {
            return Self::open_flattened(path);
        }

        let file = std::fs::File::open(path)
            .map_err(|err| Error::wrap_io(err, format!("Failed to open {}", path.display())))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|err| Error::from(err).wrap(format!("Failed to read {}", path.display())))?;

        let manifest = {
            let mut entry = archive.by_name(MANIFEST_ENTRY)?;
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            ApexManifest::parse(&content)
                .map_err(|err| err.wrap(format!("In package {}", path.display())))?
        };

        let (image_offset, image_size) = {
            let entry = archive.by_name(PAYLOAD_ENTRY)?;
            if entry.compression() != zip::CompressionMethod::Stored {
                return Err(Error::Integrity(format!(
                    "{}: payload image must be stored uncompressed",
                    path.display()
                )));
            }
            (entry.data_start(), entry.size())
        };

        let descriptor_bytes = {
            let mut entry = archive.by_name(VERITY_ENTRY)?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            buf
        };
        let signature = {
            let mut entry = archive.by_name(VERITY_SIG_ENTRY)?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            buf
        };

        Ok(Self {
            path: path.to_path_buf(),
            image_offset,
            image_size,
            manifest,
            flattened: false,
            verity: Some(VerityMetadata {
                descriptor_bytes,
                signature,
            }),
        })
    }

    fn open_flattened(path: &Path) -> Result<Self> {
        let manifest_path = path.join(MANIFEST_ENTRY);
        let content = std::fs::read_to_string(&manifest_path).map_err(|err| {
            Error::wrap_io(err, format!("Failed to read {}", manifest_path.display()))
        })?;
        let manifest = ApexManifest::parse(&content)
            .map_err(|err| err.wrap(format!("In package {}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            image_offset: 0,
            image_size: 0,
            manifest,
            flattened: true,
            verity: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the payload image within the package file.
    pub fn image_offset(&self) -> u64 {
        self.image_offset
    }

    /// Byte length of the payload image.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn manifest(&self) -> &ApexManifest {
        &self.manifest
    }

    pub fn package_id(&self) -> String {
        self.manifest.package_id()
    }

    pub fn is_flattened(&self) -> bool {
        self.flattened
    }

    /// Validate this package's verity descriptor against the trusted
    /// public key registered for its name.
    ///
    /// The key lookup walks the given directories in order; the first
    /// file whose base name equals the package name wins.
    pub fn verify_apex_verity(&self, key_dirs: &[PathBuf]) -> Result<ApexVerityData> {
        let verity = self.verity.as_ref().ok_or_else(|| {
            Error::Integrity(format!(
                "{}: flattened packages carry no verity metadata",
                self.path.display()
            ))
        })?;

        let key = self.find_trusted_key(key_dirs)?;
        let public_key = ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, &key);
        public_key
            .verify(&verity.descriptor_bytes, &verity.signature)
            .map_err(|_| {
                Error::Integrity(format!(
                    "{}: verity descriptor signature mismatch",
                    self.path.display()
                ))
            })?;

        let descriptor: VerityDescriptor = serde_json::from_slice(&verity.descriptor_bytes)
            .map_err(|err| {
                Error::Integrity(format!(
                    "{}: malformed verity descriptor: {err}",
                    self.path.display()
                ))
            })?;
        self.validate_descriptor(&descriptor)?;

        let root_digest = HEXLOWER_PERMISSIVE
            .decode(descriptor.root_digest.as_bytes())
            .map_err(|_| self.integrity_error("root digest is not valid hex"))?;
        let salt = HEXLOWER_PERMISSIVE
            .decode(descriptor.salt.as_bytes())
            .map_err(|_| self.integrity_error("salt is not valid hex"))?;

        Ok(ApexVerityData {
            descriptor,
            root_digest,
            salt,
        })
    }

    fn find_trusted_key(&self, key_dirs: &[PathBuf]) -> Result<Vec<u8>> {
        for dir in key_dirs {
            let candidate = dir.join(&self.manifest.name);
            match std::fs::read(&candidate) {
                Ok(key) => {
                    tracing::debug!(key = ?candidate, "using trusted public key");
                    return Ok(key);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(Error::wrap_io(
                        err,
                        format!("Failed to read {}", candidate.display()),
                    ))
                }
            }
        }
        Err(Error::Integrity(format!(
            "no trusted public key found for package {}",
            self.manifest.name
        )))
    }

    fn validate_descriptor(&self, desc: &VerityDescriptor) -> Result<()> {
        if desc.data_block_size == 0 || desc.hash_block_size == 0 {
            return Err(self.integrity_error("verity block sizes must be non-zero"));
        }
        if desc.image_size % u64::from(desc.data_block_size) != 0 {
            return Err(
                self.integrity_error("verity data size is not a multiple of the data block size")
            );
        }
        if desc.image_size % 512 != 0 {
            return Err(self.integrity_error("verity data size is not sector aligned"));
        }
        if desc.tree_offset % u64::from(desc.hash_block_size) != 0 {
            return Err(
                self.integrity_error("hash tree offset is not aligned to the hash block size")
            );
        }
        if desc.image_size > self.image_size {
            return Err(self.integrity_error("verity data region exceeds the payload image"));
        }
        Ok(())
    }

    fn integrity_error(&self, msg: &str) -> Error {
        Error::Integrity(format!("{}: {msg}", self.path.display()))
    }
}
