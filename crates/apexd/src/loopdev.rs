// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Allocation, configuration and teardown of loop devices backing
//! package images.
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::errno::Errno;

use crate::config::Config;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./loopdev_test.rs"]
mod loopdev_test;

/// Every loop device owned by this daemon carries this prefix in its
/// crypt-name field so that abandoned devices can be found and freed.
pub const LOOP_TAG_PREFIX: &str = "apex:";

/// Read-ahead configured on loop and verity device queues, in KiB.
pub const READ_AHEAD_KB: u32 = 128;

const LOGICAL_BLOCK_SIZE: u32 = 4096;

// from <linux/loop.h>
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
const LOOP_SET_DIRECT_IO: libc::c_ulong = 0x4C08;
const LOOP_SET_BLOCK_SIZE: libc::c_ulong = 0x4C09;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
// from <linux/fs.h>: _IO(0x12, 97)
const BLKFLSBUF: libc::c_ulong = 0x1261;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

// from <linux/loop.h>; the kernel reads every field even when we don't
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        // plain kernel ABI struct, all-zeroes is its ground state
        unsafe { std::mem::zeroed() }
    }
}

/// Exclusive ownership of a configured loop device.
///
/// The device is released again on drop unless the owning mount
/// transaction commits by calling [`LoopbackDevice::release`].
#[derive(Debug)]
pub struct LoopbackDevice {
    name: String,
    device: Option<std::fs::File>,
}

impl LoopbackDevice {
    /// The device node path, e.g. `/dev/block/loop7`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep the kernel resource alive beyond this handle.
    ///
    /// Called once the ext4 mount succeeds and the mount itself pins
    /// the device.
    pub fn release(mut self) {
        self.device.take();
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        tracing::debug!(device = %self.name, "releasing unused loop device");
        if let Err(err) = clear_fd(&device) {
            tracing::warn!(device = %self.name, ?err, "failed to release loop device");
        }
    }
}

/// Render the crypt-name tag recorded on devices bound by this daemon.
fn encode_tag(backing_file: &Path) -> [u8; LO_NAME_SIZE] {
    let mut buf = [0u8; LO_NAME_SIZE];
    let tag = format!("{LOOP_TAG_PREFIX}{}", backing_file.display());
    let bytes = tag.as_bytes();
    // always leave a trailing NUL
    let len = bytes.len().min(LO_NAME_SIZE - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// True if the given crypt-name field was written by this daemon.
fn tag_matches(crypt_name: &[u8]) -> bool {
    crypt_name.starts_with(LOOP_TAG_PREFIX.as_bytes())
}

fn clear_fd(device: &std::fs::File) -> Result<()> {
    match Errno::result(unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0) }) {
        Ok(_) => Ok(()),
        // the device may already be gone or unbound
        Err(Errno::ENOENT) | Err(Errno::ENXIO) => Ok(()),
        Err(err) => Err(Error::wrap_nix(err, "LOOP_CLR_FD failed")),
    }
}

/// Bind a region of the given file to a freshly allocated loop device.
///
/// The returned handle owns the device and will free it on drop; see
/// [`LoopbackDevice::release`].
pub fn create_loop(
    config: &Config,
    target: &Path,
    image_offset: u64,
    image_size: u64,
) -> Result<LoopbackDevice> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.paths.loop_control)
        .map_err(|err| {
            Error::wrap_io(
                err,
                format!("Failed to open {}", config.paths.loop_control.display()),
            )
        })?;
    let num = Errno::result(unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) })
        .map_err(|err| {
            Error::ResourceBusy(format!("Failed to allocate free loop device: {err}"))
        })?;

    let device_path = config.paths.loop_dir.join(format!("loop{num}"));
    let name = device_path.display().to_string();
    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&device_path)
        .map_err(|err| Error::wrap_io(err, format!("Failed to open {name}")))?;
    let target_file = std::fs::File::open(target)
        .map_err(|err| Error::wrap_io(err, format!("Failed to open {}", target.display())))?;

    Errno::result(unsafe {
        libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, target_file.as_raw_fd())
    })
    .map_err(|err| Error::ResourceBusy(format!("Failed to attach image to {name}: {err}")))?;

    // hold the device from here on so any failure path unbinds it
    let handle = LoopbackDevice {
        name: name.clone(),
        device: Some(device),
    };
    let device = handle.device.as_ref().expect("device was just stored");

    let mut info = LoopInfo64 {
        lo_offset: image_offset,
        lo_sizelimit: image_size,
        lo_crypt_name: encode_tag(target),
        ..Default::default()
    };
    Errno::result(unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            &mut info as *mut LoopInfo64,
        )
    })
    .map_err(|err| Error::wrap_nix(err, format!("Failed to configure {name}")))?;

    // The kernel partition scan triggered by binding the backing file
    // reads at offset zero of the file and leaves those pages cached
    // against the device; they are not invalidated when the offset
    // moves, so the first superblock read would see stale bytes.
    Errno::result(unsafe { libc::ioctl(device.as_raw_fd(), BLKFLSBUF as _, 0) })
        .map_err(|err| Error::wrap_nix(err, format!("Failed to flush buffers on {name}")))?;

    if let Err(err) = Errno::result(unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_BLOCK_SIZE as _,
            LOGICAL_BLOCK_SIZE as libc::c_ulong,
        )
    }) {
        tracing::warn!(device = %name, ?err, "failed to set logical block size");
    }
    if let Err(err) =
        Errno::result(unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_DIRECT_IO as _, 1) })
    {
        tracing::warn!(device = %name, ?err, "direct IO is not supported");
    }

    configure_read_ahead(config, &device_path)?;

    tracing::debug!(device = %name, image = ?target, "loop device created");
    Ok(handle)
}

/// Set the configured read-ahead on a block device's sysfs queue.
pub fn configure_read_ahead(config: &Config, device: &Path) -> Result<()> {
    let node = device
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::String(format!("Invalid device path: {}", device.display())))?;
    let sysfs_path = config
        .paths
        .sysfs_block_dir
        .join(node)
        .join("queue/read_ahead_kb");
    std::fs::write(&sysfs_path, READ_AHEAD_KB.to_string()).map_err(|err| {
        Error::wrap_io(err, format!("Failed to write {}", sysfs_path.display()))
    })?;
    Ok(())
}

/// Unbind the given loop device if it carries this daemon's tag.
pub fn destroy_loop<P: AsRef<Path>>(device_path: P) -> Result<()> {
    let device_path = device_path.as_ref();
    let device = match OpenOptions::new().read(true).write(true).open(device_path) {
        Ok(device) => device,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(Error::wrap_io(
                err,
                format!("Failed to open {}", device_path.display()),
            ))
        }
    };

    let mut info = LoopInfo64::default();
    match Errno::result(unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_GET_STATUS64 as _,
            &mut info as *mut LoopInfo64,
        )
    }) {
        Ok(_) => (),
        // not bound to anything
        Err(Errno::ENXIO) | Err(Errno::ENOENT) => return Ok(()),
        Err(err) => {
            return Err(Error::wrap_nix(
                err,
                format!("Failed to query {}", device_path.display()),
            ))
        }
    }

    if !tag_matches(&info.lo_crypt_name) {
        return Ok(());
    }
    tracing::debug!(device = ?device_path, "freeing tagged loop device");
    clear_fd(&device).map_err(|err| err.wrap(format!("Failed to free {}", device_path.display())))
}

/// Enumerate the loop device nodes and free every one tagged by this
/// daemon.
pub fn destroy_all(config: &Config) -> Result<()> {
    let read_dir = std::fs::read_dir(&config.paths.loop_dir).map_err(|err| {
        Error::wrap_io(
            err,
            format!("Can't open {} for reading", config.paths.loop_dir.display()),
        )
    })?;
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("loop") || !name[4..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Err(err) = destroy_loop(entry.path()) {
            tracing::warn!(device = ?entry.path(), ?err, "failed to tear down stale loop");
        }
    }
    Ok(())
}
