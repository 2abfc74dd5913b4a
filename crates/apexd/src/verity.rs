// Copyright (c) Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

//! Construction and teardown of device-mapper verity targets over the
//! loop devices backing package images.
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use data_encoding::HEXLOWER;
use nix::errno::Errno;

use crate::apex_file::ApexVerityData;
use crate::config::Config;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./verity_test.rs"]
mod verity_test;

const SECTOR_SIZE: u64 = 512;

// from <linux/dm-ioctl.h>
const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
const DM_VERSION_MAJOR: u32 = 4;
const DM_READONLY_FLAG: u32 = 1;

const DM_IOCTL_TYPE: libc::c_ulong = 0xfd;
const DM_DEV_CREATE_CMD: libc::c_ulong = 3;
const DM_DEV_REMOVE_CMD: libc::c_ulong = 4;
const DM_DEV_SUSPEND_CMD: libc::c_ulong = 6;
const DM_DEV_STATUS_CMD: libc::c_ulong = 7;
const DM_TABLE_LOAD_CMD: libc::c_ulong = 9;

// from <linux/dm-ioctl.h>; the kernel reads every field even when we don't
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

// from <linux/dm-ioctl.h>
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; 16],
}

/// Encode `_IOWR(DM_IOCTL_TYPE, nr, struct dm_ioctl)` as <asm-generic/ioctl.h> does.
const fn dm_request(nr: libc::c_ulong) -> libc::c_ulong {
    let size = std::mem::size_of::<DmIoctl>() as libc::c_ulong;
    (3 << 30) | (size << 16) | (DM_IOCTL_TYPE << 8) | nr
}

/// The single verity target of a device table, rendered in the
/// kernel's textual target-parameter format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerityTable {
    /// Length of the mapped device in 512-byte sectors.
    num_sectors: u64,
    params: String,
}

impl VerityTable {
    /// Build the verity target covering the data region of
    /// `data_device` as described by the given verified descriptor.
    pub fn new(verity: &ApexVerityData, data_device: &str) -> Self {
        let desc = &verity.descriptor;
        let num_data_blocks = desc.image_size / u64::from(desc.data_block_size);
        let hash_start_block = desc.tree_offset / u64::from(desc.hash_block_size);
        // the hash tree lives in the same device, past the data region
        let params = format!(
            "{} {data_device} {data_device} {} {} {num_data_blocks} {hash_start_block} {} {} {} 1 ignore_zero_blocks",
            desc.version,
            desc.data_block_size,
            desc.hash_block_size,
            desc.hash_algorithm,
            HEXLOWER.encode(&verity.root_digest),
            HEXLOWER.encode(&verity.salt),
        );
        Self {
            num_sectors: desc.image_size / SECTOR_SIZE,
            params,
        }
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    pub fn params(&self) -> &str {
        &self.params
    }
}

/// A named dm-verity block device.
///
/// The device is deleted again on drop unless the owning mount
/// transaction commits by calling [`DmVerityDevice::release`].
#[derive(Debug)]
pub struct DmVerityDevice {
    name: String,
    dev_path: PathBuf,
    control: PathBuf,
    cleared: bool,
}

impl DmVerityDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The block device node for this target, e.g. `/dev/block/dm-3`.
    pub fn dev_path(&self) -> &PathBuf {
        &self.dev_path
    }

    /// Keep the kernel device alive beyond this handle.
    pub fn release(mut self) {
        self.cleared = true;
    }
}

impl Drop for DmVerityDevice {
    fn drop(&mut self) {
        if self.cleared {
            return;
        }
        tracing::debug!(device = %self.name, "deleting unused verity device");
        if let Err(err) = delete_device_at(&self.control, &self.name) {
            tracing::warn!(device = %self.name, ?err, "failed to delete verity device");
        }
    }
}

fn open_control(config: &Config) -> Result<std::fs::File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.paths.dm_control)
        .map_err(|err| {
            Error::wrap_io(
                err,
                format!("Failed to open {}", config.paths.dm_control.display()),
            )
        })
}

fn init_header(buffer: &mut [u8], name: &str, flags: u32, target_count: u32) -> Result<()> {
    let header_size = std::mem::size_of::<DmIoctl>();
    if name.len() >= DM_NAME_LEN {
        return Err(Error::String(format!("Device name too long: {name}")));
    }
    let mut header: DmIoctl = unsafe { std::mem::zeroed() };
    header.version = [DM_VERSION_MAJOR, 0, 0];
    header.data_size = buffer.len() as u32;
    header.data_start = header_size as u32;
    header.target_count = target_count;
    header.flags = flags;
    header.name[..name.len()].copy_from_slice(name.as_bytes());
    let bytes = unsafe {
        std::slice::from_raw_parts(&header as *const DmIoctl as *const u8, header_size)
    };
    buffer[..header_size].copy_from_slice(bytes);
    Ok(())
}

fn read_header(buffer: &[u8]) -> DmIoctl {
    let mut header: DmIoctl = unsafe { std::mem::zeroed() };
    let size = std::mem::size_of::<DmIoctl>();
    unsafe {
        std::ptr::copy_nonoverlapping(
            buffer.as_ptr(),
            &mut header as *mut DmIoctl as *mut u8,
            size,
        );
    }
    header
}

fn dm_ioctl(control: &std::fs::File, request: libc::c_ulong, buffer: &mut [u8]) -> Result<DmIoctl> {
    Errno::result(unsafe {
        libc::ioctl(control.as_raw_fd(), request as _, buffer.as_mut_ptr())
    })?;
    Ok(read_header(buffer))
}

fn simple_command(
    control: &std::fs::File,
    request: libc::c_ulong,
    name: &str,
    flags: u32,
) -> Result<DmIoctl> {
    let mut buffer = vec![0u8; std::mem::size_of::<DmIoctl>()];
    init_header(&mut buffer, name, flags, 0)?;
    dm_ioctl(control, dm_request(request), &mut buffer)
}

fn delete_device_at(control_path: &PathBuf, name: &str) -> Result<()> {
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(control_path)
        .map_err(|err| Error::wrap_io(err, format!("Failed to open {}", control_path.display())))?;
    simple_command(&control, DM_DEV_REMOVE_CMD, name, 0)
        .map_err(|err| err.wrap(format!("Failed to delete device {name}")))?;
    Ok(())
}

fn device_exists(control: &std::fs::File, name: &str) -> bool {
    simple_command(control, DM_DEV_STATUS_CMD, name, 0).is_ok()
}

fn load_table(control: &std::fs::File, name: &str, table: &VerityTable) -> Result<()> {
    let header_size = std::mem::size_of::<DmIoctl>();
    let spec_size = std::mem::size_of::<DmTargetSpec>();
    // the params string is NUL terminated and padded to an 8 byte boundary
    let params_size = (table.params().len() + 1 + 7) & !7;
    let mut buffer = vec![0u8; header_size + spec_size + params_size];

    init_header(&mut buffer, name, DM_READONLY_FLAG, 1)?;

    let mut spec: DmTargetSpec = unsafe { std::mem::zeroed() };
    spec.sector_start = 0;
    spec.length = table.num_sectors();
    spec.next = (spec_size + params_size) as u32;
    spec.target_type[..b"verity".len()].copy_from_slice(b"verity");
    let spec_bytes =
        unsafe { std::slice::from_raw_parts(&spec as *const DmTargetSpec as *const u8, spec_size) };
    buffer[header_size..header_size + spec_size].copy_from_slice(spec_bytes);
    let params_start = header_size + spec_size;
    buffer[params_start..params_start + table.params().len()]
        .copy_from_slice(table.params().as_bytes());

    dm_ioctl(control, dm_request(DM_TABLE_LOAD_CMD), &mut buffer)
        .map_err(|err| err.wrap(format!("Failed to load verity table for {name}")))?;
    Ok(())
}

fn device_path_from(config: &Config, header: &DmIoctl) -> PathBuf {
    // dev_t as encoded by the kernel: 12 bit major, 20 bit minor
    let minor = (header.dev & 0xff) | ((header.dev >> 12) & 0xfff00);
    config.paths.dm_dev_dir.join(format!("dm-{minor}"))
}

/// Create a read-only dm-verity device with the given name and table.
///
/// An existing device by the same name is deleted first. The returned
/// handle owns the device and deletes it on drop; see
/// [`DmVerityDevice::release`].
pub fn create_verity(config: &Config, name: &str, table: &VerityTable) -> Result<DmVerityDevice> {
    let control = open_control(config)?;

    if device_exists(&control, name) {
        tracing::warn!(device = %name, "deleting existing dm device");
        simple_command(&control, DM_DEV_REMOVE_CMD, name, 0)
            .map_err(|err| err.wrap(format!("Failed to delete stale device {name}")))?;
    }

    simple_command(&control, DM_DEV_CREATE_CMD, name, 0).map_err(|err| {
        Error::ResourceBusy(format!("Couldn't create verity device {name}: {err}"))
    })?;
    let mut device = DmVerityDevice {
        name: name.to_string(),
        dev_path: PathBuf::new(),
        control: config.paths.dm_control.clone(),
        cleared: false,
    };

    load_table(&control, name, table)?;
    // resuming the fresh device activates the loaded table
    let header = simple_command(&control, DM_DEV_SUSPEND_CMD, name, 0)
        .map_err(|err| err.wrap(format!("Failed to activate verity device {name}")))?;
    device.dev_path = device_path_from(config, &header);

    tracing::debug!(device = %name, path = ?device.dev_path, "verity device created");
    Ok(device)
}
