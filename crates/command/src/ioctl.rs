//! Legacy ioctl request codes
//!
//! Codes follow the Linux `_IOC` layout: direction in bits 30-31, argument
//! size in bits 16-29, type (magic) in bits 8-15 and number in bits 0-7.

use libc::{c_int, c_ulong};
use std::mem::size_of;

pub const MAGIC: u8 = 0xEB;
pub const BASE: u8 = 0x90 + b'M';

const DIR_NONE: u32 = 0;
const DIR_WRITE: u32 = 1;
const DIR_READ: u32 = 2;

const fn ioc(dir: u32, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((MAGIC as u32) << 8) | (BASE + nr) as u32
}

pub const DRV_VERSION: u32 = ioc(DIR_READ, 0, size_of::<c_int>());
pub const READ_REG8: u32 = ioc(DIR_READ, 1, size_of::<c_ulong>());
pub const READ_REG16: u32 = ioc(DIR_READ, 2, size_of::<c_ulong>());
pub const READ_REG32: u32 = ioc(DIR_READ, 3, size_of::<c_ulong>());
pub const WRITE_REG8: u32 = ioc(DIR_WRITE, 4, size_of::<c_ulong>());
pub const WRITE_REG16: u32 = ioc(DIR_WRITE, 5, size_of::<c_ulong>());
pub const WRITE_REG32: u32 = ioc(DIR_WRITE, 6, size_of::<c_ulong>());
pub const SET_MMAP_INDEX: u32 = ioc(DIR_WRITE, 7, size_of::<c_int>());
pub const GET_PEAKS_DATA: u32 = ioc(DIR_READ, 8, size_of::<c_int>());
pub const PEAKS_DATA_READY: u32 = ioc(DIR_READ, 9, size_of::<c_ulong>());
pub const GET_SPECTRUM: u32 = ioc(DIR_READ, 10, size_of::<c_int>());
pub const FS_DATA_READY: u32 = ioc(DIR_READ, 11, size_of::<c_ulong>());
pub const CANCEL_READ: u32 = ioc(DIR_NONE, 12, 0);

/// Argument block of the register read/write requests
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterArg {
    pub reg: u32,
    pub value: u32,
}
