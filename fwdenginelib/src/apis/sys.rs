//! Shared structures and request codes of the legacy netmap API (version 4)
//! and the handful of interface ioctls the engine needs
//!
//! These mirror the C layouts byte for byte; nothing in here is safe to touch
//! outside of `region`, `ring`, `port` and `iface`.

#![allow(dead_code)]

use std::{mem, os::raw};

pub const NETMAP_DEVICE: &str = "/dev/netmap";
pub const NETMAP_API: u32 = 4;
pub const NETMAP_HW_RING: u16 = 0x4000;

/// Set on a slot whose buffer index was changed by user space
pub const NS_BUF_CHANGED: u16 = 0x0001;

pub const IFNAMSIZ: usize = 16;

/// Request block for `NIOCGINFO` and `NIOCREGIF`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NmReq {
	pub nr_name: [u8; IFNAMSIZ],
	pub nr_version: u32,
	pub nr_offset: u32,
	pub nr_memsize: u32,
	pub nr_tx_slots: u32,
	pub nr_rx_slots: u32,
	pub nr_tx_rings: u16,
	pub nr_rx_rings: u16,
	pub nr_ringid: u16,
	pub nr_cmd: u16,
	pub nr_arg1: u16,
	pub nr_arg2: u16,
	pub spare2: [u32; 3],
}

/// Per file descriptor interface descriptor, followed by `ring_ofs`
#[repr(C)]
pub struct NetmapIf {
	pub ni_name: [u8; IFNAMSIZ],
	pub ni_version: u32,
	pub ni_rx_rings: u32,
	pub ni_tx_rings: u32,
	pub ring_ofs: [isize; 0],
}

/// Ring header, followed by `num_slots` slots
#[repr(C)]
pub struct NetmapRing {
	pub buf_ofs: isize,
	pub num_slots: u32,
	pub avail: u32,
	pub cur: u32,
	pub reserved: u32,
	pub nr_buf_size: u16,
	pub flags: u16,
	pub ts: libc::timeval,
	pub slot: [NetmapSlot; 0],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetmapSlot {
	pub buf_idx: u32,
	pub len: u16,
	pub flags: u16,
}

const IOC_NONE: raw::c_ulong = 0;
const IOC_WRITE: raw::c_ulong = 1;
const IOC_READ: raw::c_ulong = 2;

const fn ioc(dir: raw::c_ulong, ty: u8, nr: u8, size: usize) -> raw::c_ulong {
	(dir << 30) | ((size as raw::c_ulong) << 16) | ((ty as raw::c_ulong) << 8) | nr as raw::c_ulong
}

pub const NIOCGINFO: raw::c_ulong = ioc(IOC_READ | IOC_WRITE, b'i', 145, mem::size_of::<NmReq>());
pub const NIOCREGIF: raw::c_ulong = ioc(IOC_READ | IOC_WRITE, b'i', 146, mem::size_of::<NmReq>());
pub const NIOCUNREGIF: raw::c_ulong = ioc(IOC_NONE, b'i', 147, 0);
pub const NIOCTXSYNC: raw::c_ulong = ioc(IOC_NONE, b'i', 148, 0);
pub const NIOCRXSYNC: raw::c_ulong = ioc(IOC_NONE, b'i', 149, 0);

pub const SIOCGIFFLAGS: raw::c_ulong = 0x8913;
pub const SIOCSIFFLAGS: raw::c_ulong = 0x8914;
pub const SIOCETHTOOL: raw::c_ulong = 0x8946;

pub const ETHTOOL_SRXCSUM: u32 = 0x0000_0015;
pub const ETHTOOL_STXCSUM: u32 = 0x0000_0017;
pub const ETHTOOL_STSO: u32 = 0x0000_001f;
pub const ETHTOOL_SGSO: u32 = 0x0000_0024;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EthtoolValue {
	pub cmd: u32,
	pub data: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union IfrIfru {
	pub ifru_flags: raw::c_short,
	pub ifru_data: *mut raw::c_void,
	pad: [u8; 24],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IfReq {
	pub ifr_name: [u8; IFNAMSIZ],
	pub ifr_ifru: IfrIfru,
}

impl IfReq {
	pub fn new(name: [u8; IFNAMSIZ]) -> Self {
		Self {
			ifr_name: name,
			ifr_ifru: IfrIfru { pad: [0u8; 24] },
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn abi_sizes() {
		assert_eq!(mem::size_of::<NmReq>(), 60);
		assert_eq!(mem::size_of::<NetmapSlot>(), 8);
		assert_eq!(mem::size_of::<NetmapIf>(), 32);
		assert_eq!(mem::size_of::<NetmapRing>(), 48);
		assert_eq!(mem::size_of::<IfReq>(), 40);
	}

	#[test]
	fn request_codes() {
		assert_eq!(NIOCGINFO, 0xc03c_6991);
		assert_eq!(NIOCREGIF, 0xc03c_6992);
		assert_eq!(NIOCUNREGIF, 0x6993);
		assert_eq!(NIOCRXSYNC, 0x6995);
	}
}
