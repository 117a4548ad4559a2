//! This module defines the structures that are required to operate netmap rings
//!
//! Errors related to device, region and ring operations
//!
//! Interface acquisition and release, and a software NIC that stands in for the kernel

pub(crate) mod sys;

mod iface;
mod port;
mod region;
mod ring;
mod soft;

pub use iface::*;
pub use port::*;
pub use region::*;
pub use ring::*;
pub use soft::*;

use std::io;
use thiserror::Error;

pub(crate) trait WrappedIfName {
	fn to_ifname(self) -> Result<[u8; sys::IFNAMSIZ], DeviceError>;
}

impl WrappedIfName for &str {
	/// Copies the name into a fixed size, NUL padded buffer
	///
	/// Names longer than the buffer are truncated, the way the kernel ioctls expect
	#[inline]
	fn to_ifname(self) -> Result<[u8; sys::IFNAMSIZ], DeviceError> {
		if self.is_empty() || self.as_bytes().contains(&0) {
			return Err(DeviceError::InvalidName(self.to_owned()));
		}
		let mut name = [0u8; sys::IFNAMSIZ];
		let len = self.len().min(sys::IFNAMSIZ - 1);
		name[..len].copy_from_slice(&self.as_bytes()[..len]);
		Ok(name)
	}
}

impl WrappedIfName for &String {
	#[inline]
	fn to_ifname(self) -> Result<[u8; sys::IFNAMSIZ], DeviceError> {
		self.as_str().to_ifname()
	}
}

#[derive(Error, Debug)]
pub enum DeviceError {
	#[error("cannot open {}: {}", _0, _1)]
	DeviceOpen(&'static str, #[source] io::Error),
	#[error("cannot get info on {}: {}", _0, _1)]
	DeviceInfo(String, #[source] io::Error),
	#[error("unable to mmap {} bytes: {}", _0, _1)]
	Mmap(usize, #[source] io::Error),
	#[error("unable to register {} ring #{}: {}", _0, _1, _2)]
	RingRegister(String, u16, #[source] io::Error),
	#[error("invalid interface name {:?}", _0)]
	InvalidName(String),
	#[error("shared memory layout rejected: {}", _0)]
	Region(#[from] RegionError),
}

#[derive(Error, Debug)]
pub enum RegionError {
	#[error("{} at offset {} (+{} bytes) exceeds region of {} bytes", _0, _1, _2, _3)]
	OutOfBounds(&'static str, isize, usize, usize),
	#[error("no {} ring #{} (interface has {})", _0, _1, _2)]
	NoSuchRing(RingKind, u32, u32),
	#[error("bad layout: {}", _0)]
	BadLayout(&'static str),
	#[error("out of memory for a {} byte region", _0)]
	NoMem(usize),
}

/// A slot that refers to a reserved buffer, found by the corruption guard
///
/// Never propagated, only logged by the worker that found it
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wrong index on ring #{ring_id}: rx[{rx_slot}] = {rx_buf} -> tx[{tx_slot}] = {tx_buf}")]
pub struct CorruptSlot {
	pub ring_id: u16,
	pub rx_slot: u32,
	pub rx_buf: u32,
	pub tx_slot: u32,
	pub tx_buf: u32,
}

impl DeviceError {
	/// True for failures that take the whole interface down rather than one ring
	pub fn is_fatal_to_interface(&self) -> bool {
		!matches!(self, DeviceError::RingRegister(..))
	}
}
