//! The Port structure is a wrapper around one open handle on the netmap control device
//!
//! The engine opens a port once per interface to learn the geometry and map the shared region,
//! then every worker opens its own port and binds it to a single hardware ring.

use std::{
	fs::{File, OpenOptions},
	io,
	os::unix::io::{AsRawFd, RawFd},
	ptr,
};

use super::{sys, DeviceError, WrappedIfName};

/// What `NIOCGINFO` reports about an interface
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetmapInfo {
	pub memsize: usize,
	pub tx_rings: u16,
	pub rx_rings: u16,
	pub tx_slots: u32,
	pub rx_slots: u32,
}

/// The per-worker device handle
///
/// Everything a worker does to the device between the hot loop iterations goes through this
/// trait, so the loop can be driven by a real netmap port or by a software one.
pub trait RingPort: Send {
	/// Binds the handle to hardware ring `ring_id` of `ifname`
	///
	/// Returns the offset of the interface descriptor inside the shared region.
	fn register(&mut self, ifname: &str, ring_id: u16) -> Result<usize, DeviceError>;
	fn rx_sync(&mut self) -> io::Result<()>;
	fn tx_sync(&mut self) -> io::Result<()>;
	fn unregister(&mut self) -> io::Result<()>;
}

pub struct Port {
	file: File,
	bound: Option<(String, u16)>,
}

impl Port {
	pub fn open() -> Result<Self, DeviceError> {
		OpenOptions::new()
			.read(true)
			.write(true)
			.open(sys::NETMAP_DEVICE)
			.map(|file| Self { file, bound: None })
			.map_err(|e| DeviceError::DeviceOpen(sys::NETMAP_DEVICE, e))
	}

	/// Queries memory size and ring counts of `ifname`
	pub fn info(&self, ifname: &str) -> Result<NetmapInfo, DeviceError> {
		let mut req = Self::request_for(ifname)?;
		self.ioctl_with(sys::NIOCGINFO, &mut req)
			.map_err(|e| DeviceError::DeviceInfo(ifname.to_owned(), e))?;
		Ok(NetmapInfo {
			memsize: req.nr_memsize as usize,
			tx_rings: req.nr_tx_rings,
			rx_rings: req.nr_rx_rings,
			tx_slots: req.nr_tx_slots,
			rx_slots: req.nr_rx_slots,
		})
	}

	/// The interface and ring this port is bound to, if any
	pub fn bound(&self) -> Option<(&str, u16)> {
		self.bound.as_ref().map(|(name, id)| (name.as_str(), *id))
	}

	fn request_for(ifname: &str) -> Result<sys::NmReq, DeviceError> {
		Ok(sys::NmReq {
			nr_name: ifname.to_ifname()?,
			nr_version: sys::NETMAP_API,
			..sys::NmReq::default()
		})
	}

	fn ioctl_with(&self, code: libc::c_ulong, req: &mut sys::NmReq) -> io::Result<()> {
		match unsafe { libc::ioctl(self.file.as_raw_fd(), code as _, req as *mut sys::NmReq) } {
			-1 => Err(io::Error::last_os_error()),
			_ => Ok(()),
		}
	}

	fn ioctl_bare(&self, code: libc::c_ulong) -> io::Result<()> {
		match unsafe { libc::ioctl(self.file.as_raw_fd(), code as _, ptr::null_mut::<libc::c_void>()) } {
			-1 => Err(io::Error::last_os_error()),
			_ => Ok(()),
		}
	}
}

impl RingPort for Port {
	fn register(&mut self, ifname: &str, ring_id: u16) -> Result<usize, DeviceError> {
		let mut req = Self::request_for(ifname)?;
		req.nr_ringid = sys::NETMAP_HW_RING | ring_id;
		self.ioctl_with(sys::NIOCREGIF, &mut req)
			.map_err(|e| DeviceError::RingRegister(ifname.to_owned(), ring_id, e))?;
		self.bound = Some((ifname.to_owned(), ring_id));
		Ok(req.nr_offset as usize)
	}

	#[inline]
	fn rx_sync(&mut self) -> io::Result<()> {
		self.ioctl_bare(sys::NIOCRXSYNC)
	}

	#[inline]
	fn tx_sync(&mut self) -> io::Result<()> {
		self.ioctl_bare(sys::NIOCTXSYNC)
	}

	fn unregister(&mut self) -> io::Result<()> {
		self.bound = None;
		self.ioctl_bare(sys::NIOCUNREGIF)
	}
}

impl AsRawFd for Port {
	fn as_raw_fd(&self) -> RawFd {
		self.file.as_raw_fd()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn requests_carry_name_and_version() {
		let req = Port::request_for("eth0").unwrap();
		assert_eq!(&req.nr_name[..5], b"eth0\0");
		assert_eq!(req.nr_version, sys::NETMAP_API);
		assert_eq!(req.nr_ringid, 0);
	}

	#[test]
	fn empty_names_are_refused() {
		assert!(matches!(Port::request_for(""), Err(DeviceError::InvalidName(_))));
	}
}
