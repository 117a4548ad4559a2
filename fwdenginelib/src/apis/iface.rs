//! Interface acquisition and release
//!
//! Acquiring an interface maps its netmap region and prepares the NIC for raw forwarding:
//! up, promiscuous, segmentation and checksum offloads off. Only the mapping is mandatory,
//! the interface tweaks are best effort and merely logged when they fail.

use std::{
	io,
	os::unix::io::{AsRawFd, RawFd},
	sync::Arc,
};

use super::{sys, DeviceError, NetmapInfo, Port, RingPort, RingRegion, WrappedIfName};

/// An interface whose region is mapped and which is set up for forwarding
#[derive(Debug, Clone)]
pub struct Acquired {
	pub name: String,
	pub region: Arc<RingRegion>,
	pub info: NetmapInfo,
	/// Interface flags as they were set at acquisition
	pub flags: i32,
}

/// Where interfaces and worker ports come from
pub trait Backend: Send + Sync + 'static {
	type Port: RingPort + 'static;

	fn acquire(&self, ifname: &str) -> Result<Acquired, DeviceError>;
	fn open_port(&self) -> Result<Self::Port, DeviceError>;
	fn release(&self, acquired: &Acquired);
}

/// The kernel netmap device
#[derive(Debug, Default, Clone, Copy)]
pub struct Netmap;

impl Backend for Netmap {
	type Port = Port;

	fn acquire(&self, ifname: &str) -> Result<Acquired, DeviceError> {
		acquire(ifname)
	}

	fn open_port(&self) -> Result<Port, DeviceError> {
		Port::open()
	}

	fn release(&self, acquired: &Acquired) {
		release(&acquired.name, acquired.flags)
	}
}

struct ControlSocket(RawFd);

impl ControlSocket {
	fn open() -> io::Result<Self> {
		match unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) } {
			-1 => Err(io::Error::last_os_error()),
			fd => Ok(Self(fd)),
		}
	}

	fn ioctl(&self, code: libc::c_ulong, ifr: &mut sys::IfReq) -> io::Result<()> {
		match unsafe { libc::ioctl(self.0, code as _, ifr as *mut sys::IfReq) } {
			-1 => Err(io::Error::last_os_error()),
			_ => Ok(()),
		}
	}
}

impl AsRawFd for ControlSocket {
	fn as_raw_fd(&self) -> RawFd {
		self.0
	}
}

impl Drop for ControlSocket {
	fn drop(&mut self) {
		unsafe { libc::close(self.0) };
	}
}

fn ifreq_for(ifname: &str) -> io::Result<sys::IfReq> {
	ifname
		.to_ifname()
		.map(sys::IfReq::new)
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

pub fn interface_flags(ifname: &str) -> io::Result<i32> {
	let mut ifr = ifreq_for(ifname)?;
	ControlSocket::open()?.ioctl(sys::SIOCGIFFLAGS, &mut ifr)?;
	Ok(unsafe { ifr.ifr_ifru.ifru_flags } as u16 as i32)
}

pub fn set_interface_flags(ifname: &str, flags: i32) -> io::Result<()> {
	let mut ifr = ifreq_for(ifname)?;
	ifr.ifr_ifru.ifru_flags = (flags & 0xffff) as u16 as libc::c_short;
	ControlSocket::open()?.ioctl(sys::SIOCSIFFLAGS, &mut ifr)
}

/// Sends an ethtool `set` sub-command with a zero value, switching that offload off
pub fn disable_offload(ifname: &str, cmd: u32) -> io::Result<()> {
	let mut ifr = ifreq_for(ifname)?;
	let mut eval = sys::EthtoolValue { cmd, data: 0 };
	ifr.ifr_ifru.ifru_data = &mut eval as *mut sys::EthtoolValue as *mut libc::c_void;
	ControlSocket::open()?.ioctl(sys::SIOCETHTOOL, &mut ifr)
}

const OFFLOADS: [(u32, &str); 4] = [
	(sys::ETHTOOL_SGSO, "gso"),
	(sys::ETHTOOL_STSO, "tso"),
	(sys::ETHTOOL_SRXCSUM, "rx checksum"),
	(sys::ETHTOOL_STXCSUM, "tx checksum"),
];

/// Maps the region of `ifname` and prepares the interface
pub fn acquire(ifname: &str) -> Result<Acquired, DeviceError> {
	ifname.to_ifname()?;
	let port = Port::open()?;
	let info = port.info(ifname)?;
	// the mapping outlives the control handle
	let region = RingRegion::map(port.as_raw_fd(), info.memsize)?;
	drop(port);

	let mut flags = interface_flags(ifname).unwrap_or_else(|e| {
		log::warn!("{}: cannot read interface flags: {}", ifname, e);
		0
	});
	flags |= libc::IFF_UP | libc::IFF_PROMISC;
	if let Err(e) = set_interface_flags(ifname, flags) {
		log::warn!("{}: cannot set up/promisc: {}", ifname, e);
	}
	for (cmd, what) in OFFLOADS.iter() {
		if let Err(e) = disable_offload(ifname, *cmd) {
			log::warn!("{}: cannot disable {} offload: {}", ifname, what, e);
		}
	}

	log::info!(
		"{}: acquired {} tx / {} rx rings, {} bytes of shared memory",
		ifname,
		info.tx_rings,
		info.rx_rings,
		info.memsize
	);
	Ok(Acquired {
		name: ifname.to_owned(),
		region,
		info,
		flags,
	})
}

/// Takes the interface out of promiscuous mode, leaving it up
pub fn release(ifname: &str, flags: i32) {
	if let Err(e) = set_interface_flags(ifname, flags & !libc::IFF_PROMISC) {
		log::warn!("{}: cannot clear promisc: {}", ifname, e);
	} else {
		log::info!("{}: released", ifname);
	}
}
