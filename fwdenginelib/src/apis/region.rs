//! The RingRegion owns the shared memory of one netmap interface
//!
//! All rings, slots and packet buffers of the interface live in this one region.
//! The region is mapped once per interface and shared with every worker through an `Arc`,
//! it is unmapped when the last handle goes away.
//!
//! Raw offsets published by the kernel are only turned into pointers here and in `ring`,
//! after checking them against the region length.

use std::{
	alloc::{self, Layout},
	fmt, io, mem,
	os::unix::io::RawFd,
	ptr::{self, NonNull},
	sync::Arc,
};

use super::{sys, DeviceError, RegionError, Ring, RingKind};

enum Backing {
	Mapped,
	Heap(Layout),
}

pub struct RingRegion {
	base: NonNull<u8>,
	len: usize,
	backing: Backing,
}

// The region is plain shared memory, ownership of its rings is split between workers
unsafe impl Send for RingRegion {}
unsafe impl Sync for RingRegion {}

impl RingRegion {
	/// Maps `memsize` bytes of the netmap allocator behind `fd`
	pub fn map(fd: RawFd, memsize: usize) -> Result<Arc<Self>, DeviceError> {
		if memsize == 0 {
			return Err(DeviceError::Mmap(
				memsize,
				io::Error::new(io::ErrorKind::InvalidInput, "empty region"),
			));
		}
		let raw = unsafe {
			libc::mmap(
				ptr::null_mut(),
				memsize,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_SHARED,
				fd,
				0,
			)
		};
		if raw == libc::MAP_FAILED {
			return Err(DeviceError::Mmap(memsize, io::Error::last_os_error()));
		}
		match NonNull::new(raw as *mut u8) {
			Some(base) => {
				log::debug!("mapped {} bytes of netmap memory at {:p}", memsize, raw);
				Ok(Arc::new(Self {
					base,
					len: memsize,
					backing: Backing::Mapped,
				}))
			}
			None => Err(DeviceError::Mmap(
				memsize,
				io::Error::new(io::ErrorKind::Other, "null mapping"),
			)),
		}
	}

	/// Builds a region in anonymous memory with the same layout the kernel allocator uses
	///
	/// One interface descriptor at offset 0, then `tx_rings + 1` TX rings and `rx_rings + 1`
	/// RX rings (the extra ring of each block stands for the host stack), then the buffer pool.
	/// Buffers 0 and 1 are reserved, every slot starts out with a buffer of its own.
	/// TX rings start with `num_slots - 1` free slots, RX rings start empty.
	pub fn anonymous(layout: &RingLayout) -> Result<Arc<Self>, RegionError> {
		layout.validate()?;
		let plan = layout.plan();

		let mem_layout = Layout::from_size_align(plan.total, 64)
			.map_err(|_| RegionError::BadLayout("region too large"))?;
		let raw = unsafe { alloc::alloc_zeroed(mem_layout) };
		let base = NonNull::new(raw).ok_or(RegionError::NoMem(plan.total))?;
		let region = Self {
			base,
			len: plan.total,
			backing: Backing::Heap(mem_layout),
		};

		let n_rings = layout.tx_rings + 1 + layout.rx_rings + 1;
		unsafe {
			let nifp = raw as *mut sys::NetmapIf;
			(*nifp).ni_version = sys::NETMAP_API;
			(*nifp).ni_tx_rings = layout.tx_rings;
			(*nifp).ni_rx_rings = layout.rx_rings;
			let ring_ofs = raw.add(mem::size_of::<sys::NetmapIf>()) as *mut isize;

			let mut next_buf = 2u32;
			for r in 0..n_rings {
				let ring_off = plan.rings + r as usize * plan.ring_size;
				ptr::write(ring_ofs.add(r as usize), ring_off as isize);

				let ring = raw.add(ring_off) as *mut sys::NetmapRing;
				(*ring).buf_ofs = plan.buffers as isize - ring_off as isize;
				(*ring).num_slots = layout.num_slots;
				(*ring).nr_buf_size = layout.buf_size;
				(*ring).cur = 0;
				(*ring).avail = if r <= layout.tx_rings {
					layout.num_slots - 1
				} else {
					0
				};

				let slots = raw.add(ring_off + mem::size_of::<sys::NetmapRing>()) as *mut sys::NetmapSlot;
				for s in 0..layout.num_slots as usize {
					ptr::write(
						slots.add(s),
						sys::NetmapSlot {
							buf_idx: next_buf,
							len: 0,
							flags: 0,
						},
					);
					next_buf += 1;
				}
			}
		}

		Ok(Arc::new(region))
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.len
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Returns the raw pointer at `offset` once `offset..offset + size` is known to be inside
	pub(crate) fn checked_ptr(
		&self,
		what: &'static str,
		offset: isize,
		size: usize,
	) -> Result<NonNull<u8>, RegionError> {
		if offset < 0 || (offset as usize).checked_add(size).map_or(true, |end| end > self.len) {
			return Err(RegionError::OutOfBounds(what, offset, size, self.len));
		}
		// in bounds, so never null
		Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) })
	}

	/// Returns the view of the interface descriptor a `NIOCREGIF` placed at `offset`
	pub fn interface(self: &Arc<Self>, offset: usize) -> Result<IfView, RegionError> {
		let header = self.checked_ptr("interface", offset as isize, mem::size_of::<sys::NetmapIf>())?;
		let nifp = header.as_ptr() as *const sys::NetmapIf;
		let (tx_rings, rx_rings) = unsafe { ((*nifp).ni_tx_rings, (*nifp).ni_rx_rings) };
		// a zero TX count means "same as RX"
		let tx_rings = if tx_rings == 0 { rx_rings } else { tx_rings };

		let n_ofs = (tx_rings + 1 + rx_rings + 1) as usize;
		self.checked_ptr(
			"ring offsets",
			(offset + mem::size_of::<sys::NetmapIf>()) as isize,
			n_ofs * mem::size_of::<isize>(),
		)?;

		Ok(IfView {
			region: Arc::clone(self),
			offset,
			tx_rings,
			rx_rings,
		})
	}
}

impl fmt::Debug for RingRegion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("region@{:p}", self.base.as_ptr()))
			.field("len", &self.len)
			.field("mapped", &matches!(self.backing, Backing::Mapped))
			.finish()
	}
}

impl Drop for RingRegion {
	fn drop(&mut self) {
		match self.backing {
			Backing::Mapped => unsafe {
				if libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) != 0 {
					log::warn!("munmap failed: {}", io::Error::last_os_error());
				}
			},
			Backing::Heap(layout) => unsafe { alloc::dealloc(self.base.as_ptr(), layout) },
		}
	}
}

/// Geometry of an anonymous region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
	pub tx_rings: u32,
	pub rx_rings: u32,
	pub num_slots: u32,
	pub buf_size: u16,
	pub spare_bufs: u32,
}

impl Default for RingLayout {
	fn default() -> Self {
		Self {
			tx_rings: 1,
			rx_rings: 1,
			num_slots: 256,
			buf_size: 2048,
			spare_bufs: 0,
		}
	}
}

struct Plan {
	rings: usize,
	ring_size: usize,
	buffers: usize,
	total: usize,
}

const fn align8(n: usize) -> usize {
	(n + 7) & !7
}

impl RingLayout {
	fn validate(&self) -> Result<(), RegionError> {
		if self.rx_rings == 0 || self.tx_rings == 0 {
			return Err(RegionError::BadLayout("need at least one ring of each kind"));
		}
		if self.num_slots < 2 {
			return Err(RegionError::BadLayout("a ring needs at least two slots"));
		}
		if self.buf_size < 64 {
			return Err(RegionError::BadLayout("buffers smaller than 64 bytes"));
		}
		Ok(())
	}

	fn plan(&self) -> Plan {
		let n_rings = (self.tx_rings + 1 + self.rx_rings + 1) as usize;
		let rings = align8(mem::size_of::<sys::NetmapIf>() + n_rings * mem::size_of::<isize>());
		let ring_size = align8(
			mem::size_of::<sys::NetmapRing>() + self.num_slots as usize * mem::size_of::<sys::NetmapSlot>(),
		);
		let buffers = align8(rings + n_rings * ring_size);
		let n_bufs = 2 + n_rings * self.num_slots as usize + self.spare_bufs as usize;
		Plan {
			rings,
			ring_size,
			buffers,
			total: buffers + n_bufs * self.buf_size as usize,
		}
	}

	/// Total number of buffers in the pool, reserved ones included
	pub fn num_buffers(&self) -> u32 {
		2 + (self.tx_rings + 1 + self.rx_rings + 1) * self.num_slots + self.spare_bufs
	}
}

/// The interface descriptor as seen by one registered file descriptor
#[derive(Clone)]
pub struct IfView {
	region: Arc<RingRegion>,
	offset: usize,
	tx_rings: u32,
	rx_rings: u32,
}

impl IfView {
	#[inline]
	pub fn tx_rings(&self) -> u32 {
		self.tx_rings
	}

	#[inline]
	pub fn rx_rings(&self) -> u32 {
		self.rx_rings
	}

	#[inline]
	pub fn region(&self) -> &Arc<RingRegion> {
		&self.region
	}

	/// TX rings sit at `ring_ofs[0..n_tx]`
	pub fn tx_ring(&self, index: u32) -> Result<Ring, RegionError> {
		if index >= self.tx_rings {
			return Err(RegionError::NoSuchRing(RingKind::Tx, index, self.tx_rings));
		}
		self.ring_at(RingKind::Tx, index, index)
	}

	/// RX rings follow the TX block and its host ring, at `ring_ofs[n_tx + 1 + i]`
	pub fn rx_ring(&self, index: u32) -> Result<Ring, RegionError> {
		if index >= self.rx_rings {
			return Err(RegionError::NoSuchRing(RingKind::Rx, index, self.rx_rings));
		}
		self.ring_at(RingKind::Rx, index, index + self.tx_rings + 1)
	}

	fn ring_at(&self, kind: RingKind, index: u32, slot_in_ofs: u32) -> Result<Ring, RegionError> {
		let ofs_at = self.offset + mem::size_of::<sys::NetmapIf>() + slot_in_ofs as usize * mem::size_of::<isize>();
		let rel = unsafe { ptr::read_unaligned(self.region.base.as_ptr().add(ofs_at) as *const isize) };
		let ring_off = (self.offset as isize)
			.checked_add(rel)
			.ok_or(RegionError::BadLayout("ring offset overflow"))?;
		Ring::new(Arc::clone(&self.region), kind, index, ring_off)
	}
}

impl fmt::Debug for IfView {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IfView")
			.field("offset", &self.offset)
			.field("tx_rings", &self.tx_rings)
			.field("rx_rings", &self.rx_rings)
			.finish()
	}
}
