//! Typed views over single netmap rings and their slots
//!
//! A `Ring` is created once from validated offsets (see `IfView`) and then handed to the one
//! worker that owns it. Header fields the kernel rewrites on every sync (`cur`, `avail`) are
//! read and written with volatile accesses.

use std::{
	fmt, mem,
	ptr::{self, NonNull},
	slice,
	sync::Arc,
};

use super::{sys, RegionError, RingRegion};

pub use super::sys::NetmapSlot as Slot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RingKind {
	Tx,
	Rx,
}

impl fmt::Display for RingKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RingKind::Tx => write!(f, "tx"),
			RingKind::Rx => write!(f, "rx"),
		}
	}
}

impl Slot {
	/// Buffer indices below this are reserved by the allocator
	pub const FIRST_VALID_BUFFER: u32 = 2;

	#[inline]
	pub fn buffer_index(&self) -> u32 {
		self.buf_idx
	}

	#[inline]
	pub fn length(&self) -> u16 {
		self.len
	}

	#[inline]
	pub fn is_changed(&self) -> bool {
		self.flags & sys::NS_BUF_CHANGED != 0
	}

	#[inline]
	pub fn mark_changed(&mut self) {
		self.flags |= sys::NS_BUF_CHANGED;
	}

	#[inline]
	pub fn is_reserved(&self) -> bool {
		self.buf_idx < Self::FIRST_VALID_BUFFER
	}

	/// Hands the buffer of this (RX) slot over to `tx` and takes the TX buffer in exchange
	///
	/// Only the two indices and the length move, the payload stays where it is.
	#[inline]
	pub fn exchange(&mut self, tx: &mut Slot) {
		mem::swap(&mut self.buf_idx, &mut tx.buf_idx);
		tx.len = self.len;
		tx.mark_changed();
		self.mark_changed();
	}
}

pub struct Ring {
	region: Arc<RingRegion>,
	raw: NonNull<sys::NetmapRing>,
	slots: NonNull<Slot>,
	kind: RingKind,
	index: u32,
	num_slots: u32,
	buf_base: isize,
	buf_size: usize,
}

// A ring is owned by exactly one worker thread at a time
unsafe impl Send for Ring {}

impl Ring {
	pub(crate) fn new(
		region: Arc<RingRegion>,
		kind: RingKind,
		index: u32,
		ring_off: isize,
	) -> Result<Self, RegionError> {
		let raw = region
			.checked_ptr("ring header", ring_off, mem::size_of::<sys::NetmapRing>())?
			.cast::<sys::NetmapRing>();
		let (num_slots, buf_ofs, buf_size) = unsafe {
			let r = raw.as_ref();
			(r.num_slots, r.buf_ofs, r.nr_buf_size as usize)
		};
		if num_slots == 0 {
			return Err(RegionError::BadLayout("ring without slots"));
		}
		if buf_size == 0 {
			return Err(RegionError::BadLayout("zero sized buffers"));
		}
		let slots = region
			.checked_ptr(
				"slot array",
				ring_off + mem::size_of::<sys::NetmapRing>() as isize,
				num_slots as usize * mem::size_of::<Slot>(),
			)?
			.cast::<Slot>();
		let buf_base = ring_off
			.checked_add(buf_ofs)
			.ok_or(RegionError::BadLayout("buffer offset overflow"))?;

		Ok(Self {
			region,
			raw,
			slots,
			kind,
			index,
			num_slots,
			buf_base,
			buf_size,
		})
	}

	#[inline]
	pub fn kind(&self) -> RingKind {
		self.kind
	}

	#[inline]
	pub fn index(&self) -> u32 {
		self.index
	}

	#[inline]
	pub fn num_slots(&self) -> u32 {
		self.num_slots
	}

	#[inline]
	pub fn buf_size(&self) -> usize {
		self.buf_size
	}

	/// Current read (RX) or write (TX) position
	#[inline]
	pub fn cursor(&self) -> u32 {
		unsafe { ptr::read_volatile(ptr::addr_of!((*self.raw.as_ptr()).cur)) }
	}

	#[inline]
	pub fn set_cursor(&mut self, cur: u32) {
		unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.raw.as_ptr()).cur), cur) }
	}

	/// Slots ready to be consumed (RX) or free to be filled (TX)
	#[inline]
	pub fn available(&self) -> u32 {
		unsafe { ptr::read_volatile(ptr::addr_of!((*self.raw.as_ptr()).avail)) }
	}

	#[inline]
	pub fn set_available(&mut self, avail: u32) {
		unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.raw.as_ptr()).avail), avail) }
	}

	/// The slot after `i`, wrapping at the end of the ring
	#[inline]
	pub fn advance(&self, i: u32) -> u32 {
		i.wrapping_add(1) % self.num_slots
	}

	/// True when the header published by the kernel is usable
	#[inline]
	pub fn is_sane(&self) -> bool {
		self.cursor() < self.num_slots && self.available() <= self.num_slots
	}

	#[inline]
	pub fn slot(&self, i: u32) -> &Slot {
		assert!(i < self.num_slots, "slot {} out of {}", i, self.num_slots);
		unsafe { &*self.slots.as_ptr().add(i as usize) }
	}

	#[inline]
	pub fn slot_mut(&mut self, i: u32) -> &mut Slot {
		assert!(i < self.num_slots, "slot {} out of {}", i, self.num_slots);
		unsafe { &mut *self.slots.as_ptr().add(i as usize) }
	}

	#[inline]
	fn buffer_ptr(&self, buf_idx: u32) -> Option<NonNull<u8>> {
		let off = (buf_idx as isize)
			.checked_mul(self.buf_size as isize)?
			.checked_add(self.buf_base)?;
		self.region.checked_ptr("buffer", off, self.buf_size).ok()
	}

	/// The whole packet buffer `buf_idx`, `None` when it lies outside the region
	#[inline]
	pub fn buffer(&self, buf_idx: u32) -> Option<&[u8]> {
		let p = self.buffer_ptr(buf_idx)?;
		Some(unsafe { slice::from_raw_parts(p.as_ptr(), self.buf_size) })
	}

	#[inline]
	pub fn buffer_mut(&mut self, buf_idx: u32) -> Option<&mut [u8]> {
		let p = self.buffer_ptr(buf_idx)?;
		Some(unsafe { slice::from_raw_parts_mut(p.as_ptr(), self.buf_size) })
	}

	/// The frame held by slot `i`, cut to the slot length
	#[inline]
	pub fn frame_mut(&mut self, i: u32) -> Option<&mut [u8]> {
		let (buf_idx, len) = {
			let s = self.slot(i);
			(s.buf_idx, s.len as usize)
		};
		if len > self.buf_size {
			return None;
		}
		self.buffer_mut(buf_idx).map(|b| &mut b[..len])
	}
}

impl fmt::Debug for Ring {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&format!("{}ring#{}", self.kind, self.index))
			.field("num_slots", &self.num_slots)
			.field("cur", &self.cursor())
			.field("avail", &self.available())
			.field("buf_size", &self.buf_size)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::RingLayout;

	fn rings(num_slots: u32) -> (Ring, Ring) {
		let layout = RingLayout {
			num_slots,
			..RingLayout::default()
		};
		let region = RingRegion::anonymous(&layout).unwrap();
		let nifp = region.interface(0).unwrap();
		(nifp.rx_ring(0).unwrap(), nifp.tx_ring(0).unwrap())
	}

	#[test]
	fn advance_wraps_at_the_end() {
		let (rx, _) = rings(4);
		assert_eq!(rx.advance(0), 1);
		assert_eq!(rx.advance(2), 3);
		assert_eq!(rx.advance(3), 0);
	}

	#[test]
	fn exchange_moves_indices_and_length() {
		let mut rs = Slot {
			buf_idx: 10,
			len: 100,
			flags: 0,
		};
		let mut ts = Slot {
			buf_idx: 20,
			len: 0,
			flags: 0,
		};
		rs.exchange(&mut ts);
		assert_eq!(rs.buffer_index(), 20);
		assert_eq!(ts.buffer_index(), 10);
		assert_eq!(ts.length(), 100);
		assert!(rs.is_changed() && ts.is_changed());
	}

	#[test]
	fn buffers_are_bounds_checked() {
		let layout = RingLayout {
			num_slots: 4,
			..RingLayout::default()
		};
		let (rx, _) = rings(4);
		assert!(rx.buffer(layout.num_buffers() - 1).is_some());
		assert!(rx.buffer(layout.num_buffers()).is_none());
		assert!(rx.buffer(u32::MAX).is_none());
	}

	#[test]
	fn frame_follows_slot_length() {
		let (mut rx, _) = rings(4);
		rx.slot_mut(1).len = 60;
		let frame = rx.frame_mut(1).unwrap();
		assert_eq!(frame.len(), 60);
		frame[0] = 0xab;
		let idx = rx.slot(1).buffer_index();
		assert_eq!(rx.buffer(idx).unwrap()[0], 0xab);
	}

	#[test]
	fn header_fields_round_trip() {
		let (mut rx, _) = rings(8);
		rx.set_cursor(5);
		rx.set_available(3);
		assert_eq!(rx.cursor(), 5);
		assert_eq!(rx.available(), 3);
		assert!(rx.is_sane());
		rx.set_cursor(8);
		assert!(!rx.is_sane());
	}
}
