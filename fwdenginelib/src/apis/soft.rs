//! A software NIC over an anonymous region
//!
//! It plays the kernel side of the ring protocol: frames handed to `inject` show up in an RX ring
//! on the next `rx_sync`, and whatever a worker queued on a TX ring is collected on `tx_sync`.
//! Ring headers are only touched from inside the sync calls, i.e. on the worker's own thread.

use std::{
	collections::{HashMap, HashSet, VecDeque},
	io,
	sync::{Arc, Mutex, MutexGuard},
};

use super::{
	Acquired, Backend, DeviceError, IfView, NetmapInfo, RegionError, Ring, RingLayout, RingPort,
	RingRegion,
};

#[derive(Default)]
struct Queues {
	pending: HashMap<u32, VecDeque<Vec<u8>>>,
	sent: HashMap<u32, Vec<Vec<u8>>>,
	batches: HashMap<u32, Vec<usize>>,
	tx_head: HashMap<u32, u32>,
	refuse: HashSet<u16>,
	registrations: usize,
}

struct Shared {
	name: String,
	region: Arc<RingRegion>,
	view: IfView,
	layout: RingLayout,
	tx_capacity: u32,
	queues: Mutex<Queues>,
}

impl Shared {
	fn queues(&self) -> MutexGuard<'_, Queues> {
		self.queues.lock().unwrap_or_else(|e| e.into_inner())
	}
}

/// A software interface with its own region
#[derive(Clone)]
pub struct SoftNic {
	shared: Arc<Shared>,
}

impl SoftNic {
	pub fn new(name: &str, layout: RingLayout) -> Result<Self, RegionError> {
		Self::with_tx_capacity(name, layout, layout.num_slots.saturating_sub(1))
	}

	/// Like `new`, but TX rings never offer more than `tx_capacity` free slots
	pub fn with_tx_capacity(name: &str, layout: RingLayout, tx_capacity: u32) -> Result<Self, RegionError> {
		let region = RingRegion::anonymous(&layout)?;
		let view = region.interface(0)?;
		Ok(Self {
			shared: Arc::new(Shared {
				name: name.to_owned(),
				region,
				view,
				layout,
				tx_capacity: tx_capacity.min(layout.num_slots.saturating_sub(1)),
				queues: Mutex::new(Queues::default()),
			}),
		})
	}

	pub fn name(&self) -> &str {
		&self.shared.name
	}

	pub fn region(&self) -> &Arc<RingRegion> {
		&self.shared.region
	}

	pub fn view(&self) -> &IfView {
		&self.shared.view
	}

	/// Queues a frame for RX ring `ring`
	pub fn inject(&self, ring: u32, frame: &[u8]) {
		self.shared
			.queues()
			.pending
			.entry(ring)
			.or_default()
			.push_back(frame.to_vec());
	}

	/// Frames not yet delivered to RX ring `ring`
	pub fn pending(&self, ring: u32) -> usize {
		self.shared.queues().pending.get(&ring).map_or(0, |q| q.len())
	}

	/// Everything transmitted on TX ring `ring` so far, in order
	pub fn transmitted(&self, ring: u32) -> Vec<Vec<u8>> {
		self.shared.queues().sent.get(&ring).cloned().unwrap_or_default()
	}

	/// Number of frames each non empty `tx_sync` on TX ring `ring` picked up
	pub fn tx_batches(&self, ring: u32) -> Vec<usize> {
		self.shared.queues().batches.get(&ring).cloned().unwrap_or_default()
	}

	/// Makes registration of `ring_id` fail
	pub fn refuse_ring(&self, ring_id: u16) {
		self.shared.queues().refuse.insert(ring_id);
	}

	pub fn registrations(&self) -> usize {
		self.shared.queues().registrations
	}

	pub fn port(&self) -> SoftPort {
		SoftPort {
			shared: Arc::clone(&self.shared),
			rings: None,
		}
	}

	fn acquired(&self) -> Acquired {
		Acquired {
			name: self.shared.name.clone(),
			region: Arc::clone(&self.shared.region),
			info: NetmapInfo {
				memsize: self.shared.region.len(),
				tx_rings: self.shared.layout.tx_rings as u16,
				rx_rings: self.shared.layout.rx_rings as u16,
				tx_slots: self.shared.layout.num_slots,
				rx_slots: self.shared.layout.num_slots,
			},
			flags: libc::IFF_UP | libc::IFF_PROMISC,
		}
	}
}

/// The kernel side of one registered ring pair
pub struct SoftPort {
	shared: Arc<Shared>,
	rings: Option<(Ring, Ring)>,
}

impl RingPort for SoftPort {
	fn register(&mut self, ifname: &str, ring_id: u16) -> Result<usize, DeviceError> {
		let refuse = |why: &str| {
			DeviceError::RingRegister(
				ifname.to_owned(),
				ring_id,
				io::Error::new(io::ErrorKind::InvalidInput, why.to_owned()),
			)
		};
		if ifname != self.shared.name {
			return Err(refuse("no such interface"));
		}
		if self.shared.queues().refuse.contains(&ring_id) {
			return Err(refuse("ring refused"));
		}
		let rx = self.shared.view.rx_ring(ring_id as u32)?;
		let mut tx = self.shared.view.tx_ring(ring_id as u32)?;
		tx.set_available(self.shared.tx_capacity);

		let mut q = self.shared.queues();
		q.tx_head.insert(ring_id as u32, tx.cursor());
		q.registrations += 1;
		drop(q);

		self.rings = Some((rx, tx));
		Ok(0)
	}

	fn rx_sync(&mut self) -> io::Result<()> {
		let (rx, _) = self.rings.as_mut().ok_or_else(not_registered)?;
		let mut q = self.shared.queues();
		let pending = match q.pending.get_mut(&rx.index()) {
			Some(p) => p,
			None => return Ok(()),
		};
		let n = rx.num_slots();
		while rx.available() < n - 1 {
			let frame = match pending.pop_front() {
				Some(f) => f,
				None => break,
			};
			let at = (rx.cursor() + rx.available()) % n;
			let buf_idx = rx.slot(at).buffer_index();
			let buf = rx
				.buffer_mut(buf_idx)
				.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "rx buffer out of region"))?;
			let len = frame.len().min(buf.len());
			buf[..len].copy_from_slice(&frame[..len]);
			let slot = rx.slot_mut(at);
			slot.len = len as u16;
			slot.flags = 0;
			rx.set_available(rx.available() + 1);
		}
		Ok(())
	}

	fn tx_sync(&mut self) -> io::Result<()> {
		let (_, tx) = self.rings.as_mut().ok_or_else(not_registered)?;
		let mut q = self.shared.queues();
		let ring = tx.index();
		let mut head = q.tx_head.get(&ring).copied().unwrap_or(0);
		let mut out = Vec::new();
		while head != tx.cursor() {
			let (buf_idx, len) = {
				let s = tx.slot(head);
				(s.buffer_index(), s.length() as usize)
			};
			let frame = tx
				.buffer(buf_idx)
				.map(|b| b[..len.min(b.len())].to_vec())
				.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "tx buffer out of region"))?;
			out.push(frame);
			tx.slot_mut(head).flags = 0;
			head = tx.advance(head);
		}
		q.tx_head.insert(ring, head);
		if !out.is_empty() {
			q.batches.entry(ring).or_default().push(out.len());
			q.sent.entry(ring).or_default().extend(out);
		}
		tx.set_available(self.shared.tx_capacity);
		Ok(())
	}

	fn unregister(&mut self) -> io::Result<()> {
		self.rings.take().map(|_| ()).ok_or_else(not_registered)
	}
}

fn not_registered() -> io::Error {
	io::Error::new(io::ErrorKind::NotConnected, "port not registered")
}

/// A set of software interfaces, looked up by name
#[derive(Clone, Default)]
pub struct SoftBackend {
	nics: Arc<Mutex<HashMap<String, SoftNic>>>,
}

impl SoftBackend {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, nic: SoftNic) {
		self.nics
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(nic.name().to_owned(), nic);
	}

	pub fn nic(&self, name: &str) -> Option<SoftNic> {
		self.nics.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
	}
}

/// Ports of a software backend bind to whichever interface they are registered on
pub struct SoftBackendPort {
	backend: SoftBackend,
	inner: Option<SoftPort>,
}

impl RingPort for SoftBackendPort {
	fn register(&mut self, ifname: &str, ring_id: u16) -> Result<usize, DeviceError> {
		let nic = self.backend.nic(ifname).ok_or_else(|| {
			DeviceError::RingRegister(
				ifname.to_owned(),
				ring_id,
				io::Error::new(io::ErrorKind::NotFound, "no such interface"),
			)
		})?;
		let mut port = nic.port();
		let offset = port.register(ifname, ring_id)?;
		self.inner = Some(port);
		Ok(offset)
	}

	fn rx_sync(&mut self) -> io::Result<()> {
		self.inner.as_mut().ok_or_else(not_registered)?.rx_sync()
	}

	fn tx_sync(&mut self) -> io::Result<()> {
		self.inner.as_mut().ok_or_else(not_registered)?.tx_sync()
	}

	fn unregister(&mut self) -> io::Result<()> {
		self.inner.take().ok_or_else(not_registered)?.unregister()
	}
}

impl Backend for SoftBackend {
	type Port = SoftBackendPort;

	fn acquire(&self, ifname: &str) -> Result<Acquired, DeviceError> {
		self.nic(ifname).map(|nic| nic.acquired()).ok_or_else(|| {
			DeviceError::DeviceInfo(
				ifname.to_owned(),
				io::Error::new(io::ErrorKind::NotFound, "no such software interface"),
			)
		})
	}

	fn open_port(&self) -> Result<SoftBackendPort, DeviceError> {
		Ok(SoftBackendPort {
			backend: self.clone(),
			inner: None,
		})
	}

	fn release(&self, acquired: &Acquired) {
		log::info!("{}: released", acquired.name);
	}
}
