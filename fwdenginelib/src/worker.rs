//! The forwarding worker
//!
//! One worker owns one RX ring and the TX ring with the same index. It registers its own port on
//! that ring pair, waits for the link to settle and then moves frames from RX to TX by swapping
//! buffer indices between slots, until the engine stops.

use std::{
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicU8, Ordering},
		Arc, Mutex,
	},
	thread,
};

use crate::{
	apis::{CorruptSlot, DeviceError, Ring, RingPort, RingRegion},
	config::WorkerConfig,
	decision::Forwarding,
	stats::{sleep_while_running, Counters},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
	Registering = 0,
	Warmup = 1,
	Running = 2,
	Draining = 3,
	Terminated = 4,
}

impl WorkerState {
	/// Whether the worker thread is still before its draining step
	#[inline]
	pub fn is_live(self) -> bool {
		matches!(self, WorkerState::Registering | WorkerState::Warmup | WorkerState::Running)
	}

	fn from_u8(v: u8) -> Self {
		match v {
			0 => WorkerState::Registering,
			1 => WorkerState::Warmup,
			2 => WorkerState::Running,
			3 => WorkerState::Draining,
			_ => WorkerState::Terminated,
		}
	}
}

impl fmt::Display for WorkerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			WorkerState::Registering => "registering",
			WorkerState::Warmup => "warmup",
			WorkerState::Running => "running",
			WorkerState::Draining => "draining",
			WorkerState::Terminated => "terminated",
		};
		f.write_str(s)
	}
}

/// Lifecycle state of a worker, readable from any thread
#[derive(Clone, Debug)]
pub struct StateCell(Arc<StateInner>);

#[derive(Debug)]
struct StateInner {
	state: AtomicU8,
	// held while a worker leaves the live states and while someone acts on its live thread
	exit: Mutex<()>,
}

impl Default for StateCell {
	fn default() -> Self {
		Self(Arc::new(StateInner {
			state: AtomicU8::new(WorkerState::Registering as u8),
			exit: Mutex::new(()),
		}))
	}
}

impl StateCell {
	#[inline]
	pub fn get(&self) -> WorkerState {
		WorkerState::from_u8(self.0.state.load(Ordering::Acquire))
	}

	pub(crate) fn set(&self, state: WorkerState) {
		if state.is_live() {
			self.0.state.store(state as u8, Ordering::Release);
		} else {
			let _exit = self.0.exit.lock().unwrap_or_else(|e| e.into_inner());
			self.0.state.store(state as u8, Ordering::Release);
		}
	}

	/// Runs `f` only while the worker is live, its thread cannot exit before `f` returns
	pub fn while_live<R, F: FnOnce() -> R>(&self, f: F) -> Option<R> {
		let _exit = self.0.exit.lock().unwrap_or_else(|e| e.into_inner());
		match self.get().is_live() {
			true => Some(f()),
			false => None,
		}
	}
}

/// What one pass over a ring pair did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Batch {
	/// RX slots consumed
	pub consumed: u32,
	pub transmitted: u32,
	pub dropped: u32,
	/// RX frames left behind because the TX ring was full
	pub leftover: u32,
	/// A reserved buffer index or an impossible ring header was seen
	pub corrupt: bool,
}

/// Moves up to `min(rx.available, tx.available)` frames from `rx` to `tx`
///
/// Frames the forwarding decision rejects stay in their RX buffer, which the kernel reuses.
pub fn process_rings(rx: &mut Ring, tx: &mut Ring, forwarding: &Forwarding) -> Batch {
	let mut batch = Batch::default();
	if !rx.is_sane() || !tx.is_sane() {
		log::error!(
			"ring #{}: bad ring header rx(cur {}, avail {}) tx(cur {}, avail {}) of {} slots",
			rx.index(),
			rx.cursor(),
			rx.available(),
			tx.cursor(),
			tx.available(),
			rx.num_slots()
		);
		batch.corrupt = true;
		return batch;
	}

	let mut j = rx.cursor();
	let mut k = tx.cursor();
	let rx_avail = rx.available();
	let limit = rx_avail.min(tx.available());

	for _ in 0..limit {
		let (rs_buf, ts_buf) = (rx.slot(j).buffer_index(), tx.slot(k).buffer_index());
		if rx.slot(j).is_reserved() || tx.slot(k).is_reserved() {
			let e = CorruptSlot {
				ring_id: rx.index() as u16,
				rx_slot: j,
				rx_buf: rs_buf,
				tx_slot: k,
				tx_buf: ts_buf,
			};
			log::error!("{}", e);
			batch.corrupt = true;
			batch.dropped += 1;
			j = rx.advance(j);
			continue;
		}

		let transmit = match rx.frame_mut(j) {
			Some(frame) => forwarding.decide(frame).transmit,
			None => false,
		};
		if transmit {
			rx.slot_mut(j).exchange(tx.slot_mut(k));
			k = tx.advance(k);
			tx.set_cursor(k);
			tx.set_available(tx.available() - 1);
			batch.transmitted += 1;
		} else {
			batch.dropped += 1;
		}
		j = rx.advance(j);
	}

	rx.set_available(rx_avail - limit);
	rx.set_cursor(j);
	batch.consumed = limit;
	batch.leftover = rx_avail - limit;
	batch
}

/// A worker ready to be started on its own thread
pub struct Worker<P: RingPort> {
	ifname: String,
	ring_id: u16,
	region: Arc<RingRegion>,
	port: P,
	forwarding: Forwarding,
	config: WorkerConfig,
	counters: Arc<Counters>,
	running: Arc<AtomicBool>,
	state: StateCell,
}

impl<P: RingPort> Worker<P> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		ifname: &str,
		ring_id: u16,
		region: Arc<RingRegion>,
		port: P,
		forwarding: Forwarding,
		config: WorkerConfig,
		counters: Arc<Counters>,
		running: Arc<AtomicBool>,
	) -> Self {
		Self {
			ifname: ifname.to_owned(),
			ring_id,
			region,
			port,
			forwarding,
			config,
			counters,
			running,
			state: StateCell::default(),
		}
	}

	pub fn state(&self) -> StateCell {
		self.state.clone()
	}

	pub fn label(&self) -> String {
		format!("{} ring #{}", self.ifname, self.ring_id)
	}

	fn attach(&mut self) -> Result<(Ring, Ring), DeviceError> {
		let offset = self.port.register(&self.ifname, self.ring_id)?;
		let nifp = self.region.interface(offset)?;
		let rx = nifp.rx_ring(self.ring_id as u32)?;
		let tx = nifp.tx_ring(self.ring_id as u32)?;
		Ok((rx, tx))
	}

	/// Runs the worker to completion on the calling thread
	pub fn run(mut self) {
		let label = self.label();
		self.state.set(WorkerState::Registering);
		let (mut rx, mut tx) = match self.attach() {
			Ok(rings) => rings,
			Err(e) => {
				log::error!("{}: {}", label, e);
				self.state.set(WorkerState::Terminated);
				return;
			}
		};

		self.state.set(WorkerState::Warmup);
		if sleep_while_running(&self.running, self.config.warmup) {
			self.state.set(WorkerState::Running);
			log::info!("{} up", label);
			self.forward(&mut rx, &mut tx, &label);
		}

		self.state.set(WorkerState::Draining);
		if let Err(e) = self.port.unregister() {
			log::warn!("{}: unregister failed: {}", label, e);
		}
		self.state.set(WorkerState::Terminated);
		log::info!("{}: exiting forwarding loop", label);
	}

	fn forward(&mut self, rx: &mut Ring, tx: &mut Ring, label: &str) {
		let burst = self.config.burst.max(1);
		let mut leftover = false;
		let mut sync_warned = false;

		while self.running.load(Ordering::Acquire) {
			if let Err(e) = self.port.rx_sync() {
				if !sync_warned {
					log::warn!("{}: rx sync failed: {}", label, e);
					sync_warned = true;
				}
			}
			if !leftover && rx.available() < burst {
				thread::sleep(self.config.idle_sleep);
				continue;
			}

			let batch = process_rings(rx, tx, &self.forwarding);
			self.counters.add_rx(batch.consumed as u64);
			self.counters.add_tx(batch.transmitted as u64);
			self.counters.add_drop(batch.dropped as u64);
			#[cfg(feature = "debug")]
			println!(
				"{}: {} in, {} out, {} dropped, {} left",
				label, batch.consumed, batch.transmitted, batch.dropped, batch.leftover
			);

			if let Err(e) = self.port.tx_sync() {
				if !sync_warned {
					log::warn!("{}: tx sync failed: {}", label, e);
					sync_warned = true;
				}
			}

			leftover = batch.leftover > 0;
			if batch.corrupt {
				sleep_while_running(&self.running, self.config.corrupt_backoff);
			} else if batch.consumed == 0 {
				thread::sleep(self.config.idle_sleep);
			}
		}
	}
}
