//! The engine ties interfaces, workers, affinity and statistics together
//!
//! `Engine::start` acquires every configured interface, then starts one worker per hardware RX
//! ring and pins it. Any interface that cannot be acquired aborts the start, and the interfaces
//! acquired before it are released again. A ring that cannot be registered only costs that
//! one worker.

use std::{
	io,
	os::unix::thread::JoinHandleExt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
};

use crossbeam::channel::{bounded, Receiver};
use thiserror::Error;

use crate::{
	affinity::{AffinityController, AffinityError, NoopGovernor, PowerGovernor, ScriptGovernor},
	apis::{Acquired, Backend, DeviceError, Netmap},
	config::{ConfigError, EngineConfig, ForwardingMode},
	decision::{Forwarding, Router, Strategy},
	lookup::LookupTable,
	stats::{sleep_while_running, CounterSnapshot, Counters, StatisticsUpdate, StatsAggregator},
	worker::{StateCell, Worker, WorkerState},
};

const EVENT_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum EngineError {
	#[error("bad configuration: {}", _0)]
	Config(#[from] ConfigError),
	#[error("{}", _0)]
	Device(#[from] DeviceError),
	#[error("{}", _0)]
	Affinity(#[from] AffinityError),
	#[error("cannot start statistics thread: {}", _0)]
	Stats(#[source] io::Error),
}

/// Signals from the power management side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerSignal {
	ActiveCoresChanged(u32),
}

struct WorkerHandle {
	ifname: String,
	ring_id: u16,
	state: StateCell,
	thread: Option<JoinHandle<()>>,
	// index in the affinity controller
	pinned: Option<usize>,
}

/// Status of one worker as shown to the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerStatus {
	pub ifname: String,
	pub ring_id: u16,
	pub state: WorkerState,
	pub cpu: Option<usize>,
}

pub struct Engine<B: Backend = Netmap> {
	backend: B,
	acquired: Vec<Acquired>,
	workers: Vec<WorkerHandle>,
	affinity: AffinityController,
	table: Arc<LookupTable>,
	counters: Arc<Counters>,
	running: Arc<AtomicBool>,
	stats: Option<StatsAggregator>,
	events: Receiver<StatisticsUpdate>,
	stopped: bool,
}

fn forwarding_for(config: &EngineConfig, table: &Arc<LookupTable>) -> Forwarding {
	let strategy = match config.mode {
		ForwardingMode::Passthrough => Strategy::Passthrough,
		ForwardingMode::Routed => {
			let mut router = Router::new(Arc::clone(table)).with_ttl_decrement(config.routing.decrement_ttl);
			if let Some(mac) = config.routing.router_mac {
				router = router.with_source_mac(mac);
			}
			Strategy::Routed(router)
		}
	};
	Forwarding::new(strategy, config.worker.window)
}

fn governor_for(config: &EngineConfig) -> Box<dyn PowerGovernor> {
	match &config.affinity.governor {
		Some(script) => Box::new(ScriptGovernor::new(script, config.interfaces.clone())),
		None => Box::new(NoopGovernor),
	}
}

impl<B: Backend> Engine<B> {
	pub fn start(backend: B, config: EngineConfig) -> Result<Self, EngineError> {
		config.validate()?;

		let mut acquired: Vec<Acquired> = Vec::with_capacity(config.interfaces.len());
		for ifname in &config.interfaces {
			match backend.acquire(ifname) {
				Ok(a) => acquired.push(a),
				Err(e) => {
					log::error!("{}: {}", ifname, e);
					acquired.iter().rev().for_each(|a| backend.release(a));
					return Err(e.into());
				}
			}
		}

		let affinity = match AffinityController::new(
			config.affinity.first_core,
			config.affinity.num_cores,
			governor_for(&config),
		) {
			Ok(a) => a,
			Err(e) => {
				acquired.iter().rev().for_each(|a| backend.release(a));
				return Err(e.into());
			}
		};

		let table = Arc::new(LookupTable::with_routes(config.routing.routes.iter().copied()));
		let (tx_events, events) = bounded(EVENT_QUEUE);
		let mut engine = Self {
			backend,
			acquired,
			workers: Vec::new(),
			affinity,
			table,
			counters: Arc::new(Counters::new()),
			running: Arc::new(AtomicBool::new(true)),
			stats: None,
			events,
			stopped: false,
		};

		log::info!(
			"starting {} forwarding on {} with {} routes",
			config.mode,
			config.interfaces.join(", "),
			engine.table.len()
		);
		let forwarding = forwarding_for(&config, &engine.table);
		for a in engine.acquired.clone() {
			for ring_id in 0..a.info.rx_rings {
				engine.spawn_worker(&a, ring_id, &forwarding, &config);
				if !config.start_delay.is_zero() {
					sleep_while_running(&engine.running, config.start_delay);
				}
			}
		}
		log::info!("{} workers started", engine.workers.len());

		if config.stats.enabled {
			let stats = StatsAggregator::spawn(
				Arc::clone(&engine.counters),
				&config.stats,
				Arc::clone(&engine.running),
				tx_events,
			)
			.map_err(EngineError::Stats)?;
			engine.stats = Some(stats);
		}
		Ok(engine)
	}

	fn spawn_worker(&mut self, a: &Acquired, ring_id: u16, forwarding: &Forwarding, config: &EngineConfig) {
		let label = format!("{} ring #{}", a.name, ring_id);
		let mut handle = WorkerHandle {
			ifname: a.name.clone(),
			ring_id,
			state: StateCell::default(),
			thread: None,
			pinned: None,
		};
		let port = match self.backend.open_port() {
			Ok(p) => p,
			Err(e) => {
				log::error!("{}: {}", label, e);
				handle.state.set(WorkerState::Terminated);
				self.workers.push(handle);
				return;
			}
		};

		let worker = Worker::new(
			&a.name,
			ring_id,
			Arc::clone(&a.region),
			port,
			forwarding.clone(),
			config.worker.clone(),
			Arc::clone(&self.counters),
			Arc::clone(&self.running),
		);
		handle.state = worker.state();
		let spawned = thread::Builder::new()
			.name(format!("fwd-{}-{}", a.name, ring_id))
			.spawn(move || worker.run());
		match spawned {
			Ok(t) => {
				handle.pinned = Some(self.affinity.adopt(label, t.as_pthread_t(), handle.state.clone()));
				handle.thread = Some(t);
			}
			Err(e) => {
				log::error!("{}: cannot start thread: {}", label, e);
				handle.state.set(WorkerState::Terminated);
			}
		}
		self.workers.push(handle);
	}

	/// Re-pins all workers onto `count` cores
	pub fn set_active_cores(&mut self, count: usize) -> Result<(), AffinityError> {
		self.affinity.rebalance(count)?;
		log::info!("{} active cores", count);
		Ok(())
	}

	pub fn on_signal(&mut self, signal: PowerSignal) -> Result<(), AffinityError> {
		match signal {
			PowerSignal::ActiveCoresChanged(n) => self.set_active_cores(n as usize),
		}
	}

	pub fn active_cores(&self) -> usize {
		self.affinity.active_cores()
	}

	/// Flips the live rate line; `None` when statistics are off
	pub fn toggle_rate(&self) -> Option<bool> {
		self.stats.as_ref().map(StatsAggregator::toggle_rate)
	}

	pub fn counters(&self) -> CounterSnapshot {
		self.counters.snapshot()
	}

	pub fn events(&self) -> &Receiver<StatisticsUpdate> {
		&self.events
	}

	pub fn table(&self) -> &Arc<LookupTable> {
		&self.table
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	pub fn worker_states(&self) -> Vec<WorkerStatus> {
		let placement = self.affinity.placement();
		self.workers
			.iter()
			.map(|w| WorkerStatus {
				ifname: w.ifname.clone(),
				ring_id: w.ring_id,
				state: w.state.get(),
				cpu: w.pinned.and_then(|i| placement.get(i).copied().flatten()),
			})
			.collect()
	}

	/// Stops every worker, waits for them and releases the interfaces
	pub fn stop(&mut self) {
		if self.stopped {
			return;
		}
		self.stopped = true;
		self.running.store(false, Ordering::Release);
		for w in self.workers.iter_mut() {
			if let Some(t) = w.thread.take() {
				if t.join().is_err() {
					log::error!("{} ring #{}: worker panicked", w.ifname, w.ring_id);
				}
			}
		}
		self.affinity.forget_workers();
		if let Some(stats) = self.stats.take() {
			stats.join();
		}
		for a in self.acquired.drain(..).rev() {
			self.backend.release(&a);
		}
		log::info!("engine stopped");
	}
}

impl<B: Backend> Drop for Engine<B> {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{RingLayout, SoftBackend, SoftNic};
	use std::time::{Duration, Instant};

	fn backend(names: &[&str]) -> SoftBackend {
		let backend = SoftBackend::new();
		for name in names {
			let layout = RingLayout {
				tx_rings: 2,
				rx_rings: 2,
				num_slots: 64,
				..RingLayout::default()
			};
			backend.add(SoftNic::new(name, layout).unwrap());
		}
		backend
	}

	fn config(names: &[&str]) -> EngineConfig {
		let mut config = EngineConfig::new(names.iter().copied(), ForwardingMode::Passthrough);
		config.worker.warmup = Duration::from_millis(0);
		config.stats.enabled = false;
		config.affinity.num_cores = 2;
		config
	}

	fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
		let t0 = Instant::now();
		while !f() {
			assert!(t0.elapsed() < Duration::from_secs(10), "timed out waiting for {}", what);
			thread::sleep(Duration::from_millis(1));
		}
	}

	#[test]
	fn one_worker_per_rx_ring() {
		let mut engine = Engine::start(backend(&["soft0", "soft1"]), config(&["soft0", "soft1"])).unwrap();
		wait_for("workers", || {
			engine.worker_states().iter().all(|w| w.state == WorkerState::Running)
		});
		let states = engine.worker_states();
		assert_eq!(states.len(), 4);
		assert_eq!(
			states.iter().map(|w| w.cpu).collect::<Vec<_>>(),
			vec![Some(0), Some(1), Some(0), Some(1)]
		);

		engine.set_active_cores(1).unwrap();
		assert!(engine.worker_states().iter().all(|w| w.cpu == Some(0)));
		assert!(engine.on_signal(PowerSignal::ActiveCoresChanged(0)).is_err());
		assert_eq!(engine.active_cores(), 1);

		engine.stop();
		assert!(engine.worker_states().iter().all(|w| w.state == WorkerState::Terminated));
		assert!(!engine.is_running());
	}

	#[test]
	fn refused_ring_does_not_affect_siblings() {
		let backend = backend(&["soft0"]);
		backend.nic("soft0").unwrap().refuse_ring(1);
		let mut engine = Engine::start(backend, config(&["soft0"])).unwrap();
		wait_for("ring 0", || engine.worker_states()[0].state == WorkerState::Running);
		wait_for("ring 1", || engine.worker_states()[1].state == WorkerState::Terminated);
		assert_eq!(engine.worker_states()[0].state, WorkerState::Running);

		// only the live worker is moved
		engine.set_active_cores(1).unwrap();
		let cpus: Vec<_> = engine.worker_states().iter().map(|w| w.cpu).collect();
		assert_eq!(cpus, vec![Some(0), None]);

		engine.stop();
		assert!(engine.set_active_cores(2).is_ok());
		assert!(engine.worker_states().iter().all(|w| w.cpu.is_none()));
	}

	#[test]
	fn missing_interface_aborts_start() {
		let result = Engine::start(backend(&["soft0"]), config(&["soft0", "soft9"]));
		assert!(matches!(result, Err(EngineError::Device(DeviceError::DeviceInfo(..)))));
	}

	#[test]
	fn invalid_config_is_rejected() {
		let mut bad = config(&["soft0"]);
		bad.worker.burst = 0;
		assert!(matches!(
			Engine::start(backend(&["soft0"]), bad),
			Err(EngineError::Config(ConfigError::ZeroBurst))
		));
	}

	#[test]
	fn rate_toggle_needs_statistics() {
		let engine = Engine::start(backend(&["soft0"]), config(&["soft0"])).unwrap();
		assert_eq!(engine.toggle_rate(), None);
		drop(engine);

		let mut with_stats = config(&["soft0"]);
		with_stats.stats.enabled = true;
		let engine = Engine::start(backend(&["soft0"]), with_stats).unwrap();
		assert_eq!(engine.toggle_rate(), Some(true));
		assert_eq!(engine.toggle_rate(), Some(false));
	}
}
