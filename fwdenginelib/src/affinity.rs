//! Core affinity for worker threads
//!
//! Worker `i` runs on `first_core + i % active`. Changing the number of active cores re-pins
//! every worker in place and then tells the power governor, so cores that fell out of use can
//! be put to sleep. Workers are never stopped for this.

use std::{
	io, mem,
	os::unix::thread::RawPthread,
	path::{Path, PathBuf},
	process::{Command, ExitStatus},
};

use thiserror::Error;

use crate::worker::StateCell;

#[derive(Error, Debug)]
pub enum AffinityError {
	#[error("the number of active cores must be at least 1")]
	ZeroCores,
	#[error("no worker #{}", _0)]
	NoSuchWorker(usize),
	#[error("cannot pin {} to cpu #{}: {}", _0, _1, _2)]
	Pin(String, usize, #[source] io::Error),
	#[error("{} has left its forwarding loop", _0)]
	Retired(String),
}

#[derive(Error, Debug)]
pub enum GovernorError {
	#[error("cannot run {}: {}", _0.display(), _1)]
	Spawn(PathBuf, #[source] io::Error),
	#[error("{} {}", _0.display(), _1)]
	Exit(PathBuf, ExitStatus),
}

/// Told whenever the set of cores in use changes
pub trait PowerGovernor: Send {
	fn cores_changed(&mut self, first_core: usize, active: usize) -> Result<(), GovernorError>;
}

impl<F> PowerGovernor for F
where
	F: FnMut(usize, usize) -> Result<(), GovernorError> + Send,
{
	fn cores_changed(&mut self, first_core: usize, active: usize) -> Result<(), GovernorError> {
		self(first_core, active)
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGovernor;

impl PowerGovernor for NoopGovernor {
	fn cores_changed(&mut self, _first_core: usize, _active: usize) -> Result<(), GovernorError> {
		Ok(())
	}
}

/// Runs `script <iface> <first_core> <count>` once per interface
#[derive(Debug, Clone)]
pub struct ScriptGovernor {
	script: PathBuf,
	interfaces: Vec<String>,
}

impl ScriptGovernor {
	pub fn new<P: AsRef<Path>>(script: P, interfaces: Vec<String>) -> Self {
		Self {
			script: script.as_ref().to_path_buf(),
			interfaces,
		}
	}
}

impl PowerGovernor for ScriptGovernor {
	fn cores_changed(&mut self, first_core: usize, active: usize) -> Result<(), GovernorError> {
		for iface in &self.interfaces {
			let status = Command::new(&self.script)
				.arg(iface)
				.arg(first_core.to_string())
				.arg(active.to_string())
				.status()
				.map_err(|e| GovernorError::Spawn(self.script.clone(), e))?;
			if !status.success() {
				return Err(GovernorError::Exit(self.script.clone(), status));
			}
		}
		Ok(())
	}
}

/// The core worker `index` belongs on
#[inline]
pub fn core_for(first_core: usize, index: usize, active: usize) -> usize {
	first_core + index % active.max(1)
}

fn set_affinity(thread: RawPthread, cpu: usize) -> io::Result<()> {
	unsafe {
		let mut set: libc::cpu_set_t = mem::zeroed();
		libc::CPU_ZERO(&mut set);
		libc::CPU_SET(cpu, &mut set);
		match libc::pthread_setaffinity_np(thread, mem::size_of::<libc::cpu_set_t>(), &set) {
			0 => Ok(()),
			err => Err(io::Error::from_raw_os_error(err)),
		}
	}
}

struct Pinned {
	label: String,
	// only valid while `state` is live
	thread: RawPthread,
	state: StateCell,
	cpu: Option<usize>,
}

pub struct AffinityController {
	first_core: usize,
	active: usize,
	workers: Vec<Pinned>,
	governor: Box<dyn PowerGovernor>,
}

impl AffinityController {
	pub fn new(first_core: usize, active: usize, governor: Box<dyn PowerGovernor>) -> Result<Self, AffinityError> {
		if active == 0 {
			return Err(AffinityError::ZeroCores);
		}
		Ok(Self {
			first_core,
			active,
			workers: Vec::new(),
			governor,
		})
	}

	/// Takes over a worker thread and pins it for the current core count
	///
	/// `state` tells whether the thread still exists; a worker that has started draining is
	/// never touched again.
	pub fn adopt(&mut self, label: String, thread: RawPthread, state: StateCell) -> usize {
		let index = self.workers.len();
		self.workers.push(Pinned {
			label,
			thread,
			state,
			cpu: None,
		});
		let cpu = core_for(self.first_core, index, self.active);
		match self.pin(index, cpu) {
			Ok(()) | Err(AffinityError::Retired(_)) => {}
			Err(e) => log::error!("{}", e),
		}
		index
	}

	/// Binds worker `index` to `cpu`
	pub fn pin(&mut self, index: usize, cpu: usize) -> Result<(), AffinityError> {
		let w = self.workers.get_mut(index).ok_or(AffinityError::NoSuchWorker(index))?;
		let thread = w.thread;
		let pinned = match w.state.while_live(|| set_affinity(thread, cpu)) {
			Some(result) => result,
			None => {
				w.cpu = None;
				return Err(AffinityError::Retired(w.label.clone()));
			}
		};
		// remember the target even when the OS refuses it, the next rebalance retries
		w.cpu = Some(cpu);
		pinned.map_err(|e| AffinityError::Pin(w.label.clone(), cpu, e))?;
		log::debug!("{} ==> cpu #{}", w.label, cpu);
		Ok(())
	}

	/// Spreads all workers over `active` cores and informs the governor
	pub fn rebalance(&mut self, active: usize) -> Result<(), AffinityError> {
		if active == 0 {
			return Err(AffinityError::ZeroCores);
		}
		self.active = active;
		for index in 0..self.workers.len() {
			let cpu = core_for(self.first_core, index, active);
			match self.pin(index, cpu) {
				Ok(()) => log::info!("{} ==> cpu #{}", self.workers[index].label, cpu),
				Err(AffinityError::Retired(label)) => log::debug!("{} skipped", label),
				Err(e) => log::error!("{}", e),
			}
		}
		if let Err(e) = self.governor.cores_changed(self.first_core, active) {
			log::warn!("power governor: {}", e);
		}
		Ok(())
	}

	pub fn active_cores(&self) -> usize {
		self.active
	}

	pub fn first_core(&self) -> usize {
		self.first_core
	}

	/// Target core of every worker, in adoption order; `None` once a worker is gone
	pub fn placement(&self) -> Vec<Option<usize>> {
		self.workers
			.iter()
			.map(|w| if w.state.get().is_live() { w.cpu } else { None })
			.collect()
	}

	/// Drops every worker; called once their threads have been joined
	pub fn forget_workers(&mut self) {
		self.workers.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::worker::WorkerState;
	use std::{
		os::unix::thread::JoinHandleExt,
		sync::{
			atomic::{AtomicBool, Ordering},
			mpsc, Arc,
		},
		thread,
		time::Duration,
	};

	#[test]
	fn cores_wrap_around_the_active_set() {
		let cores: Vec<usize> = (0..6).map(|i| core_for(2, i, 4)).collect();
		assert_eq!(cores, vec![2, 3, 4, 5, 2, 3]);
		assert_eq!(core_for(0, 7, 1), 0);
	}

	fn parked_threads(n: usize, stop: &Arc<AtomicBool>) -> Vec<thread::JoinHandle<()>> {
		(0..n)
			.map(|_| {
				let stop = Arc::clone(stop);
				thread::spawn(move || {
					while !stop.load(Ordering::Relaxed) {
						thread::sleep(Duration::from_millis(1));
					}
				})
			})
			.collect()
	}

	#[test]
	fn rebalance_is_idempotent() {
		let stop = Arc::new(AtomicBool::new(false));
		let threads = parked_threads(3, &stop);
		let (tx, rx) = mpsc::channel();
		let governor = move |first: usize, active: usize| -> Result<(), GovernorError> {
			tx.send((first, active)).ok();
			Ok(())
		};
		let mut ctl = AffinityController::new(0, 3, Box::new(governor)).unwrap();
		for (i, t) in threads.iter().enumerate() {
			ctl.adopt(format!("worker #{}", i), t.as_pthread_t(), StateCell::default());
		}
		assert_eq!(ctl.placement(), vec![Some(0), Some(1), Some(2)]);

		ctl.rebalance(2).unwrap();
		let once = ctl.placement();
		ctl.rebalance(2).unwrap();
		assert_eq!(ctl.placement(), once);
		assert_eq!(once, vec![Some(0), Some(1), Some(0)]);
		assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![(0, 2), (0, 2)]);
		assert_eq!(ctl.active_cores(), 2);

		stop.store(true, Ordering::Relaxed);
		threads.into_iter().for_each(|t| t.join().unwrap());
	}

	#[test]
	fn retired_workers_are_never_pinned_again() {
		let stop = Arc::new(AtomicBool::new(false));
		let threads = parked_threads(2, &stop);
		let states = vec![StateCell::default(), StateCell::default()];
		let mut ctl = AffinityController::new(0, 2, Box::new(NoopGovernor)).unwrap();
		for (i, (t, state)) in threads.iter().zip(&states).enumerate() {
			ctl.adopt(format!("worker #{}", i), t.as_pthread_t(), state.clone());
		}
		assert_eq!(ctl.placement(), vec![Some(0), Some(1)]);

		states[1].set(WorkerState::Terminated);
		ctl.rebalance(1).unwrap();
		assert_eq!(ctl.placement(), vec![Some(0), None]);
		assert!(matches!(ctl.pin(1, 0), Err(AffinityError::Retired(_))));

		// adopted after it already left, e.g. a refused ring
		let gone = thread::spawn(|| {});
		let raw = gone.as_pthread_t();
		gone.join().unwrap();
		let state = StateCell::default();
		state.set(WorkerState::Terminated);
		let index = ctl.adopt("worker #2".to_owned(), raw, state);
		assert_eq!(ctl.placement()[index], None);

		stop.store(true, Ordering::Relaxed);
		threads.into_iter().for_each(|t| t.join().unwrap());
		ctl.forget_workers();
		assert!(ctl.placement().is_empty());
		assert!(ctl.rebalance(2).is_ok());
	}

	#[test]
	fn zero_cores_are_rejected() {
		assert!(matches!(
			AffinityController::new(0, 0, Box::new(NoopGovernor)),
			Err(AffinityError::ZeroCores)
		));
		let mut ctl = AffinityController::new(0, 1, Box::new(NoopGovernor)).unwrap();
		assert!(matches!(ctl.rebalance(0), Err(AffinityError::ZeroCores)));
		assert!(matches!(ctl.pin(3, 0), Err(AffinityError::NoSuchWorker(3))));
	}

	#[test]
	fn script_governor_reports_failures() {
		let mut ok = ScriptGovernor::new("true", vec!["eth0".to_owned()]);
		assert!(ok.cores_changed(0, 2).is_ok());
		let mut failing = ScriptGovernor::new("false", vec!["eth0".to_owned()]);
		assert!(matches!(failing.cores_changed(0, 2), Err(GovernorError::Exit(..))));
		let mut missing = ScriptGovernor::new("/nonexistent/set_affinity.sh", vec!["eth0".to_owned()]);
		assert!(matches!(missing.cores_changed(0, 2), Err(GovernorError::Spawn(..))));
	}
}
