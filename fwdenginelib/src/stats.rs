//! Packet counters and the statistics aggregator
//!
//! Workers bump three engine wide counters. A background thread samples them at a fixed interval,
//! turns the deltas into rates and publishes a `StatisticsUpdate` for whoever listens.

use std::{
	io::{self, Write},
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam::channel::{Sender, TrySendError};

use crate::config::StatsConfig;

#[derive(Debug, Default)]
pub struct Counters {
	rx: AtomicU64,
	tx: AtomicU64,
	drop: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
	pub rx: u64,
	pub tx: u64,
	pub dropped: u64,
}

impl Counters {
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub fn add_rx(&self, n: u64) {
		self.rx.fetch_add(n, Ordering::Relaxed);
	}

	#[inline]
	pub fn add_tx(&self, n: u64) {
		self.tx.fetch_add(n, Ordering::Relaxed);
	}

	#[inline]
	pub fn add_drop(&self, n: u64) {
		self.drop.fetch_add(n, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> CounterSnapshot {
		CounterSnapshot {
			rx: self.rx.load(Ordering::Relaxed),
			tx: self.tx.load(Ordering::Relaxed),
			dropped: self.drop.load(Ordering::Relaxed),
		}
	}
}

/// One sample of the counters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatisticsUpdate {
	pub rx_total: u64,
	pub tx_total: u64,
	/// packets per second
	pub rx_rate: f64,
	pub tx_rate: f64,
	pub dropped: u64,
}

impl StatisticsUpdate {
	/// The live rate line
	pub fn rate_line(&self) -> String {
		format!(
			"Rx: {:.0} pkts/s\tTx: {:.0} pkts/s\tDropped: {} pkts",
			self.rx_rate, self.tx_rate, self.dropped
		)
	}
}

/// Turns successive counter samples into rates
#[derive(Debug, Clone, Copy)]
pub struct RateMeter {
	prev: CounterSnapshot,
	at: Instant,
}

impl RateMeter {
	pub fn new(start: CounterSnapshot, at: Instant) -> Self {
		Self { prev: start, at }
	}

	pub fn sample(&mut self, now: CounterSnapshot, at: Instant) -> StatisticsUpdate {
		let ms = at.saturating_duration_since(self.at).as_secs_f64() * 1000.0;
		let rate = |cur: u64, prev: u64| match ms {
			ms if ms > 0.0 => cur.saturating_sub(prev) as f64 / ms * 1000.0,
			_ => 0.0,
		};
		let update = StatisticsUpdate {
			rx_total: now.rx,
			tx_total: now.tx,
			rx_rate: rate(now.rx, self.prev.rx),
			tx_rate: rate(now.tx, self.prev.tx),
			dropped: now.dropped,
		};
		self.prev = now;
		self.at = at;
		update
	}
}

const SLEEP_CHUNK: Duration = Duration::from_millis(20);

/// Sleeps for `total`, waking up early once `running` goes false
///
/// Returns whether the engine is still running.
pub fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
	let deadline = Instant::now() + total;
	while running.load(Ordering::Acquire) {
		let now = Instant::now();
		if now >= deadline {
			return true;
		}
		thread::sleep((deadline - now).min(SLEEP_CHUNK));
	}
	false
}

pub struct StatsAggregator {
	handle: JoinHandle<()>,
	show_rate: Arc<AtomicBool>,
}

impl StatsAggregator {
	pub fn spawn(
		counters: Arc<Counters>,
		config: &StatsConfig,
		running: Arc<AtomicBool>,
		events: Sender<StatisticsUpdate>,
	) -> io::Result<Self> {
		let show_rate = Arc::new(AtomicBool::new(config.show_rate));
		let show = Arc::clone(&show_rate);
		let (start_delay, interval) = (config.start_delay, config.interval);

		let handle = thread::Builder::new()
			.name("stats".to_owned())
			.spawn(move || {
				if !sleep_while_running(&running, start_delay) {
					return;
				}
				let mut meter = RateMeter::new(counters.snapshot(), Instant::now());
				let mut showing = false;
				while sleep_while_running(&running, interval) {
					let update = meter.sample(counters.snapshot(), Instant::now());
					match events.try_send(update) {
						Ok(()) | Err(TrySendError::Full(_)) => {}
						Err(TrySendError::Disconnected(_)) => {
							log::debug!("nobody listens to statistics any more");
						}
					}
					if show.load(Ordering::Relaxed) {
						let mut out = io::stdout();
						if !showing {
							let _ = writeln!(out);
						}
						let _ = write!(out, "\r\x1b[2K{}", update.rate_line());
						let _ = out.flush();
						showing = true;
					} else if showing {
						let _ = writeln!(io::stdout());
						showing = false;
					}
				}
				log::debug!("statistics aggregator done");
			})?;

		Ok(Self { handle, show_rate })
	}

	/// Flips the live rate line, returns the new setting
	pub fn toggle_rate(&self) -> bool {
		!self.show_rate.fetch_xor(true, Ordering::Relaxed)
	}

	pub fn showing_rate(&self) -> bool {
		self.show_rate.load(Ordering::Relaxed)
	}

	pub fn join(self) {
		if self.handle.join().is_err() {
			log::error!("statistics thread panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crossbeam::channel::bounded;

	#[test]
	fn counters_accumulate() {
		let c = Counters::new();
		c.add_rx(40);
		c.add_tx(32);
		c.add_tx(8);
		c.add_drop(1);
		assert_eq!(
			c.snapshot(),
			CounterSnapshot {
				rx: 40,
				tx: 40,
				dropped: 1
			}
		);
	}

	#[test]
	fn rate_follows_linear_growth() {
		let t0 = Instant::now();
		let mut meter = RateMeter::new(CounterSnapshot::default(), t0);
		// 10_000 packets per second, sampled every 500 ms
		for step in 1..=4u64 {
			let snap = CounterSnapshot {
				rx: 5_000 * step,
				tx: 2_500 * step,
				dropped: 0,
			};
			let u = meter.sample(snap, t0 + Duration::from_millis(500 * step));
			assert!((u.rx_rate - 10_000.0).abs() < 1e-6, "rx rate {}", u.rx_rate);
			assert!((u.tx_rate - 5_000.0).abs() < 1e-6, "tx rate {}", u.tx_rate);
			assert_eq!(u.rx_total, 5_000 * step);
		}
	}

	#[test]
	fn zero_interval_gives_zero_rate() {
		let t0 = Instant::now();
		let mut meter = RateMeter::new(CounterSnapshot::default(), t0);
		let u = meter.sample(
			CounterSnapshot {
				rx: 10,
				tx: 10,
				dropped: 0,
			},
			t0,
		);
		assert_eq!(u.rx_rate, 0.0);
	}

	#[test]
	fn rate_line_format() {
		let u = StatisticsUpdate {
			rx_total: 0,
			tx_total: 0,
			rx_rate: 1500.4,
			tx_rate: 99.0,
			dropped: 7,
		};
		assert_eq!(u.rate_line(), "Rx: 1500 pkts/s\tTx: 99 pkts/s\tDropped: 7 pkts");
	}

	#[test]
	fn sleep_is_cut_short_by_stop() {
		let running = AtomicBool::new(false);
		let t0 = Instant::now();
		assert!(!sleep_while_running(&running, Duration::from_secs(10)));
		assert!(t0.elapsed() < Duration::from_secs(1));

		let running = AtomicBool::new(true);
		assert!(sleep_while_running(&running, Duration::from_millis(5)));
	}

	#[test]
	fn aggregator_publishes_updates() {
		let counters = Arc::new(Counters::new());
		let running = Arc::new(AtomicBool::new(true));
		let (tx, rx) = bounded(4);
		let config = StatsConfig {
			start_delay: Duration::from_millis(0),
			interval: Duration::from_millis(10),
			..StatsConfig::default()
		};
		let agg = StatsAggregator::spawn(Arc::clone(&counters), &config, Arc::clone(&running), tx).unwrap();
		counters.add_rx(5);
		let update = rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert!(update.rx_total <= 5);

		assert!(agg.toggle_rate());
		assert!(!agg.toggle_rate());

		running.store(false, Ordering::Release);
		agg.join();
	}
}
