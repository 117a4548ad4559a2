//! Engine configuration
//!
//! Plain structs with working defaults; the binary fills them from its command line.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use pnet::datalink::MacAddr;
use thiserror::Error;

use crate::{decision::FrameWindow, lookup::Ipv4Net};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
	#[error("no interface to forward on")]
	NoInterfaces,
	#[error("burst threshold must be at least 1")]
	ZeroBurst,
	#[error("need at least one core")]
	ZeroCores,
	#[error("frame window {}..{} admits no length", _0, _1)]
	EmptyWindow(usize, usize),
	#[error("unknown forwarding mode {:?}", _0)]
	UnknownMode(String),
	#[error("statistics interval must not be zero")]
	ZeroInterval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardingMode {
	Passthrough,
	Routed,
}

impl Default for ForwardingMode {
	fn default() -> Self {
		ForwardingMode::Routed
	}
}

impl FromStr for ForwardingMode {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"passthrough" | "bridge" => Ok(ForwardingMode::Passthrough),
			"routed" | "router" => Ok(ForwardingMode::Routed),
			_ => Err(ConfigError::UnknownMode(s.to_owned())),
		}
	}
}

impl fmt::Display for ForwardingMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ForwardingMode::Passthrough => write!(f, "passthrough"),
			ForwardingMode::Routed => write!(f, "routed"),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
	/// Minimum RX backlog before a batch is processed
	pub burst: u32,
	/// Pause between registration and the first batch
	pub warmup: Duration,
	pub window: FrameWindow,
	/// Pause after a slot with a reserved buffer index was found
	pub corrupt_backoff: Duration,
	/// Yield while the RX backlog is under the burst threshold
	pub idle_sleep: Duration,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			burst: 32,
			warmup: Duration::from_secs(5),
			window: FrameWindow::default(),
			corrupt_backoff: Duration::from_secs(1),
			idle_sleep: Duration::from_nanos(1),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AffinityConfig {
	pub first_core: usize,
	/// Cores in use at start
	pub num_cores: usize,
	/// Core scaling helper, run as `script <iface> <first_core> <count>`
	pub governor: Option<PathBuf>,
}

impl Default for AffinityConfig {
	fn default() -> Self {
		Self {
			first_core: 0,
			num_cores: 1,
			governor: None,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsConfig {
	pub enabled: bool,
	/// Delay before the first sample
	pub start_delay: Duration,
	pub interval: Duration,
	pub show_rate: bool,
}

impl Default for StatsConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			start_delay: Duration::from_secs(7),
			interval: Duration::from_millis(500),
			show_rate: false,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
	/// Source MAC written into forwarded frames
	pub router_mac: Option<MacAddr>,
	pub decrement_ttl: bool,
	/// Routes installed before the first worker starts
	pub routes: Vec<(Ipv4Net, MacAddr)>,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		Self {
			router_mac: None,
			decrement_ttl: true,
			routes: Vec::new(),
		}
	}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
	pub interfaces: Vec<String>,
	pub mode: ForwardingMode,
	/// Gap between starting consecutive workers
	pub start_delay: Duration,
	pub worker: WorkerConfig,
	pub affinity: AffinityConfig,
	pub stats: StatsConfig,
	pub routing: RoutingConfig,
}

impl EngineConfig {
	pub fn new<I, S>(interfaces: I, mode: ForwardingMode) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			interfaces: interfaces.into_iter().map(Into::into).collect(),
			mode,
			..Self::default()
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.interfaces.is_empty() {
			return Err(ConfigError::NoInterfaces);
		}
		if self.worker.burst == 0 {
			return Err(ConfigError::ZeroBurst);
		}
		if self.affinity.num_cores == 0 {
			return Err(ConfigError::ZeroCores);
		}
		let w = self.worker.window;
		if w.max <= w.min + 1 {
			return Err(ConfigError::EmptyWindow(w.min, w.max));
		}
		if self.stats.enabled && self.stats.interval.as_millis() == 0 {
			return Err(ConfigError::ZeroInterval);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		let config = EngineConfig::new(vec!["eth0"], ForwardingMode::Passthrough);
		assert_eq!(config.validate(), Ok(()));
		assert_eq!(config.worker.burst, 32);
		assert_eq!(config.worker.warmup, Duration::from_secs(5));
		assert_eq!(config.stats.interval, Duration::from_millis(500));
		assert_eq!(config.stats.start_delay, Duration::from_secs(7));
	}

	#[test]
	fn invalid_settings_are_reported() {
		assert_eq!(EngineConfig::default().validate(), Err(ConfigError::NoInterfaces));

		let mut config = EngineConfig::new(vec!["eth0"], ForwardingMode::Routed);
		config.worker.burst = 0;
		assert_eq!(config.validate(), Err(ConfigError::ZeroBurst));

		config.worker.burst = 1;
		config.affinity.num_cores = 0;
		assert_eq!(config.validate(), Err(ConfigError::ZeroCores));

		config.affinity.num_cores = 2;
		config.worker.window = FrameWindow { min: 10, max: 11 };
		assert_eq!(config.validate(), Err(ConfigError::EmptyWindow(10, 11)));
	}

	#[test]
	fn modes_parse() {
		assert_eq!("passthrough".parse::<ForwardingMode>(), Ok(ForwardingMode::Passthrough));
		assert_eq!("Routed".parse::<ForwardingMode>(), Ok(ForwardingMode::Routed));
		assert!("switch".parse::<ForwardingMode>().is_err());
		assert_eq!(ForwardingMode::Passthrough.to_string(), "passthrough");
	}
}
