use std::{
	io::{self, BufRead},
	path::PathBuf,
	thread,
	time::Duration,
};

use anyhow::Context;
use clap::Parser;
use crossbeam::{
	channel::{never, unbounded, Receiver, Sender},
	select,
};
use fwdenginelib::{
	config::{EngineConfig, ForwardingMode},
	lookup::{parse_mac, Ipv4Net},
	stats::StatisticsUpdate,
	Engine, MacAddr, Netmap,
};

/// Forward frames between the hardware rings of netmap interfaces
#[derive(Parser, Debug)]
#[command(name = "fwdengine", version, about, long_about = None)]
struct Args {
	/// Interfaces to forward on
	#[arg(required = true)]
	interfaces: Vec<String>,

	/// passthrough or routed
	#[arg(long, default_value = "routed")]
	mode: ForwardingMode,

	/// First core workers are pinned to
	#[arg(long, default_value_t = 0)]
	first_core: usize,

	/// Number of cores in use at start
	#[arg(long, default_value_t = 1)]
	cores: usize,

	/// Seconds between starting two workers
	#[arg(long, default_value_t = 0.0)]
	delay: f64,

	/// Minimum RX backlog before a batch is forwarded
	#[arg(long, default_value_t = 32)]
	burst: u32,

	/// Seconds a worker waits after registering its rings
	#[arg(long, default_value_t = 5.0)]
	warmup: f64,

	/// Milliseconds between two statistics samples
	#[arg(long, default_value_t = 500)]
	stats_interval: u64,

	/// Do not run the statistics aggregator
	#[arg(long)]
	no_stats: bool,

	/// Script run as `<script> <iface> <first_core> <count>` when the core count changes
	#[arg(long)]
	governor: Option<PathBuf>,

	/// Source MAC written into routed frames
	#[arg(long, value_parser = mac_arg)]
	router_mac: Option<MacAddr>,

	/// Initial route, may be repeated
	#[arg(long = "route", value_name = "CIDR=MAC", value_parser = route_arg)]
	routes: Vec<(Ipv4Net, MacAddr)>,
}

fn mac_arg(s: &str) -> Result<MacAddr, String> {
	parse_mac(s).map_err(|e| e.to_string())
}

fn route_arg(s: &str) -> Result<(Ipv4Net, MacAddr), String> {
	let (net, mac) = s.split_once('=').ok_or_else(|| format!("expected CIDR=MAC, got {:?}", s))?;
	let net = net.trim().parse::<Ipv4Net>().map_err(|e| e.to_string())?;
	Ok((net, mac_arg(mac.trim())?))
}

fn seconds(s: f64) -> Duration {
	if s.is_finite() && s > 0.0 {
		Duration::from_secs_f64(s)
	} else {
		Duration::from_secs(0)
	}
}

impl Args {
	fn into_config(self) -> EngineConfig {
		let mut config = EngineConfig::new(self.interfaces, self.mode);
		config.start_delay = seconds(self.delay);
		config.worker.burst = self.burst;
		config.worker.warmup = seconds(self.warmup);
		config.affinity.first_core = self.first_core;
		config.affinity.num_cores = self.cores;
		config.affinity.governor = self.governor;
		config.stats.enabled = !self.no_stats;
		config.stats.interval = Duration::from_millis(self.stats_interval);
		config.routing.router_mac = self.router_mac;
		config.routing.routes = self.routes;
		config
	}
}

/// Operator commands read from stdin
#[derive(Clone, Debug, PartialEq, Eq)]
enum Command {
	Cores(usize),
	Quit,
	ToggleRate,
	Show,
	Routes,
	Add(Ipv4Net, MacAddr),
	Del(Ipv4Net),
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
	let mut words = line.split_whitespace();
	let cmd = match words.next() {
		Some(w) => w,
		None => return Ok(None),
	};
	let command = match cmd {
		"q" | "quit" => Command::Quit,
		"r" => Command::ToggleRate,
		"s" => Command::Show,
		"routes" => Command::Routes,
		"add" => {
			let net = words.next().ok_or("usage: add CIDR MAC")?;
			let mac = words.next().ok_or("usage: add CIDR MAC")?;
			Command::Add(
				net.parse().map_err(|e: fwdenginelib::lookup::RouteError| e.to_string())?,
				mac_arg(mac)?,
			)
		}
		"del" => {
			let net = words.next().ok_or("usage: del CIDR")?;
			Command::Del(net.parse().map_err(|e: fwdenginelib::lookup::RouteError| e.to_string())?)
		}
		n => match n.parse::<usize>() {
			Ok(count) => Command::Cores(count),
			Err(_) => return Err(format!("unknown command {:?}", n)),
		},
	};
	if let Some(extra) = words.next() {
		return Err(format!("unexpected {:?}", extra));
	}
	Ok(Some(command))
}

fn read_commands(tx: Sender<Command>) -> io::Result<()> {
	thread::Builder::new().name("stdin".to_owned()).spawn(move || {
		let stdin = io::stdin();
		for line in stdin.lock().lines() {
			let line = match line {
				Ok(l) => l,
				Err(e) => {
					log::error!("stdin: {}", e);
					break;
				}
			};
			match parse_command(&line) {
				Ok(Some(cmd)) => {
					if tx.send(cmd).is_err() {
						break;
					}
				}
				Ok(None) => {}
				Err(e) => eprintln!("{}", e),
			}
		}
	})?;
	Ok(())
}

fn show(engine: &Engine) {
	let c = engine.counters();
	println!("rx {} tx {} dropped {}", c.rx, c.tx, c.dropped);
	for w in engine.worker_states() {
		match w.cpu {
			Some(cpu) => println!("{} ring #{}: {} on cpu #{}", w.ifname, w.ring_id, w.state, cpu),
			None => println!("{} ring #{}: {}", w.ifname, w.ring_id, w.state),
		}
	}
}

fn route_lines(routes: &[(Ipv4Net, MacAddr)]) -> Vec<String> {
	if routes.is_empty() {
		return vec!["No routes".to_owned()];
	}
	routes.iter().map(|(net, mac)| format!("{} via {}", net, mac)).collect()
}

/// Returns false once the engine should stop
fn handle(engine: &mut Engine, cmd: Command) -> bool {
	match cmd {
		Command::Quit => return false,
		Command::Cores(n) => {
			if let Err(e) = engine.set_active_cores(n) {
				log::error!("{}", e);
			}
		}
		Command::ToggleRate => match engine.toggle_rate() {
			Some(on) => log::info!("rate display {}", if on { "on" } else { "off" }),
			None => log::warn!("statistics are disabled"),
		},
		Command::Show => show(engine),
		Command::Routes => route_lines(&engine.table().routes()).iter().for_each(|l| println!("{}", l)),
		Command::Add(net, mac) => {
			let change = engine.table().add_route(net, mac);
			log::info!("route {} via {}: {:?}", net, mac, change);
		}
		Command::Del(net) => match engine.table().del_route(net) {
			Some(mac) => log::info!("route {} via {} removed", net, mac),
			None => log::warn!("no route for {}", net),
		},
	}
	true
}

enum Input {
	Command(Command),
	Stats(Option<StatisticsUpdate>),
}

fn main() -> anyhow::Result<()> {
	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

	let config = Args::parse().into_config();
	config.validate()?;

	let (tx, commands): (Sender<Command>, Receiver<Command>) = unbounded();
	{
		let tx = tx.clone();
		ctrlc::set_handler(move || {
			let _ = tx.send(Command::Quit);
		})
		.context("cannot install the Ctrl+C handler")?;
	}
	read_commands(tx).context("cannot read stdin")?;

	log::info!("Initializing netmap engine ...");
	let mut engine = Engine::start(Netmap, config)?;
	let mut events = engine.events().clone();

	loop {
		let input = select! {
			recv(commands) -> cmd => Input::Command(cmd.unwrap_or(Command::Quit)),
			recv(events) -> update => Input::Stats(update.ok()),
		};
		match input {
			Input::Command(cmd) => {
				if !handle(&mut engine, cmd) {
					break;
				}
			}
			Input::Stats(Some(update)) => log::trace!("{}", update.rate_line()),
			// statistics are off or their thread is gone
			Input::Stats(None) => events = never(),
		}
	}

	log::info!("shutting down");
	engine.stop();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn commands_parse() {
		assert_eq!(parse_command("  "), Ok(None));
		assert_eq!(parse_command("q"), Ok(Some(Command::Quit)));
		assert_eq!(parse_command("r"), Ok(Some(Command::ToggleRate)));
		assert_eq!(parse_command("3"), Ok(Some(Command::Cores(3))));
		assert_eq!(
			parse_command("del 10.0.0.0/8"),
			Ok(Some(Command::Del("10.0.0.0/8".parse().unwrap())))
		);
		match parse_command("add 10.1.0.0/16 02:00:00:00:00:01") {
			Ok(Some(Command::Add(net, mac))) => {
				assert_eq!(net.len(), 16);
				assert_eq!(mac, MacAddr::new(2, 0, 0, 0, 0, 1));
			}
			other => panic!("unexpected {:?}", other),
		}
		assert!(parse_command("add 10.1.0.0/16").is_err());
		assert!(parse_command("bogus").is_err());
		assert!(parse_command("q now").is_err());
	}

	#[test]
	fn route_listing() {
		assert_eq!(route_lines(&[]), vec!["No routes"]);
		let routes = vec![
			("0.0.0.0/0".parse().unwrap(), MacAddr::new(2, 0, 0, 0, 0, 1)),
			("10.0.0.0/8".parse().unwrap(), MacAddr::new(2, 0, 0, 0, 0, 0x0a)),
		];
		assert_eq!(
			route_lines(&routes),
			vec!["0.0.0.0/0 via 02:00:00:00:00:01", "10.0.0.0/8 via 02:00:00:00:00:0a"]
		);
	}

	#[test]
	fn arguments_fill_the_config() {
		let args = Args::try_parse_from([
			"fwdengine",
			"eth0",
			"eth1",
			"--mode",
			"passthrough",
			"--cores",
			"2",
			"--warmup",
			"0",
			"--route",
			"10.0.0.0/8=02:00:00:00:00:0a",
			"--no-stats",
		])
		.unwrap();
		let config = args.into_config();
		assert_eq!(config.interfaces, vec!["eth0", "eth1"]);
		assert_eq!(config.mode, ForwardingMode::Passthrough);
		assert_eq!(config.affinity.num_cores, 2);
		assert_eq!(config.worker.warmup, Duration::from_secs(0));
		assert!(!config.stats.enabled);
		assert_eq!(config.routing.routes.len(), 1);
		assert!(config.validate().is_ok());

		assert!(Args::try_parse_from(["fwdengine", "eth0", "--route", "10.0.0.0/8"]).is_err());
		assert!(Args::try_parse_from(["fwdengine"]).is_err());
	}
}
