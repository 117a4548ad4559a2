//! The next hop lookup table
//!
//! Readers never lock: every lookup runs against an immutable snapshot that writers replace as a
//! whole. A snapshot keeps one hash table per prefix length, searched from the longest length
//! that has any route down to `/0`.

use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	net::Ipv4Addr,
	str::FromStr,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, MutexGuard,
	},
};

use arc_swap::{ArcSwap, Guard};
use pnet::datalink::MacAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
	#[error("invalid prefix {:?}", _0)]
	BadPrefix(String),
	#[error("prefix length {} is longer than 32", _0)]
	BadLength(u8),
	#[error("invalid MAC address {:?}", _0)]
	BadMac(String),
	#[error("no route for {}", _0)]
	NoSuchRoute(Ipv4Net),
}

/// An IPv4 prefix, host bits cleared
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Net {
	addr: u32,
	len: u8,
}

#[inline]
fn mask(len: u8) -> u32 {
	match len {
		0 => 0,
		l => u32::MAX << (32 - l as u32),
	}
}

impl Ipv4Net {
	pub fn new(addr: u32, len: u8) -> Result<Self, RouteError> {
		if len > 32 {
			return Err(RouteError::BadLength(len));
		}
		Ok(Self {
			addr: addr & mask(len),
			len,
		})
	}

	/// The default route
	pub const fn any() -> Self {
		Self { addr: 0, len: 0 }
	}

	#[inline]
	pub fn addr(&self) -> u32 {
		self.addr
	}

	#[inline]
	pub fn len(&self) -> u8 {
		self.len
	}

	#[inline]
	pub fn contains(&self, ip: u32) -> bool {
		ip & mask(self.len) == self.addr
	}
}

impl fmt::Display for Ipv4Net {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.len)
	}
}

/// Accepts `a.b.c.d/len`, a bare address is a `/32`
impl FromStr for Ipv4Net {
	type Err = RouteError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let bad = || RouteError::BadPrefix(s.to_owned());
		let (addr, len) = match s.split_once('/') {
			Some((a, l)) => (a, l.parse::<u8>().map_err(|_| bad())?),
			None => (s, 32),
		};
		let addr = addr.parse::<Ipv4Addr>().map_err(|_| bad())?;
		Self::new(u32::from(addr), len)
	}
}

pub fn parse_mac(s: &str) -> Result<MacAddr, RouteError> {
	s.parse::<MacAddr>().map_err(|_| RouteError::BadMac(s.to_owned()))
}

/// An immutable view of every installed route
pub struct Snapshot {
	by_len: Vec<HashMap<u32, MacAddr>>,
	// non empty prefix lengths, longest first
	lens: Vec<u8>,
}

impl Snapshot {
	fn empty() -> Self {
		Self {
			by_len: vec![HashMap::new(); 33],
			lens: Vec::new(),
		}
	}

	fn build(routes: &BTreeMap<Ipv4Net, MacAddr>) -> Self {
		let mut snap = Self::empty();
		for (net, mac) in routes {
			snap.by_len[net.len as usize].insert(net.addr, *mac);
		}
		snap.lens = (0..=32u8).rev().filter(|&l| !snap.by_len[l as usize].is_empty()).collect();
		snap
	}

	/// Longest prefix match on a host order address
	#[inline]
	pub fn lookup(&self, ip: u32) -> Option<MacAddr> {
		self.lens
			.iter()
			.find_map(|&len| self.by_len[len as usize].get(&(ip & mask(len))).copied())
	}

	pub fn len(&self) -> usize {
		self.by_len.iter().map(HashMap::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.lens.is_empty()
	}
}

/// Outcome of installing a route
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteChange {
	Added,
	Replaced(MacAddr),
	Unchanged,
}

pub struct LookupTable {
	current: ArcSwap<Snapshot>,
	routes: Mutex<BTreeMap<Ipv4Net, MacAddr>>,
	version: AtomicU64,
}

impl Default for LookupTable {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for LookupTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LookupTable")
			.field("routes", &self.len())
			.field("version", &self.version())
			.finish()
	}
}

impl LookupTable {
	pub fn new() -> Self {
		Self {
			current: ArcSwap::from_pointee(Snapshot::empty()),
			routes: Mutex::new(BTreeMap::new()),
			version: AtomicU64::new(0),
		}
	}

	pub fn with_routes<I>(routes: I) -> Self
	where
		I: IntoIterator<Item = (Ipv4Net, MacAddr)>,
	{
		let table = Self::new();
		table.replace(routes);
		table
	}

	fn writer(&self) -> MutexGuard<'_, BTreeMap<Ipv4Net, MacAddr>> {
		self.routes.lock().unwrap_or_else(|e| e.into_inner())
	}

	// called with the writer lock held
	fn publish(&self, routes: &BTreeMap<Ipv4Net, MacAddr>) {
		self.current.store(Arc::new(Snapshot::build(routes)));
		self.version.fetch_add(1, Ordering::Release);
	}

	/// Next hop for `dst_ip` (host byte order)
	#[inline]
	pub fn lookup(&self, dst_ip: u32) -> Option<MacAddr> {
		self.current.load().lookup(dst_ip)
	}

	/// The snapshot current readers see; later writes do not affect it
	pub fn snapshot(&self) -> Guard<Arc<Snapshot>> {
		self.current.load()
	}

	pub fn add(&self, prefix: (u32, u8), mac: MacAddr) -> Result<RouteChange, RouteError> {
		Ok(self.add_route(Ipv4Net::new(prefix.0, prefix.1)?, mac))
	}

	pub fn del(&self, prefix: (u32, u8)) -> Result<MacAddr, RouteError> {
		let net = Ipv4Net::new(prefix.0, prefix.1)?;
		self.del_route(net).ok_or(RouteError::NoSuchRoute(net))
	}

	pub fn add_route(&self, net: Ipv4Net, mac: MacAddr) -> RouteChange {
		let mut routes = self.writer();
		let change = match routes.insert(net, mac) {
			None => RouteChange::Added,
			Some(old) if old == mac => return RouteChange::Unchanged,
			Some(old) => RouteChange::Replaced(old),
		};
		self.publish(&routes);
		log::debug!("route {} via {} ({:?})", net, mac, change);
		change
	}

	pub fn del_route(&self, net: Ipv4Net) -> Option<MacAddr> {
		let mut routes = self.writer();
		let old = routes.remove(&net)?;
		self.publish(&routes);
		log::debug!("route {} via {} removed", net, old);
		Some(old)
	}

	/// Swaps the whole route set in one step
	pub fn replace<I>(&self, new_routes: I)
	where
		I: IntoIterator<Item = (Ipv4Net, MacAddr)>,
	{
		let mut routes = self.writer();
		*routes = new_routes.into_iter().collect();
		self.publish(&routes);
	}

	/// Installed routes, ordered by prefix
	pub fn routes(&self) -> Vec<(Ipv4Net, MacAddr)> {
		self.writer().iter().map(|(n, m)| (*n, *m)).collect()
	}

	pub fn len(&self) -> usize {
		self.writer().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Bumped on every published change
	pub fn version(&self) -> u64 {
		self.version.load(Ordering::Acquire)
	}
}
