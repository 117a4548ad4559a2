//! Per frame forwarding decisions
//!
//! A decision is made on the frame in place, inside the RX buffer, before the buffer is handed
//! to the TX ring. Passthrough only looks at the length, routed mode parses the Ethernet and
//! IPv4 headers, looks the destination up and rewrites the headers for the next hop.

use std::sync::Arc;

use etherparse::{EtherType, Ethernet2HeaderSlice, Ipv4HeaderSlice, SingleVlanHeaderSlice};
use pnet::{
	datalink::MacAddr,
	packet::{
		ethernet::MutableEthernetPacket,
		ipv4::{self, MutableIpv4Packet},
	},
};

use crate::lookup::LookupTable;

const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
const MAX_VLAN_TAGS: usize = 2;

#[inline]
fn is_vlan(ether_type: u16) -> bool {
	ether_type == EtherType::VlanTaggedFrame as u16
		|| ether_type == EtherType::ProviderBridging as u16
		|| ether_type == EtherType::VlanDoubleTaggedFrame as u16
}

/// What to do with one frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardDecision {
	pub transmit: bool,
	pub rewritten_destination: Option<MacAddr>,
}

impl ForwardDecision {
	pub const DROP: Self = Self {
		transmit: false,
		rewritten_destination: None,
	};

	pub const PASS: Self = Self {
		transmit: true,
		rewritten_destination: None,
	};

	fn rewritten(mac: MacAddr) -> Self {
		Self {
			transmit: true,
			rewritten_destination: Some(mac),
		}
	}
}

/// Frame lengths accepted for forwarding, both bounds exclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameWindow {
	pub min: usize,
	pub max: usize,
}

impl Default for FrameWindow {
	/// Anything up to an Ethernet plus IPv4 header is too short to forward
	fn default() -> Self {
		Self { min: 34, max: 2048 }
	}
}

impl FrameWindow {
	#[inline]
	pub fn admits(&self, len: usize) -> bool {
		self.min < len && len < self.max
	}
}

/// Next hop forwarding on the destination IPv4 address
#[derive(Clone, Debug)]
pub struct Router {
	table: Arc<LookupTable>,
	source_mac: Option<MacAddr>,
	decrement_ttl: bool,
}

impl Router {
	pub fn new(table: Arc<LookupTable>) -> Self {
		Self {
			table,
			source_mac: None,
			decrement_ttl: true,
		}
	}

	/// Forwarded frames leave with `mac` as their source
	pub fn with_source_mac(mut self, mac: MacAddr) -> Self {
		self.source_mac = Some(mac);
		self
	}

	pub fn with_ttl_decrement(mut self, on: bool) -> Self {
		self.decrement_ttl = on;
		self
	}

	pub fn table(&self) -> &Arc<LookupTable> {
		&self.table
	}

	/// Destination address and IPv4 header offset, up to two VLAN tags skipped
	///
	/// Only the link and network headers are read, whatever follows the IPv4 header is payload.
	fn locate(frame: &[u8]) -> Option<(u32, usize)> {
		let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
		let mut ether_type = eth.ether_type();
		let mut off = ETH_HLEN;
		for _ in 0..MAX_VLAN_TAGS {
			if !is_vlan(ether_type) {
				break;
			}
			let tag = SingleVlanHeaderSlice::from_slice(frame.get(off..)?).ok()?;
			ether_type = tag.ether_type();
			off += VLAN_HLEN;
		}
		if ether_type != EtherType::Ipv4 as u16 {
			return None;
		}
		let ip = Ipv4HeaderSlice::from_slice(frame.get(off..)?).ok()?;
		Some((u32::from(ip.destination_addr()), off))
	}

	pub fn decide(&self, frame: &mut [u8]) -> ForwardDecision {
		let (dst, ip_off) = match Self::locate(frame) {
			Some(found) => found,
			None => return ForwardDecision::DROP,
		};
		let next_hop = match self.table.lookup(dst) {
			Some(mac) => mac,
			None => return ForwardDecision::DROP,
		};

		if self.decrement_ttl {
			let mut ip = match MutableIpv4Packet::new(&mut frame[ip_off..]) {
				Some(ip) => ip,
				None => return ForwardDecision::DROP,
			};
			let ttl = ip.get_ttl();
			if ttl <= 1 {
				return ForwardDecision::DROP;
			}
			ip.set_ttl(ttl - 1);
			let sum = ipv4::checksum(&ip.to_immutable());
			ip.set_checksum(sum);
		}

		match MutableEthernetPacket::new(frame) {
			Some(mut eth) => {
				eth.set_destination(next_hop);
				if let Some(src) = self.source_mac {
					eth.set_source(src);
				}
				ForwardDecision::rewritten(next_hop)
			}
			None => ForwardDecision::DROP,
		}
	}
}

/// How frames move from an RX ring to its TX ring
#[derive(Clone, Debug)]
pub enum Strategy {
	/// Bridge every frame of acceptable length unchanged
	Passthrough,
	Routed(Router),
}

/// A strategy together with the frame length window it applies to
#[derive(Clone, Debug)]
pub struct Forwarding {
	window: FrameWindow,
	strategy: Strategy,
}

impl Forwarding {
	pub fn new(strategy: Strategy, window: FrameWindow) -> Self {
		Self { window, strategy }
	}

	pub fn passthrough() -> Self {
		Self::new(Strategy::Passthrough, FrameWindow::default())
	}

	pub fn routed(router: Router) -> Self {
		Self::new(Strategy::Routed(router), FrameWindow::default())
	}

	#[inline]
	pub fn window(&self) -> FrameWindow {
		self.window
	}

	pub fn strategy(&self) -> &Strategy {
		&self.strategy
	}

	/// Decides on `frame`, which is exactly as long as its slot says
	#[inline]
	pub fn decide(&self, frame: &mut [u8]) -> ForwardDecision {
		if !self.window.admits(frame.len()) {
			return ForwardDecision::DROP;
		}
		match &self.strategy {
			Strategy::Passthrough => ForwardDecision::PASS,
			Strategy::Routed(router) => router.decide(frame),
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::lookup::Ipv4Net;
	use pnet::packet::ipv4::Ipv4Packet;
	use proptest::prelude::*;
	use std::net::Ipv4Addr;

	pub(crate) const ROUTER: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x01);
	const NEXT_HOP: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x77);

	/// An Ethernet frame carrying an IPv4 header of protocol 0xfd and a zeroed payload
	pub(crate) fn ipv4_frame(dst: [u8; 4], ttl: u8, vlan_tags: usize, len: usize) -> Vec<u8> {
		let mut f = vec![0u8; len];
		f[..6].copy_from_slice(&[0xff; 6]);
		f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x99]);
		let mut off = 12;
		for _ in 0..vlan_tags {
			f[off..off + 4].copy_from_slice(&[0x81, 0x00, 0x00, 0x0a]);
			off += 4;
		}
		f[off..off + 2].copy_from_slice(&[0x08, 0x00]);
		let ip = off + 2;
		let total = (len - ip) as u16;
		f[ip] = 0x45;
		f[ip + 2..ip + 4].copy_from_slice(&total.to_be_bytes());
		f[ip + 8] = ttl;
		f[ip + 9] = 0xfd;
		f[ip + 12..ip + 16].copy_from_slice(&[10, 0, 0, 1]);
		f[ip + 16..ip + 20].copy_from_slice(&dst);
		f
	}

	fn routed() -> Forwarding {
		let table = Arc::new(LookupTable::new());
		table.add_route("192.168.1.0/24".parse::<Ipv4Net>().unwrap(), NEXT_HOP);
		Forwarding::routed(Router::new(table).with_source_mac(ROUTER))
	}

	#[test]
	fn passthrough_only_checks_length() {
		let fwd = Forwarding::passthrough();
		assert_eq!(fwd.decide(&mut [0u8; 100]), ForwardDecision::PASS);
		assert_eq!(fwd.decide(&mut [0u8; 34]), ForwardDecision::DROP);
		assert_eq!(fwd.decide(&mut [0u8; 35]), ForwardDecision::PASS);
		assert_eq!(fwd.decide(&mut vec![0u8; 2047]), ForwardDecision::PASS);
		assert_eq!(fwd.decide(&mut vec![0u8; 2048]), ForwardDecision::DROP);
	}

	#[test]
	fn routed_hit_rewrites_macs_and_ttl() {
		let fwd = routed();
		let mut frame = ipv4_frame([192, 168, 1, 20], 64, 0, 100);
		let d = fwd.decide(&mut frame);
		assert_eq!(d, ForwardDecision::rewritten(NEXT_HOP));
		assert_eq!(&frame[..6], &[0x02, 0, 0, 0, 0, 0x77]);
		assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 0x01]);

		let ip = Ipv4Packet::new(&frame[14..]).unwrap();
		assert_eq!(ip.get_ttl(), 63);
		assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));
		assert_eq!(ip.get_destination(), Ipv4Addr::new(192, 168, 1, 20));
	}

	#[test]
	fn routed_miss_is_dropped_untouched() {
		let fwd = routed();
		let mut frame = ipv4_frame([172, 16, 0, 1], 64, 0, 100);
		let before = frame.clone();
		assert_eq!(fwd.decide(&mut frame), ForwardDecision::DROP);
		assert_eq!(frame, before);
	}

	#[test]
	fn expiring_ttl_is_dropped() {
		let fwd = routed();
		assert!(!fwd.decide(&mut ipv4_frame([192, 168, 1, 20], 1, 0, 100)).transmit);
		assert!(!fwd.decide(&mut ipv4_frame([192, 168, 1, 20], 0, 0, 100)).transmit);
		assert!(fwd.decide(&mut ipv4_frame([192, 168, 1, 20], 2, 0, 100)).transmit);
	}

	#[test]
	fn vlan_tags_are_skipped() {
		let fwd = routed();
		for tags in 1..=2 {
			let mut frame = ipv4_frame([192, 168, 1, 9], 64, tags, 120);
			assert!(fwd.decide(&mut frame).transmit, "{} tags", tags);
			let ip = Ipv4Packet::new(&frame[14 + 4 * tags..]).unwrap();
			assert_eq!(ip.get_ttl(), 63);
		}
	}

	#[test]
	fn non_ipv4_is_dropped() {
		let fwd = routed();
		let mut frame = ipv4_frame([192, 168, 1, 20], 64, 0, 100);
		frame[12..14].copy_from_slice(&[0x86, 0xdd]);
		assert_eq!(fwd.decide(&mut frame), ForwardDecision::DROP);
		let mut arp = ipv4_frame([192, 168, 1, 20], 64, 0, 100);
		arp[12..14].copy_from_slice(&[0x08, 0x06]);
		assert_eq!(fwd.decide(&mut arp), ForwardDecision::DROP);
	}

	fn with_protocol(mut frame: Vec<u8>, proto: u8) -> Vec<u8> {
		frame[14 + 9] = proto;
		frame
	}

	#[test]
	fn transport_headers_are_not_inspected() {
		let fwd = routed();
		let dst = [192, 168, 1, 20];
		// tcp with a zeroed header, i.e. a data offset of 0
		let mut tcp = with_protocol(ipv4_frame(dst, 64, 0, 100), 6);
		assert_eq!(fwd.decide(&mut tcp), ForwardDecision::rewritten(NEXT_HOP));
		assert_eq!(Ipv4Packet::new(&tcp[14..]).unwrap().get_ttl(), 63);

		let mut well_formed = with_protocol(ipv4_frame(dst, 64, 0, 100), 6);
		well_formed[34 + 12] = 0x50;
		assert!(fwd.decide(&mut well_formed).transmit);

		let mut short_tcp = with_protocol(ipv4_frame(dst, 64, 0, 50), 6);
		assert!(fwd.decide(&mut short_tcp).transmit);

		let mut short_udp = with_protocol(ipv4_frame(dst, 64, 0, 40), 17);
		assert!(fwd.decide(&mut short_udp).transmit);

		// fragment offset 185 * 8, no transport header in this piece
		let mut fragment = with_protocol(ipv4_frame(dst, 64, 0, 120), 6);
		fragment[14 + 6..14 + 8].copy_from_slice(&[0x00, 0xb9]);
		assert!(fwd.decide(&mut fragment).transmit);
		assert_eq!(&fragment[..6], &[0x02, 0, 0, 0, 0, 0x77]);
	}

	#[test]
	fn three_vlan_tags_are_too_many() {
		let fwd = routed();
		let mut frame = ipv4_frame([192, 168, 1, 20], 64, 3, 120);
		assert_eq!(fwd.decide(&mut frame), ForwardDecision::DROP);
	}

	#[test]
	fn ttl_can_be_left_alone() {
		let table = Arc::new(LookupTable::new());
		table.add_route(Ipv4Net::any(), NEXT_HOP);
		let fwd = Forwarding::routed(Router::new(table).with_ttl_decrement(false));
		let mut frame = ipv4_frame([1, 2, 3, 4], 1, 0, 60);
		assert!(fwd.decide(&mut frame).transmit);
		assert_eq!(frame[14 + 8], 1);
		// source untouched without a router MAC
		assert_eq!(&frame[6..12], &[0x02, 0, 0, 0, 0, 0x99]);
	}

	proptest! {
		#[test]
		fn lengths_outside_the_window_never_transmit(len in prop_oneof![0usize..=34, 2048usize..4096]) {
			let mut frame = vec![0u8; len];
			prop_assert!(!Forwarding::passthrough().decide(&mut frame).transmit);
			if len >= 14 + 20 + 1 {
				let mut frame = ipv4_frame([192, 168, 1, 20], 64, 0, len);
				prop_assert!(!routed().decide(&mut frame).transmit);
			}
		}
	}
}
