use super::flowkey::FlowKey;
use super::headers;
use super::headers::{Ethernet, IPv4, TCP, UDP};
use super::packet::Packet;
use super::util;

// PACKET DECODER
//
// Parses the L2/L3/L4 headers of a captured packet into a provisional
// FlowKey. Only Ethernet + IPv4 + (TCP|UDP) is understood; everything else
// is a silent drop (None), not an error.
//
//   Decoded - provisional flow key plus the IP datagram length
//   decode(&mut Packet) -> Option<Decoded>
//
// The provisional key assigns the packet source to the local side
// (local_ip = saddr); flowkey::localize() fixes that up afterwards.

pub struct Decoded {
    pub key: FlowKey,
    pub length: u16, // IP total length, the byte count the flow tables account
}

pub fn decode(p: &mut Packet) -> Option<Decoded> {
    let len = p.length as usize;
    let eth_size = headers::size_of::<Ethernet>();
    if len < eth_size + headers::size_of::<IPv4>() { return None; }

    let mut key = FlowKey::default();

    let eth = headers::from_mem::<Ethernet>(&mut p.data);
    key.l3_protocol = eth.ethertype();
    if key.l3_protocol != headers::TYPE_IPV4 { return None; }

    let ip = headers::from_mem::<IPv4>(&mut p.data[eth_size..]);
    if ip.version() != 4 || ip.ihl() < 5 { return None; }
    let ip_size = ip.ihl() as usize * 4;
    key.local_ip = util::ntohl(ip.src());
    key.remote_ip = util::ntohl(ip.dst());
    key.l4_protocol = ip.protocol();
    let length = ip.total_length();

    let l4_ofs = eth_size + ip_size;
    match key.l4_protocol {
        headers::PROTOCOL_TCP => {
            if len < l4_ofs + headers::size_of::<TCP>() { return None; }
            let tcp = headers::from_mem::<TCP>(&mut p.data[l4_ofs..]);
            key.local_port = tcp.src_port();
            key.remote_port = tcp.dst_port();
        }
        headers::PROTOCOL_UDP => {
            if len < l4_ofs + headers::size_of::<UDP>() { return None; }
            let udp = headers::from_mem::<UDP>(&mut p.data[l4_ofs..]);
            key.local_port = udp.src_port();
            key.remote_port = udp.dst_port();
        }
        _ => return None,
    }

    Some(Decoded { key, length })
}

#[cfg(test)]
pub mod testpkt {
    use super::*;
    use crate::packet;

    // Synthesize an Ethernet+IPv4+TCP/UDP packet for tests.
    pub fn build(proto: u8, saddr: &str, daddr: &str, sport: u16, dport: u16,
                 ip_len: u16) -> Box<Packet> {
        let mut p = packet::allocate();
        let eth_size = headers::size_of::<Ethernet>();
        let ip_size = headers::size_of::<IPv4>();
        let mut eth = headers::from_mem::<Ethernet>(&mut p.data);
        eth.set_ethertype(headers::TYPE_IPV4);
        let mut ip = headers::from_mem::<IPv4>(&mut p.data[eth_size..]);
        ip.set_version(4);
        ip.set_ihl(5);
        ip.set_total_length(ip_len);
        ip.set_protocol(proto);
        ip.set_src(headers::pton(saddr));
        ip.set_dst(headers::pton(daddr));
        let l4_ofs = eth_size + ip_size;
        match proto {
            headers::PROTOCOL_TCP => {
                let mut tcp = headers::from_mem::<TCP>(&mut p.data[l4_ofs..]);
                tcp.set_src_port(sport);
                tcp.set_dst_port(dport);
                p.length = (l4_ofs + headers::size_of::<TCP>()) as u16;
            }
            headers::PROTOCOL_UDP => {
                let mut udp = headers::from_mem::<UDP>(&mut p.data[l4_ofs..]);
                udp.set_src_port(sport);
                udp.set_dst_port(dport);
                udp.set_len(ip_len - ip_size as u16);
                p.length = (l4_ofs + headers::size_of::<UDP>()) as u16;
            }
            _ => p.length = l4_ofs as u16,
        }
        p
    }
}
