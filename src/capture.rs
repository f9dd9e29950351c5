use std::ffi;
use std::io;
use std::mem;
use std::ptr;

use super::error::{PnaError, Result};
use super::packet::{self, Packet};
use super::util;

// PACKET CAPTURE
//
// AF_PACKET raw-socket ingress bound to the monitored interface, in
// promiscuous mode. One Capture per shard; with more than one shard the
// sockets join a PACKET_FANOUT group hashed on the flow so each shard sees
// a disjoint slice of the traffic.
//
//   Capture - an open capture socket
//   open(iface, fanout) -> Result<Capture>
//   wait_readable(millis) -> bool - select(2) with a timeout, so the
//       capture loop can notice the stop flag on quiet links
//   recv() -> Option<(Box<Packet>, u32, bool)> - one frame: the packet
//       (snapped to PAYLOAD_SIZE), the on-wire frame length, and whether
//       the kernel marked it outgoing
//
// recv() passes MSG_TRUNC so the frame length survives the snap, and reads
// the sockaddr_ll packet type so the dispatcher can reject PACKET_OUTGOING.

// not in the libc crate at the time of writing
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_FANOUT_HASH: libc::c_int = 0;

pub struct Capture {
    sock: i32
}

impl Capture {

    pub fn open(iface: &str, fanout: Option<u16>) -> Result<Capture> {
        let err = |source: io::Error| PnaError::Capture {
            iface: iface.to_string(),
            source
        };
        let index = unsafe { libc::if_nametoindex(cstr(iface).as_ptr()) };
        if index == 0 {
            return Err(err(io::Error::last_os_error()));
        }
        let proto_eth = util::htons(libc::ETH_P_ALL as u16) as i32;
        let sock = unsafe {
            libc::socket(libc::AF_PACKET,
                         libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                         proto_eth)
        };
        if sock == -1 {
            return Err(err(io::Error::last_os_error()));
        }
        let capture = Capture { sock }; // closes the fd on any error below

        unsafe {
            let addr = libc::sockaddr_ll {
                sll_family: libc::AF_PACKET as u16,
                sll_ifindex: index as i32,
                sll_protocol: proto_eth as u16,
                // Unset / zero
                sll_addr: [0; 8],
                sll_hatype: 0,
                sll_halen: 0,
                sll_pkttype: 0
            };
            let sa = &addr as *const libc::sockaddr_ll as *const libc::sockaddr;
            let addrlen = mem::size_of::<libc::sockaddr_ll>() as u32;
            if libc::bind(sock, sa, addrlen) == -1 {
                return Err(err(io::Error::last_os_error()));
            }

            let mreq = libc::packet_mreq {
                mr_ifindex: index as i32,
                mr_type: libc::PACKET_MR_PROMISC as u16,
                mr_alen: 0,
                mr_address: [0; 8]
            };
            if libc::setsockopt(sock, libc::SOL_PACKET,
                                libc::PACKET_ADD_MEMBERSHIP,
                                &mreq as *const libc::packet_mreq
                                    as *const ffi::c_void,
                                mem::size_of::<libc::packet_mreq>() as u32)
                == -1
            {
                return Err(err(io::Error::last_os_error()));
            }

            if let Some(group) = fanout {
                let arg: libc::c_int =
                    group as libc::c_int | (PACKET_FANOUT_HASH << 16);
                if libc::setsockopt(sock, libc::SOL_PACKET, PACKET_FANOUT,
                                    &arg as *const libc::c_int
                                        as *const ffi::c_void,
                                    mem::size_of::<libc::c_int>() as u32)
                    == -1
                {
                    return Err(err(io::Error::last_os_error()));
                }
            }
        }

        Ok(capture)
    }

    pub fn wait_readable(&self, millis: i64) -> bool {
        let mut fdset = FdSet::new();
        let fdmax = self.sock + 1;
        let writefds = ptr::null_mut();
        let exceptfds = ptr::null_mut();
        let timeout = &mut libc::timeval {
            tv_sec: millis / 1000,
            tv_usec: (millis % 1000) * 1000
        };
        fdset.set(self.sock);
        let ret = unsafe {
            libc::select(fdmax, fdset.as_mut_ptr(), writefds, exceptfds,
                         timeout)
        };
        ret == 1
    }

    pub fn recv(&self) -> Option<(Box<Packet>, u32, bool)> {
        let mut p = packet::allocate();
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_ll>() as u32;
        let read = unsafe {
            libc::recvfrom(self.sock,
                           p.data.as_mut_ptr() as *mut ffi::c_void,
                           packet::PAYLOAD_SIZE,
                           libc::MSG_TRUNC,
                           &mut addr as *mut libc::sockaddr_ll
                               as *mut libc::sockaddr,
                           &mut addrlen)
        };
        if read < 0 {
            packet::free(p);
            return None; // EAGAIN and friends; the loop selects and retries
        }
        let frame_len = read as u32;
        p.length = frame_len.min(packet::PAYLOAD_SIZE as u32) as u16;
        let outgoing = addr.sll_pkttype == libc::PACKET_OUTGOING as u8;
        Some((p, frame_len, outgoing))
    }

}

impl Drop for Capture {
    fn drop(&mut self) {
        unsafe { libc::close(self.sock); }
    }
}

fn cstr(s: &str) -> ffi::CString {
    ffi::CString::new(s).expect("interface name contains NUL")
}

struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> FdSet {
        unsafe {
            let mut raw_fd_set = mem::MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(raw_fd_set.as_mut_ptr());
            FdSet(raw_fd_set.assume_init())
        }
    }

    fn set(&mut self, fd: i32) {
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}
