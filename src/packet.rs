use std::cell::RefCell;

// PACKET STRUCT AND FREELIST
//
// This module defines a struct to represent captured packets, and implements
// a per-thread freelist from which packets can be allocated.
//
//   Packet - packet structure with length and data fields
//   PAYLOAD_SIZE - size of packet's data field (the capture snap length)
//   allocate() -> Box<Packet> - take a packet off the freelist for use
//   free(Box<Packet>) - return a packet to the freelist
//
// In pipeline mode packets are allocated on the capture thread and freed on
// the last monitor's worker thread, so each thread keeps its own freelist:
// allocation falls back to the heap when the local list runs dry, and frees
// beyond MAX_FREE simply return memory to the allocator. No locks, and no
// cross-thread traffic on the freelists themselves.

// Snap length. Headers are all the analyzer reads; anything beyond this is
// truncated at capture time (the on-wire frame length is tracked separately).
pub const PAYLOAD_SIZE: usize = 2048;

pub struct Packet {
    pub length: u16, // captured data length
    pub data: [u8; PAYLOAD_SIZE]
}

// Per-thread freelist bound.
const MAX_FREE: usize = 8192;

thread_local! {
    static FL: RefCell<Vec<Box<Packet>>> = RefCell::new(Vec::new());
}

#[inline(always)]
pub fn allocate() -> Box<Packet> {
    FL.with(|fl| fl.borrow_mut().pop())
        .unwrap_or_else(|| Box::new(Packet { length: 0, data: [0; PAYLOAD_SIZE] }))
}

pub fn free(mut p: Box<Packet>) {
    p.length = 0;
    FL.with(|fl| {
        let mut fl = fl.borrow_mut();
        if fl.len() < MAX_FREE { fl.push(p); }
        // else: drop, returning the buffer to the allocator
    });
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn alloc() {
        let mut p = allocate();
        assert_eq!(p.length, 0);
        p.length = 42;
        p.data[0] = 42;
        free(p);
        // recycled off the freelist with length reset
        let p = allocate();
        assert_eq!(p.length, 0);
        free(p);
    }

    #[test]
    fn freelist_is_bounded() {
        let packets: Vec<_> = (0..MAX_FREE + 10).map(|_| allocate()).collect();
        for p in packets { free(p); }
        FL.with(|fl| assert_eq!(fl.borrow().len(), MAX_FREE));
    }
}
