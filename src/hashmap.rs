use std::mem;
use std::slice;

use byteorder::{ByteOrder, LittleEndian};

// TWO-CHOICE BUCKETED HASH MAP
//
// A fixed-capacity, insert-and-lookup-only map. Keys hash to one candidate
// bucket in each half of the bucket array; an entry lives in whichever of
// the two was less loaded at insert time. There is no eviction and no
// relocation: when both candidate buckets are full the insert is refused
// and the caller decides the policy. This is the general flow index used by
// the real-time monitors, not the three-level flow table.
//
//   MapKey - trait for types usable as keys
//   HashMap<K, V> - the map
//   new(n_pairs) -> HashMap - fixed capacity of n_pairs entries
//   get(&K) -> Option<&V> / get_mut(&K) -> Option<&mut V>
//   put(K, V) -> Option<&mut V> - None when full or both buckets loaded
//   get_or_put(K) -> Option<&mut V> - lookup, inserting a default on miss
//   reset() - clear all buckets and pairs
//
// Each bucket holds BKT_SIZE slot words packing a key fingerprint (high
// bits) and an index into the pair store (low bits). A slot word of zero is
// an empty slot; a fingerprint that happens to hash to zero makes its entry
// unfindable, which costs a duplicate pair, never a wrong answer.

pub const BKT_SIZE: usize = 4;

// MurmurHash3-x64-128 seeds selecting the two bucket hash functions.
const C0: u32 = 0xa96347c5;
const C1: u32 = 0xe65ac2d3;

/// Keys are hashed and compared through their raw byte image, so
/// implementors must be padding-free (e.g. `#[repr(C)]` with no gaps).
pub trait MapKey: Copy + PartialEq {
    fn as_bytes(&self) -> &[u8] {
        unsafe {
            slice::from_raw_parts(self as *const Self as *const u8,
                                  mem::size_of::<Self>())
        }
    }
}

impl MapKey for u32 {}
impl MapKey for u64 {}

pub struct HashMap<K, V> {
    n_pairs: u32,
    n_buckets: u32,
    bkt_mask: u32,
    kvx_mask: u32,
    fp_mask: u32,
    buckets: Vec<[u32; BKT_SIZE]>, // 2 * n_buckets: left half, right half
    pairs: Vec<(K, V)>,
    next_idx: u32
}

impl<K: MapKey + Default, V: Clone + Default> HashMap<K, V> {

    pub fn new(n_pairs: u32) -> HashMap<K, V> {
        // need at least 4 buckets, and 8*n_buckets > n_pairs
        let mut n_buckets: u32 = 4;
        while 8 * n_buckets <= n_pairs {
            n_buckets <<= 1;
        }
        let kvx_mask = 8 * n_buckets - 1;
        HashMap {
            n_pairs,
            n_buckets,
            bkt_mask: n_buckets - 1,
            kvx_mask,
            fp_mask: !kvx_mask,
            buckets: vec![[0; BKT_SIZE]; (2 * n_buckets) as usize],
            pairs: vec![(K::default(), V::default()); n_pairs as usize],
            next_idx: 0
        }
    }

    // Bucket index and fingerprint of a key under hash function `func`.
    fn hashit(&self, key: &K, func: usize) -> (u32, u32) {
        let seed = if func == 0 { C1 } else { C0 };
        let (lo, hi) = murmur3_x64_128(key.as_bytes(), seed);
        ((lo as u32) & self.bkt_mask, (hi as u32) & self.fp_mask)
    }

    fn find(&self, key: &K) -> Option<usize> {
        for func in 0..2 {
            let (mut bkt, fp) = self.hashit(key, func);
            if func == 1 { bkt += self.n_buckets; }
            for slot in &self.buckets[bkt as usize] {
                if *slot != 0 && (*slot & self.fp_mask) == fp {
                    let idx = (*slot & self.kvx_mask) as usize;
                    if self.pairs[idx].0 == *key {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(move |idx| &self.pairs[idx].1)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find(key).map(move |idx| &mut self.pairs[idx].1)
    }

    fn put_idx(&mut self, key: K, value: V) -> Option<usize> {
        // refuse when the pair store is exhausted
        if self.next_idx >= self.n_pairs { return None; }

        // count free slots in both candidate buckets, remembering one
        let (b0, fp0) = self.hashit(&key, 0);
        let (b1, fp1) = self.hashit(&key, 1);
        let b1 = b1 + self.n_buckets;
        let (mut n0, mut i0) = (0, 0);
        for (i, slot) in self.buckets[b0 as usize].iter().enumerate() {
            if *slot == 0 { n0 += 1; i0 = i; }
        }
        let (mut n1, mut i1) = (0, 0);
        for (i, slot) in self.buckets[b1 as usize].iter().enumerate() {
            if *slot == 0 { n1 += 1; i1 = i; }
        }
        if n0 + n1 == 0 { return None; }

        let idx = self.next_idx;
        self.next_idx += 1;
        self.pairs[idx as usize] = (key, value);
        // slot in the less-loaded half, preferring the left on a tie
        if n0 >= n1 {
            self.buckets[b0 as usize][i0] = fp0 | (idx & self.kvx_mask);
        } else {
            self.buckets[b1 as usize][i1] = fp1 | (idx & self.kvx_mask);
        }
        Some(idx as usize)
    }

    pub fn put(&mut self, key: K, value: V) -> Option<&mut V> {
        self.put_idx(key, value).map(move |idx| &mut self.pairs[idx].1)
    }

    pub fn get_or_put(&mut self, key: K) -> Option<&mut V> {
        match self.find(&key) {
            Some(idx) => Some(&mut self.pairs[idx].1),
            None => self.put(key, V::default())
        }
    }

    pub fn reset(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = [0; BKT_SIZE];
        }
        for pair in self.pairs.iter_mut() {
            *pair = (K::default(), V::default());
        }
        self.next_idx = 0;
    }

    pub fn len(&self) -> u32 { self.next_idx }

    pub fn is_empty(&self) -> bool { self.next_idx == 0 }

}

// MurmurHash3-x64-128 (public domain reference algorithm by Austin Appleby),
// returning the two 64-bit lanes.
fn murmur3_x64_128(data: &[u8], seed: u32) -> (u64, u64) {
    const K1: u64 = 0x87c37b91114253d5;
    const K2: u64 = 0x4cf5ad432745937f;

    let len = data.len();
    let nblocks = len / 16;
    let mut h1 = seed as u64;
    let mut h2 = seed as u64;

    for i in 0..nblocks {
        let mut k1 = LittleEndian::read_u64(&data[i * 16..]);
        let mut k2 = LittleEndian::read_u64(&data[i * 16 + 8..]);

        k1 = k1.wrapping_mul(K1).rotate_left(31).wrapping_mul(K2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dce729);

        k2 = k2.wrapping_mul(K2).rotate_left(33).wrapping_mul(K1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x38495ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    if tail.len() > 8 {
        for (i, b) in tail[8..].iter().enumerate() {
            k2 ^= (*b as u64) << (i * 8);
        }
        k2 = k2.wrapping_mul(K2).rotate_left(33).wrapping_mul(K1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        for (i, b) in tail[..tail.len().min(8)].iter().enumerate() {
            k1 ^= (*b as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(K1).rotate_left(31).wrapping_mul(K2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod selftest {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn murmur() {
        // known vector: empty input, zero seed hashes to zero
        assert_eq!(murmur3_x64_128(&[], 0), (0, 0));
        // deterministic, and the two seeds disagree
        let key = 0xdeadbeefu32;
        assert_eq!(murmur3_x64_128(key.as_bytes(), C0),
                   murmur3_x64_128(key.as_bytes(), C0));
        assert_ne!(murmur3_x64_128(key.as_bytes(), C0),
                   murmur3_x64_128(key.as_bytes(), C1));
    }

    #[test]
    fn bucket_sizing() {
        // minimum of 4 buckets, doubling while 8*n_buckets <= n_pairs
        let map: HashMap<u32, u32> = HashMap::new(8);
        assert_eq!(map.n_buckets, 4);
        let map: HashMap<u32, u32> = HashMap::new(1024);
        assert_eq!(map.n_buckets, 256);
        assert_eq!(map.kvx_mask, 2047);
        assert_eq!(map.fp_mask, !2047u32);
    }

    #[test]
    fn put_then_get() {
        let mut map: HashMap<u32, u64> = HashMap::new(64);
        assert!(map.get(&7).is_none());
        assert!(map.put(7, 700).is_some());
        assert_eq!(map.get(&7), Some(&700));
        *map.get_mut(&7).unwrap() += 1;
        assert_eq!(map.get(&7), Some(&701));
        map.reset();
        assert!(map.get(&7).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn fill_to_capacity() {
        // capacity 1024: 1024 distinct keys all fit, the 1025th is refused
        let mut map: HashMap<u64, u64> = HashMap::new(1024);
        let mut rng = StdRng::seed_from_u64(42);
        let keys: Vec<u64> = (0..1024).map(|_| rng.gen::<u64>() | 1).collect();
        for (i, k) in keys.iter().enumerate() {
            assert!(map.put(*k, i as u64).is_some(), "insert {} refused", i);
        }
        assert!(map.put(0xffff_ffff_ffff_fffe, 0).is_none());
        // prior entries are intact
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(map.get(k), Some(&(i as u64)));
        }
    }

    #[test]
    fn get_or_put() {
        let mut map: HashMap<u32, u32> = HashMap::new(16);
        *map.get_or_put(5).unwrap() += 1;
        *map.get_or_put(5).unwrap() += 1;
        assert_eq!(map.get(&5), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn overload_degrades_gracefully() {
        // past capacity the map refuses inserts but never corrupts
        let mut map: HashMap<u64, u64> = HashMap::new(128);
        let mut rng = StdRng::seed_from_u64(7);
        let mut stored = Vec::new();
        for _ in 0..256 {
            let k = rng.gen::<u64>() | 1;
            if map.put(k, k ^ 1).is_some() {
                stored.push(k);
            }
        }
        assert!(stored.len() <= 128);
        for k in &stored {
            assert_eq!(map.get(k), Some(&(k ^ 1)));
        }
    }
}
