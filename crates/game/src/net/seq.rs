use std::fmt;

const SEQ_MODULUS: u32 = 1 << 16;
const SEQ_HALF: u32 = 1 << 15;

/// Cyclic 16-bit sequence number. `a` precedes `b` iff
/// `(b - a) mod 2^16` lies in `(0, 2^15]`; equal values compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(pub u16);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn increment(self, amount: i32) -> Seq {
        Seq((self.0 as i64 + amount as i64).rem_euclid(SEQ_MODULUS as i64) as u16)
    }

    pub fn precedes(self, other: Seq) -> bool {
        if self.0 == other.0 {
            return false;
        }
        let delta = other.0.wrapping_sub(self.0) as u32;
        delta > 0 && delta <= SEQ_HALF
    }

    pub fn follows(self, other: Seq) -> bool {
        other.precedes(self)
    }

    pub fn later(self, other: Seq) -> Seq {
        if self.precedes(other) { other } else { self }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub const CACHE_SIZE: usize = 256;

/// Ring of 256 slots keyed by sequence number. Inserting overwrites the
/// slot at `seq % 256`; lookups only hit on an exact sequence match, so
/// a newer occupant silently shadows an older one.
pub struct PacketCache<V> {
    entries: Vec<Option<(Seq, V)>>,
}

impl<V> PacketCache<V> {
    pub fn new() -> Self {
        Self {
            entries: (0..CACHE_SIZE).map(|_| None).collect(),
        }
    }

    fn slot(seq: Seq) -> usize {
        seq.0 as usize % CACHE_SIZE
    }

    pub fn insert(&mut self, seq: Seq, value: V) {
        self.entries[Self::slot(seq)] = Some((seq, value));
    }

    pub fn get(&self, seq: Seq) -> Option<&V> {
        match &self.entries[Self::slot(seq)] {
            Some((stored, value)) if *stored == seq => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, seq: Seq) -> Option<&mut V> {
        match &mut self.entries[Self::slot(seq)] {
            Some((stored, value)) if *stored == seq => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.get(seq).is_some()
    }

    pub fn remove(&mut self, seq: Seq) -> Option<V> {
        if self.contains(seq) {
            self.entries[Self::slot(seq)].take().map(|(_, v)| v)
        } else {
            None
        }
    }
}

impl<V> Default for PacketCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_modular() {
        assert!(Seq(1).precedes(Seq(2)));
        assert!(!Seq(2).precedes(Seq(1)));
        assert!(Seq(u16::MAX).precedes(Seq(0)));
        assert!(!Seq(0).precedes(Seq(u16::MAX)));
        assert!(Seq(0).precedes(Seq(SEQ_HALF as u16)));
        assert!(!Seq(0).precedes(Seq(SEQ_HALF as u16 + 1)));
    }

    #[test]
    fn ordering_is_irreflexive() {
        for value in [0u16, 1, 255, u16::MAX] {
            assert!(!Seq(value).precedes(Seq(value)));
            assert!(!Seq(value).follows(Seq(value)));
        }
    }

    #[test]
    fn increment_wraps() {
        assert_eq!(Seq(u16::MAX).increment(1), Seq(0));
        assert_eq!(Seq(0).increment(-1), Seq(u16::MAX));
        assert_eq!(Seq(10).increment(-3), Seq(7));
    }

    #[test]
    fn cache_round_trip() {
        let mut cache = PacketCache::new();
        cache.insert(Seq(5), "five");
        assert_eq!(cache.get(Seq(5)), Some(&"five"));
        assert_eq!(cache.get(Seq(6)), None);
    }

    #[test]
    fn cache_eviction_on_slot_collision() {
        let mut cache = PacketCache::new();
        cache.insert(Seq(5), 5u32);
        cache.insert(Seq(5 + CACHE_SIZE as u16), 261u32);
        assert_eq!(cache.get(Seq(5)), None);
        assert_eq!(cache.get(Seq(5 + CACHE_SIZE as u16)), Some(&261));
    }

    #[test]
    fn cache_remove_requires_exact_match() {
        let mut cache = PacketCache::new();
        cache.insert(Seq(7), 7u32);
        assert_eq!(cache.remove(Seq(7 + CACHE_SIZE as u16)), None);
        assert_eq!(cache.remove(Seq(7)), Some(7));
        assert!(!cache.contains(Seq(7)));
    }
}
