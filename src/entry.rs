//! Storage records: a [`Key`] plus an occurrence counter and first-game
//! reference, in both packed (8 byte) and unpacked (16 byte) forms.
//!
//! The packed form is the on-disk format. A single `u64` holds, from the
//! least significant bit: 6 bits for the count bit-length `N`, then `N` bits
//! of count, then `58 - N` bits of first-game offset. As the count grows,
//! `N` grows and the offset window shrinks; once the offset no longer fits,
//! `N` is forced to 58 and the reference is dropped for good. Queries then
//! report the first game as unavailable while the count stays exact.
//!
//! Records are 24 bytes on disk: four little-endian `u32` key lanes followed
//! by the packed counter.

use crate::chess::{GameLevel, GameResult, Position, ReverseMove};
use crate::key::Key;

/// Size of one on-disk record.
pub const ENTRY_SIZE: usize = 24;

const SIZE_BITS: u64 = 6;
const DATA_BITS: u64 = 64 - SIZE_BITS;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const MAX_COUNT: u64 = (1 << DATA_BITS) - 1;

fn bit_length(value: u64) -> u64 {
    (64 - value.leading_zeros() as u64).max(1)
}

/// Unpacked counter: exact count plus first-game offset.
///
/// Used as the aggregation form; `u64::MAX` marks a missing offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountAndGameOffset {
    count: u64,
    game_offset: u64,
}

impl CountAndGameOffset {
    pub const INVALID_OFFSET: u64 = u64::MAX;

    pub fn new(count: u64, game_offset: Option<u64>) -> Self {
        Self {
            count,
            game_offset: game_offset.unwrap_or(Self::INVALID_OFFSET),
        }
    }

    pub fn zero() -> Self {
        Self::new(0, None)
    }

    pub fn single(game_offset: u64) -> Self {
        Self::new(1, Some(game_offset))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn game_offset(&self) -> Option<u64> {
        (self.game_offset != Self::INVALID_OFFSET).then_some(self.game_offset)
    }

    /// Sum counts, keep the earliest available game offset.
    pub fn combine(&mut self, rhs: &Self) {
        self.count = self.count.saturating_add(rhs.count);
        self.game_offset = self.game_offset.min(rhs.game_offset);
    }
}

/// Packed counter, see the module docs for the bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedCountAndGameOffset(u64);

impl PackedCountAndGameOffset {
    pub fn single(game_offset: u64) -> Self {
        Self::pack(1, Some(game_offset))
    }

    pub fn pack(count: u64, game_offset: Option<u64>) -> Self {
        let count = count.min(MAX_COUNT);
        let count_bits = bit_length(count);
        match game_offset {
            Some(offset)
                if count_bits < DATA_BITS && offset < (1u64 << (DATA_BITS - count_bits)) =>
            {
                Self(count_bits | (count << SIZE_BITS) | (offset << (SIZE_BITS + count_bits)))
            }
            // The offset does not fit next to the count (or there is none):
            // give the count the whole data window, which marks the offset
            // as unavailable.
            _ => Self(DATA_BITS | (count << SIZE_BITS)),
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    fn count_bits(&self) -> u64 {
        self.0 & SIZE_MASK
    }

    pub fn count(&self) -> u64 {
        let bits = self.count_bits();
        (self.0 >> SIZE_BITS) & ((1u64 << bits) - 1)
    }

    pub fn game_offset(&self) -> Option<u64> {
        let bits = self.count_bits();
        (bits < DATA_BITS).then(|| self.0 >> (SIZE_BITS + bits))
    }

    pub fn unpack(&self) -> CountAndGameOffset {
        CountAndGameOffset::new(self.count(), self.game_offset())
    }

    /// Sum counts, keep the earliest available game offset, repack.
    pub fn combine(&mut self, rhs: &Self) {
        let mut unpacked = self.unpack();
        unpacked.combine(&rhs.unpack());
        *self = Self::pack(unpacked.count(), unpacked.game_offset());
    }
}

/// One stored record: key plus packed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    key: Key,
    counter: PackedCountAndGameOffset,
}

impl Entry {
    /// Record for a single played position.
    pub fn new(
        position: &Position,
        reverse_move: Option<&ReverseMove>,
        level: GameLevel,
        result: GameResult,
        game_offset: u64,
    ) -> Self {
        Self {
            key: Key::tagged(position, reverse_move, level, result),
            counter: PackedCountAndGameOffset::single(game_offset),
        }
    }

    pub fn from_parts(key: Key, counter: PackedCountAndGameOffset) -> Self {
        Self { key, counter }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn count(&self) -> u64 {
        self.counter.count()
    }

    pub fn game_offset(&self) -> Option<u64> {
        self.counter.game_offset()
    }

    pub fn counter(&self) -> &PackedCountAndGameOffset {
        &self.counter
    }

    /// Fold `rhs` into this record. Only meaningful for records with equal
    /// full keys.
    pub fn combine(&mut self, rhs: &Entry) {
        self.counter.combine(&rhs.counter);
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        for lane in self.key.lanes() {
            buf.extend_from_slice(&lane.to_le_bytes());
        }
        buf.extend_from_slice(&self.counter.raw().to_le_bytes());
    }

    /// Decode one record from `bytes`; the caller guarantees
    /// `bytes.len() >= ENTRY_SIZE`.
    pub fn decode(bytes: &[u8]) -> Self {
        let lane = |i: usize| {
            u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().expect("lane slice"))
        };
        let raw = u64::from_le_bytes(bytes[16..24].try_into().expect("counter slice"));
        Self {
            key: Key::from_lanes([lane(0), lane(1), lane(2), lane(3)]),
            counter: PackedCountAndGameOffset::from_raw(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::{Move, Square};

    #[test]
    fn pack_roundtrips_small_values() {
        for count in [1u64, 2, 3, 57, 1000, 123_456_789] {
            for offset in [0u64, 1, 42, 1 << 20] {
                let packed = PackedCountAndGameOffset::pack(count, Some(offset));
                assert_eq!(packed.count(), count, "count for {count}/{offset}");
                assert_eq!(packed.game_offset(), Some(offset));
            }
        }
    }

    #[test]
    fn offset_is_dropped_when_count_crowds_it_out() {
        let packed = PackedCountAndGameOffset::pack(1 << 57, Some(5));
        assert_eq!(packed.count(), 1 << 57);
        assert_eq!(packed.game_offset(), None);
    }

    #[test]
    fn count_growth_eventually_loses_the_offset_but_stays_exact() {
        let offset = (1u64 << 52) - 1;
        let mut packed = PackedCountAndGameOffset::single(offset);
        assert_eq!(packed.game_offset(), Some(offset));

        let one = PackedCountAndGameOffset::single(offset);
        for _ in 0..999 {
            packed.combine(&one);
        }
        assert_eq!(packed.count(), 1000);
        // 1000 needs 10 count bits, leaving 48 for the 52-bit offset.
        assert_eq!(packed.game_offset(), None);
    }

    #[test]
    fn combine_keeps_the_earliest_offset() {
        let mut a = PackedCountAndGameOffset::pack(3, Some(700));
        let b = PackedCountAndGameOffset::pack(4, Some(20));
        a.combine(&b);
        assert_eq!(a.count(), 7);
        assert_eq!(a.game_offset(), Some(20));

        let mut lost = PackedCountAndGameOffset::pack(1 << 57, Some(9));
        assert_eq!(lost.game_offset(), None);
        lost.combine(&PackedCountAndGameOffset::pack(1, Some(33)));
        assert_eq!(lost.game_offset(), Some(33));
    }

    #[test]
    fn unpacked_combine_matches_packed_combine() {
        let mut packed = PackedCountAndGameOffset::pack(5, Some(100));
        let mut unpacked = packed.unpack();

        let rhs = PackedCountAndGameOffset::pack(2, Some(40));
        packed.combine(&rhs);
        unpacked.combine(&rhs.unpack());

        assert_eq!(packed.unpack(), unpacked);
    }

    #[test]
    fn randomized_pack_roundtrip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let count_bits = rng.gen_range(1..=57u32);
            let count = rng.gen_range(1..=(1u64 << count_bits).saturating_sub(1).max(1));
            let offset = rng.gen_range(0..1u64 << 40);

            let packed = PackedCountAndGameOffset::pack(count, Some(offset));
            assert_eq!(packed.count(), count);
            match packed.game_offset() {
                Some(read) => assert_eq!(read, offset),
                // Legitimately dropped: the offset no longer fits next to
                // the count.
                None => assert!(bit_length(count) + bit_length(offset) > DATA_BITS),
            }
        }
    }

    #[test]
    fn record_codec_roundtrip() {
        let pos = Position::initial();
        let rm = ReverseMove::new(Move::new(Square::new(6, 0), Square::new(5, 2)));
        let entry = Entry::new(&pos, Some(&rm), GameLevel::Server, GameResult::BlackWin, 77);

        let mut buf = Vec::new();
        entry.encode_into(&mut buf);
        assert_eq!(buf.len(), ENTRY_SIZE);

        let decoded = Entry::decode(&buf);
        assert_eq!(decoded, entry);
        assert_eq!(decoded.key().level().unwrap(), GameLevel::Server);
        assert_eq!(decoded.game_offset(), Some(77));
    }
}
