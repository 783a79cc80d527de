//! Task-to-mesh ring channel.
//!
//! Two rings carry data from a task workgroup to the mesh workgroups it
//! launches: the payload ring (one 16 KiB entry per task workgroup, read
//! and written in place) and the draw-data ring (one 16-byte
//! `DrawDataEntry` per task workgroup). Both are indexed by the same
//! entry index, derived from a monotonically increasing ring counter.
//!
//! Readiness uses a flag that toggles on every lap of the ring: the
//! producer writes `((counter / depth) & 1) ^ 1`, and the consumer waits
//! for exactly that value, so an entry left over from the previous lap is
//! never taken for a fresh one. The depth is a power of two, so the
//! 2^32 counter period is a whole number of double laps and the flag
//! keeps alternating across the counter wrap.

use bytemuck::{Pod, Zeroable};

use crate::ir::builder::Builder;
use crate::ir::{AtomicOp, GlobalId, Ordering, Ty, Value};

/// Bytes of task payload reserved per ring entry.
pub const PAYLOAD_RING_ENTRY_SIZE: u32 = 16 * 1024;

/// Bytes per draw-data ring entry.
pub const DRAW_DATA_RING_ENTRY_SIZE: u32 = 16;

/// One draw-data ring entry as laid out in memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawDataEntry {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
    pub ready: u32,
}

const _: () = assert!(std::mem::size_of::<DrawDataEntry>() == DRAW_DATA_RING_ENTRY_SIZE as usize);

impl DrawDataEntry {
    pub const GROUP_COUNT_OFFSET: u32 = std::mem::offset_of!(DrawDataEntry, group_count_x) as u32;
    pub const READY_OFFSET: u32 = std::mem::offset_of!(DrawDataEntry, ready) as u32;

    pub fn group_count(&self) -> [u32; 3] {
        [self.group_count_x, self.group_count_y, self.group_count_z]
    }
}

/// Handles and depth of the ring pair shared by one task/mesh pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingChannelDescriptor {
    pub entry_count: u32,
    pub payload_ring: GlobalId,
    pub draw_data_ring: GlobalId,
}

/// Ring addressing values computed once in a shader prologue.
#[derive(Clone, Copy, Debug)]
pub struct RingEntry {
    pub counter: Value,
    pub index: Value,
    /// Byte offset of this entry in the payload ring.
    pub payload_base: Value,
    /// Byte offset of this entry in the draw-data ring.
    pub draw_data_base: Value,
    /// Flag value marking the entry as ready for this lap.
    pub ready_flag: Value,
}

impl RingChannelDescriptor {
    /// Entry index of a ring counter.
    pub fn entry_index(&self, counter: u32) -> u32 {
        counter & (self.entry_count - 1)
    }

    /// Readiness flag value the producer of `counter` writes.
    pub fn ready_flag(&self, counter: u32) -> u32 {
        ((counter >> self.entry_count.trailing_zeros()) & 1) ^ 1
    }

    pub fn payload_ring_size(&self) -> Option<u32> {
        self.entry_count.checked_mul(PAYLOAD_RING_ENTRY_SIZE)
    }

    pub fn draw_data_ring_size(&self) -> Option<u32> {
        self.entry_count.checked_mul(DRAW_DATA_RING_ENTRY_SIZE)
    }

    /// Emit the entry index, byte offsets and ready flag for `counter`.
    pub fn emit_entry(&self, b: &mut Builder<'_>, counter: Value) -> RingEntry {
        let mask = b.const_i32(self.entry_count - 1);
        let index = b.and(counter, mask);
        let shift = b.const_i32(self.entry_count.trailing_zeros());
        let lap = b.lshr(counter, shift);
        let one = b.const_i32(1);
        let parity = b.and(lap, one);
        let ready_flag = b.xor(parity, one);

        let payload_base = b.mul_imm(index, PAYLOAD_RING_ENTRY_SIZE);
        let draw_data_base = b.mul_imm(index, DRAW_DATA_RING_ENTRY_SIZE);
        RingEntry {
            counter,
            index,
            payload_base,
            draw_data_base,
            ready_flag,
        }
    }

    // ── Payload access ─────────────────────────────────────────────

    fn payload_address(&self, b: &mut Builder<'_>, entry: &RingEntry, offset: Value) -> Value {
        b.add(entry.payload_base, offset)
    }

    pub fn read_payload(&self, b: &mut Builder<'_>, entry: &RingEntry, ty: Ty, offset: Value) -> Value {
        let addr = self.payload_address(b, entry, offset);
        b.load(ty, self.payload_ring, addr)
    }

    pub fn write_payload(&self, b: &mut Builder<'_>, entry: &RingEntry, offset: Value, value: Value) {
        let addr = self.payload_address(b, entry, offset);
        b.store(self.payload_ring, addr, value);
    }

    pub fn payload_atomic(
        &self,
        b: &mut Builder<'_>,
        entry: &RingEntry,
        op: AtomicOp,
        ordering: Ordering,
        offset: Value,
        value: Value,
    ) -> Value {
        let addr = self.payload_address(b, entry, offset);
        b.atomic_rmw(op, self.payload_ring, addr, value, ordering)
    }

    pub fn payload_cmpxchg(
        &self,
        b: &mut Builder<'_>,
        entry: &RingEntry,
        ordering: Ordering,
        offset: Value,
        compare: Value,
        new: Value,
    ) -> Value {
        let addr = self.payload_address(b, entry, offset);
        b.cmpxchg(self.payload_ring, addr, compare, new, ordering)
    }

    // ── Draw data ──────────────────────────────────────────────────

    /// Producer side: write the launch counts, then publish the entry.
    pub fn write_draw_data(&self, b: &mut Builder<'_>, entry: &RingEntry, counts: [Value; 3]) {
        for (i, count) in counts.into_iter().enumerate() {
            let addr = b.add_imm(entry.draw_data_base, DrawDataEntry::GROUP_COUNT_OFFSET + 4 * i as u32);
            b.store(self.draw_data_ring, addr, count);
        }
        let ready = b.add_imm(entry.draw_data_base, DrawDataEntry::READY_OFFSET);
        b.store_atomic(self.draw_data_ring, ready, entry.ready_flag, Ordering::Release);
    }

    /// Consumer side: acquire-load the ready flag of the entry.
    pub fn load_ready_flag(&self, b: &mut Builder<'_>, entry: &RingEntry) -> Value {
        let addr = b.add_imm(entry.draw_data_base, DrawDataEntry::READY_OFFSET);
        b.load_atomic(Ty::I32, self.draw_data_ring, addr, Ordering::Acquire)
    }

    /// Consumer side: read the launch counts of the entry.
    pub fn read_group_counts(&self, b: &mut Builder<'_>, entry: &RingEntry) -> [Value; 3] {
        let mut counts = [entry.counter; 3];
        for (i, count) in counts.iter_mut().enumerate() {
            let addr = b.add_imm(entry.draw_data_base, DrawDataEntry::GROUP_COUNT_OFFSET + 4 * i as u32);
            *count = b.load(Ty::I32, self.draw_data_ring, addr);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(entry_count: u32) -> RingChannelDescriptor {
        RingChannelDescriptor {
            entry_count,
            payload_ring: GlobalId(0),
            draw_data_ring: GlobalId(1),
        }
    }

    #[test]
    fn test_draw_data_layout() {
        assert_eq!(DrawDataEntry::GROUP_COUNT_OFFSET, 0);
        assert_eq!(DrawDataEntry::READY_OFFSET, 12);
        let entry = DrawDataEntry {
            group_count_x: 2,
            group_count_y: 3,
            group_count_z: 1,
            ready: 1,
        };
        let bytes = bytemuck::bytes_of(&entry);
        assert_eq!(bytes.len(), 16);
        let back: DrawDataEntry = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(back.group_count(), [2, 3, 1]);
    }

    #[test]
    fn test_entry_index_power_of_two() {
        let r = ring(8);
        assert_eq!(r.entry_index(0), 0);
        assert_eq!(r.entry_index(7), 7);
        assert_eq!(r.entry_index(8), 0);
        assert_eq!(r.entry_index(13), 5);
        assert_eq!(r.entry_index(u32::MAX), 7);
    }

    #[test]
    fn test_entry_index_idempotent_modulo_depth() {
        for depth in [1u32, 4, 256] {
            let r = ring(depth);
            for counter in [0u32, 1, 5, 1000, 123_456] {
                assert_eq!(r.entry_index(counter), r.entry_index(counter + depth));
            }
        }
    }

    #[test]
    fn test_ready_flag_toggles_per_lap() {
        let r = ring(4);
        assert_eq!(r.ready_flag(0), 1);
        assert_eq!(r.ready_flag(3), 1);
        assert_eq!(r.ready_flag(4), 0);
        assert_eq!(r.ready_flag(8), 1);
        // same slot on consecutive laps never shares a flag
        for c in 0..32 {
            assert_ne!(r.ready_flag(c), r.ready_flag(c + 4));
        }
    }

    #[test]
    fn test_ready_flag_survives_counter_wrap() {
        for depth in [1u32, 4, 256, 1 << 16] {
            let r = ring(depth);
            for before in (u32::MAX - depth + 1)..=u32::MAX {
                let after = before.wrapping_add(depth);
                assert_eq!(r.entry_index(before), r.entry_index(after));
                assert_ne!(r.ready_flag(before), r.ready_flag(after), "depth {}", depth);
            }
            // the wrap continues at the next slot
            assert_eq!(
                r.entry_index(u32::MAX.wrapping_add(1)),
                (r.entry_index(u32::MAX) + 1) % depth
            );
        }
    }

    #[test]
    fn test_ring_sizes() {
        assert_eq!(ring(4).payload_ring_size(), Some(64 * 1024));
        assert_eq!(ring(4).draw_data_ring_size(), Some(64));
        assert_eq!(ring(1 << 20).payload_ring_size(), None);
    }
}
