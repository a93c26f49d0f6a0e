//! Property tests for the slot lifecycle protocol.

use proptest::prelude::*;

use sluice::{BufferConfig, ElementType, ReadGuard, RingBuffer, SlotLayout, WriteGuard};

const SLOTS: usize = 4;

/// Interpret a command stream against a two-group buffer, skipping
/// commands that would block, and check the conservation and ordering
/// invariants at every step and at quiescence.
fn run_commands(commands: &[u8]) {
    let cfg = BufferConfig::new(SLOTS, 1, SlotLayout::scalar(ElementType::U64)).unwrap();
    let rb = RingBuffer::create("RB_prop", cfg).unwrap();
    let groups = [
        rb.new_reader_group().unwrap(),
        rb.new_reader_group().unwrap(),
    ];

    let mut writes: Vec<WriteGuard> = Vec::new();
    let mut reads: [Vec<ReadGuard>; 2] = [Vec::new(), Vec::new()];
    let mut pending: [u64; 2] = [0, 0]; // committed, not yet read, per group
    let mut last_seq: [u64; 2] = [0, 0];

    for &cmd in commands {
        match cmd % 6 {
            // acquire (only when it cannot block)
            0 => {
                if rb.free_slots() > 0 {
                    writes.push(rb.new_writer().acquire().expect("free slot available"));
                }
            }
            // commit the oldest held write
            1 => {
                if !writes.is_empty() {
                    writes.remove(0).commit();
                    pending[0] += 1;
                    pending[1] += 1;
                }
            }
            // discard the newest held write
            2 => {
                if let Some(guard) = writes.pop() {
                    guard.discard();
                }
            }
            // read for a group (only when data is pending)
            g @ (3 | 4) => {
                let g = (g - 3) as usize;
                if pending[g] > 0 {
                    let guard = groups[g].next().expect("pending publication");
                    assert!(
                        guard.sequence() > last_seq[g],
                        "group {g} saw sequences out of order"
                    );
                    last_seq[g] = guard.sequence();
                    pending[g] -= 1;
                    reads[g].push(guard);
                }
            }
            // release the oldest held read of group 0 or 1
            _ => {
                for held in reads.iter_mut() {
                    if !held.is_empty() {
                        held.remove(0).release();
                        break;
                    }
                }
            }
        }

        // Conservation: every slot is free, held by a writer, or
        // unreleased by at least one group.
        assert!(rb.free_slots() <= SLOTS);
        assert!(rb.free_slots() + writes.len() <= SLOTS);
    }

    // Quiesce: drop everything held, drain both groups, and every
    // slot must come home.
    writes.clear();
    reads[0].clear();
    reads[1].clear();
    rb.shutdown();
    for (g, group) in groups.iter().enumerate() {
        while let Some(guard) = group.next() {
            assert!(guard.sequence() > last_seq[g]);
            last_seq[g] = guard.sequence();
        }
    }
    assert_eq!(rb.free_slots(), SLOTS, "slots leaked");
    assert_eq!(last_seq[0], last_seq[1], "fan-out delivered unequal streams");
    assert_eq!(last_seq[0], rb.events_total(), "a committed slot was lost");
}

proptest! {
    #[test]
    fn conservation_under_arbitrary_interleavings(
        commands in proptest::collection::vec(0u8..=255, 1..256)
    ) {
        run_commands(&commands);
    }
}

#[test]
fn conservation_on_known_edge_sequences() {
    // acquire-all then commit-all, interleaved reads and releases.
    run_commands(&[0, 0, 0, 0, 1, 1, 1, 1, 3, 4, 5, 5, 3, 4, 5, 5]);
    // discard-heavy churn.
    run_commands(&[0, 2, 0, 2, 0, 1, 3, 5, 4, 5]);
}
