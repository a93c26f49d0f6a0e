//! Cross-process exchange through the shared region.
//!
//! One test only: it forks, and fork from a test harness is only safe
//! while this process has no other active test threads.

use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

use sluice::{BufferConfig, ElementType, RingBuffer, SlotLayout};

#[test]
fn child_process_produces_into_parent_buffer() {
    let cfg = BufferConfig::new(4, 1, SlotLayout::scalar(ElementType::U64)).unwrap();
    let rb = RingBuffer::create("RB_1", cfg).unwrap();
    let reader = rb.new_reader_group().unwrap();
    let writer = rb.new_writer();

    // SAFETY: no other threads are running in this test binary; the
    // child only touches the shared region and exits via _exit.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            for i in 1..=50u64 {
                let mut slot = writer.acquire().expect("ingest open");
                slot.scalars_mut::<u64>().unwrap().fill(i * 3);
                slot.commit();
            }
            // SAFETY: child exit without running the parent's cleanup.
            unsafe { libc::_exit(0) }
        }
        ForkResult::Parent { child } => {
            for i in 1..=50u64 {
                let slot = reader.next().expect("stream open");
                assert_eq!(slot.sequence(), i);
                assert_eq!(slot.scalars::<u64>().unwrap()[0], i * 3);
            }
            let status = waitpid(child, None).expect("waitpid");
            assert!(matches!(status, WaitStatus::Exited(_, 0)));
            assert_eq!(rb.events_total(), 50);
            assert_eq!(rb.free_slots(), 4);
        }
    }
}
