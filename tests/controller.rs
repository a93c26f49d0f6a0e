//! Batch-mode end-to-end run through the controller.
//!
//! Replays a recorded file through `RB_1` into the raw sink; the
//! source's clean exit at end of file terminates the batch run, and
//! the drained sink output must be byte-identical to the input.
//!
//! One test only: the controller forks worker processes, which is
//! only safe while no other test threads are active in this binary.

use std::fs;
use std::io::Write;

use sluice::control::{Controller, RunDirectory};
use sluice::{workers, SetupPlan};

#[test]
fn batch_run_replays_a_file_through_the_graph() {
    workers::register_builtin();

    let tmp = tempfile::tempdir().unwrap();
    let input = tmp.path().join("input.dat");
    let mut payload = Vec::new();
    {
        let mut f = fs::File::create(&input).unwrap();
        for i in 0..20u64 {
            for ch in 0..2u64 {
                let v = (i * 10 + ch) as f64;
                payload.extend_from_slice(&v.to_ne_bytes());
            }
        }
        f.write_all(&payload).unwrap();
    }

    let source_cfg = tmp.path().join("source.yaml");
    fs::write(
        &source_cfg,
        format!("filename: {}\n", input.display()),
    )
    .unwrap();
    let sink_cfg = tmp.path().join("sink.yaml");
    fs::write(&sink_cfg, "filename: replayed\n").unwrap();

    let setup = tmp.path().join("replay_setup.yaml");
    fs::write(
        &setup,
        format!(
            r#"
RingBuffer:
  - RB_1:
      number_of_slots: 8
      channel_per_slot: 2
      data_type: float
Functions:
  - Fkt_main: {{}}
  - Fkt_1:
      file_name: workers/file_source
      fkt_name: file_source
      num_process: 1
      RB_assign: {{RB_1: write}}
      config_file: {source}
  - Fkt_2:
      file_name: workers/save_files
      fkt_name: save_raw
      num_process: 1
      RB_assign: {{RB_1: read}}
      config_file: {sink}
"#,
            source = source_cfg.display(),
            sink = sink_cfg.display(),
        ),
    )
    .unwrap();

    let out_dir = tmp.path().join("run");
    fs::create_dir_all(&out_dir).unwrap();

    let plan = SetupPlan::load(&setup).unwrap();
    assert_eq!(plan.runtime, 0.0, "no runtime selects batch mode");

    let mut controller =
        Controller::with_output_dir(plan, RunDirectory::at(&out_dir)).unwrap();
    controller.setup_buffers().unwrap();
    controller.setup_workers().unwrap();
    controller.display_layout();
    controller.start_workers().unwrap();
    let events = controller.supervise().unwrap();
    let exits = controller.shutdown().unwrap();

    assert_eq!(events, 20);
    for (name, code) in &exits {
        assert_eq!(*code, 0, "worker {name} failed");
    }

    // Config copies land in the run directory before workers start.
    assert!(out_dir.join("replay_setup.yaml").is_file());
    assert!(out_dir.join("source.yaml").is_file());
    assert!(out_dir.join("sink.yaml").is_file());

    // The sink drained every committed record, byte-identical.
    let replayed = fs::read(out_dir.join("replayed.dat")).unwrap();
    assert_eq!(replayed, payload);

    // Quiescent at the end: all slots back home.
    let rb = &controller.buffers()[0];
    assert_eq!(rb.free_slots(), rb.slots());
}
