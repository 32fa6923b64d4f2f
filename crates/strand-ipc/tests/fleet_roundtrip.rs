//! End-to-end fleet exercise: fork two workers, run a get round-trip
//! between them, and shut the fleet down cleanly.
//!
//! Kept as the only test in this binary: it forks, and the worker processes
//! exit directly from the work loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use strand_rt::Deadline;

const MSG_PROBE: u8 = strand_ipc::MSG_USER_BASE;
const MSG_DONE: u8 = strand_ipc::MSG_USER_BASE + 1;

/// Set in worker 2's process when worker 1 reports completion.
static DONE: AtomicBool = AtomicBool::new(false);

/// Per-process safety valve so a lost message cannot hang the test.
static ITERATIONS: AtomicU32 = AtomicU32::new(0);

#[test]
fn fleet_get_roundtrip() {
    let result_path =
        std::env::temp_dir().join(format!("strand-fleet-roundtrip-{}", std::process::id()));
    let _ = std::fs::remove_file(&result_path);

    strand_ipc::init(2).unwrap();

    // Registered before the fork: inherited by both workers, with interest
    // bits set fleet-wide.
    strand_ipc::register_get_handler(MSG_PROBE, |token, src| {
        let _ = strand_ipc::send_get_response(token, src, &[0x01, 0x02, 0x03]);
    });
    strand_ipc::register_handler(MSG_DONE, |_src, _data| {
        DONE.store(true, Ordering::SeqCst);
    });

    let rp = result_path.clone();
    strand_ipc::spawn(
        move || {
            if ITERATIONS.fetch_add(1, Ordering::SeqCst) > 3000 {
                return 2;
            }
            match strand_ipc::spid() {
                1 => {
                    // Retry until worker 2 is up and interested.
                    let mut got = Vec::new();
                    for _ in 0..200 {
                        match strand_ipc::get(MSG_PROBE, 2, Deadline::after_ms(500)) {
                            Ok(data) => {
                                got = data;
                                break;
                            }
                            Err(_) => strand_rt::sleep(Duration::from_millis(10)),
                        }
                    }
                    let _ = std::fs::write(&rp, &got);
                    let _ = strand_ipc::send(2, MSG_DONE, b"");
                    1
                }
                _ => {
                    if DONE.load(Ordering::SeqCst) {
                        1
                    } else {
                        strand_rt::sleep(Duration::from_millis(10));
                        0
                    }
                }
            }
        },
        None,
        None,
    )
    .unwrap();

    let data = std::fs::read(&result_path).unwrap();
    let _ = std::fs::remove_file(&result_path);
    assert_eq!(data, vec![0x01, 0x02, 0x03]);
}
