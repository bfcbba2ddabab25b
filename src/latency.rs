// SPDX-License-Identifier: GPL-2.0

//! Pairwise core-to-core latency measurement.
//!
//! For a directed pair (A, B) two worker threads pin themselves to their
//! processors, rendezvous at a barrier so setup cost stays out of the timed
//! window, and then bounce a single machine word back and forth in a busy
//! spin. The spin avoids kernel wakeups entirely, so the measured time is
//! dominated by the hardware path: a cache-line transfer plus a small store.
//!
//! Iteration counts must be large enough to dominate timer granularity;
//! 10_000 and up is reasonable on commodity hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Instant;

use crate::error::{Error, Result};

/// Something that measures the one-way latency of a directed processor pair,
/// in nanoseconds. Identical endpoints are never requested.
pub trait LinkMeasurer: Send + Sync {
    fn measure(&self, cpu_a: u32, cpu_b: u32, iterations: u32) -> Result<f64>;
}

/// The real measurer: pinned threads, shared-flag ping-pong.
pub struct PingPongMeasurer;

impl LinkMeasurer for PingPongMeasurer {
    fn measure(&self, cpu_a: u32, cpu_b: u32, iterations: u32) -> Result<f64> {
        measure_link(cpu_a, cpu_b, iterations)
    }
}

/// Pin the calling thread to a single processor. Mandatory for measurement
/// workers: an unpinned spin would measure the scheduler, not the hardware.
fn pin_current_thread(cpu: u32) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Measure the mean one-way latency between `cpu_a` and `cpu_b` over
/// `iterations` ping-pongs on each side.
///
/// The coordinator timestamps just before releasing the rendezvous and just
/// after both workers finish; the mean one-way cost is `elapsed / (2 * N)`.
/// A pin failure on either side fails the whole measurement.
pub fn measure_link(cpu_a: u32, cpu_b: u32, iterations: u32) -> Result<f64> {
    debug_assert_ne!(cpu_a, cpu_b);

    let flag = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(Barrier::new(3));
    let abort = Arc::new(AtomicBool::new(false));
    let pin_err: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    let spawn_worker = |cpu: u32, role: Role| {
        let flag = flag.clone();
        let barrier = barrier.clone();
        let abort = abort.clone();
        let pin_err = pin_err.clone();
        thread::spawn(move || {
            if let Err(e) = pin_current_thread(cpu) {
                abort.store(true, Ordering::SeqCst);
                let mut slot = pin_err.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(Error::Pin { cpu, source: e });
                }
                barrier.wait();
                return;
            }
            barrier.wait();
            if abort.load(Ordering::SeqCst) {
                return;
            }
            match role {
                Role::Initiator => {
                    for _ in 0..iterations {
                        while flag.load(Ordering::Acquire) != 0 {
                            std::hint::spin_loop();
                        }
                        flag.store(1, Ordering::Release);
                    }
                }
                Role::Responder => {
                    for _ in 0..iterations {
                        while flag.load(Ordering::Acquire) != 1 {
                            std::hint::spin_loop();
                        }
                        flag.store(0, Ordering::Release);
                    }
                }
            }
        })
    };

    let worker_a = spawn_worker(cpu_a, Role::Initiator);
    let worker_b = spawn_worker(cpu_b, Role::Responder);

    let start = Instant::now();
    barrier.wait();
    join_worker(worker_a)?;
    join_worker(worker_b)?;
    let elapsed = start.elapsed();

    if let Some(e) = pin_err.lock().unwrap().take() {
        return Err(e);
    }

    Ok(elapsed.as_nanos() as f64 / (2.0 * f64::from(iterations)))
}

#[derive(Clone, Copy)]
enum Role {
    Initiator,
    Responder,
}

fn join_worker(handle: thread::JoinHandle<()>) -> Result<()> {
    handle.join().map_err(|_| {
        Error::Io(std::io::Error::other("measurement worker panicked"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::present_cpu_count;

    #[test]
    fn measures_positive_latency() {
        if present_cpu_count() < 2 {
            return;
        }
        let lat = measure_link(0, 1, 10_000).unwrap();
        assert!(lat > 0.0);
    }

    #[test]
    fn pin_failure_fails_measurement() {
        // The highest representable cpu id is almost certainly not present;
        // pinning to it must fail cleanly rather than hang the workers.
        let absent = (libc::CPU_SETSIZE - 1) as u32;
        if present_cpu_count() as u32 > absent {
            return;
        }
        let err = measure_link(0, absent, 10).unwrap_err();
        assert!(matches!(err, Error::Pin { cpu, .. } if cpu == absent));
    }
}
