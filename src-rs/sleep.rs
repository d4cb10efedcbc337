use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Below this, sleeps spin instead of yielding to keep timing precise.
const SPIN_THRESHOLD: Duration = Duration::from_millis(10);
const POLL_STEP: Duration = Duration::from_millis(1);

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sleeps for `secs` seconds unless `cancel` fires first.
///
/// Returns `true` when the full duration elapsed and `false` when the sleep was
/// cut short. Non-finite or non-positive durations return immediately.
pub fn interruptible_sleep(secs: f64, cancel: &CancelToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if !secs.is_finite() || secs <= 0.0 {
        return true;
    }

    let Ok(total) = Duration::try_from_secs_f64(secs) else {
        // Longer than `Duration` can hold: only a cancel ends it.
        while !cancel.is_cancelled() {
            thread::sleep(POLL_STEP);
        }
        return false;
    };
    let start = Instant::now();

    if total < SPIN_THRESHOLD {
        while start.elapsed() < total {
            if cancel.is_cancelled() {
                return false;
            }
            std::hint::spin_loop();
        }
        return true;
    }

    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let elapsed = start.elapsed();
        if elapsed >= total {
            return true;
        }
        thread::sleep(POLL_STEP.min(total - elapsed));
    }
}
