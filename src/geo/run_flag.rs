use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive `Idle -> Running -> Idle` flag.
///
/// `try_start` is a compare-and-set: while one holder is running, every other
/// attempt is rejected rather than queued.
#[derive(Debug, Default)]
pub struct RunFlag {
    running: AtomicBool,
}

impl RunFlag {
    pub const fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }

    /// Move to `Running`. Returns `false` if already running.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move back to `Idle`
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Like [`RunFlag::try_start`], finishing automatically when the guard drops
    pub fn try_acquire(&self) -> Option<RunGuard<'_>> {
        self.try_start().then(|| RunGuard { flag: self })
    }
}

/// Holds a [`RunFlag`] in the running state
#[derive(Debug)]
pub struct RunGuard<'a> {
    flag: &'a RunFlag,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.finish();
    }
}
