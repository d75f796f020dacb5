use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative run/cancel state shared between the engine's run loop and
/// whatever thread requests cancellation (§5: cancellation is polled, not
/// preemptive).
pub struct RunState {
    canceled: AtomicBool,
    running: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            canceled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.canceled.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_clears_prior_cancel() {
        let state = RunState::new();
        state.request_cancel();
        state.start();
        assert!(!state.is_canceled());
        assert!(state.is_running());
    }

    #[test]
    fn stop_does_not_clear_cancel() {
        let state = RunState::new();
        state.start();
        state.request_cancel();
        state.stop();
        assert!(state.is_canceled());
        assert!(!state.is_running());
    }
}
