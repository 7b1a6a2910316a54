use parking_lot::Mutex;

#[derive(Debug, Default)]
struct CounterState {
    count: u64,
    total: Option<u64>,
    completed: bool,
}

/// Counts processed batches of one input against its announced total.
///
/// The total may be announced before or after the batches arrive;
/// whichever call completes the count returns true, exactly once.
#[derive(Debug, Default)]
pub struct BatchCounter {
    state: Mutex<CounterState>,
}

impl BatchCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one batch. True if this completes the input.
    pub fn increment(&self) -> bool {
        let mut state = self.state.lock();
        state.count += 1;
        Self::check(&mut state)
    }

    /// Announce the total. True if every batch was already counted.
    pub fn set_total(&self, total: u64) -> bool {
        let mut state = self.state.lock();
        if let Some(previous) = state.total {
            log::warn!("batch total announced twice ({previous}, then {total})");
            return false;
        }
        state.total = Some(total);
        Self::check(&mut state)
    }

    fn check(state: &mut CounterState) -> bool {
        if !state.completed && state.total == Some(state.count) {
            state.completed = true;
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().completed
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn total(&self) -> Option<u64> {
        self.state.lock().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_total_after_batches() {
        let counter = BatchCounter::new();
        assert!(!counter.increment());
        assert!(!counter.increment());
        assert!(counter.set_total(2));
        assert!(counter.is_complete());
    }

    #[test]
    fn test_total_before_batches() {
        let counter = BatchCounter::new();
        assert!(!counter.set_total(2));
        assert!(!counter.increment());
        assert!(counter.increment());
        assert!(!counter.increment());
    }

    #[test]
    fn test_empty_input() {
        let counter = BatchCounter::new();
        assert!(counter.set_total(0));
        assert!(!counter.set_total(0));
    }

    #[test]
    fn test_completes_once_under_contention() {
        let counter = Arc::new(BatchCounter::new());
        let completions = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let completions = Arc::clone(&completions);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if counter.increment() {
                            completions.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        if counter.set_total(800) {
            completions.fetch_add(1, Ordering::SeqCst);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(counter.count(), 800);
    }
}
