use tokio::time::{Duration, Instant};

/// Buffers text between the function-call tags and releases it either on
/// tag close or once the debounce window has elapsed since the last flush.
///
/// Fragments are concatenated in arrival order; every character pushed is
/// returned by exactly one flush.
#[derive(Debug)]
pub struct FunctionCallAccumulator {
    fragments: Vec<String>,
    last_flush: Instant,
    debounce: Duration,
}

impl FunctionCallAccumulator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            fragments: Vec::new(),
            last_flush: Instant::now(),
            debounce,
        }
    }

    /// Begin a new region: drop anything left over and restart the window.
    pub fn start(&mut self, now: Instant) {
        self.fragments.clear();
        self.last_flush = now;
    }

    pub fn push(&mut self, text: &str) {
        if !text.is_empty() {
            self.fragments.push(text.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// When buffered text becomes due, if there is any.
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_empty() {
            None
        } else {
            Some(self.last_flush + self.debounce)
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    /// Concatenate and clear the buffer. Empty buffer is a no-op.
    pub fn flush(&mut self, now: Instant) -> Option<String> {
        if self.fragments.is_empty() {
            return None;
        }
        let text = self.fragments.concat();
        self.fragments.clear();
        self.last_flush = now;
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_concatenates_in_order_and_clears() {
        let t0 = Instant::now();
        let mut acc = FunctionCallAccumulator::new(Duration::from_millis(80));
        acc.start(t0);
        acc.push("{\"name\":");
        acc.push("");
        acc.push(" \"get_weather\"}");
        assert_eq!(acc.flush(t0).as_deref(), Some("{\"name\": \"get_weather\"}"));
        assert!(acc.is_empty());
        assert_eq!(acc.flush(t0), None);
    }

    #[test]
    fn due_only_after_window_and_with_text() {
        let t0 = Instant::now();
        let mut acc = FunctionCallAccumulator::new(Duration::from_millis(80));
        acc.start(t0);
        assert!(!acc.is_due(t0 + Duration::from_secs(1)));
        assert_eq!(acc.deadline(), None);

        acc.push("a");
        assert_eq!(acc.deadline(), Some(t0 + Duration::from_millis(80)));
        assert!(!acc.is_due(t0 + Duration::from_millis(79)));
        assert!(acc.is_due(t0 + Duration::from_millis(80)));

        let t1 = t0 + Duration::from_millis(90);
        assert_eq!(acc.flush(t1).as_deref(), Some("a"));
        acc.push("b");
        assert!(!acc.is_due(t1 + Duration::from_millis(10)));
        assert_eq!(acc.deadline(), Some(t1 + Duration::from_millis(80)));
    }

    #[test]
    fn start_discards_leftovers() {
        let t0 = Instant::now();
        let mut acc = FunctionCallAccumulator::new(Duration::from_millis(80));
        acc.push("stale");
        acc.start(t0);
        assert!(acc.is_empty());
    }
}
