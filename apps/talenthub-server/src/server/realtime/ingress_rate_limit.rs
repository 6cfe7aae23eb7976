use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Frames accepted from one socket inside a sliding window.
#[derive(Debug)]
pub(crate) struct IngressWindow {
    accepted: VecDeque<Instant>,
    limit: usize,
    window: Duration,
}

impl IngressWindow {
    pub(crate) fn new(limit: u32, window: Duration) -> Self {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Self {
            accepted: VecDeque::with_capacity(limit.min(64)),
            limit,
            window,
        }
    }

    /// Records a frame received at `now`, or returns false when the window is full.
    pub(crate) fn admit(&mut self, now: Instant) -> bool {
        while self
            .accepted
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) > self.window)
        {
            self.accepted.pop_front();
        }
        if self.accepted.len() >= self.limit {
            return false;
        }
        self.accepted.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::IngressWindow;

    #[test]
    fn frames_beyond_the_limit_are_refused_inside_the_window() {
        let start = Instant::now();
        let mut window = IngressWindow::new(2, Duration::from_millis(250));

        assert!(window.admit(start));
        assert!(window.admit(start + Duration::from_millis(10)));
        assert!(!window.admit(start + Duration::from_millis(50)));
    }

    #[test]
    fn capacity_returns_once_old_frames_expire() {
        let start = Instant::now();
        let mut window = IngressWindow::new(1, Duration::from_millis(100));

        assert!(window.admit(start));
        assert!(!window.admit(start + Duration::from_millis(50)));
        assert!(window.admit(start + Duration::from_millis(200)));
    }
}
