use std::collections::VecDeque;
use std::time::Duration;

use crate::synth::Sample;

/// Bounded per-family sample window: entries expire by age and by an
/// absolute element cap.
///
/// Producers add under a short lock; the monitor computes on a snapshot
/// copy so statistical passes never block emission.
pub struct SlidingWindow {
    duration: Duration,
    max_samples: usize,
    samples: parking_lot::Mutex<VecDeque<Sample>>,
}

impl SlidingWindow {
    pub fn new(duration: Duration, max_samples: usize) -> Self {
        Self {
            duration,
            max_samples,
            samples: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Admits a sample, evicting entries older than the window duration
    /// (relative to the newest sample's own timestamp) and enforcing the
    /// element cap.
    pub fn add(&self, sample: Sample) {
        let mut samples = self.samples.lock();

        let cutoff = sample.timestamp.checked_sub(self.duration);
        samples.push_back(sample);

        if let Some(cutoff) = cutoff {
            while samples
                .front()
                .is_some_and(|s| s.timestamp < cutoff)
            {
                samples.pop_front();
            }
        }

        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Copies the current samples out for computation.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest admissible timestamp given `now`; used by age assertions.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    fn sample_at(secs: u64, value: f64) -> Sample {
        Sample {
            timestamp: UNIX_EPOCH + Duration::from_secs(secs),
            value,
            source: "host-01".to_string(),
            tags: HashMap::new(),
            line_size: 40,
        }
    }

    #[test]
    fn test_add_and_snapshot() {
        let window = SlidingWindow::new(Duration::from_secs(300), 100);
        window.add(sample_at(1_000, 1.0));
        window.add(sample_at(1_001, 2.0));

        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].value, 1.0);
        assert_eq!(snapshot[1].value, 2.0);
    }

    #[test]
    fn test_age_eviction() {
        let window = SlidingWindow::new(Duration::from_secs(60), 100);
        window.add(sample_at(1_000, 1.0));
        window.add(sample_at(1_030, 2.0));
        // 100 s later: the first two fall outside the 60 s window.
        window.add(sample_at(1_100, 3.0));

        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].value, 2.0);

        for s in &snapshot {
            let newest = UNIX_EPOCH + Duration::from_secs(1_100);
            let age = newest.duration_since(s.timestamp).expect("ordered");
            assert!(age <= window.duration());
        }
    }

    #[test]
    fn test_element_cap() {
        let window = SlidingWindow::new(Duration::from_secs(3600), 5);
        for i in 0..10 {
            window.add(sample_at(1_000 + i, i as f64));
        }
        assert_eq!(window.len(), 5);
        // Oldest entries were evicted first.
        assert_eq!(window.snapshot()[0].value, 5.0);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let window = SlidingWindow::new(Duration::from_secs(60), 100);
        window.add(sample_at(1_000, 1.0));
        let _ = window.snapshot();
        assert_eq!(window.len(), 1);
    }
}
