// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::time::Duration;

use medians::Medianf64;

/// Summary of a set of latencies, in milliseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    // Only for the recent window.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

impl fmt::Display for DescriptiveStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n={} mean={:.1}ms stddev={:.1}ms min={:.1}ms max={:.1}ms",
               self.count, self.mean, self.stddev, self.min, self.max)?;
        if let Some(median) = self.median {
            write!(f, " median={:.1}ms", median)?;
        }
        Ok(())
    }
}

/// Accumulates durations such as per-frame processing time. `recent` covers
/// the last `capacity` values; `session` covers everything since construction
/// or reset_session().
pub struct LatencyStats {
    pub recent: DescriptiveStats,
    pub session: DescriptiveStats,

    // State for `recent`.
    circular_buffer: CircularBuffer,

    // State for `session`.
    rolling_stats: rolling_stats::Stats<f64>,
}

impl LatencyStats {
    pub fn new(capacity: usize) -> Self {
        LatencyStats{
            recent: DescriptiveStats::default(),
            session: DescriptiveStats::default(),
            circular_buffer: CircularBuffer::new(capacity.max(1)),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add(&mut self, latency: Duration) {
        self.add_value(latency.as_secs_f64() * 1000.0);
    }

    pub fn add_value(&mut self, value_ms: f64) {
        self.circular_buffer.push(value_ms);
        self.rolling_stats.update(value_ms);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent = &mut self.recent;
        recent.count = recent_values.len();
        recent.min = recent_values.iter().copied().fold(f64::INFINITY, f64::min);
        recent.max = recent_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        recent.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent.stddev = statistical::standard_deviation(
                recent_values, Some(recent.mean));
        }
        let median = recent_values.medf_unchecked();
        recent.median = Some(median);
        recent.median_absolute_deviation = Some(recent_values.madf(median));

        let session = &mut self.session;
        session.count += 1;
        session.min = self.rolling_stats.min;
        session.max = self.rolling_stats.max;
        session.mean = self.rolling_stats.mean;
        session.stddev = self.rolling_stats.std_dev;
    }

    pub fn reset_session(&mut self) {
        self.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }
}

// Ring buffer exposing its contents as one unordered slice.
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        CircularBuffer{start: 0, data: Vec::with_capacity(capacity)}
    }

    pub fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start = (self.start + 1) % self.data.len();
        }
    }

    pub fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_circular_buffer() {
        let mut cb = CircularBuffer::new(3);
        assert_eq!(cb.unordered_contents(), &[] as &[f64]);
        cb.push(4.0);
        cb.push(5.0);
        cb.push(6.0);
        assert_eq!(cb.unordered_contents(), [4.0, 5.0, 6.0]);
        cb.push(7.0);
        cb.push(8.0);
        assert_eq!(cb.unordered_contents(), [7.0, 8.0, 6.0]);
    }

    #[test]
    fn test_latency_stats() {
        let mut stats = LatencyStats::new(2);
        assert_eq!(stats.recent, DescriptiveStats::default());

        stats.add(Duration::from_millis(10));
        stats.add(Duration::from_millis(30));
        assert_eq!(stats.recent.count, 2);
        assert_abs_diff_eq!(stats.recent.min, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.recent.max, 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.recent.mean, 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.recent.stddev, 14.14, epsilon = 0.01);
        assert_abs_diff_eq!(stats.recent.median.unwrap(), 20.0, epsilon = 1e-9);

        // Oldest value leaves the recent window but not the session.
        stats.add(Duration::from_millis(50));
        assert_eq!(stats.recent.count, 2);
        assert_abs_diff_eq!(stats.recent.min, 30.0, epsilon = 1e-9);
        assert_eq!(stats.session.count, 3);
        assert_abs_diff_eq!(stats.session.min, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.session.max, 50.0, epsilon = 1e-9);
        assert_abs_diff_eq!(stats.session.mean, 30.0, epsilon = 1e-9);
        assert_eq!(stats.session.median, None);

        stats.reset_session();
        assert_eq!(stats.session, DescriptiveStats::default());
        assert_eq!(stats.recent.count, 2);
    }

}  // mod tests.
