//! Global mean response time over a sliding window.

use std::collections::VecDeque;
use std::time::Instant;

/// Rolling arithmetic mean of reply latencies over the last
/// `window_seconds` one-second buckets.
///
/// Samples landing in the same second sum into one bucket; when the window
/// rolls over, the oldest bucket is discarded. The average is cached so
/// reads never mutate.
#[derive(Debug)]
pub(crate) struct Gmrt {
    window_seconds: u64,
    epoch: Instant,
    buckets: VecDeque<Bucket>,
    sum: u64,
    count: u64,
    average: u32,
}

#[derive(Debug)]
struct Bucket {
    second: u64,
    sum: u64,
    count: u64,
}

impl Gmrt {
    pub fn new(window_seconds: u64) -> Self {
        Gmrt {
            window_seconds,
            epoch: Instant::now(),
            buckets: VecDeque::new(),
            sum: 0,
            count: 0,
            average: 0,
        }
    }

    /// The current mean in milliseconds.
    pub fn average(&self) -> u32 {
        self.average
    }

    /// Fold a latency sample into the window and return the new mean.
    pub fn update(&mut self, now: Instant, sample_millis: u32) -> u32 {
        let second = now.duration_since(self.epoch).as_secs();

        while let Some(oldest) = self.buckets.front() {
            if second < oldest.second + self.window_seconds {
                break;
            }

            self.sum -= oldest.sum;
            self.count -= oldest.count;
            self.buckets.pop_front();
        }

        match self.buckets.back_mut() {
            Some(bucket) if bucket.second == second => {
                bucket.sum += sample_millis as u64;
                bucket.count += 1;
            }
            _ => {
                self.buckets.push_back(Bucket {
                    second,
                    sum: sample_millis as u64,
                    count: 1,
                });
            }
        }

        self.sum += sample_millis as u64;
        self.count += 1;

        self.average = (self.sum / self.count) as u32;
        self.average
    }
}
