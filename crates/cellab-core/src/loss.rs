//! Packet-loss window: the last few loss samples of a UDP run.

use std::collections::VecDeque;

/// Number of samples the window holds.
pub const LOSS_WINDOW_CAPACITY: usize = 3;
/// Loss percentage above which a sample counts as high.
pub const DEFAULT_LOSS_THRESHOLD: f32 = 75.0;
/// High samples needed (in a full window) to trip.
pub const DEFAULT_REQUIRED_HIGH: usize = 2;

/// Fixed-capacity FIFO of loss percentages, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct PacketLossWindow {
    samples: VecDeque<f32>,
}

impl PacketLossWindow {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LOSS_WINDOW_CAPACITY),
        }
    }

    pub fn push(&mut self, sample: f32) {
        if self.samples.len() >= LOSS_WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == LOSS_WINDOW_CAPACITY
    }

    pub fn samples(&self) -> impl Iterator<Item = f32> + '_ {
        self.samples.iter().copied()
    }

    /// `true` only when the window is full and at least `required` samples
    /// are strictly above `threshold`. A partial window never trips.
    pub fn is_high_loss(&self, threshold: f32, required: usize) -> bool {
        self.is_full() && self.samples.iter().filter(|&&s| s > threshold).count() >= required
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
