use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{deferred::DeferredTasks, palette::Palette};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Advance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclerState {
    Idle,
    Cycling,
}

/// Rotates through the palettes extracted from the current artwork.
#[derive(Debug)]
pub struct PaletteCycler {
    sequence: Vec<Palette>,
    index: usize,
    timer: DeferredTasks<Advance>,
    cycle_range: (f64, f64),
    rng: StdRng,
}

impl PaletteCycler {
    pub fn new(initial: Palette, cycle_range: (f64, f64), rng: StdRng) -> Self {
        Self {
            sequence: vec![initial],
            index: 0,
            timer: DeferredTasks::new(),
            cycle_range,
            rng,
        }
    }

    pub fn with_seed(initial: Palette, seed: u64) -> Self {
        Self::new(initial, (15.0, 20.0), StdRng::seed_from_u64(seed))
    }

    pub fn set_cycle_range(&mut self, range: (f64, f64)) {
        self.cycle_range = range;
    }

    pub fn state(&self) -> CyclerState {
        if self.timer.is_empty() {
            CyclerState::Idle
        } else {
            CyclerState::Cycling
        }
    }

    pub fn current(&self) -> Palette {
        self.sequence[self.index]
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.timer.next_due()
    }

    pub fn adopt(&mut self, sequence: Vec<Palette>, now: Instant) -> Palette {
        if sequence.is_empty() {
            return self.current();
        }
        self.timer.cancel(Advance);
        self.sequence = sequence;
        self.index = 0;
        debug!(count = self.sequence.len(), "palette sequence adopted");
        self.arm(now);
        self.current()
    }

    pub fn poll(&mut self, now: Instant) -> Option<Palette> {
        self.timer.pop_due(now)?;
        self.index = (self.index + 1) % self.sequence.len();
        self.arm(now);
        Some(self.current())
    }

    fn arm(&mut self, now: Instant) {
        if self.sequence.len() < 2 {
            return;
        }
        let (min, max) = self.cycle_range;
        let delay = if max > min {
            self.rng.gen_range(min..=max)
        } else {
            min
        };
        self.timer
            .schedule(Advance, now + Duration::from_secs_f64(delay));
    }
}
