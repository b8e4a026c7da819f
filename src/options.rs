use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Limits applied to a single parse so that a pathological grammar or a huge document
/// cannot stall the caller.
///
/// Nothing is limited by default.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Maximum number of scan steps (one per match, block opening or closing)
    max_steps: Option<usize>,
    /// Maximum wall-clock time spent in one `parse`/`edit` call
    time_budget: Option<Duration>,
    /// Checked between scan steps, parsing stops as soon as it is set
    cancel: Option<Arc<AtomicBool>>,
}

impl ParseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops parsing after that many scan steps.
    pub fn max_steps(mut self, value: usize) -> Self {
        self.max_steps = Some(value);
        self
    }

    /// Stops parsing once that much time has been spent.
    pub fn time_budget(mut self, value: Duration) -> Self {
        self.time_budget = Some(value);
        self
    }

    /// Stops parsing when the flag is set, from any thread.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub(crate) fn start_budget(&self) -> Budget<'_> {
        Budget {
            options: self,
            started: Instant::now(),
            steps: 0,
            exhausted: false,
        }
    }
}

/// Running count of one parse against its `ParseOptions`
#[derive(Debug)]
pub(crate) struct Budget<'o> {
    options: &'o ParseOptions,
    started: Instant,
    steps: usize,
    exhausted: bool,
}

impl Budget<'_> {
    /// Records a step, returns false if parsing should stop.
    pub fn step(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        self.steps += 1;
        self.exhausted = self.is_over();
        !self.exhausted
    }

    fn is_over(&self) -> bool {
        if let Some(max) = self.options.max_steps
            && self.steps > max
        {
            return true;
        }
        if let Some(flag) = &self.options.cancel
            && flag.load(Ordering::Relaxed)
        {
            return true;
        }
        // Reading the clock on every step is measurable on big files
        self.options.time_budget.is_some_and(|budget| {
            self.steps % 64 == 0 && self.started.elapsed() > budget
        })
    }
}
