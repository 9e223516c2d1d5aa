use crate::data::{DataSource, InterestingOrigin, Status, StopTest, TestResult};
use crate::pareto::sort_key;
use crate::runner::{EngineError, Runner};
use log::{debug, trace};
use std::sync::Arc;

/// Block sizes tried by the span-oriented passes, largest first so big wins
/// land before fine-grained cleanup.
const DELETE_SPANS: [usize; 6] = [64, 16, 8, 4, 2, 1];
const ZERO_SPANS: [usize; 5] = [16, 8, 4, 2, 1];
const DEDUP_SPANS: [usize; 4] = [8, 4, 2, 1];

/// Reduces an interesting buffer to a locally minimal one that still
/// reproduces the same classification.
///
/// The shrinker repeatedly applies a fixed battery of reduction passes to
/// the current best buffer, re-testing every candidate through the runner's
/// cache and accepting it only when it is smaller by [`sort_key`] and still
/// interesting for the same origin. It loops until one full round makes no
/// improvement, or until its execution budget runs out. Exhaustion yields
/// the best buffer found so far, never a failure.
///
/// Determinism comes for free: the cache guarantees identical buffers
/// reproduce identical records.
pub struct Shrinker<'r, F> {
    runner: &'r mut Runner<F>,
    origin: InterestingOrigin,
    best: Arc<TestResult>,
    budget: u64,
    attempts: u64,
}

impl<'r, F> Shrinker<'r, F>
where
    F: Fn(&mut DataSource) -> Result<(), StopTest>,
{
    pub fn new(
        runner: &'r mut Runner<F>,
        origin: InterestingOrigin,
        seed: Arc<TestResult>,
        budget: u64,
    ) -> Self {
        Self {
            runner,
            origin,
            best: seed,
            budget,
            attempts: 0,
        }
    }

    /// Runs passes to a fixed point and returns the minimal record found.
    pub fn shrink(mut self) -> Result<Arc<TestResult>, EngineError> {
        loop {
            let before = self.best.buffer.clone();
            self.delete_spans()?;
            self.zero_spans()?;
            self.descend_bytes()?;
            self.descend_duplicates()?;
            self.dedup_blocks()?;
            if self.exhausted() || self.best.buffer == before {
                break;
            }
        }
        debug!(
            "shrink finished at {} bytes after {} attempts",
            self.best.buffer.len(),
            self.attempts
        );
        Ok(self.best)
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.budget
    }

    /// Replays `candidate` and adopts it when it is a strict improvement
    /// that reproduces the same interesting origin.
    fn attempt(&mut self, candidate: Vec<u8>) -> Result<bool, EngineError> {
        if self.exhausted() {
            return Ok(false);
        }
        if candidate == self.best.buffer || sort_key(&candidate) > sort_key(&self.best.buffer) {
            return Ok(false);
        }
        self.attempts += 1;
        self.runner.stats.shrink_calls += 1;
        let result = self.runner.cached_run(&candidate)?;
        let reproduces = result.status == Status::Interesting
            && result.origin.as_ref() == Some(&self.origin);
        if reproduces && sort_key(&result.buffer) < sort_key(&self.best.buffer) {
            trace!(
                "shrink accepted {} -> {} bytes",
                self.best.buffer.len(),
                result.buffer.len()
            );
            self.best = result;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Deletes byte spans, largest blocks first. Starts with the whole
    /// buffer: plenty of predicates fail before drawing anything.
    fn delete_spans(&mut self) -> Result<(), EngineError> {
        self.attempt(Vec::new())?;
        for span in DELETE_SPANS {
            if self.exhausted() {
                return Ok(());
            }
            let mut index = 0;
            while index + span <= self.best.buffer.len() && !self.exhausted() {
                let mut candidate = self.best.buffer.clone();
                candidate.drain(index..index + span);
                if !self.attempt(candidate)? {
                    index += 1;
                }
                // On success the next span has shifted into place at `index`.
            }
        }
        Ok(())
    }

    /// Zeroes aligned ranges of descending sizes.
    fn zero_spans(&mut self) -> Result<(), EngineError> {
        for span in ZERO_SPANS {
            if self.exhausted() {
                return Ok(());
            }
            let mut index = 0;
            while index + span <= self.best.buffer.len() && !self.exhausted() {
                if self.best.buffer[index..index + span].iter().any(|b| *b != 0) {
                    let mut candidate = self.best.buffer.clone();
                    candidate[index..index + span].fill(0);
                    self.attempt(candidate)?;
                }
                index += span;
            }
        }
        Ok(())
    }

    /// Minimizes each byte individually by binary descent toward zero.
    fn descend_bytes(&mut self) -> Result<(), EngineError> {
        let mut index = 0;
        while index < self.best.buffer.len() && !self.exhausted() {
            let current = self.best.buffer[index];
            if current > 0 && !self.replace_byte(index, 0)? {
                let mut failing = 0u8;
                let mut passing = current;
                while passing - failing > 1 && !self.exhausted() {
                    let midpoint = failing + (passing - failing) / 2;
                    if self.replace_byte(index, midpoint)? {
                        passing = midpoint;
                    } else {
                        failing = midpoint;
                    }
                }
            }
            index += 1;
        }
        Ok(())
    }

    fn replace_byte(&mut self, index: usize, value: u8) -> Result<bool, EngineError> {
        if index >= self.best.buffer.len() {
            return Ok(false);
        }
        let mut candidate = self.best.buffer.clone();
        candidate[index] = value;
        self.attempt(candidate)
    }

    /// Lowers every occurrence of a repeated byte value simultaneously.
    /// Catches buffers where equal bytes must stay equal to reproduce, which
    /// the per-byte descent can never move on its own.
    fn descend_duplicates(&mut self) -> Result<(), EngineError> {
        let mut values: Vec<u8> = self.best.buffer.to_vec();
        values.sort_unstable();
        values.dedup();
        for value in values {
            if value == 0 || self.exhausted() {
                continue;
            }
            let count = self.best.buffer.iter().filter(|b| **b == value).count();
            if count < 2 {
                continue;
            }
            if self.replace_value(value, 0)? {
                continue;
            }
            let mut failing = 0u8;
            let mut passing = value;
            let mut current = value;
            while passing - failing > 1 && !self.exhausted() {
                let midpoint = failing + (passing - failing) / 2;
                if self.replace_value(current, midpoint)? {
                    passing = midpoint;
                    current = midpoint;
                } else {
                    failing = midpoint;
                }
            }
        }
        Ok(())
    }

    fn replace_value(&mut self, from: u8, to: u8) -> Result<bool, EngineError> {
        let candidate: Vec<u8> = self
            .best
            .buffer
            .iter()
            .map(|b| if *b == from { to } else { *b })
            .collect();
        self.attempt(candidate)
    }

    /// Drops the second copy of an adjacent repeated block.
    fn dedup_blocks(&mut self) -> Result<(), EngineError> {
        for span in DEDUP_SPANS {
            if self.exhausted() {
                return Ok(());
            }
            let mut index = 0;
            while index + 2 * span <= self.best.buffer.len() && !self.exhausted() {
                let buffer = &self.best.buffer;
                let repeated = buffer[index..index + span] == buffer[index + span..index + 2 * span];
                if repeated {
                    let mut candidate = buffer.clone();
                    candidate.drain(index + span..index + 2 * span);
                    if self.attempt(candidate)? {
                        continue;
                    }
                }
                index += 1;
            }
        }
        Ok(())
    }
}
