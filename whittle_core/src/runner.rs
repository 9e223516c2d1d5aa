use crate::cache::ResultCache;
use crate::config::{EngineConfig, HealthCheckKind, Phase};
use crate::data::{DataSource, InterestingOrigin, Status, StopTest, TestResult};
use crate::database::{ExampleDatabase, pareto_key};
use crate::mutator::standard_mutators;
use crate::pareto::{ParetoFront, sort_key};
use crate::shrinker::Shrinker;
use log::{debug, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Average per-execution wall time above which the `TooSlow` check trips.
const TOO_SLOW_AVERAGE_SECS: f64 = 1.0;
/// Minimum evidence before the ratio-based health checks may trip.
const MIN_INVALID_FOR_HEALTH: u64 = 50;
const MIN_OVERRUN_FOR_HEALTH: u64 = 20;
const MIN_CALLS_FOR_TIMING: u64 = 10;

/// Run-level failures. Discovered counterexamples are *not* errors (they
/// come back in the [`RunReport`]); these are the conditions that abort a run.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The predicate itself misbehaves (too slow, too often invalid, inputs
    /// too large). Distinct from any counterexample and suppressible per
    /// kind via configuration.
    #[error("health check failed: {message}")]
    HealthCheck {
        kind: HealthCheckKind,
        message: String,
    },

    /// The predicate aborted through the stop signal without any outcome
    /// recorded on its data source: a bug in the harness, not in the code
    /// under test.
    #[error("harness bug: {0}")]
    Harness(String),
}

/// Counters describing one run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Predicate executions (cache hits excluded).
    pub calls: u64,
    pub valid: u64,
    pub invalid: u64,
    pub overrun: u64,
    pub interesting: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Shrink candidates evaluated (cached replays included).
    pub shrink_calls: u64,
    pub elapsed: Duration,
}

/// Terminal output of a run: the minimal example per distinct interesting
/// origin, the final Pareto front, and the counters.
#[derive(Debug)]
pub struct RunReport {
    pub interesting: BTreeMap<InterestingOrigin, Arc<TestResult>>,
    pub front: Vec<Arc<TestResult>>,
    pub stats: RunStats,
}

/// Orchestrates one full run: Reuse, Generate, Target, Shrink.
///
/// The runner exclusively owns its cache, front, RNG and database handle for
/// the duration of the run, and is single-use: `run` consumes it.
pub struct Runner<F> {
    pub(crate) config: EngineConfig,
    predicate: F,
    rng: ChaCha8Rng,
    cache: ResultCache,
    front: ParetoFront,
    database: Option<Box<dyn ExampleDatabase>>,
    database_key: Option<Vec<u8>>,
    interesting: BTreeMap<InterestingOrigin, Arc<TestResult>>,
    best_targets: BTreeMap<String, (f64, Arc<TestResult>)>,
    pub(crate) stats: RunStats,
    execution_time: Duration,
    started: Instant,
}

impl<F> Runner<F>
where
    F: Fn(&mut DataSource) -> Result<(), StopTest>,
{
    pub fn new(config: EngineConfig, predicate: F) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            predicate,
            rng,
            cache: ResultCache::new(),
            front: ParetoFront::new(),
            database: None,
            database_key: None,
            interesting: BTreeMap::new(),
            best_targets: BTreeMap::new(),
            stats: RunStats::default(),
            execution_time: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Attaches the example database and the caller's logical-test key.
    /// Without both, the Reuse phase is a no-op and nothing is persisted.
    pub fn with_database(
        mut self,
        database: Box<dyn ExampleDatabase>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        self.database = Some(database);
        self.database_key = Some(key.into());
        self
    }

    /// Executes the configured phases and returns the final report.
    pub fn run(mut self) -> Result<RunReport, EngineError> {
        self.started = Instant::now();
        for phase in self.config.phases.clone() {
            match phase {
                Phase::Reuse => self.reuse_phase()?,
                Phase::Generate => self.generate_phase()?,
                Phase::Target => self.target_phase()?,
                Phase::Shrink => self.shrink_phase()?,
            }
        }
        self.persist_results();
        self.stats.cache_hits = self.cache.hits();
        self.stats.cache_misses = self.cache.misses();
        self.stats.elapsed = self.started.elapsed();
        debug!(
            "run finished: {} calls, {} valid, {} origins, front of {}",
            self.stats.calls,
            self.stats.valid,
            self.interesting.len(),
            self.front.len()
        );
        Ok(RunReport {
            interesting: self.interesting,
            front: self.front.into_members(),
            stats: self.stats,
        })
    }

    /// Runs the predicate over one data source and records the outcome.
    ///
    /// Panics from the predicate are captured here and classified as
    /// interesting; the stop signal is absorbed; any other shape of failure
    /// is a harness bug.
    fn execute(&mut self, mut source: DataSource) -> Result<Arc<TestResult>, EngineError> {
        let predicate = &self.predicate;
        let begin = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| predicate(&mut source)));
        self.execution_time += begin.elapsed();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(_stop)) => {
                if source.status() == Status::Valid {
                    return Err(EngineError::Harness(
                        "predicate aborted without recording an outcome".to_string(),
                    ));
                }
            }
            Err(payload) => {
                let message = panic_message(payload);
                source.record_panic(InterestingOrigin::from_panic(&message));
            }
        }
        let result = Arc::new(source.into_result());
        self.cache.insert(result.buffer.clone(), result.clone());
        self.note_result(&result);
        Ok(result)
    }

    /// Replays `buffer` through the cache: a hit is free, a miss re-executes
    /// exactly those bytes with no extra randomness.
    pub(crate) fn cached_run(&mut self, buffer: &[u8]) -> Result<Arc<TestResult>, EngineError> {
        if let Some(hit) = self.cache.get(buffer) {
            return Ok(hit);
        }
        let source = DataSource::replay(buffer.to_vec(), self.config.max_length);
        let result = self.execute(source)?;
        // Key the record under the requested buffer too, so a blob with
        // trailing unconsumed bytes replays for free next time.
        self.cache.insert(buffer.to_vec(), result.clone());
        Ok(result)
    }

    /// Bookkeeping shared by every execution: counters, per-origin minima,
    /// objective maxima, and the front with its database mirror.
    fn note_result(&mut self, result: &Arc<TestResult>) {
        self.stats.calls += 1;
        match result.status {
            Status::Overrun => self.stats.overrun += 1,
            Status::Invalid => self.stats.invalid += 1,
            Status::Valid => self.stats.valid += 1,
            Status::Interesting => self.stats.interesting += 1,
        }

        if result.status >= Status::Valid {
            for (name, value) in &result.targets {
                let improved = match self.best_targets.get(name) {
                    Some((best, _)) => value > best,
                    None => true,
                };
                if improved {
                    self.best_targets
                        .insert(name.clone(), (*value, result.clone()));
                }
            }
        }

        if result.status == Status::Interesting {
            if let Some(origin) = result.origin.clone() {
                let replace = match self.interesting.get(&origin) {
                    Some(current) => sort_key(&result.buffer) < sort_key(&current.buffer),
                    None => {
                        debug!("new interesting origin: {origin}");
                        true
                    }
                };
                if replace {
                    self.interesting.insert(origin, result.clone());
                }
            }
        }

        let admission = self.front.consider(result.clone());
        if let Some(key) = self.database_key.clone() {
            let front_key = pareto_key(&key);
            if admission.inserted {
                self.db_save(&front_key, &result.buffer);
            }
            for evicted in &admission.evicted {
                self.db_delete(&front_key, &evicted.buffer);
            }
        }
    }

    /// Replays persisted buffers under the caller key and the front sub-key,
    /// re-confirming each before trusting it. Entries that no longer earn
    /// their place are deleted.
    fn reuse_phase(&mut self) -> Result<(), EngineError> {
        let Some(key) = self.database_key.clone() else {
            return Ok(());
        };
        if self.database.is_none() {
            return Ok(());
        }
        debug!("reuse phase: replaying persisted examples");

        let mut primary = self.db_fetch(&key);
        primary.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        for buffer in primary {
            let result = self.cached_run(&buffer)?;
            if result.status != Status::Interesting {
                self.db_delete(&key, &buffer);
            }
        }

        let front_key = pareto_key(&key);
        let mut persisted_front = self.db_fetch(&front_key);
        persisted_front.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        for buffer in persisted_front {
            self.cached_run(&buffer)?;
            if !self.front.contains_buffer(&buffer) {
                self.db_delete(&front_key, &buffer);
            }
        }
        Ok(())
    }

    /// Draws fresh pseudo-random buffers until a budget or the deadline ends
    /// the phase. Generation does not stop at the first interesting result:
    /// the front wants one champion per origin.
    fn generate_phase(&mut self) -> Result<(), EngineError> {
        debug!(
            "generate phase: budget {} valid examples",
            self.config.max_examples
        );
        while self.keep_generating() {
            let seed = self.rng.next_u64();
            let source = DataSource::random(seed, self.config.max_length);
            self.execute(source)?;
            self.enforce_health_checks()?;
        }
        Ok(())
    }

    /// Hill-climbs each named objective from its best-known example by
    /// applying small buffer mutations and keeping improvements.
    fn target_phase(&mut self) -> Result<(), EngineError> {
        if self.best_targets.is_empty() {
            return Ok(());
        }
        debug!(
            "target phase: optimising {} objectives",
            self.best_targets.len()
        );
        let mutators = standard_mutators();
        let labels: Vec<String> = self.best_targets.keys().cloned().collect();
        for label in labels {
            let Some((mut best_score, mut best)) = self
                .best_targets
                .get(&label)
                .map(|(score, result)| (*score, result.clone()))
            else {
                continue;
            };
            let mut attempts = self.config.max_examples;
            while attempts > 0 && self.stats.calls < self.call_limit() && !self.past_deadline() {
                attempts -= 1;
                let index = self.rng.random_range(0..mutators.len());
                let mutant =
                    mutators[index].mutate(&best.buffer, self.config.max_length, &mut self.rng);
                if mutant == best.buffer {
                    continue;
                }
                let result = self.cached_run(&mutant)?;
                if let Some(score) = result.targets.get(&label) {
                    if *score > best_score {
                        debug!("objective {label} improved to {score}");
                        best_score = *score;
                        best = result;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains the per-origin queue through the shrinker.
    fn shrink_phase(&mut self) -> Result<(), EngineError> {
        let origins: Vec<InterestingOrigin> = self.interesting.keys().cloned().collect();
        for origin in origins {
            let Some(seed) = self.interesting.get(&origin).cloned() else {
                continue;
            };
            debug!("shrinking origin {origin} from {} bytes", seed.buffer.len());
            let budget = self.config.shrink_calls;
            let minimal = Shrinker::new(self, origin.clone(), seed, budget).shrink()?;
            self.interesting.insert(origin, minimal);
        }
        Ok(())
    }

    /// Saves the minimal example per origin under the caller key and makes
    /// the front sub-key mirror the front exactly.
    fn persist_results(&mut self) {
        let Some(key) = self.database_key.clone() else {
            return;
        };
        if self.database.is_none() {
            return;
        }
        let minima: Vec<Arc<TestResult>> = self.interesting.values().cloned().collect();
        for result in minima {
            self.db_save(&key, &result.buffer);
        }

        let front_key = pareto_key(&key);
        let existing = self.db_fetch(&front_key);
        let members: HashSet<Vec<u8>> = self.front.iter().map(|m| m.buffer.clone()).collect();
        for value in &existing {
            if !members.contains(value) {
                self.db_delete(&front_key, value);
            }
        }
        let existing: HashSet<Vec<u8>> = existing.into_iter().collect();
        for buffer in members {
            if !existing.contains(&buffer) {
                self.db_save(&front_key, &buffer);
            }
        }
    }

    fn call_limit(&self) -> u64 {
        self.config.max_examples.saturating_mul(10).max(1000)
    }

    fn keep_generating(&self) -> bool {
        self.stats.valid < self.config.max_examples
            && self.stats.calls < self.call_limit()
            && !self.past_deadline()
    }

    fn past_deadline(&self) -> bool {
        match self.config.deadline_ms {
            Some(ms) => self.started.elapsed() >= Duration::from_millis(ms),
            None => false,
        }
    }

    fn enforce_health_checks(&self) -> Result<(), EngineError> {
        if self.config.health_check_enabled(HealthCheckKind::FilterTooMuch)
            && self.stats.invalid >= MIN_INVALID_FOR_HEALTH
            && self.stats.invalid > self.stats.valid.saturating_mul(10)
        {
            return Err(EngineError::HealthCheck {
                kind: HealthCheckKind::FilterTooMuch,
                message: format!(
                    "the predicate rejected {} of {} runs as invalid",
                    self.stats.invalid, self.stats.calls
                ),
            });
        }
        if self.config.health_check_enabled(HealthCheckKind::DataTooLarge)
            && self.stats.overrun >= MIN_OVERRUN_FOR_HEALTH
            && self.stats.overrun > self.stats.valid.saturating_mul(10)
        {
            return Err(EngineError::HealthCheck {
                kind: HealthCheckKind::DataTooLarge,
                message: format!(
                    "{} of {} runs exceeded the {}-byte budget",
                    self.stats.overrun, self.stats.calls, self.config.max_length
                ),
            });
        }
        if self.config.health_check_enabled(HealthCheckKind::TooSlow)
            && self.stats.calls >= MIN_CALLS_FOR_TIMING
        {
            let average = self.execution_time.as_secs_f64() / self.stats.calls as f64;
            if average > TOO_SLOW_AVERAGE_SECS {
                return Err(EngineError::HealthCheck {
                    kind: HealthCheckKind::TooSlow,
                    message: format!("predicate executions average {average:.2}s each"),
                });
            }
        }
        Ok(())
    }

    fn db_save(&mut self, key: &[u8], value: &[u8]) {
        if let Some(db) = self.database.as_mut() {
            if let Err(e) = db.save(key, value) {
                warn!("database save failed: {e}");
            }
        }
    }

    fn db_delete(&mut self, key: &[u8], value: &[u8]) {
        if let Some(db) = self.database.as_mut() {
            if let Err(e) = db.delete(key, value) {
                warn!("database delete failed: {e}");
            }
        }
    }

    fn db_fetch(&self, key: &[u8]) -> Vec<Vec<u8>> {
        match self.database.as_ref() {
            Some(db) => match db.fetch(key) {
                Ok(values) => values,
                Err(e) => {
                    warn!("database fetch failed: {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
