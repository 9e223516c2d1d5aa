use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;

/// Classification of a single predicate execution, ordered from worst to best
/// from the engine's point of view: an `Overrun` run told us nothing, an
/// `Invalid` run was rejected by the predicate, a `Valid` run completed
/// quietly, and an `Interesting` run is what the whole search is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// The execution ran out of byte budget mid-draw.
    Overrun,
    /// The predicate explicitly rejected the run.
    Invalid,
    /// The predicate completed without flagging anything.
    Valid,
    /// The predicate signaled a distinguished condition.
    Interesting,
}

/// Identity of the reason an execution was interesting.
///
/// Multiple distinct origins coexist within one run; the engine keeps (and
/// shrinks) a separate minimal example for each. Origins are either explicit
/// numeric labels supplied by the predicate, or derived from a panic payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterestingOrigin {
    id: u64,
    label: String,
}

impl InterestingOrigin {
    /// An origin from an explicit numeric label.
    pub fn from_label(label: u64) -> Self {
        Self {
            id: label,
            label: format!("label {label}"),
        }
    }

    /// An origin derived from a panic payload. The payload text is hashed to
    /// a stable identity so the same failure maps to the same origin across
    /// executions; the leading text is kept for reporting.
    pub fn from_panic(payload: &str) -> Self {
        let digest = md5::compute(payload.as_bytes());
        let id = u64::from_be_bytes(digest.0[..8].try_into().unwrap_or([0; 8]));
        let mut label: String = payload.lines().next().unwrap_or("").chars().take(120).collect();
        if label.is_empty() {
            label = "panic".to_string();
        }
        Self { id, label }
    }
}

impl fmt::Display for InterestingOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Control-flow signal that aborts the current predicate execution.
///
/// Draws and the `mark_*` methods hand one back; the predicate propagates it
/// with `?` up to the per-execution frame and never further. It carries no
/// data: the outcome it signals is already recorded on the [`DataSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTest(pub(crate) ());

/// The frozen record of one predicate execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    /// The exact bytes consumed, in draw order. Unit of replay and of shrink
    /// comparison.
    pub buffer: Vec<u8>,
    pub status: Status,
    /// Present exactly when `status` is `Interesting`.
    pub origin: Option<InterestingOrigin>,
    /// Named objective observations, last write per name wins.
    pub targets: BTreeMap<String, f64>,
    /// Diagnostic events noted by the predicate.
    pub events: Vec<String>,
}

enum ByteSource {
    Random(ChaCha8Rng),
    Replay(Vec<u8>),
}

/// The byte stream a predicate draws its input from.
///
/// A source either generates fresh pseudo-random bytes from a seeded RNG or
/// replays a previously recorded buffer; in both modes every byte handed out
/// is appended to `buffer`, so the record of an execution is exactly the
/// bytes it consumed. Surplus high bits of a draw are masked *before* the
/// bytes are recorded, which keeps buffers canonical and shrinkable.
pub struct DataSource {
    source: ByteSource,
    buffer: Vec<u8>,
    max_length: usize,
    status: Status,
    origin: Option<InterestingOrigin>,
    targets: BTreeMap<String, f64>,
    events: Vec<String>,
    frozen: bool,
}

impl DataSource {
    /// A source generating fresh bytes from a deterministically seeded RNG.
    pub fn random(seed: u64, max_length: usize) -> Self {
        Self::with_source(ByteSource::Random(ChaCha8Rng::seed_from_u64(seed)), max_length)
    }

    /// A source replaying exactly `bytes`; draws beyond its end overrun.
    pub fn replay(bytes: Vec<u8>, max_length: usize) -> Self {
        Self::with_source(ByteSource::Replay(bytes), max_length)
    }

    fn with_source(source: ByteSource, max_length: usize) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            max_length,
            status: Status::Valid,
            origin: None,
            targets: BTreeMap::new(),
            events: Vec::new(),
            frozen: false,
        }
    }

    /// Draws an unsigned value in `[0, 2^n_bits - 1]`, consuming
    /// `ceil(n_bits / 8)` bytes. Fails with `Overrun` when the byte budget or
    /// the replayed bytes run out.
    ///
    /// # Panics
    /// If `n_bits > 64`, or if the source is already frozen. Both are
    /// programming errors in the harness, not properties of the input.
    pub fn draw_bits(&mut self, n_bits: u32) -> Result<u64, StopTest> {
        assert!(n_bits <= 64, "cannot draw more than 64 bits at once");
        assert!(!self.frozen, "draw from a frozen data source");
        if n_bits == 0 {
            return Ok(0);
        }
        let n_bytes = (n_bits as usize).div_ceil(8);
        if self.buffer.len() + n_bytes > self.max_length {
            return Err(self.mark_overrun());
        }

        let mut bytes = vec![0u8; n_bytes];
        match &mut self.source {
            ByteSource::Random(rng) => rng.fill_bytes(&mut bytes),
            ByteSource::Replay(recorded) => {
                let consumed = self.buffer.len();
                if consumed + n_bytes > recorded.len() {
                    return Err(self.mark_overrun());
                }
                bytes.copy_from_slice(&recorded[consumed..consumed + n_bytes]);
            }
        }

        // Mask surplus high bits of the leading byte so the recorded buffer
        // is canonical for the requested width.
        let surplus = (n_bits as usize) % 8;
        if surplus != 0 {
            bytes[0] &= (1u8 << surplus) - 1;
        }

        let mut value: u64 = 0;
        for byte in &bytes {
            value = (value << 8) | u64::from(*byte);
        }
        self.buffer.extend_from_slice(&bytes);
        Ok(value)
    }

    /// Marks the run rejected and aborts the execution.
    #[must_use = "return the signal from the predicate to abort the execution"]
    pub fn mark_invalid(&mut self) -> StopTest {
        self.status = Status::Invalid;
        StopTest(())
    }

    /// Marks the run interesting for `origin` and aborts the execution.
    #[must_use = "return the signal from the predicate to abort the execution"]
    pub fn mark_interesting(&mut self, origin: InterestingOrigin) -> StopTest {
        self.status = Status::Interesting;
        self.origin = Some(origin);
        StopTest(())
    }

    fn mark_overrun(&mut self) -> StopTest {
        self.status = Status::Overrun;
        StopTest(())
    }

    /// Records that the predicate panicked. Treated as interesting: an
    /// uncaught failure is precisely the kind of outcome the engine hunts.
    pub(crate) fn record_panic(&mut self, origin: InterestingOrigin) {
        self.status = Status::Interesting;
        self.origin = Some(origin);
    }

    /// Records a diagnostic event. Pure side effect, no control transfer.
    pub fn note_event(&mut self, message: impl Into<String>) {
        self.events.push(message.into());
    }

    /// Records a named objective observation. The last write per name wins
    /// within one execution.
    pub fn target(&mut self, name: &str, value: f64) {
        self.targets.insert(name.to_string(), value);
    }

    /// The bytes consumed so far.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Finalizes the record. Idempotent; later draws panic.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Freezes and yields the execution record.
    pub fn into_result(mut self) -> TestResult {
        self.freeze();
        TestResult {
            buffer: self.buffer,
            status: self.status,
            origin: self.origin,
            targets: self.targets,
            events: self.events,
        }
    }
}
