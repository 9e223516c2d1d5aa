use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// A byte-level transformation of a buffer, used by the Target phase to
/// explore the neighborhood of the best-known example for an objective.
///
/// Mutators must be total: any buffer (including an empty one) yields some
/// buffer no longer than `max_length`. They need not produce a *different*
/// buffer every time; the hill climb simply discards no-op mutants.
pub trait BufferMutator {
    fn name(&self) -> &'static str;

    fn mutate(&self, buffer: &[u8], max_length: usize, rng: &mut ChaCha8Rng) -> Vec<u8>;
}

/// Nudges a single byte by a small wrapping delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct NudgeByteMutator;

impl BufferMutator for NudgeByteMutator {
    fn name(&self) -> &'static str {
        "nudge-byte"
    }

    fn mutate(&self, buffer: &[u8], _max_length: usize, rng: &mut ChaCha8Rng) -> Vec<u8> {
        let mut bytes = buffer.to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }
        let delta = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(delta);
        bytes
    }
}

/// Overwrites a short span with a single freshly drawn byte value.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteSpanMutator;

impl BufferMutator for OverwriteSpanMutator {
    fn name(&self) -> &'static str {
        "overwrite-span"
    }

    fn mutate(&self, buffer: &[u8], _max_length: usize, rng: &mut ChaCha8Rng) -> Vec<u8> {
        let mut bytes = buffer.to_vec();
        if bytes.is_empty() {
            bytes.push(0);
        }
        let start = rng.random_range(0..bytes.len());
        let span = rng.random_range(1..=8usize).min(bytes.len() - start);
        let fill: u8 = rng.random();
        for byte in &mut bytes[start..start + span] {
            *byte = fill;
        }
        bytes
    }
}

/// Duplicates a span in place, growing the buffer up to `max_length`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DuplicateSpanMutator;

impl BufferMutator for DuplicateSpanMutator {
    fn name(&self) -> &'static str {
        "duplicate-span"
    }

    fn mutate(&self, buffer: &[u8], max_length: usize, rng: &mut ChaCha8Rng) -> Vec<u8> {
        let mut bytes = buffer.to_vec();
        if bytes.is_empty() || bytes.len() >= max_length {
            return bytes;
        }
        let start = rng.random_range(0..bytes.len());
        let room = max_length - bytes.len();
        let span = rng
            .random_range(1..=8usize)
            .min(bytes.len() - start)
            .min(room);
        let copy: Vec<u8> = bytes[start..start + span].to_vec();
        let insert_at = start + span;
        bytes.splice(insert_at..insert_at, copy);
        bytes
    }
}

/// The battery the Target phase draws from.
pub fn standard_mutators() -> Vec<Box<dyn BufferMutator>> {
    vec![
        Box::new(NudgeByteMutator),
        Box::new(OverwriteSpanMutator),
        Box::new(DuplicateSpanMutator),
    ]
}
