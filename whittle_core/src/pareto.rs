use crate::data::{Status, TestResult};
use log::trace;
use std::sync::Arc;

/// Shortlex ordering key for buffers: length first, then byte value. The
/// whole engine agrees that smaller-by-this-key is better.
pub fn sort_key(buffer: &[u8]) -> (usize, &[u8]) {
    (buffer.len(), buffer)
}

/// Outcome of comparing two execution records for Pareto dominance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    /// Neither record dominates the other.
    Incomparable,
    /// The records carry the same buffer.
    Equal,
    /// The left record dominates the right.
    Left,
    /// The right record dominates the left.
    Right,
}

/// Compares two records across classification, interesting origin, objective
/// vector and buffer form.
///
/// `left` dominates `right` when its buffer is no larger by [`sort_key`], its
/// classification is at least as good, and it is at least as good on every
/// objective. A key missing from a record counts as worst-possible, so the
/// dominating side must carry every key the other carries. Records that are
/// interesting for different origins are incomparable axes: each origin keeps
/// its own champion. Identical objective vectors fall through to the buffer
/// key, so the shorter/lexicographically smaller form wins.
pub fn dominance(left: &TestResult, right: &TestResult) -> Dominance {
    if left.buffer == right.buffer {
        return Dominance::Equal;
    }
    if sort_key(&right.buffer) < sort_key(&left.buffer) {
        return match dominance(right, left) {
            Dominance::Left => Dominance::Right,
            Dominance::Right => Dominance::Left,
            other => other,
        };
    }
    // From here on, left is the smaller buffer and only Left or Incomparable
    // can come out.
    if left.status == Status::Interesting
        && right.status == Status::Interesting
        && left.origin != right.origin
    {
        return Dominance::Incomparable;
    }
    if left.status < right.status {
        return Dominance::Incomparable;
    }
    for (name, theirs) in &right.targets {
        match left.targets.get(name) {
            Some(ours) if ours >= theirs => {}
            _ => return Dominance::Incomparable,
        }
    }
    Dominance::Left
}

/// Outcome of offering a record to the front: whether it was admitted, and
/// which members it displaced. Evicted members are handed back so the caller
/// can mirror the change to the example database.
#[derive(Debug, Default)]
pub struct Admission {
    pub inserted: bool,
    pub evicted: Vec<Arc<TestResult>>,
}

/// The set of mutually non-dominated Valid-or-Interesting records seen during
/// one run.
///
/// Members are kept sorted by [`sort_key`] of their buffers, which gives an
/// internally consistent iteration order (no external ordering is promised).
/// Size is bounded in practice by the generation budget and by shrinking
/// driving members toward canonical minimal forms that dominate each other.
#[derive(Debug, Default)]
pub struct ParetoFront {
    members: Vec<Arc<TestResult>>,
}

impl ParetoFront {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a record to the front.
    ///
    /// Records below `Valid` are never eligible. A candidate dominated by an
    /// existing member (or already present) is rejected; otherwise it is
    /// inserted and every member it dominates is removed and returned.
    pub fn consider(&mut self, candidate: Arc<TestResult>) -> Admission {
        if candidate.status < Status::Valid {
            return Admission::default();
        }
        for member in &self.members {
            match dominance(member, &candidate) {
                Dominance::Equal | Dominance::Left => return Admission::default(),
                _ => {}
            }
        }

        let mut evicted = Vec::new();
        self.members.retain(|member| {
            if dominance(&candidate, member) == Dominance::Left {
                trace!("pareto front evicts {} bytes", member.buffer.len());
                evicted.push(member.clone());
                false
            } else {
                true
            }
        });

        let position = self
            .members
            .partition_point(|member| sort_key(&member.buffer) < sort_key(&candidate.buffer));
        self.members.insert(position, candidate);
        Admission { inserted: true, evicted }
    }

    /// Whether some member carries exactly this buffer.
    pub fn contains_buffer(&self, buffer: &[u8]) -> bool {
        let position = self
            .members
            .partition_point(|member| sort_key(&member.buffer) < sort_key(buffer));
        self.members
            .get(position)
            .is_some_and(|member| member.buffer == buffer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestResult>> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn into_members(self) -> Vec<Arc<TestResult>> {
        self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InterestingOrigin;
    use std::collections::BTreeMap;

    fn record(buffer: &[u8], status: Status, targets: &[(&str, f64)]) -> Arc<TestResult> {
        let origin = match status {
            Status::Interesting => Some(InterestingOrigin::from_label(0)),
            _ => None,
        };
        record_with_origin(buffer, status, origin, targets)
    }

    fn record_with_origin(
        buffer: &[u8],
        status: Status,
        origin: Option<InterestingOrigin>,
        targets: &[(&str, f64)],
    ) -> Arc<TestResult> {
        let mut map = BTreeMap::new();
        for (name, value) in targets {
            map.insert((*name).to_string(), *value);
        }
        Arc::new(TestResult {
            buffer: buffer.to_vec(),
            status,
            origin,
            targets: map,
            events: Vec::new(),
        })
    }

    #[test]
    fn sort_key_is_shortlex() {
        assert!(sort_key(&[9]) < sort_key(&[0, 0]));
        assert!(sort_key(&[0, 1]) < sort_key(&[0, 2]));
        assert_eq!(sort_key(&[3, 4]), sort_key(&[3, 4]));
    }

    #[test]
    fn smaller_buffer_dominates_on_equal_vectors() {
        let small = record(&[1], Status::Valid, &[("a", 1.0)]);
        let large = record(&[1, 1], Status::Valid, &[("a", 1.0)]);
        assert_eq!(dominance(&small, &large), Dominance::Left);
        assert_eq!(dominance(&large, &small), Dominance::Right);
    }

    #[test]
    fn missing_objective_key_counts_as_worst() {
        let partial = record(&[1], Status::Valid, &[("a", 5.0)]);
        let full = record(&[2, 2], Status::Valid, &[("a", 1.0), ("b", 1.0)]);
        // `partial` is smaller but lacks "b", so it cannot dominate.
        assert_eq!(dominance(&partial, &full), Dominance::Incomparable);
    }

    #[test]
    fn better_classification_is_required() {
        let valid = record(&[1], Status::Valid, &[]);
        let interesting = record(&[2, 2], Status::Interesting, &[]);
        assert_eq!(dominance(&valid, &interesting), Dominance::Incomparable);
        let small_interesting = record(&[1], Status::Interesting, &[]);
        let large_valid = record(&[2, 2], Status::Valid, &[]);
        assert_eq!(dominance(&small_interesting, &large_valid), Dominance::Left);
    }

    #[test]
    fn distinct_origins_are_incomparable() {
        let a = record_with_origin(
            &[1],
            Status::Interesting,
            Some(InterestingOrigin::from_label(1)),
            &[],
        );
        let b = record_with_origin(
            &[2, 2],
            Status::Interesting,
            Some(InterestingOrigin::from_label(2)),
            &[],
        );
        assert_eq!(dominance(&a, &b), Dominance::Incomparable);
    }

    #[test]
    fn front_rejects_sub_valid_records() {
        let mut front = ParetoFront::new();
        assert!(!front.consider(record(&[1], Status::Invalid, &[])).inserted);
        assert!(!front.consider(record(&[1], Status::Overrun, &[])).inserted);
        assert!(front.is_empty());
    }

    #[test]
    fn front_keeps_one_member_per_origin() {
        let mut front = ParetoFront::new();
        for label in 0..16 {
            let origin = Some(InterestingOrigin::from_label(label));
            let admission = front.consider(record_with_origin(
                &[label as u8],
                Status::Interesting,
                origin,
                &[],
            ));
            assert!(admission.inserted);
        }
        assert_eq!(front.len(), 16);
        // A second, larger representative of an existing origin is rejected.
        let duplicate = record_with_origin(
            &[3, 0],
            Status::Interesting,
            Some(InterestingOrigin::from_label(3)),
            &[],
        );
        assert!(!front.consider(duplicate).inserted);
        assert_eq!(front.len(), 16);
    }

    #[test]
    fn insertion_evicts_dominated_members() {
        let mut front = ParetoFront::new();
        assert!(front.consider(record(&[5, 5], Status::Valid, &[("a", 1.0)])).inserted);
        let admission = front.consider(record(&[1], Status::Valid, &[("a", 2.0)]));
        assert!(admission.inserted);
        assert_eq!(admission.evicted.len(), 1);
        assert_eq!(admission.evicted[0].buffer, vec![5, 5]);
        assert_eq!(front.len(), 1);
    }

    #[test]
    fn no_two_members_mutually_dominate() {
        let mut front = ParetoFront::new();
        front.consider(record(&[1], Status::Valid, &[("a", 1.0), ("b", 3.0)]));
        front.consider(record(&[2], Status::Valid, &[("a", 3.0), ("b", 1.0)]));
        front.consider(record(&[3], Status::Valid, &[("a", 2.0), ("b", 2.0)]));
        assert_eq!(front.len(), 3);
        let members: Vec<_> = front.iter().cloned().collect();
        for left in &members {
            for right in &members {
                if left.buffer != right.buffer {
                    assert_ne!(dominance(left, right), Dominance::Left);
                }
            }
        }
    }

    #[test]
    fn equal_buffer_is_rejected_without_eviction() {
        let mut front = ParetoFront::new();
        assert!(front.consider(record(&[7], Status::Valid, &[])).inserted);
        let again = front.consider(record(&[7], Status::Valid, &[]));
        assert!(!again.inserted);
        assert!(again.evicted.is_empty());
        assert_eq!(front.len(), 1);
    }

    #[test]
    fn iteration_is_sorted_by_buffer_key() {
        let mut front = ParetoFront::new();
        front.consider(record_with_origin(
            &[9],
            Status::Interesting,
            Some(InterestingOrigin::from_label(9)),
            &[],
        ));
        front.consider(record_with_origin(
            &[1],
            Status::Interesting,
            Some(InterestingOrigin::from_label(1)),
            &[],
        ));
        front.consider(record_with_origin(
            &[4],
            Status::Interesting,
            Some(InterestingOrigin::from_label(4)),
            &[],
        ));
        let buffers: Vec<_> = front.iter().map(|m| m.buffer.clone()).collect();
        assert_eq!(buffers, vec![vec![1], vec![4], vec![9]]);
        assert!(front.contains_buffer(&[4]));
        assert!(!front.contains_buffer(&[5]));
    }
}
