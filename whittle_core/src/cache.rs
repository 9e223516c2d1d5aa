use crate::data::TestResult;
use std::collections::HashMap;
use std::sync::Arc;

/// Exact-match cache from a byte buffer to the record its replay produced.
///
/// Identical buffers always yield identical records, so a hit makes replay
/// free. Matching is byte-for-byte; there is no prefix or fuzzy lookup, and
/// no implicit memoization. The runner decides what goes in.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: HashMap<Vec<u8>, Arc<TestResult>>,
    hits: u64,
    misses: u64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, buffer: &[u8]) -> Option<Arc<TestResult>> {
        match self.entries.get(buffer) {
            Some(result) => {
                self.hits += 1;
                Some(result.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, buffer: Vec<u8>, result: Arc<TestResult>) {
        self.entries.insert(buffer, result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Status;
    use std::collections::BTreeMap;

    fn record(buffer: Vec<u8>) -> Arc<TestResult> {
        Arc::new(TestResult {
            buffer,
            status: Status::Valid,
            origin: None,
            targets: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    #[test]
    fn lookup_is_exact() {
        let mut cache = ResultCache::new();
        cache.insert(vec![1, 2, 3], record(vec![1, 2, 3]));
        assert!(cache.get(&[1, 2, 3]).is_some());
        assert!(cache.get(&[1, 2]).is_none(), "prefixes must not match");
        assert!(cache.get(&[1, 2, 3, 0]).is_none(), "extensions must not match");
    }

    #[test]
    fn counters_track_hits_and_misses() {
        let mut cache = ResultCache::new();
        cache.insert(vec![9], record(vec![9]));
        cache.get(&[9]);
        cache.get(&[9]);
        cache.get(&[7]);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn reinsert_overwrites() {
        let mut cache = ResultCache::new();
        cache.insert(vec![1], record(vec![1]));
        cache.insert(vec![1], record(vec![]));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&[1]).unwrap().buffer.is_empty());
    }
}
