//! The injected statistics sink.
//!
//! The memory reports per-update metrics (timings, rehearsal outcomes,
//! reduced ids) into a caller-owned [`Statistics`] value instead of posting
//! to a process-global bus; the hosting application decides what to do with
//! them.

use std::collections::BTreeMap;

/// Named metrics and side-channel results collected during one update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    values: BTreeMap<String, f32>,
    /// Nodes collapsed by graph reduction this update: reduced id → target.
    reduced_ids: BTreeMap<i32, i32>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) a named metric.
    pub fn add(&mut self, name: &str, value: f32) {
        self.values.insert(name.to_string(), value);
    }

    pub fn value(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f32> {
        &self.values
    }

    pub fn set_reduced_ids(&mut self, reduced: BTreeMap<i32, i32>) {
        self.reduced_ids = reduced;
    }

    pub fn reduced_ids(&self) -> &BTreeMap<i32, i32> {
        &self.reduced_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read_values() {
        let mut stats = Statistics::new();
        stats.add("rehearsal/sim", 0.9);
        stats.add("rehearsal/sim", 0.5); // overwrite
        assert_eq!(stats.value("rehearsal/sim"), Some(0.5));
        assert_eq!(stats.value("missing"), None);
    }

    #[test]
    fn reduced_ids_roundtrip() {
        let mut stats = Statistics::new();
        stats.set_reduced_ids(BTreeMap::from([(5, 2)]));
        assert_eq!(stats.reduced_ids()[&5], 2);
    }
}
