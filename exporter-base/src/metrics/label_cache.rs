use std::collections::HashSet;

use parking_lot::Mutex;

/// One published series: metric family name plus ordered label values.
/// Families are referenced by name, not by handle, so the cache carries no
/// lifetime ties to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub family: &'static str,
    pub labels: Vec<String>,
}

impl SeriesKey {
    pub fn new(family: &'static str, labels: &[&str]) -> Self {
        Self {
            family,
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// The authoritative set of series a chain currently publishes. Every gauge
/// write records here; pruning walks exactly this set, never the whole
/// registry.
#[derive(Default)]
pub struct LabelCache {
    series: Mutex<HashSet<SeriesKey>>,
}

impl LabelCache {
    pub fn record(&self, key: SeriesKey) {
        self.series.lock().insert(key);
    }

    pub fn remove(&self, key: &SeriesKey) -> bool {
        self.series.lock().remove(key)
    }

    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.series.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.series.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.lock().is_empty()
    }

    /// Empty the cache, returning what was published.
    pub fn drain(&self) -> Vec<SeriesKey> {
        self.series.lock().drain().collect()
    }

    pub fn snapshot(&self) -> Vec<SeriesKey> {
        self.series.lock().iter().cloned().collect()
    }

    /// Cached series within `subject` families that are absent from `live`.
    /// Used after a successful collect to find series the current spec no
    /// longer produces.
    pub fn stale_series(
        &self,
        live: &HashSet<SeriesKey>,
        subject: impl Fn(&SeriesKey) -> bool,
    ) -> Vec<SeriesKey> {
        self.series
            .lock()
            .iter()
            .filter(|key| subject(key) && !live.contains(*key))
            .cloned()
            .collect()
    }
}
