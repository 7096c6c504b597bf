use serde::{Deserialize, Serialize};

/// Handle to a counter registered with a [`Registry`].
///
/// Handles are cheap to copy and only valid for the registry that issued
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counter(u32);

impl Default for Counter {
    fn default() -> Self {
        // Sentinel for "not yet registered". Using it panics.
        Counter(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Name {
    name: String,
    long_name: String,
}

/// Insertion-ordered counter registry.
///
/// Counters are registered once with a short and a long name and bumped
/// through their [`Counter`] handle. Dumping iterates in registration
/// order, which keeps log output stable across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    names: Vec<Name>,
    values: Vec<u64>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, long_name: impl Into<String>) -> Counter {
        let name = name.into();
        assert!(
            !self.names.iter().any(|n| n.name == name),
            "duplicate counter `{name}`"
        );
        self.names.push(Name {
            name,
            long_name: long_name.into(),
        });
        self.values.push(0);
        Counter(self.values.len() as u32 - 1)
    }

    pub fn inc(&mut self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn dec(&mut self, counter: Counter) {
        self.values[counter.0 as usize] -= 1;
    }

    pub fn add(&mut self, counter: Counter, value: u64) {
        self.values[counter.0 as usize] += value;
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.0 as usize]
    }

    /// Zero every counter. Used when the warm-up phase ends.
    pub fn reset_all(&mut self) {
        for value in &mut self.values {
            *value = 0;
        }
    }

    /// Iterate `(name, long name, value)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.names
            .iter()
            .zip(&self.values)
            .map(|(n, v)| (n.name.as_str(), n.long_name.as_str(), *v))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = Registry::new();
        let hits = registry.register("hits", "Total Hits");
        let misses = registry.register("misses", "Total Misses");
        registry.add(hits, 3);
        registry.inc(misses);

        let dumped: Vec<_> = registry.iter().collect();
        assert_eq!(
            dumped,
            vec![("hits", "Total Hits", 3), ("misses", "Total Misses", 1)]
        );
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut registry = Registry::new();
        let a = registry.register("a", "a");
        registry.add(a, 10);
        registry.reset_all();
        assert_eq!(registry.get(a), 0);
    }

    #[test]
    #[should_panic(expected = "duplicate counter")]
    fn duplicate_names_panic() {
        let mut registry = Registry::new();
        registry.register("a", "first");
        registry.register("a", "second");
    }
}
