//! Connection quorum counting

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// Distinct edge connections registered during one attempt
///
/// Indexed registrations count once per index. Registrations without an index
/// count at most once per deduplication window, so a burst of near-identical
/// lines is not mistaken for several connections. The size never decreases.
#[derive(Debug, Clone)]
pub struct ConnectionQuorum {
    indices: BTreeSet<u32>,
    anonymous: usize,
    last_anonymous: Option<Instant>,
    window: Duration,
    locations: Vec<String>,
}

impl ConnectionQuorum {
    /// Create an empty quorum with the given deduplication window
    pub fn new(window: Duration) -> Self {
        Self {
            indices: BTreeSet::new(),
            anonymous: 0,
            last_anonymous: None,
            window,
            locations: Vec::new(),
        }
    }

    /// Record a registration; returns `true` if it increased the quorum
    pub fn record(&mut self, index: Option<u32>, location: Option<&str>, now: Instant) -> bool {
        if let Some(location) = location
            && !self.locations.iter().any(|l| l == location)
        {
            self.locations.push(location.to_string());
        }

        match index {
            Some(index) => self.indices.insert(index),
            None => {
                let within_window = self
                    .last_anonymous
                    .is_some_and(|last| now.saturating_duration_since(last) < self.window);
                if within_window {
                    return false;
                }
                self.last_anonymous = Some(now);
                self.anonymous += 1;
                true
            }
        }
    }

    /// Number of distinct connections counted so far
    pub fn size(&self) -> usize {
        self.indices.len() + self.anonymous
    }

    /// Edge locations seen, in order of first appearance
    pub fn locations(&self) -> &[String] {
        &self.locations
    }
}
