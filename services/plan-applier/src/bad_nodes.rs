//! Tracks nodes whose plans keep getting rejected.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use fleet_id::NodeId;

#[derive(Debug, Clone)]
pub struct BadNodeTrackerConfig {
    /// Rejections inside the window that mark a node ineligible. Zero
    /// disables tracking.
    pub threshold: usize,
    pub window: Duration,
}

impl Default for BadNodeTrackerConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            window: Duration::from_secs(300),
        }
    }
}

/// Sliding-window rejection counter per node.
#[derive(Debug, Default)]
pub struct BadNodeTracker {
    config: BadNodeTrackerConfig,
    rejections: HashMap<NodeId, VecDeque<DateTime<Utc>>>,
}

impl BadNodeTracker {
    pub fn new(config: BadNodeTrackerConfig) -> Self {
        Self {
            config,
            rejections: HashMap::new(),
        }
    }

    /// Records a rejection of `node` at `now`. Returns true exactly when the
    /// node crosses the threshold; its history is then cleared so the next
    /// report needs a full window of fresh rejections.
    pub fn add(&mut self, node: &NodeId, now: DateTime<Utc>) -> bool {
        if self.config.threshold == 0 {
            return false;
        }
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or(chrono::Duration::MAX);
        let history = self.rejections.entry(node.clone()).or_default();
        history.push_back(now);
        while history
            .front()
            .is_some_and(|first| now.signed_duration_since(*first) > window)
        {
            history.pop_front();
        }
        if history.len() < self.config.threshold {
            return false;
        }
        self.rejections.remove(node);
        info!(node_id = %node, threshold = self.config.threshold, "Node marked ineligible after repeated plan rejections");
        true
    }

    /// Number of rejections currently held for `node`.
    pub fn count(&self, node: &NodeId) -> usize {
        self.rejections.get(node).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: usize, window_secs: u64) -> BadNodeTracker {
        BadNodeTracker::new(BadNodeTrackerConfig {
            threshold,
            window: Duration::from_secs(window_secs),
        })
    }

    #[test]
    fn test_crossing_threshold_reports_once() {
        let mut tracker = tracker(3, 60);
        let node = NodeId::from("n1");
        let now = Utc::now();
        assert!(!tracker.add(&node, now));
        assert!(!tracker.add(&node, now));
        assert!(tracker.add(&node, now));
        assert_eq!(tracker.count(&node), 0);
        assert!(!tracker.add(&node, now));
    }

    #[test]
    fn test_old_rejections_slide_out() {
        let mut tracker = tracker(2, 60);
        let node = NodeId::from("n1");
        let start = Utc::now();
        assert!(!tracker.add(&node, start));
        assert!(!tracker.add(&node, start + chrono::Duration::seconds(120)));
        assert_eq!(tracker.count(&node), 1);
    }

    #[test]
    fn test_nodes_tracked_separately() {
        let mut tracker = tracker(2, 60);
        let now = Utc::now();
        assert!(!tracker.add(&NodeId::from("n1"), now));
        assert!(!tracker.add(&NodeId::from("n2"), now));
        assert!(tracker.add(&NodeId::from("n1"), now));
    }

    #[test]
    fn test_zero_threshold_disables() {
        let mut tracker = tracker(0, 60);
        let node = NodeId::from("n1");
        for _ in 0..10 {
            assert!(!tracker.add(&node, Utc::now()));
        }
        assert_eq!(tracker.count(&node), 0);
    }
}
