use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::ArrayConfig;
use crate::detect::SignalInterval;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoincidenceCluster {
    pub channels: BTreeSet<usize>,
    pub begin_time: f64,
    pub end_time: f64,
    /// Intervals in scan order; one per channel.
    pub members: Vec<SignalInterval>,
}

impl CoincidenceCluster {
    pub fn arrival_time(&self, channel: usize) -> Option<f64> {
        self.members
            .iter()
            .find(|m| m.channel == channel)
            .map(|m| m.begin_time)
    }

    // Checked against the interval that closed the cluster.
    pub fn within_window(&self, (start, end): (f64, f64)) -> bool {
        match self.members.last() {
            Some(last) => last.begin_time >= start && self.end_time <= end,
            None => false,
        }
    }
}

/// Greedy single-pass grouping of begin-sorted intervals.
#[derive(Debug, Clone, Copy)]
pub struct Clusterer {
    pub channel_count: usize,
    pub min_cluster_size: usize,
    pub proximity: f64,
}

impl From<&ArrayConfig> for Clusterer {
    fn from(cfg: &ArrayConfig) -> Self {
        Self {
            channel_count: cfg.channel_count,
            min_cluster_size: cfg.half_channel_threshold(),
            proximity: cfg.coincidence_proximity,
        }
    }
}

struct OpenCluster {
    channels: BTreeSet<usize>,
    members: Vec<SignalInterval>,
    begin_time: f64,
}

impl OpenCluster {
    fn new() -> Self {
        Self {
            channels: BTreeSet::new(),
            members: Vec::new(),
            begin_time: 0.0,
        }
    }

    fn finish(&mut self, end_time: f64) -> CoincidenceCluster {
        let cluster = CoincidenceCluster {
            channels: std::mem::take(&mut self.channels),
            begin_time: self.begin_time,
            end_time,
            members: std::mem::take(&mut self.members),
        };
        self.begin_time = 0.0;
        cluster
    }

    fn reset(&mut self) {
        self.channels.clear();
        self.members.clear();
        self.begin_time = 0.0;
    }
}

impl Clusterer {
    fn absorbs(&self, open: &OpenCluster, channel: usize, begin: f64, reference: f64) -> bool {
        !open.channels.contains(&channel) && (begin - reference).abs() < self.proximity
    }

    pub fn cluster(&self, intervals: &[SignalInterval]) -> Vec<CoincidenceCluster> {
        let mut sorted = intervals.to_vec();
        sorted.sort_by(|a, b| a.begin_time.total_cmp(&b.begin_time));

        let mut open = OpenCluster::new();
        let mut clusters = Vec::new();

        for (i, event) in sorted.iter().enumerate() {
            open.members.push(*event);
            if open.channels.is_empty() {
                open.channels.insert(event.channel);
                open.begin_time = event.begin_time;
            }

            if open.channels.len() == self.channel_count {
                clusters.push(open.finish(event.end_time));
                continue;
            }

            if let Some(next) = sorted.get(i + 1) {
                if self.absorbs(&open, next.channel, next.begin_time, event.begin_time) {
                    open.channels.insert(next.channel);
                    continue;
                }
            } else if i > 0 {
                // Last interval looks behind instead of ahead.
                let prev = &sorted[i - 1];
                if self.absorbs(&open, event.channel, prev.begin_time, event.begin_time) {
                    open.channels.insert(event.channel);
                }
            }

            if open.channels.len() >= self.min_cluster_size {
                clusters.push(open.finish(event.end_time));
            } else {
                open.reset();
            }
        }
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::Clusterer;
    use crate::config::ArrayConfig;
    use crate::detect::SignalInterval;

    fn interval(channel: usize, begin_time: f64, end_time: f64) -> SignalInterval {
        SignalInterval {
            channel,
            begin_time,
            end_time,
        }
    }

    fn clusterer() -> Clusterer {
        Clusterer::from(&ArrayConfig::default())
    }

    #[test]
    fn late_channel_is_left_out_of_the_cluster() {
        let mut pool: Vec<SignalInterval> = (0..7).map(|ch| interval(ch, 0.0, 50.0)).collect();
        pool.push(interval(7, 600.0, 650.0));
        let clusters = clusterer().cluster(&pool);
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.channels.len(), 7);
        assert!(!cluster.channels.contains(&7));
        assert_eq!(cluster.begin_time, 0.0);
        assert_eq!(cluster.end_time, 50.0);
        assert_eq!(cluster.members.len(), 7);
    }

    #[test]
    fn full_coincidence_finalizes_on_the_eighth_interval() {
        let mut pool: Vec<SignalInterval> = (0..8)
            .rev()
            .map(|ch| interval(ch, 10.0 * ch as f64, 10.0 * ch as f64 + 40.0))
            .collect();
        pool.push(interval(0, 80.0, 120.0));
        let clusters = clusterer().cluster(&pool);
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.channels.len(), 8);
        assert_eq!(cluster.begin_time, 0.0);
        assert_eq!(cluster.end_time, 110.0);
        assert_eq!(cluster.arrival_time(5), Some(50.0));
    }

    #[test]
    fn small_groups_are_dropped() {
        assert_eq!(clusterer().min_cluster_size, 4);
        let pool = vec![
            interval(0, 0.0, 40.0),
            interval(1, 20.0, 60.0),
            interval(2, 30.0, 70.0),
            interval(3, 2000.0, 2050.0),
        ];
        assert!(clusterer().cluster(&pool).is_empty());
    }

    #[test]
    fn repeated_channel_closes_the_cluster() {
        let pool = vec![
            interval(0, 0.0, 40.0),
            interval(1, 10.0, 50.0),
            interval(2, 20.0, 60.0),
            interval(3, 30.0, 70.0),
            interval(1, 35.0, 75.0),
            interval(4, 36.0, 76.0),
        ];
        let clusters = clusterer().cluster(&pool);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].channels.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(clusters[0].end_time, 70.0);
    }

    #[test]
    fn separate_bursts_form_separate_clusters() {
        let mut pool = Vec::new();
        for ch in 0..4 {
            pool.push(interval(ch, -1800.0 + ch as f64, -1760.0));
            pool.push(interval(ch + 4, -400.0 + ch as f64, -350.0));
        }
        let clusters = clusterer().cluster(&pool);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].channels.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(clusters[1].channels.iter().copied().collect::<Vec<_>>(), vec![4, 5, 6, 7]);
        assert_eq!(clusters[1].begin_time, -400.0);
        assert!(!clusters[0].within_window((-1500.0, 0.0)));
        assert!(clusters[1].within_window((-1500.0, 0.0)));
    }

    #[test]
    fn equal_begin_times_keep_pool_order() {
        let pool = vec![
            interval(6, 5.0, 30.0),
            interval(2, 5.0, 31.0),
            interval(4, 5.0, 32.0),
            interval(0, 5.0, 33.0),
        ];
        let clusters = clusterer().cluster(&pool);
        assert_eq!(clusters.len(), 1);
        let order: Vec<usize> = clusters[0].members.iter().map(|m| m.channel).collect();
        assert_eq!(order, vec![6, 2, 4, 0]);
        assert_eq!(clusters[0].end_time, 33.0);
    }

    #[test]
    fn empty_pool_has_no_clusters() {
        assert!(clusterer().cluster(&[]).is_empty());
    }
}
