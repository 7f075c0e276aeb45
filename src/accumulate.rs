use serde::Serialize;

use crate::detect::SignalInterval;
use crate::utils::unit_grid_index;

/// Run-wide counters. Each event fills its own instance and the driver folds
/// them together with [`Accumulator::merge`]; merge order does not change the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accumulator {
    pub channel_count: usize,
    pub time_len: usize,
    /// Per-channel counts of coincident signal begins, spread over `bin_range` slots.
    pub histogram: Vec<Vec<u64>>,
    /// Per-channel occupancy of coincident signals over their full duration.
    pub heatmap: Vec<Vec<u64>>,
    /// Whole-degree |antenna - reference| azimuth differences.
    pub azimuth_differences: Vec<u32>,
    pub events: u64,
    pub clusters: u64,
    pub reconstructed_clusters: u64,
    pub cosmic_ray_candidates: u64,
}

impl Accumulator {
    pub fn new(channel_count: usize, time_len: usize) -> Self {
        Self {
            channel_count,
            time_len,
            histogram: vec![vec![0; time_len]; channel_count],
            heatmap: vec![vec![0; time_len]; channel_count],
            azimuth_differences: Vec::new(),
            events: 0,
            clusters: 0,
            reconstructed_clusters: 0,
            cosmic_ray_candidates: 0,
        }
    }

    pub fn empty_like(&self) -> Self {
        Self::new(self.channel_count, self.time_len)
    }

    pub fn record_histogram(&mut self, origin: f64, members: &[SignalInterval], bin_range: usize) {
        if bin_range == 0 {
            return;
        }
        for member in members {
            let Some(row) = self.histogram.get_mut(member.channel) else {
                continue;
            };
            let Some(index) = unit_grid_index(origin, member.begin_time) else {
                continue;
            };
            let start = index - index % bin_range;
            // The final slot is never filled.
            let stop = (start + bin_range).min(self.time_len.saturating_sub(1));
            for slot in row.iter_mut().take(stop).skip(start) {
                *slot += 1;
            }
        }
    }

    pub fn record_heatmap(&mut self, origin: f64, members: &[SignalInterval]) {
        for member in members {
            let Some(row) = self.heatmap.get_mut(member.channel) else {
                continue;
            };
            let Some(index) = unit_grid_index(origin, member.begin_time) else {
                continue;
            };
            let span = member.duration().max(0.0) as usize;
            let stop = (index + span).min(self.time_len);
            for slot in row.iter_mut().take(stop).skip(index) {
                *slot += 1;
            }
        }
    }

    pub fn record_azimuth_difference(&mut self, antenna_azimuth: f64, reference_azimuth: f64) {
        let diff = (antenna_azimuth - reference_azimuth).abs().floor();
        if diff.is_finite() {
            self.azimuth_differences.push(diff as u32);
        }
    }

    pub fn merge(&mut self, other: &Accumulator) {
        for (mine, theirs) in self.histogram.iter_mut().zip(&other.histogram) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += *b;
            }
        }
        for (mine, theirs) in self.heatmap.iter_mut().zip(&other.heatmap) {
            for (a, b) in mine.iter_mut().zip(theirs) {
                *a += *b;
            }
        }
        self.azimuth_differences
            .extend_from_slice(&other.azimuth_differences);
        self.events += other.events;
        self.clusters += other.clusters;
        self.reconstructed_clusters += other.reconstructed_clusters;
        self.cosmic_ray_candidates += other.cosmic_ray_candidates;
    }

    /// Azimuth-difference counts in 5 degree bins starting at 0.
    pub fn azimuth_difference_bins(&self) -> Vec<u64> {
        let Some(&max) = self.azimuth_differences.iter().max() else {
            return Vec::new();
        };
        let mut bins = vec![0u64; max as usize / 5 + 1];
        for &diff in &self.azimuth_differences {
            bins[diff as usize / 5] += 1;
        }
        bins
    }
}

#[cfg(test)]
mod tests {
    use super::Accumulator;
    use crate::detect::SignalInterval;

    fn member(channel: usize, begin_time: f64, end_time: f64) -> SignalInterval {
        SignalInterval {
            channel,
            begin_time,
            end_time,
        }
    }

    #[test]
    fn histogram_snaps_to_bin_boundaries() {
        let mut acc = Accumulator::new(8, 100);
        acc.record_histogram(-50.0, &[member(2, -37.0, -20.0)], 10);
        // begin index 13 -> bins 10..20
        let hits: Vec<usize> = (0..100).filter(|&i| acc.histogram[2][i] == 1).collect();
        assert_eq!(hits, (10..20).collect::<Vec<_>>());
        assert!(acc.histogram[0].iter().all(|&v| v == 0));
    }

    #[test]
    fn histogram_never_touches_the_final_slot() {
        let mut acc = Accumulator::new(8, 25);
        acc.record_histogram(0.0, &[member(0, 22.0, 24.0)], 10);
        assert_eq!(&acc.histogram[0][20..25], &[1, 1, 1, 1, 0]);
    }

    #[test]
    fn heatmap_covers_the_signal_duration() {
        let mut acc = Accumulator::new(8, 50);
        acc.record_heatmap(0.0, &[member(5, 10.0, 14.0), member(5, 48.0, 60.0)]);
        let filled: Vec<usize> = (0..50).filter(|&i| acc.heatmap[5][i] > 0).collect();
        assert_eq!(filled, vec![10, 11, 12, 13, 48, 49]);
        assert!(acc.heatmap[0].iter().all(|&v| v == 0));
    }

    #[test]
    fn merge_order_does_not_matter() {
        let mut a = Accumulator::new(8, 40);
        a.record_histogram(0.0, &[member(1, 3.0, 9.0)], 5);
        a.record_azimuth_difference(120.0, 101.5);
        a.events = 1;
        let mut b = a.empty_like();
        b.record_heatmap(0.0, &[member(7, 30.0, 35.0)]);
        b.record_azimuth_difference(10.0, 12.0);
        b.events = 2;
        b.clusters = 1;

        let mut ab = a.empty_like();
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = a.empty_like();
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab.histogram, ba.histogram);
        assert_eq!(ab.heatmap, ba.heatmap);
        assert_eq!(ab.events, 3);
        assert_eq!(ab.clusters, ba.clusters);
        let mut x = ab.azimuth_differences.clone();
        let mut y = ba.azimuth_differences.clone();
        x.sort_unstable();
        y.sort_unstable();
        assert_eq!(x, vec![2, 18]);
        assert_eq!(x, y);
    }

    #[test]
    fn azimuth_differences_bin_by_five_degrees() {
        let mut acc = Accumulator::new(8, 1);
        assert!(acc.azimuth_difference_bins().is_empty());
        acc.record_azimuth_difference(10.0, 3.0);
        acc.record_azimuth_difference(0.0, 4.5);
        acc.record_azimuth_difference(50.0, 38.0);
        assert_eq!(acc.azimuth_difference_bins(), vec![1, 1, 1]);
    }
}
