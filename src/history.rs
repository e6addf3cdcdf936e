use crate::api::{AnalysisResult, BoundingBox, CongestionLevel};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 50;

/// Most recent analysis results, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<AnalysisResult>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Appends a result, evicting the oldest one when full.
    pub fn push(&mut self, result: AnalysisResult) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&AnalysisResult> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<AnalysisResult> {
        self.entries.iter().cloned().collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let mut stats = HistoryStats {
            samples: self.entries.len(),
            ..Default::default()
        };
        if self.entries.is_empty() {
            return stats;
        }

        let mut total = 0u64;
        for result in &self.entries {
            total += u64::from(result.vehicle_count);
            stats.peak_vehicles = stats.peak_vehicles.max(result.vehicle_count);
            match result.congestion_level {
                CongestionLevel::Low => stats.low += 1,
                CongestionLevel::Medium => stats.medium += 1,
                CongestionLevel::High => stats.high += 1,
            }
        }
        stats.average_vehicles = total as f64 / self.entries.len() as f64;
        stats.latest_congestion = self.latest().map(|r| r.congestion_level);
        stats
    }
}

/// Aggregates shown next to the trend chart.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub samples: usize,
    pub average_vehicles: f64,
    pub peak_vehicles: u32,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub latest_congestion: Option<CongestionLevel>,
}

/// Presentation state written by the scheduler and read by the dashboard.
#[derive(Debug, Default)]
pub struct Board {
    history: History,
    detections: Vec<BoundingBox>,
}

impl Board {
    pub fn record(&mut self, result: AnalysisResult) {
        self.detections = result.detected_objects.clone();
        self.history.push(result);
    }

    /// Drops the boxes of the previous source. History is kept.
    pub fn clear_detections(&mut self) {
        self.detections.clear();
    }

    pub fn detections(&self) -> &[BoundingBox] {
        &self.detections
    }

    pub fn history(&self) -> &History {
        &self.history
    }
}
