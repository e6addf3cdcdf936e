use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{
    history::HistoryStats, scheduler::ScheduleStatus, source::SourceStatus,
};

/// Coarse traffic density for a single frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl FromStr for CongestionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(CongestionLevel::Low),
            "medium" => Ok(CongestionLevel::Medium),
            "high" => Ok(CongestionLevel::High),
            other => Err(format!("unknown congestion level {other:?}")),
        }
    }
}

impl fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionLevel::Low => write!(f, "Low"),
            CongestionLevel::Medium => write!(f, "Medium"),
            CongestionLevel::High => write!(f, "High"),
        }
    }
}

/// One detected object. Coordinates are normalized to the frame, 0 is top/left.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub ymin: f32,
    pub xmin: f32,
    pub ymax: f32,
    pub xmax: f32,
    pub label: String,
}

/// The outcome of one completed analysis cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// The number of vehicles counted in the frame.
    pub vehicle_count: u32,
    pub congestion_level: CongestionLevel,
    /// A short summary of the scene.
    pub description: String,
    /// Boxes in the order the service reported them.
    pub detected_objects: Vec<BoundingBox>,
    /// Local capture time, human readable.
    pub timestamp: String,
    /// Capture instant in epoch milliseconds.
    pub processed_at: i64,
}

/// Where frames come from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Webcam,
    Url { address: String },
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Webcam => write!(f, "webcam"),
            SourceDescriptor::Url { address } => write!(f, "url {address}"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    /// True while the user wants periodic analysis.
    pub analysis_enabled: bool,
    pub source: SourceStatus,
    pub schedule: ScheduleStatus,
    /// Boxes of the latest result for the current source.
    pub detected_objects: Vec<BoundingBox>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub success: bool,
    pub entries: Vec<AnalysisResult>,
    pub stats: HistoryStats,
}

#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    /// True if successful.
    pub success: bool,
    /// A summary of what happened.
    pub message: String,
    /// An description of the error if success was false.
    pub error: Option<String>,
}
