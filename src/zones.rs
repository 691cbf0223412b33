//! Exclusion Zones and Target Ordering
//!
//! Certain screen rectangles must never be clicked (navigation bars, menu
//! hotspots). The filter drops candidates inside those rectangles, orders
//! survivors so recently productive rows are revisited first, and picks an
//! escape sweep direction when an actionable target sits inside a zone.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detect::Detection;

/// Axis-aligned rectangle with inclusive bounds on all four edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionZone {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

impl ExclusionZone {
    pub fn new(x_min: i32, x_max: i32, y_min: i32, y_max: i32) -> Self {
        Self { x_min, x_max, y_min, y_max }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }

    fn vertical_center(&self) -> i32 {
        self.y_min + (self.y_max - self.y_min) / 2
    }
}

/// Direction for view sweeps (drags that move the surface content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepDirection {
    Up,
    Down,
}

impl SweepDirection {
    pub fn flipped(self) -> Self {
        match self {
            SweepDirection::Up => SweepDirection::Down,
            SweepDirection::Down => SweepDirection::Up,
        }
    }
}

pub struct ZoneFilter {
    zones: Vec<ExclusionZone>,
    /// Vertical coordinates of targets that previously led to a successful
    /// anchor interaction. Revisit those rows first.
    productive_rows: Vec<i32>,
    row_tolerance: i32,
    scan_height: i32,
}

impl ZoneFilter {
    pub fn new(zones: Vec<ExclusionZone>, row_tolerance: i32, scan_height: i32) -> Self {
        Self {
            zones,
            productive_rows: Vec::new(),
            row_tolerance,
            scan_height,
        }
    }

    /// True if the point lies in any configured zone. Short-circuits on the
    /// first containing zone.
    pub fn is_excluded(&self, x: i32, y: i32) -> bool {
        self.zones.iter().any(|z| z.contains(x, y))
    }

    /// Partition detections into (kept, excluded count), preserving the
    /// relative order of kept items.
    pub fn filter(&self, detections: Vec<Detection>) -> (Vec<Detection>, usize) {
        let total = detections.len();
        let kept: Vec<Detection> = detections
            .into_iter()
            .filter(|d| !self.is_excluded(d.x, d.y))
            .collect();
        let excluded = total - kept.len();
        if excluded > 0 {
            debug!(excluded, "detections removed by exclusion zones");
        }
        (kept, excluded)
    }

    pub fn record_productive_row(&mut self, y: i32) {
        if !self.productive_rows.contains(&y) {
            self.productive_rows.push(y);
        }
    }

    fn is_productive_row(&self, y: i32) -> bool {
        self.productive_rows
            .iter()
            .any(|&row| (y - row).abs() < self.row_tolerance)
    }

    /// Stable sort: detections near a previously productive row first,
    /// then top to bottom.
    pub fn prioritize(&self, detections: &mut [Detection]) {
        detections.sort_by_key(|d| (!self.is_productive_row(d.y), d.y));
    }

    /// Sweep direction that moves an excluded point away from the exclusion
    /// band containing it. Falls back to `default` when the point is not
    /// clearly inside an upper or lower band.
    pub fn escape_direction(&self, y: i32, default: SweepDirection) -> SweepDirection {
        let Some(zone) = self
            .zones
            .iter()
            .find(|z| y >= z.y_min && y <= z.y_max)
        else {
            return default;
        };

        let midline = self.scan_height / 2;
        match zone.vertical_center() {
            c if c > midline => SweepDirection::Up,
            c if c < midline => SweepDirection::Down,
            _ => default,
        }
    }
}
