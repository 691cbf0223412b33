//! Configuration
//!
//! One TOML file describes the observed surface, detection thresholds,
//! timing, adaptive-tuning bounds, exclusion zones, fixed interaction
//! points and pattern names. Every section has working defaults so the
//! binary runs with no file at all.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::zones::ExclusionZone;

pub fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

/// Fixed surface-relative interaction point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Surface-relative rectangle used to restrict a detection pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Region {
    pub x_min: i32,
    pub x_max: i32,
    pub y_min: i32,
    pub y_max: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    /// Monitor index for the capture backend
    pub monitor_index: usize,
    /// Normal scan cutoff: rows below this are UI chrome
    pub scan_height: u32,
    /// Extended cutoff used when the attribute/priority bars matter
    pub extended_scan_height: u32,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            monitor_index: 0,
            scan_height: 660,
            extended_scan_height: 710,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Quorum of independent variants required per consensus point
    pub target_min_matches: usize,
    /// Minimum pixel separation handed to the matcher's dedup
    pub match_min_separation: u32,
    /// Consensus merge distance (both axes)
    pub proximity: i32,
    /// Spatial hash bucket edge
    pub bucket_size: i32,

    /// Region where the primary priority marker appears
    pub primary_region: Region,
    pub primary_min_matches: usize,

    /// Threshold drop applied on late anchor search attempts
    pub anchor_relaxation: f64,

    /// Region (before padding) where the attribute marker appears
    pub attribute_region: Region,
    pub attribute_region_padding: i32,

    /// Threshold for the post-event confirmation element
    pub confirm_threshold: f64,
    pub pickup_threshold: f64,

    /// Re-locate radius around an expected position
    pub refine_radius: i32,
    /// Threshold drop while refining
    pub refine_threshold_drop: f64,
    /// Padding of the presence re-verification window
    pub verify_padding: i32,
    /// Allowed drift between expected and re-verified position
    pub verify_tolerance: i32,

    /// Click offset applied to target markers
    pub target_offset_x: i32,
    pub target_offset_y: i32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            target_min_matches: 2,
            match_min_separation: 80,
            proximity: 10,
            bucket_size: 10,
            primary_region: Region { x_min: 40, x_max: 60, y_min: 665, y_max: 680 },
            primary_min_matches: 2,
            anchor_relaxation: 0.05,
            attribute_region: Region { x_min: 280, x_max: 310, y_min: 665, y_max: 680 },
            attribute_region_padding: 20,
            confirm_threshold: 0.85,
            pickup_threshold: 0.97,
            refine_radius: 40,
            refine_threshold_drop: 0.05,
            verify_padding: 30,
            verify_tolerance: 15,
            target_offset_x: 10,
            target_offset_y: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Frame cache TTL within one tick (seconds)
    pub capture_cache_ttl: f64,
    /// Memoized primary-detection TTL; may exceed the frame TTL
    pub priority_cache_ttl: f64,
    /// Sub-interval for interrupt polling inside long sleeps/holds
    pub interrupt_poll: f64,
    /// Background monitor cycle interval
    pub monitor_poll: f64,
    /// Bounded join on shutdown
    pub monitor_join_timeout: f64,

    pub click_delay: f64,
    pub move_delay: f64,
    pub state_delay: f64,
    pub search_interval: f64,

    pub hold_duration: f64,
    pub hold_check_interval: f64,

    pub attribute_click_duration: f64,
    pub attribute_click_interval: f64,

    pub sweep_duration: f64,
    pub escape_sweep_duration: f64,
    pub escape_sweep_cooldown: f64,
    pub settle_delay: f64,

    /// Minimum gap between repeated priority override click sequences
    pub override_cooldown: f64,
    pub transition_retry_delay: f64,
    pub transition_post_click_delay: f64,
    pub recovery_retry_delay: f64,
    pub recovery_post_click_delay: f64,
    pub priority_button_delay: f64,
    pub priority_followup_delay: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            capture_cache_ttl: 0.08,
            priority_cache_ttl: 0.25,
            interrupt_poll: 0.2,
            monitor_poll: 0.25,
            monitor_join_timeout: 1.0,
            click_delay: 0.3,
            move_delay: 0.01,
            state_delay: 0.05,
            search_interval: 0.5,
            hold_duration: 5.0,
            hold_check_interval: 1.0,
            attribute_click_duration: 2.0,
            attribute_click_interval: 0.005,
            sweep_duration: 0.3,
            escape_sweep_duration: 0.3,
            escape_sweep_cooldown: 0.2,
            settle_delay: 0.2,
            override_cooldown: 2.0,
            transition_retry_delay: 0.5,
            transition_post_click_delay: 1.0,
            recovery_retry_delay: 1.0,
            recovery_post_click_delay: 0.5,
            priority_button_delay: 0.5,
            priority_followup_delay: 0.5,
        }
    }
}

/// Bounds and adaptation parameters for one tuned confidence threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub initial: f64,
    pub min: f64,
    pub max: f64,
    /// Subtracted from observed confidence before it becomes the EMA target
    pub margin: f64,
    /// Consecutive misses before the threshold is relaxed
    pub miss_window: u32,
    /// Downward nudge applied after a full miss window
    pub miss_step: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial: 0.94,
            min: 0.88,
            max: 0.97,
            margin: 0.02,
            miss_window: 6,
            miss_step: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionTuningConfig {
    pub enabled: bool,
    /// Base EMA smoothing factor
    pub alpha: f64,
    /// Cap for the confidence-boosted alpha; also used on miss relaxation
    pub alpha_max: f64,
    /// Confidence above this pivot starts boosting alpha
    pub confidence_pivot: f64,
    /// How strongly confidence beyond the pivot raises alpha
    pub confidence_boost: f64,
    /// Minimum gap between persistence writes
    pub save_interval: f64,
    /// Threshold state file; defaults to a per-user state dir
    pub state_file: Option<PathBuf>,

    pub target: ChannelConfig,
    pub primary_event: ChannelConfig,
    pub secondary_event: ChannelConfig,
    pub anchor: ChannelConfig,
    pub attribute: ChannelConfig,
}

impl Default for VisionTuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.2,
            alpha_max: 0.6,
            confidence_pivot: 0.8,
            confidence_boost: 0.5,
            save_interval: 5.0,
            state_file: None,
            target: ChannelConfig {
                initial: 0.94,
                min: 0.88,
                max: 0.97,
                margin: 0.02,
                miss_window: 6,
                miss_step: 0.05,
            },
            primary_event: ChannelConfig {
                initial: 0.95,
                min: 0.88,
                max: 0.98,
                margin: 0.0,
                miss_window: 8,
                miss_step: 0.02,
            },
            secondary_event: ChannelConfig {
                initial: 0.95,
                min: 0.90,
                max: 0.98,
                margin: 0.0,
                miss_window: 8,
                miss_step: 0.02,
            },
            anchor: ChannelConfig {
                initial: 0.94,
                min: 0.88,
                max: 0.97,
                margin: 0.0,
                miss_window: 5,
                miss_step: 0.03,
            },
            attribute: ChannelConfig {
                initial: 0.97,
                min: 0.92,
                max: 0.985,
                margin: 0.0,
                miss_window: 6,
                miss_step: 0.02,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingTuningConfig {
    pub enabled: bool,
    pub alpha: f64,

    pub click_low_watermark: f64,
    pub click_high_watermark: f64,
    pub search_low_watermark: f64,
    pub search_high_watermark: f64,

    pub min_click_delay: f64,
    pub max_click_delay: f64,
    pub min_move_delay: f64,
    pub max_move_delay: f64,
    pub min_search_interval: f64,
    pub max_search_interval: f64,
    pub min_action_interval: f64,
    pub max_action_interval: f64,
}

impl Default for TimingTuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.2,
            click_low_watermark: 0.85,
            click_high_watermark: 0.97,
            search_low_watermark: 0.70,
            search_high_watermark: 0.90,
            min_click_delay: 0.05,
            max_click_delay: 0.60,
            min_move_delay: 0.005,
            max_move_delay: 0.05,
            min_search_interval: 0.20,
            max_search_interval: 1.50,
            min_action_interval: 0.003,
            max_action_interval: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub exclusion: Vec<ExclusionZone>,
    /// Vertical tolerance when matching previously productive rows
    pub row_tolerance: i32,
    /// Escape sweeps allowed per scan cycle
    pub max_escape_sweeps: u32,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            exclusion: vec![
                // Right side menu column
                ExclusionZone::new(290, 350, 93, 270),
                // Left side top menu column
                ExclusionZone::new(0, 60, 50, 280),
                // Left side bottom menu column
                ExclusionZone::new(0, 60, 590, 667),
                // Top center notification area
                ExclusionZone::new(145, 200, 65, 110),
                // Bottom navigation bar
                ExclusionZone::new(55, 285, 660, 725),
                // Lower action band
                ExclusionZone::new(60, 280, 668, 10_000),
            ],
            row_tolerance: 50,
            max_escape_sweeps: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointConfig {
    /// Neutral point used to dismiss transient popups
    pub idle: Point,
    /// Fixed location of the priority action button
    pub priority_action: Point,
    /// Fixed confirmation point of the stage transition dialog
    pub priority_transition: Point,
    /// Fixed location of the priority bar button
    pub priority_button: Point,
    /// Follow-up click after the priority bar button
    pub priority_followup: Point,
    /// Opens the attribute panel
    pub attribute_open: Point,
    /// Repeated-click point inside the attribute panel
    pub attribute_click: Point,
    pub sweep_start: Point,
    pub sweep_end: Point,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            idle: Point::new(2, 390),
            priority_action: Point::new(40, 726),
            priority_transition: Point::new(183, 561),
            priority_button: Point::new(30, 692),
            priority_followup: Point::new(166, 526),
            attribute_open: Point::new(310, 698),
            attribute_click: Point::new(270, 304),
            sweep_start: Point::new(170, 380),
            sweep_end: Point::new(170, 200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Directory of PNG pattern files, one per name
    pub dir: PathBuf,
    /// Variant names of the target marker
    pub target_variants: Vec<String>,
    pub anchor: String,
    /// Secondary priority element (stage advance button)
    pub advance: String,
    /// Post-event confirmation element
    pub confirm: String,
    pub pickups: Vec<String>,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("patterns"),
            target_variants: (1..=8).map(|i| format!("marker{i}")).collect(),
            anchor: "anchor".into(),
            advance: "advance".into(),
            confirm: "confirm".into(),
            pickups: (1..=5).map(|i| format!("pickup{i}")).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Sweeps in one direction before flipping
    pub max_sweeps: u32,
    /// Idle cycles before a sweep is forced
    pub cycles_before_sweep: u32,
    /// Consecutive anchorless cycles before a forced sweep
    pub failed_cycles_before_sweep: u32,
    pub anchor_search_attempts: u32,
    /// Attempts before relaxing the anchor threshold
    pub anchor_strict_attempts: u32,
    pub transition_attempts: u32,
    pub recovery_attempts: u32,
    /// Up/down drags of the nothing-found scan sequence
    pub rescan_up_sweeps: u32,
    pub rescan_down_sweeps: u32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_sweeps: 5,
            cycles_before_sweep: 2,
            failed_cycles_before_sweep: 3,
            anchor_search_attempts: 5,
            anchor_strict_attempts: 2,
            transition_attempts: 5,
            recovery_attempts: 4,
            rescan_up_sweeps: 2,
            rescan_down_sweeps: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub telegram_token: String,
    pub telegram_chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub surface: SurfaceConfig,
    pub detection: DetectionConfig,
    pub timing: TimingConfig,
    pub vision_tuning: VisionTuningConfig,
    pub timing_tuning: TimingTuningConfig,
    pub zones: ZoneConfig,
    pub points: PointConfig,
    pub patterns: PatternConfig,
    pub behavior: BehaviorConfig,
    pub notify: NotifyConfig,
}

impl Config {
    /// Load from a TOML file; a missing file means defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Resolved threshold state file path.
    pub fn state_file(&self) -> PathBuf {
        if let Some(path) = &self.vision_tuning.state_file {
            return path.clone();
        }
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("screenpilot")
            .join("vision_tuning.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.surface.scan_height, 660);
        assert_eq!(config.detection.target_min_matches, 2);
        assert_eq!(config.zones.exclusion.len(), 6);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            [surface]
            scan_height = 500

            [detection]
            confirm_threshold = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(config.surface.scan_height, 500);
        assert_eq!(config.surface.extended_scan_height, 710);
        assert!((config.detection.confirm_threshold - 0.9).abs() < 1e-9);
        assert_eq!(config.detection.proximity, 10);
    }
}
