//! Adaptive Vision and Timing Tuning
//!
//! Static thresholds rot: lighting, scaling and asset updates shift the
//! confidence distribution under the matcher. The vision tuner keeps one
//! threshold per detection condition and walks it with an exponential
//! moving average toward observed evidence. The timing tuner does the same
//! for interaction delays, driven by click/search success rates. Both are
//! clamped so a burst of bad evidence can never run a threshold off a cliff.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, TimingConfig, TimingTuningConfig, VisionTuningConfig};

/// Detection conditions with independently tuned thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Target,
    PrimaryEvent,
    SecondaryEvent,
    Anchor,
    Attribute,
}

impl Condition {
    pub const ALL: [Condition; 5] = [
        Condition::Target,
        Condition::PrimaryEvent,
        Condition::SecondaryEvent,
        Condition::Anchor,
        Condition::Attribute,
    ];

    /// Stable key used in the persisted state file.
    pub fn key(&self) -> &'static str {
        match self {
            Condition::Target => "target_threshold",
            Condition::PrimaryEvent => "primary_event_threshold",
            Condition::SecondaryEvent => "secondary_event_threshold",
            Condition::Anchor => "anchor_threshold",
            Condition::Attribute => "attribute_threshold",
        }
    }
}

struct Channel {
    config: ChannelConfig,
    threshold: f64,
    miss_count: u32,
}

impl Channel {
    fn clamp(&mut self) {
        self.threshold = self.threshold.clamp(self.config.min, self.config.max);
    }
}

/// Persists tuned thresholds as a flat JSON object, throttled so the hot
/// loop never writes more than once per interval.
pub struct StateStore {
    path: PathBuf,
    save_interval: f64,
    last_save: Option<Instant>,
}

impl StateStore {
    pub fn new(path: PathBuf, save_interval: f64) -> Self {
        Self {
            path,
            save_interval,
            last_save: None,
        }
    }

    /// Load persisted thresholds. A missing or corrupt file is not an
    /// error: tuning restarts from configured initials.
    pub fn load(&self) -> BTreeMap<String, f64> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(map) => {
                info!(path = %self.path.display(), "tuning state restored");
                map
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "tuning state unreadable, starting fresh");
                BTreeMap::new()
            }
        }
    }

    /// Write thresholds if the throttle interval elapsed. `force` bypasses
    /// the throttle for the shutdown flush.
    pub fn save(&mut self, values: &BTreeMap<String, f64>, force: bool) {
        if !force {
            if let Some(last) = self.last_save {
                if last.elapsed().as_secs_f64() < self.save_interval {
                    return;
                }
            }
        }
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(%err, "cannot create tuning state dir");
                return;
            }
        }
        match serde_json::to_string_pretty(values) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.path, json) {
                    warn!(%err, "tuning state write failed");
                } else {
                    self.last_save = Some(Instant::now());
                }
            }
            Err(err) => warn!(%err, "tuning state serialization failed"),
        }
    }
}

pub struct VisionTuner {
    enabled: bool,
    alpha: f64,
    alpha_max: f64,
    confidence_pivot: f64,
    confidence_boost: f64,
    channels: Vec<(Condition, Channel)>,
    store: Option<StateStore>,
}

impl VisionTuner {
    pub fn new(config: &VisionTuningConfig, store: Option<StateStore>) -> Self {
        let persisted = store.as_ref().map(|s| s.load()).unwrap_or_default();
        let channels = Condition::ALL
            .into_iter()
            .map(|condition| {
                let cfg = Self::channel_config(config, condition);
                let threshold = persisted
                    .get(condition.key())
                    .copied()
                    .unwrap_or(cfg.initial)
                    .clamp(cfg.min, cfg.max);
                (
                    condition,
                    Channel {
                        config: cfg,
                        threshold,
                        miss_count: 0,
                    },
                )
            })
            .collect();
        Self {
            enabled: config.enabled,
            alpha: config.alpha,
            alpha_max: config.alpha_max,
            confidence_pivot: config.confidence_pivot,
            confidence_boost: config.confidence_boost,
            channels,
            store,
        }
    }

    fn channel_config(config: &VisionTuningConfig, condition: Condition) -> ChannelConfig {
        match condition {
            Condition::Target => config.target,
            Condition::PrimaryEvent => config.primary_event,
            Condition::SecondaryEvent => config.secondary_event,
            Condition::Anchor => config.anchor,
            Condition::Attribute => config.attribute,
        }
    }

    fn channel_mut(&mut self, condition: Condition) -> &mut Channel {
        self.channels
            .iter_mut()
            .find(|(c, _)| *c == condition)
            .map(|(_, ch)| ch)
            .unwrap()
    }

    pub fn threshold(&self, condition: Condition) -> f64 {
        self.channels
            .iter()
            .find(|(c, _)| *c == condition)
            .map(|(_, ch)| ch.threshold)
            .unwrap()
    }

    /// Successful detection at the given confidence. Resets the miss
    /// counter and pulls the threshold toward `confidence - margin` with
    /// an alpha that grows with the strength of the evidence.
    pub fn record_hit(&mut self, condition: Condition, confidence: f64) {
        if !self.enabled {
            return;
        }
        let alpha_max = self.alpha_max;
        let alpha = (self.alpha
            + (confidence - self.confidence_pivot).clamp(0.0, 1.0) * self.confidence_boost)
            .min(alpha_max);
        let channel = self.channel_mut(condition);
        channel.miss_count = 0;
        let target = (confidence - channel.config.margin)
            .clamp(channel.config.min, channel.config.max);
        channel.threshold += alpha * (target - channel.threshold);
        channel.clamp();
        debug!(
            condition = condition.key(),
            threshold = channel.threshold,
            confidence,
            "threshold tuned on hit"
        );
        self.maybe_persist(false);
    }

    /// Failed detection. After a full window of consecutive misses the
    /// threshold is relaxed one step toward easier matching.
    pub fn record_miss(&mut self, condition: Condition) {
        if !self.enabled {
            return;
        }
        let alpha_max = self.alpha_max;
        let channel = self.channel_mut(condition);
        channel.miss_count += 1;
        if channel.miss_count < channel.config.miss_window {
            return;
        }
        channel.miss_count = 0;
        let target = (channel.threshold - channel.config.miss_step)
            .max(channel.config.min);
        channel.threshold += alpha_max * (target - channel.threshold);
        channel.clamp();
        info!(
            condition = condition.key(),
            threshold = channel.threshold,
            "threshold relaxed after miss window"
        );
        self.maybe_persist(false);
    }

    /// Outcome of a whole scan pass: best confidences per consensus point.
    /// An empty slice counts as a miss.
    pub fn record_scan(&mut self, condition: Condition, confidences: &[f64]) {
        match confidences.iter().copied().fold(None, |best: Option<f64>, c| {
            Some(best.map_or(c, |b| b.max(c)))
        }) {
            Some(best) => self.record_hit(condition, best),
            None => self.record_miss(condition),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, f64> {
        self.channels
            .iter()
            .map(|(c, ch)| (c.key().to_string(), ch.threshold))
            .collect()
    }

    fn maybe_persist(&mut self, force: bool) {
        if self.store.is_none() {
            return;
        }
        let values = self.snapshot();
        if let Some(store) = &mut self.store {
            store.save(&values, force);
        }
    }

    /// Unthrottled write, for shutdown.
    pub fn flush(&mut self) {
        self.maybe_persist(true);
    }
}

/// Tunes the four interaction delays from observed success rates.
/// Degrading rates stretch delays toward the ceiling; healthy rates
/// shrink them toward the floor.
pub struct TimingTuner {
    enabled: bool,
    alpha: f64,
    config: TimingTuningConfig,
    click_rate: f64,
    search_rate: f64,
    pub click_delay: f64,
    pub move_delay: f64,
    pub search_interval: f64,
    pub action_interval: f64,
}

impl TimingTuner {
    pub fn new(config: &TimingTuningConfig, timing: &TimingConfig) -> Self {
        Self {
            enabled: config.enabled,
            alpha: config.alpha,
            config: config.clone(),
            click_rate: 1.0,
            search_rate: 1.0,
            click_delay: timing.click_delay.clamp(config.min_click_delay, config.max_click_delay),
            move_delay: timing.move_delay.clamp(config.min_move_delay, config.max_move_delay),
            search_interval: timing
                .search_interval
                .clamp(config.min_search_interval, config.max_search_interval),
            action_interval: timing
                .attribute_click_interval
                .clamp(config.min_action_interval, config.max_action_interval),
        }
    }

    pub fn record_click(&mut self, success: bool) {
        if !self.enabled {
            return;
        }
        let sample = if success { 1.0 } else { 0.0 };
        self.click_rate += self.alpha * (sample - self.click_rate);

        if self.click_rate < self.config.click_low_watermark {
            self.click_delay = (self.click_delay + 0.01).min(self.config.max_click_delay);
            self.move_delay = (self.move_delay + 0.001).min(self.config.max_move_delay);
            debug!(rate = self.click_rate, delay = self.click_delay, "click timing stretched");
        } else if self.click_rate > self.config.click_high_watermark {
            self.click_delay = (self.click_delay - 0.005).max(self.config.min_click_delay);
            self.move_delay = (self.move_delay - 0.001).max(self.config.min_move_delay);
        }
    }

    pub fn record_search(&mut self, success: bool) {
        if !self.enabled {
            return;
        }
        let sample = if success { 1.0 } else { 0.0 };
        self.search_rate += self.alpha * (sample - self.search_rate);

        if self.search_rate < self.config.search_low_watermark {
            self.search_interval =
                (self.search_interval + 0.01).min(self.config.max_search_interval);
            self.action_interval =
                (self.action_interval + 0.001).min(self.config.max_action_interval);
            debug!(rate = self.search_rate, interval = self.search_interval, "search slowed");
        } else if self.search_rate > self.config.search_high_watermark {
            self.search_interval =
                (self.search_interval - 0.005).max(self.config.min_search_interval);
            self.action_interval =
                (self.action_interval - 0.001).max(self.config.min_action_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn tuner() -> VisionTuner {
        VisionTuner::new(&Config::default().vision_tuning, None)
    }

    #[test]
    fn hits_pull_threshold_toward_evidence_within_bounds() {
        let mut t = tuner();
        let before = t.threshold(Condition::Target);
        t.record_hit(Condition::Target, 0.99);
        let after = t.threshold(Condition::Target);
        assert!(after > before);

        for _ in 0..200 {
            t.record_hit(Condition::Target, 0.999);
        }
        let cfg = Config::default().vision_tuning.target;
        assert!(t.threshold(Condition::Target) <= cfg.max + 1e-9);

        for _ in 0..200 {
            t.record_hit(Condition::Target, 0.0);
        }
        assert!(t.threshold(Condition::Target) >= cfg.min - 1e-9);
    }

    #[test]
    fn miss_window_relaxes_once_then_resets() {
        let mut config = Config::default().vision_tuning;
        config.target.initial = 0.90;
        config.target.miss_window = 5;
        config.target.miss_step = 0.05;
        let mut t = VisionTuner::new(&config, None);

        let start = t.threshold(Condition::Target);
        for _ in 0..4 {
            t.record_miss(Condition::Target);
        }
        // Window not full yet: unchanged.
        assert!((t.threshold(Condition::Target) - start).abs() < 1e-9);

        t.record_miss(Condition::Target);
        let relaxed = t.threshold(Condition::Target);
        assert!(relaxed < start);
        // One EMA-damped step toward start - 0.05, never past it.
        assert!(relaxed >= start - 0.05 - 1e-9);

        // Counter reset: four more misses change nothing.
        for _ in 0..4 {
            t.record_miss(Condition::Target);
        }
        assert!((t.threshold(Condition::Target) - relaxed).abs() < 1e-9);
    }

    #[test]
    fn hit_resets_miss_counter() {
        let mut config = Config::default().vision_tuning;
        config.target.miss_window = 3;
        let mut t = VisionTuner::new(&config, None);

        t.record_miss(Condition::Target);
        t.record_miss(Condition::Target);
        t.record_hit(Condition::Target, 0.95);
        let after_hit = t.threshold(Condition::Target);

        // Two more misses do not complete a window.
        t.record_miss(Condition::Target);
        t.record_miss(Condition::Target);
        assert!((t.threshold(Condition::Target) - after_hit).abs() < 1e-9);
    }

    #[test]
    fn disabled_tuner_is_inert() {
        let mut config = Config::default().vision_tuning;
        config.enabled = false;
        let mut t = VisionTuner::new(&config, None);
        let before = t.threshold(Condition::Anchor);
        t.record_hit(Condition::Anchor, 0.99);
        for _ in 0..50 {
            t.record_miss(Condition::Anchor);
        }
        assert!((t.threshold(Condition::Anchor) - before).abs() < 1e-9);
    }

    #[test]
    fn conditions_tune_independently() {
        let mut t = tuner();
        let anchor_before = t.threshold(Condition::Anchor);
        t.record_hit(Condition::Target, 0.99);
        assert!((t.threshold(Condition::Anchor) - anchor_before).abs() < 1e-9);
    }

    #[test]
    fn record_scan_uses_best_confidence() {
        let mut t = tuner();
        let mut t2 = tuner();
        t.record_scan(Condition::Target, &[0.90, 0.96, 0.93]);
        t2.record_hit(Condition::Target, 0.96);
        assert!((t.threshold(Condition::Target) - t2.threshold(Condition::Target)).abs() < 1e-9);
    }

    #[test]
    fn state_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut store = StateStore::new(path.clone(), 0.0);
        let mut values = BTreeMap::new();
        values.insert("target_threshold".to_string(), 0.9123);
        store.save(&values, true);

        let config = Config::default().vision_tuning;
        let t = VisionTuner::new(&config, Some(StateStore::new(path, 0.0)));
        assert!((t.threshold(Condition::Target) - 0.9123).abs() < 1e-9);
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json{{").unwrap();

        let config = Config::default().vision_tuning;
        let t = VisionTuner::new(&config, Some(StateStore::new(path, 0.0)));
        assert!((t.threshold(Condition::Target) - config.target.initial).abs() < 1e-9);
    }

    #[test]
    fn save_throttle_skips_rapid_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::new(path.clone(), 60.0);

        let mut values = BTreeMap::new();
        values.insert("target_threshold".to_string(), 0.90);
        store.save(&values, true);

        values.insert("target_threshold".to_string(), 0.80);
        store.save(&values, false); // throttled

        let raw = fs::read_to_string(&path).unwrap();
        let read: BTreeMap<String, f64> = serde_json::from_str(&raw).unwrap();
        assert!((read["target_threshold"] - 0.90).abs() < 1e-9);
    }

    #[test]
    fn timing_watermarks_move_delays() {
        let config = Config::default();
        let mut t = TimingTuner::new(&config.timing_tuning, &config.timing);
        let start = t.click_delay;

        for _ in 0..40 {
            t.record_click(false);
        }
        assert!(t.click_delay > start);
        assert!(t.click_delay <= config.timing_tuning.max_click_delay);

        for _ in 0..200 {
            t.record_click(true);
        }
        assert!(t.click_delay < config.timing_tuning.max_click_delay);
        assert!(t.click_delay >= config.timing_tuning.min_click_delay);
    }

    #[test]
    fn confidence_pivot_gates_the_alpha_boost() {
        let mut near = Config::default().vision_tuning;
        near.confidence_pivot = 0.5;
        let mut far = Config::default().vision_tuning;
        far.confidence_pivot = 0.99;

        let mut boosted = VisionTuner::new(&near, None);
        let mut plain = VisionTuner::new(&far, None);
        boosted.record_hit(Condition::Target, 0.9);
        plain.record_hit(Condition::Target, 0.9);

        // Same evidence, same EMA target below the initial threshold; only
        // the tuner whose pivot sits under the observed confidence takes
        // the larger step toward it.
        assert!(boosted.threshold(Condition::Target) < plain.threshold(Condition::Target));
    }

    #[test]
    fn search_rate_drives_search_interval() {
        let config = Config::default();
        let mut t = TimingTuner::new(&config.timing_tuning, &config.timing);
        let start = t.search_interval;

        for _ in 0..40 {
            t.record_search(false);
        }
        assert!(t.search_interval > start);

        for _ in 0..300 {
            t.record_search(true);
        }
        assert!(t.search_interval < config.timing_tuning.max_search_interval);
    }

    #[test]
    fn action_interval_follows_search_rate_not_click_rate() {
        let config = Config::default();
        let mut t = TimingTuner::new(&config.timing_tuning, &config.timing);
        let start = t.action_interval;

        // Click failures move the click timing, never the action interval.
        for _ in 0..60 {
            t.record_click(false);
        }
        assert!((t.action_interval - start).abs() < 1e-9);

        for _ in 0..60 {
            t.record_search(false);
        }
        assert!(t.action_interval > start);
        assert!(t.action_interval <= config.timing_tuning.max_action_interval);

        for _ in 0..300 {
            t.record_search(true);
        }
        assert!(t.action_interval >= config.timing_tuning.min_action_interval);
        assert!(t.action_interval < config.timing_tuning.max_action_interval);
    }

    #[test]
    fn disabled_timing_tuner_is_inert() {
        let mut config = Config::default();
        config.timing_tuning.enabled = false;
        let mut t = TimingTuner::new(&config.timing_tuning, &config.timing);
        let delay = t.click_delay;
        for _ in 0..50 {
            t.record_click(false);
        }
        assert!((t.click_delay - delay).abs() < 1e-9);
    }
}
