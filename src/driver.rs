//! Control Loop Driver
//!
//! Owns every collaborator, registers the eleven state handlers and the
//! priority resolver, and runs the tick loop: clear caches, push tuned
//! timing into the actuator, step the state machine. The background
//! interrupt monitor is spawned for the duration of `run()` and joined
//! with a bounded timeout on the way out.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::actuator::Actuator;
use crate::assets::PatternStore;
use crate::capture::{CaptureCache, CaptureError, Frame, FrameSource, ResultCache};
use crate::config::{secs, Config, Point};
use crate::detect::{Detection, DetectionAggregator};
use crate::interrupt::{InterruptMonitor, InterruptSlot, InterruptSource, InterruptToken, PriorityProbe};
use crate::machine::{MachineError, State, StateMachine};
use crate::matcher::TemplateMatcher;
use crate::notify::Notifier;
use crate::tuning::{Condition, StateStore, TimingTuner, VisionTuner};
use crate::zones::{SweepDirection, ZoneFilter};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error("monitor thread failed to start: {0}")]
    Monitor(#[from] io::Error),
}

/// A priority hit: best confidence plus location.
type PriorityHit = Option<(f64, i32, i32)>;

/// Detect the primary priority marker: target-marker variants inside a
/// fixed region, accepted only on a quorum of independent variants.
fn detect_primary_in(
    frame: &Frame,
    matcher: &dyn TemplateMatcher,
    patterns: &PatternStore,
    config: &Config,
    threshold: f32,
) -> PriorityHit {
    let region = config.detection.primary_region;
    let x0 = region.x_min.max(0);
    let y0 = region.y_min.max(0);
    let sub = frame.crop(
        x0 as u32,
        y0 as u32,
        (region.x_max - x0 + 1).max(0) as u32,
        (region.y_max - y0 + 1).max(0) as u32,
    );
    if sub.width == 0 || sub.height == 0 {
        return None;
    }

    let mut agg = DetectionAggregator::new(
        config.detection.proximity,
        config.detection.bucket_size,
        config.detection.primary_min_matches,
    );
    for name in &config.patterns.target_variants {
        let Some(pattern) = patterns.get(name) else {
            continue;
        };
        for hit in matcher.match_all(&sub, pattern, threshold, config.detection.match_min_separation)
        {
            agg.add(name, hit.confidence, hit.x + x0, hit.y + y0);
        }
    }
    agg.finish()
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|d| (d.confidence as f64, d.x, d.y))
}

/// Detect the secondary priority element (the stage advance button).
fn detect_secondary_in(
    frame: &Frame,
    matcher: &dyn TemplateMatcher,
    patterns: &PatternStore,
    config: &Config,
    threshold: f32,
) -> PriorityHit {
    let pattern = patterns.get(&config.patterns.advance)?;
    matcher
        .match_one(frame, pattern, threshold)
        .map(|m| (m.confidence as f64, m.x, m.y))
}

/// Everything the state handlers touch. Handlers are plain functions over
/// this context, so the machine can own them as fn pointers.
pub struct Ctx {
    config: Config,
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    matcher: Arc<dyn TemplateMatcher>,
    patterns: Arc<PatternStore>,
    actuator: Box<dyn Actuator>,
    notifier: Notifier,
    slot: Arc<InterruptSlot>,
    running: Arc<AtomicBool>,

    frames: CaptureCache,
    primary_seen: ResultCache<PriorityHit>,
    secondary_seen: ResultCache<PriorityHit>,

    vision: VisionTuner,
    timing: TimingTuner,
    zones: ZoneFilter,

    fatal: Option<CaptureError>,

    // Per-cycle bookkeeping
    targets: Vec<Detection>,
    target_index: usize,
    anchor_pos: Option<(i32, i32)>,
    last_anchor_pos: Option<(i32, i32)>,
    sweep_direction: SweepDirection,
    sweep_count: u32,
    cycle_count: u32,
    failed_cycles: u32,
    anchor_found_in_cycle: bool,
    nothing_found: bool,
    escape_sweeps: u32,
    recovery_attempts: u32,

    stages_completed: u64,
    stage_started: Instant,
    last_override: Option<Instant>,
}

impl Ctx {
    /// Tick prologue: everything cached is from a previous tick and gone.
    fn begin_tick(&mut self) {
        self.frames.clear();
        self.primary_seen.clear();
        self.secondary_seen.clear();
        self.actuator
            .set_timing(secs(self.timing.click_delay), secs(self.timing.move_delay));
    }

    /// Capture through the tick cache. Surface loss is recorded as fatal
    /// and ends the loop; a plain capture failure is transient.
    fn capture(&mut self, max_height: Option<u32>, force: bool) -> Option<Frame> {
        match self.frames.get(&self.source, max_height, force) {
            Ok(frame) => Some(frame),
            Err(err @ CaptureError::SurfaceLost(_)) => {
                error!(%err, "capture surface lost");
                self.fatal = Some(err);
                None
            }
            Err(err) => {
                warn!(%err, "capture failed, skipping");
                None
            }
        }
    }

    fn scan_height(&self) -> u32 {
        self.config.surface.scan_height
    }

    fn extended_height(&self) -> u32 {
        self.config.surface.extended_scan_height
    }

    /// Full consensus scan for target markers. Feeds the vision tuner with
    /// the scan outcome; returns unfiltered detections.
    fn detect_targets(&mut self) -> Vec<Detection> {
        let Some(frame) = self.capture(Some(self.scan_height()), false) else {
            return Vec::new();
        };
        let threshold = self.vision.threshold(Condition::Target) as f32;
        let mut agg = DetectionAggregator::new(
            self.config.detection.proximity,
            self.config.detection.bucket_size,
            self.config.detection.target_min_matches,
        );
        for name in &self.config.patterns.target_variants {
            let Some(pattern) = self.patterns.get(name) else {
                continue;
            };
            for hit in self.matcher.match_all(
                &frame,
                pattern,
                threshold,
                self.config.detection.match_min_separation,
            ) {
                agg.add(name, hit.confidence, hit.x, hit.y);
            }
        }
        let detections = agg.finish();
        let confidences: Vec<f64> = detections.iter().map(|d| d.confidence as f64).collect();
        self.vision.record_scan(Condition::Target, &confidences);
        detections
    }

    fn detect_primary(&mut self, force: bool) -> PriorityHit {
        let key = Some(self.extended_height());
        if !force {
            if let Some(hit) = self.primary_seen.get(key) {
                return hit;
            }
        }
        let frame = self.capture(key, force)?;
        let threshold = self.vision.threshold(Condition::PrimaryEvent) as f32;
        let hit = detect_primary_in(&frame, &*self.matcher, &self.patterns, &self.config, threshold);
        match hit {
            Some((conf, _, _)) => self.vision.record_hit(Condition::PrimaryEvent, conf),
            None => self.vision.record_miss(Condition::PrimaryEvent),
        }
        self.primary_seen.put(key, hit);
        hit
    }

    fn detect_secondary(&mut self, force: bool) -> PriorityHit {
        let key = Some(self.scan_height());
        if !force {
            if let Some(hit) = self.secondary_seen.get(key) {
                return hit;
            }
        }
        let frame = self.capture(key, force)?;
        let threshold = self.vision.threshold(Condition::SecondaryEvent) as f32;
        let hit =
            detect_secondary_in(&frame, &*self.matcher, &self.patterns, &self.config, threshold);
        match hit {
            Some((conf, _, _)) => self.vision.record_hit(Condition::SecondaryEvent, conf),
            None => self.vision.record_miss(Condition::SecondaryEvent),
        }
        self.secondary_seen.put(key, hit);
        hit
    }

    /// One priority evaluation: primary marker first, then the secondary
    /// element. `force` bypasses the per-tick memoization.
    fn probe_priority(&mut self, force: bool) -> Option<InterruptToken> {
        if let Some((conf, x, y)) = self.detect_primary(force) {
            return Some(InterruptToken::new(InterruptSource::PrimaryEvent, conf, x, y));
        }
        if let Some((conf, x, y)) = self.detect_secondary(force) {
            return Some(InterruptToken::new(InterruptSource::SecondaryEvent, conf, x, y));
        }
        None
    }

    /// The fixed click sequence fired the moment a priority event is
    /// observed, rate-limited so repeated observations of the same event
    /// do not hammer the surface.
    fn override_click(&mut self, token: &InterruptToken) {
        let cooldown = secs(self.config.timing.override_cooldown);
        if let Some(last) = self.last_override {
            if last.elapsed() < cooldown {
                debug!("priority override within cooldown, skipping click sequence");
                return;
            }
        }
        self.last_override = Some(Instant::now());

        let action = self.config.points.priority_action;
        info!(x = action.x, y = action.y, "priority override click");
        self.actuator.click(action.x, action.y);

        // The primary marker opens its own dialog; only the secondary
        // path needs the transition confirmation.
        if token.source == InterruptSource::PrimaryEvent {
            return;
        }
        let transition = self.config.points.priority_transition;
        self.actuator.click(transition.x, transition.y);
    }

    fn click_point(&mut self, point: Point) -> bool {
        let ok = self.actuator.click(point.x, point.y);
        self.timing.record_click(ok);
        ok
    }

    /// Click the neutral point to dismiss transient popups.
    fn settle_click(&mut self) {
        let idle = self.config.points.idle;
        self.actuator.click(idle.x, idle.y);
    }

    /// Cancellable sleep: bounded sub-intervals, returning true the moment
    /// a token is pending or a live priority probe fires.
    fn sleep_interruptible(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }
        let deadline = Instant::now() + duration;
        let poll = secs(self.config.timing.interrupt_poll);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(poll));
            if self.slot.is_pending() {
                return true;
            }
            if let Some(token) = self.probe_priority(true) {
                self.slot.publish(token);
                return true;
            }
        }
    }

    fn drag_sweep(&mut self, direction: SweepDirection, duration: Duration) {
        let start = self.config.points.sweep_start;
        let end = self.config.points.sweep_end;
        let (from, to) = match direction {
            SweepDirection::Up => ((end.x, end.y), (start.x, start.y)),
            SweepDirection::Down => ((start.x, start.y), (end.x, end.y)),
        };
        self.actuator.drag(from, to, duration);
    }

    /// Sweep away from the exclusion band containing an otherwise
    /// actionable target. Bounded per scan cycle.
    fn escape_sweep(&mut self, y: i32) -> bool {
        if self.escape_sweeps >= self.config.zones.max_escape_sweeps {
            warn!("escape sweep budget exhausted, skipping target instead");
            return false;
        }
        let direction = self.zones.escape_direction(y, self.sweep_direction);
        info!(?direction, y, "target inside exclusion zone, sweeping to clear");
        self.drag_sweep(direction, secs(self.config.timing.escape_sweep_duration));
        self.settle_click();
        thread::sleep(secs(self.config.timing.escape_sweep_cooldown));
        self.escape_sweeps += 1;
        true
    }

    /// Verify a previously detected target is still visible near (x, y).
    fn target_present_at(&mut self, x: i32, y: i32) -> bool {
        let Some(frame) = self.capture(Some(self.scan_height()), true) else {
            return false;
        };
        let pad = self.config.detection.verify_padding;
        let tol = self.config.detection.verify_tolerance;
        let x0 = (x - pad).max(0);
        let y0 = (y - pad).max(0);
        let sub = frame.crop(x0 as u32, y0 as u32, (pad * 2) as u32, (pad * 2) as u32);
        let threshold = (self.vision.threshold(Condition::Target)
            - self.config.detection.refine_threshold_drop) as f32;

        for name in &self.config.patterns.target_variants {
            let Some(pattern) = self.patterns.get(name) else {
                continue;
            };
            if let Some(hit) = self.matcher.match_one(&sub, pattern, threshold) {
                let (hx, hy) = (hit.x + x0, hit.y + y0);
                if (hx - x).abs() <= tol && (hy - y).abs() <= tol {
                    return true;
                }
            }
        }
        false
    }

    /// Re-locate a named pattern near an expected position with a slightly
    /// relaxed threshold. Returns the refined position and confidence.
    fn refine_position(
        &mut self,
        name: &str,
        expected: (i32, i32),
        threshold: f64,
    ) -> Option<((i32, i32), f64)> {
        let frame = self.capture(Some(self.scan_height()), false)?;
        let pattern = self.patterns.get(name)?;
        let radius = self.config.detection.refine_radius;
        let x0 = (expected.0 - radius).max(0);
        let y0 = (expected.1 - radius).max(0);
        let sub = frame.crop(x0 as u32, y0 as u32, (radius * 2) as u32, (radius * 2) as u32);
        let relaxed = (threshold - self.config.detection.refine_threshold_drop) as f32;
        self.matcher
            .match_one(&sub, pattern, relaxed)
            .map(|m| ((m.x + x0, m.y + y0), m.confidence as f64))
    }

    fn mark_stage_completed(&mut self) {
        self.stages_completed += 1;
        let elapsed = self.stage_started.elapsed();
        self.stage_started = Instant::now();
        info!(
            stage = self.stages_completed,
            elapsed_s = elapsed.as_secs_f64(),
            "stage completed"
        );
        self.notifier.stage_completed(self.stages_completed, elapsed);
    }
}

/// Consulted before every handler. Consumes a background token first;
/// otherwise runs at most one (memoized) priority evaluation this tick.
fn resolve_priority(ctx: &mut Ctx) -> Option<State> {
    if let Some(token) = ctx.slot.consume() {
        info!(
            source = ?token.source,
            x = token.x,
            y = token.y,
            age_ms = token.created_at.elapsed().as_millis() as u64,
            "background interrupt consumed, preempting"
        );
        ctx.override_click(&token);
        return Some(State::HandlePriorityEvent);
    }
    if let Some(token) = ctx.probe_priority(false) {
        info!(source = ?token.source, "priority event observed in foreground, preempting");
        ctx.override_click(&token);
        return Some(State::HandlePriorityEvent);
    }
    None
}

fn handle_scan(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();
    ctx.escape_sweeps = 0;

    if ctx.detect_primary(true).is_some() {
        info!("priority marker seen during scan");
        return Some(State::CheckPriorityEvent);
    }
    if ctx.detect_secondary(true).is_some() {
        return Some(State::HandlePriorityEvent);
    }

    let detections = ctx.detect_targets();
    if ctx.fatal.is_some() {
        return None;
    }
    if detections.is_empty() {
        info!("no targets found, sweeping to search");
        ctx.nothing_found = true;
        return Some(State::Sweep);
    }

    let (mut kept, excluded) = ctx.zones.filter(detections);
    if excluded > 0 {
        info!(excluded, "targets removed by exclusion zones");
    }
    if kept.is_empty() {
        ctx.nothing_found = true;
        return Some(State::Sweep);
    }

    ctx.zones.prioritize(&mut kept);
    info!(count = kept.len(), "targets ready to process");
    ctx.targets = kept;
    ctx.target_index = 0;
    ctx.nothing_found = false;
    Some(State::ActOnTarget)
}

fn handle_act(ctx: &mut Ctx) -> Option<State> {
    if ctx.target_index >= ctx.targets.len() {
        debug!("all targets processed");
        return Some(State::Reposition);
    }

    let target = ctx.targets[ctx.target_index].clone();
    let (mut x, mut y) = (target.x, target.y);

    if !ctx.target_present_at(x, y) {
        info!(x, y, "target no longer present, skipping");
        ctx.target_index += 1;
        return Some(if ctx.target_index < ctx.targets.len() {
            State::ActOnTarget
        } else {
            State::ScanForTargets
        });
    }

    // Presence confirmed; refinement tightens the click point.
    let variant = target.support.first().map(|(name, _)| name.clone());
    if let Some(name) = variant {
        let threshold = ctx.vision.threshold(Condition::Target);
        if let Some(((rx, ry), conf)) = ctx.refine_position(&name, (x, y), threshold) {
            (x, y) = (rx, ry);
            ctx.vision.record_hit(Condition::Target, conf);
        }
    }

    let click_x = x + ctx.config.detection.target_offset_x;
    let click_y = y + ctx.config.detection.target_offset_y;

    if ctx.zones.is_excluded(click_x, click_y) {
        if ctx.escape_sweep(click_y) {
            return Some(State::ScanForTargets);
        }
        ctx.target_index += 1;
        return Some(if ctx.target_index < ctx.targets.len() {
            State::ActOnTarget
        } else {
            State::Reposition
        });
    }

    info!(
        index = ctx.target_index + 1,
        total = ctx.targets.len(),
        x = click_x,
        y = click_y,
        "clicking target"
    );
    let ok = ctx.actuator.click(click_x, click_y);
    ctx.timing.record_click(ok);
    Some(State::CheckSecondaryCondition)
}

fn handle_check_secondary(ctx: &mut Ctx) -> Option<State> {
    if let Some(frame) = ctx.capture(Some(ctx.scan_height()), false) {
        if let Some(pattern) = ctx.patterns.get(&ctx.config.patterns.confirm.clone()) {
            let threshold = ctx.config.detection.confirm_threshold as f32;
            if let Some(hit) = ctx.matcher.match_one(&frame, pattern, threshold) {
                if ctx.zones.is_excluded(hit.x, hit.y) {
                    warn!(x = hit.x, y = hit.y, "confirmation element inside exclusion zone");
                } else {
                    info!("confirmation element found, clicking");
                    let ok = ctx.actuator.click(hit.x, hit.y);
                    ctx.timing.record_click(ok);
                }
            }
        }
    }
    Some(State::SearchAnchor)
}

fn handle_search_anchor(ctx: &mut Ctx) -> Option<State> {
    let attempts = ctx.config.behavior.anchor_search_attempts;
    let strict = ctx.config.behavior.anchor_strict_attempts;
    let base = ctx.vision.threshold(Condition::Anchor);
    let relaxed = base - ctx.config.detection.anchor_relaxation;
    let anchor_name = ctx.config.patterns.anchor.clone();

    for attempt in 0..attempts {
        let threshold = if attempt < strict { base } else { relaxed };
        let hit = ctx.capture(Some(ctx.scan_height()), false).and_then(|frame| {
            let pattern = ctx.patterns.get(&anchor_name)?;
            ctx.matcher.match_one(&frame, pattern, threshold as f32)
        });

        if let Some(hit) = hit {
            info!(attempt = attempt + 1, x = hit.x, y = hit.y, "anchor found");
            let mut pos = (hit.x, hit.y);
            if let Some((refined, _)) = ctx.refine_position(&anchor_name, pos, threshold) {
                pos = refined;
            }
            ctx.vision.record_hit(Condition::Anchor, hit.confidence as f64);

            if let Some(target) = ctx.targets.get(ctx.target_index) {
                ctx.zones.record_productive_row(target.y);
            }

            ctx.anchor_pos = Some(pos);
            ctx.last_anchor_pos = Some(pos);
            ctx.anchor_found_in_cycle = true;
            ctx.failed_cycles = 0;
            ctx.timing.record_search(true);
            return Some(State::HoldAnchor);
        }

        if attempt + 1 < attempts {
            let retry = secs(ctx.timing.search_interval);
            if ctx.sleep_interruptible(retry) {
                return Some(State::HandlePriorityEvent);
            }
        }
    }

    info!(failed_cycles = ctx.failed_cycles + 1, "anchor not found");
    ctx.vision.record_miss(Condition::Anchor);
    ctx.timing.record_search(false);
    ctx.failed_cycles += 1;
    Some(State::Reposition)
}

fn handle_hold_anchor(ctx: &mut Ctx) -> Option<State> {
    let Some(base) = ctx.anchor_pos else {
        return Some(State::Reposition);
    };

    let threshold = ctx.vision.threshold(Condition::Anchor);
    let anchor_name = ctx.config.patterns.anchor.clone();
    ctx.capture(Some(ctx.scan_height()), true);

    let (mut x, mut y) = base;
    match ctx.refine_position(&anchor_name, base, threshold) {
        Some((pos, _)) => {
            (x, y) = pos;
            ctx.anchor_pos = Some(pos);
            ctx.last_anchor_pos = Some(pos);
        }
        None => {
            // Drift fallback to the last known good position.
            if let Some((lx, ly)) = ctx.last_anchor_pos {
                let limit = ctx.config.detection.refine_radius * 2;
                if (lx - base.0).abs() <= limit && (ly - base.1).abs() <= limit {
                    (x, y) = (lx, ly);
                    ctx.anchor_pos = Some((lx, ly));
                }
            }
        }
    }

    if ctx.zones.is_excluded(x, y) {
        warn!(x, y, "anchor inside exclusion zone, skipping hold");
        return Some(State::Reposition);
    }

    if !ctx.actuator.press_down(x, y) {
        ctx.timing.record_click(false);
        return Some(State::Reposition);
    }

    info!(x, y, "holding anchor");
    let start = Instant::now();
    let deadline = start + secs(ctx.config.timing.hold_duration);
    let check_interval = secs(ctx.config.timing.hold_check_interval);
    let poll = secs(ctx.config.timing.interrupt_poll);
    let mut next_check = start + check_interval;
    let mut missing_logged = false;
    let mut interrupted = false;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_check {
            ctx.capture(Some(ctx.scan_height()), true);
            if ctx.refine_position(&anchor_name, (x, y), threshold).is_none() && !missing_logged {
                info!("anchor not visible while holding, continuing until duration completes");
                missing_logged = true;
            }
            if let Some(token) = ctx.probe_priority(true) {
                ctx.slot.publish(token);
                interrupted = true;
                break;
            }
            next_check = (next_check + check_interval).max(now + check_interval);
        }
        let wake = deadline.min(next_check);
        let pause = wake.saturating_duration_since(Instant::now()).min(poll);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
        if ctx.slot.is_pending() {
            interrupted = true;
            break;
        }
    }

    // The press is paired with a release no matter how the hold ended.
    ctx.actuator.press_up();
    info!(elapsed_s = start.elapsed().as_secs_f64(), "hold complete");

    ctx.settle_click();
    if interrupted {
        return Some(State::HandlePriorityEvent);
    }
    if ctx.sleep_interruptible(secs(ctx.config.timing.settle_delay)) {
        return Some(State::HandlePriorityEvent);
    }
    Some(State::AdjustAttribute)
}

fn handle_adjust_attribute(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();

    if ctx.detect_secondary(false).is_some() {
        return Some(State::HandlePriorityEvent);
    }

    // The attribute marker sits in the extended band below the scan cutoff.
    let hit = ctx.capture(Some(ctx.extended_height()), false).and_then(|frame| {
        let region = ctx.config.detection.attribute_region;
        let pad = ctx.config.detection.attribute_region_padding;
        let x0 = (region.x_min - pad).max(0);
        let y0 = (region.y_min - pad).max(0);
        let sub = frame.crop(
            x0 as u32,
            y0 as u32,
            (region.x_max - x0 + pad + 1) as u32,
            (region.y_max - y0 + pad + 1) as u32,
        );
        let threshold = ctx.vision.threshold(Condition::Attribute) as f32;
        ctx.config.patterns.target_variants.iter().find_map(|name| {
            let pattern = ctx.patterns.get(name)?;
            ctx.matcher.match_one(&sub, pattern, threshold)
        })
    });

    let Some(hit) = hit else {
        info!("no attribute marker, skipping");
        ctx.vision.record_miss(Condition::Attribute);
        return Some(State::Sweep);
    };
    ctx.vision.record_hit(Condition::Attribute, hit.confidence as f64);

    info!("attribute marker found, working the panel");
    let open = ctx.config.points.attribute_open;
    ctx.click_point(open);
    if ctx.sleep_interruptible(secs(ctx.config.timing.state_delay)) {
        return Some(State::HandlePriorityEvent);
    }

    let click = ctx.config.points.attribute_click;
    let duration = secs(ctx.config.timing.attribute_click_duration);
    let poll = secs(ctx.config.timing.interrupt_poll);
    let start = Instant::now();
    let mut last_priority_check = start;
    while start.elapsed() < duration {
        ctx.actuator.click(click.x, click.y);
        thread::sleep(secs(ctx.timing.action_interval));
        if last_priority_check.elapsed() >= poll {
            if ctx.slot.is_pending() || ctx.probe_priority(false).is_some() {
                return Some(State::HandlePriorityEvent);
            }
            last_priority_check = Instant::now();
        }
    }

    ctx.settle_click();
    info!("attribute adjustment complete");
    Some(State::Reposition)
}

fn handle_reposition(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();

    if ctx.detect_secondary(false).is_some() {
        return Some(State::HandlePriorityEvent);
    }

    let frame = ctx.capture(Some(ctx.scan_height()), false);
    let mut picked = 0usize;
    if let Some(frame) = frame {
        let threshold = ctx.config.detection.pickup_threshold as f32;
        let names = ctx.config.patterns.pickups.clone();
        for name in names {
            let hit = ctx
                .patterns
                .get(&name)
                .and_then(|p| ctx.matcher.match_one(&frame, p, threshold));
            if let Some(hit) = hit {
                if ctx.zones.is_excluded(hit.x, hit.y) {
                    debug!(name, "pickup inside exclusion zone, skipping");
                } else {
                    ctx.actuator.click(hit.x, hit.y);
                    picked += 1;
                }
            }
        }
    }

    if let Some(token) = ctx.probe_priority(true) {
        ctx.slot.publish(token);
        return Some(State::HandlePriorityEvent);
    }

    if picked > 0 {
        info!(picked, "pickups collected");
    }

    if ctx.anchor_found_in_cycle {
        debug!("anchor found this cycle, staying in area");
        ctx.anchor_found_in_cycle = false;
        ctx.cycle_count = 0;
        return Some(State::ScanForTargets);
    }

    ctx.cycle_count += 1;
    if ctx.failed_cycles >= ctx.config.behavior.failed_cycles_before_sweep {
        info!(failed = ctx.failed_cycles, "too many anchorless cycles, forcing sweep");
        ctx.failed_cycles = 0;
        ctx.cycle_count = 0;
        return Some(State::Sweep);
    }
    if ctx.cycle_count >= ctx.config.behavior.cycles_before_sweep {
        debug!(cycles = ctx.cycle_count, "cycle budget reached, sweeping");
        ctx.cycle_count = 0;
        return Some(State::Sweep);
    }
    Some(State::ScanForTargets)
}

/// One drag of the nothing-found rescan sequence. Short-circuits back to
/// acting the moment targets reappear.
fn sweep_and_scan(ctx: &mut Ctx, direction: SweepDirection) -> Option<State> {
    ctx.drag_sweep(direction, secs(ctx.config.timing.sweep_duration));
    ctx.settle_click();

    if let Some(token) = ctx.probe_priority(true) {
        ctx.slot.publish(token);
        return Some(State::HandlePriorityEvent);
    }

    let detections = ctx.detect_targets();
    let (mut kept, _) = ctx.zones.filter(detections);
    if kept.is_empty() {
        return None;
    }
    ctx.zones.prioritize(&mut kept);
    info!(count = kept.len(), ?direction, "targets found mid-sweep");
    ctx.targets = kept;
    ctx.target_index = 0;
    ctx.nothing_found = false;
    Some(State::ActOnTarget)
}

fn handle_sweep(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();

    if ctx.detect_secondary(false).is_some() {
        return Some(State::HandlePriorityEvent);
    }

    if ctx.nothing_found {
        info!("nothing found, running up/down rescan sequence");
        let plan = [
            (SweepDirection::Up, ctx.config.behavior.rescan_up_sweeps),
            (SweepDirection::Down, ctx.config.behavior.rescan_down_sweeps),
        ];
        for (direction, count) in plan {
            for _ in 0..count {
                if let Some(state) = sweep_and_scan(ctx, direction) {
                    return Some(state);
                }
            }
        }
        return Some(State::ScanForTargets);
    }

    info!(
        direction = ?ctx.sweep_direction,
        count = ctx.sweep_count + 1,
        max = ctx.config.behavior.max_sweeps,
        "sweeping"
    );
    ctx.drag_sweep(ctx.sweep_direction, secs(ctx.config.timing.sweep_duration));
    ctx.settle_click();

    ctx.sweep_count += 1;
    if ctx.sweep_count >= ctx.config.behavior.max_sweeps {
        ctx.sweep_direction = ctx.sweep_direction.flipped();
        ctx.sweep_count = 0;
    }
    Some(State::ScanForTargets)
}

fn handle_check_priority(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();
    if ctx.sleep_interruptible(secs(ctx.config.timing.settle_delay)) {
        return Some(State::HandlePriorityEvent);
    }

    if ctx.probe_priority(false).is_some() {
        return Some(State::HandlePriorityEvent);
    }

    info!("clicking priority bar button");
    let button = ctx.config.points.priority_button;
    ctx.click_point(button);
    if ctx.sleep_interruptible(secs(ctx.config.timing.priority_button_delay)) {
        return Some(State::HandlePriorityEvent);
    }

    let followup = ctx.config.points.priority_followup;
    ctx.click_point(followup);
    if ctx.sleep_interruptible(secs(ctx.config.timing.priority_followup_delay)) {
        return Some(State::HandlePriorityEvent);
    }

    ctx.sweep_direction = SweepDirection::Down;
    ctx.sweep_count = 0;
    Some(State::ScanForTargets)
}

fn handle_handle_priority(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();

    let attempts = ctx.config.behavior.transition_attempts;
    for attempt in 0..attempts {
        if let Some((conf, x, y)) = ctx.detect_secondary(true) {
            info!(attempt = attempt + 1, x, y, conf, "advance element found, clicking");
            let ok = ctx.actuator.click(x, y);
            ctx.timing.record_click(ok);
            ctx.mark_stage_completed();

            if ctx.sleep_interruptible(secs(ctx.config.timing.transition_post_click_delay)) {
                return Some(State::HandlePriorityEvent);
            }
            ctx.recovery_attempts = 0;
            return Some(State::AwaitRecovery);
        }
        if attempt + 1 < attempts {
            if ctx.sleep_interruptible(secs(ctx.config.timing.transition_retry_delay)) {
                return Some(State::HandlePriorityEvent);
            }
        }
    }

    warn!(attempts, "advance element not found, resuming scan");
    ctx.sweep_direction = SweepDirection::Down;
    ctx.sweep_count = 0;
    Some(State::ScanForTargets)
}

fn handle_await_recovery(ctx: &mut Ctx) -> Option<State> {
    ctx.settle_click();
    if ctx.sleep_interruptible(secs(ctx.config.timing.settle_delay)) {
        return Some(State::HandlePriorityEvent);
    }

    ctx.recovery_attempts += 1;
    if ctx.recovery_attempts > ctx.config.behavior.recovery_attempts {
        warn!(
            attempts = ctx.config.behavior.recovery_attempts,
            "confirmation never appeared, resuming scan"
        );
        ctx.recovery_attempts = 0;
        ctx.sweep_direction = SweepDirection::Down;
        ctx.sweep_count = 0;
        return Some(State::ScanForTargets);
    }

    let hit = ctx.capture(Some(ctx.scan_height()), false).and_then(|frame| {
        let pattern = ctx.patterns.get(&ctx.config.patterns.confirm.clone())?;
        let threshold = ctx.config.detection.confirm_threshold as f32;
        ctx.matcher.match_one(&frame, pattern, threshold)
    });

    if let Some(hit) = hit {
        info!(x = hit.x, y = hit.y, "confirmation element found after transition");
        ctx.actuator.click(hit.x, hit.y);
        if ctx.sleep_interruptible(secs(ctx.config.timing.recovery_post_click_delay)) {
            return Some(State::HandlePriorityEvent);
        }
        ctx.recovery_attempts = 0;
        ctx.sweep_direction = SweepDirection::Down;
        ctx.sweep_count = 0;
        return Some(State::ScanForTargets);
    }

    if ctx.sleep_interruptible(secs(ctx.config.timing.recovery_retry_delay)) {
        return Some(State::HandlePriorityEvent);
    }
    None
}

/// Background probe: own trip through the shared (lock-serialized) frame
/// source, baseline thresholds snapshotted at spawn.
struct BackgroundProbe {
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    matcher: Arc<dyn TemplateMatcher>,
    patterns: Arc<PatternStore>,
    config: Config,
    primary_threshold: f32,
    secondary_threshold: f32,
}

impl PriorityProbe for BackgroundProbe {
    fn probe(&mut self) -> Result<Option<InterruptToken>, CaptureError> {
        let max_height = self.config.surface.extended_scan_height;
        let frame = self.source.lock().unwrap().capture(Some(max_height))?;

        if let Some((conf, x, y)) = detect_primary_in(
            &frame,
            &*self.matcher,
            &self.patterns,
            &self.config,
            self.primary_threshold,
        ) {
            return Ok(Some(InterruptToken::new(InterruptSource::PrimaryEvent, conf, x, y)));
        }
        if let Some((conf, x, y)) = detect_secondary_in(
            &frame,
            &*self.matcher,
            &self.patterns,
            &self.config,
            self.secondary_threshold,
        ) {
            return Ok(Some(InterruptToken::new(InterruptSource::SecondaryEvent, conf, x, y)));
        }
        Ok(None)
    }
}

pub struct Driver {
    machine: StateMachine<Ctx>,
    ctx: Ctx,
}

impl Driver {
    pub fn new(
        config: Config,
        source: Box<dyn FrameSource>,
        matcher: Arc<dyn TemplateMatcher>,
        patterns: PatternStore,
        actuator: Box<dyn Actuator>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let store = config
            .vision_tuning
            .enabled
            .then(|| StateStore::new(config.state_file(), config.vision_tuning.save_interval));
        let vision = VisionTuner::new(&config.vision_tuning, store);
        let timing = TimingTuner::new(&config.timing_tuning, &config.timing);
        let zones = ZoneFilter::new(
            config.zones.exclusion.clone(),
            config.zones.row_tolerance,
            config.surface.scan_height as i32,
        );
        let notifier = Notifier::new(&config.notify);

        let frames = CaptureCache::new(secs(config.timing.capture_cache_ttl));
        let primary_seen = ResultCache::new(secs(config.timing.priority_cache_ttl));
        let secondary_seen = ResultCache::new(secs(config.timing.priority_cache_ttl));

        let ctx = Ctx {
            config,
            source: Arc::new(Mutex::new(source)),
            matcher,
            patterns: Arc::new(patterns),
            actuator,
            notifier,
            slot: Arc::new(InterruptSlot::new()),
            running,
            frames,
            primary_seen,
            secondary_seen,
            vision,
            timing,
            zones,
            fatal: None,
            targets: Vec::new(),
            target_index: 0,
            anchor_pos: None,
            last_anchor_pos: None,
            sweep_direction: SweepDirection::Down,
            sweep_count: 0,
            cycle_count: 0,
            failed_cycles: 0,
            anchor_found_in_cycle: false,
            nothing_found: false,
            escape_sweeps: 0,
            recovery_attempts: 0,
            stages_completed: 0,
            stage_started: Instant::now(),
            last_override: None,
        };

        let mut machine = StateMachine::new(State::ScanForTargets);
        machine.register(State::ScanForTargets, handle_scan);
        machine.register(State::ActOnTarget, handle_act);
        machine.register(State::CheckSecondaryCondition, handle_check_secondary);
        machine.register(State::SearchAnchor, handle_search_anchor);
        machine.register(State::HoldAnchor, handle_hold_anchor);
        machine.register(State::Sweep, handle_sweep);
        machine.register(State::AdjustAttribute, handle_adjust_attribute);
        machine.register(State::Reposition, handle_reposition);
        machine.register(State::CheckPriorityEvent, handle_check_priority);
        machine.register(State::HandlePriorityEvent, handle_handle_priority);
        machine.register(State::AwaitRecovery, handle_await_recovery);
        machine.set_priority_resolver(resolve_priority);

        Self { machine, ctx }
    }

    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn stages_completed(&self) -> u64 {
        self.ctx.stages_completed
    }

    /// Exposed for tests and embedding: one full tick.
    pub fn tick(&mut self) -> Result<(), MachineError> {
        self.ctx.begin_tick();
        self.machine.step(&mut self.ctx)
    }

    fn spawn_monitor(&self) -> io::Result<InterruptMonitor> {
        let probe = BackgroundProbe {
            source: self.ctx.source.clone(),
            matcher: self.ctx.matcher.clone(),
            patterns: self.ctx.patterns.clone(),
            config: self.ctx.config.clone(),
            primary_threshold: self.ctx.config.vision_tuning.primary_event.initial as f32,
            secondary_threshold: self.ctx.config.vision_tuning.secondary_event.initial as f32,
        };
        InterruptMonitor::spawn(
            self.ctx.slot.clone(),
            Box::new(probe),
            secs(self.ctx.config.timing.monitor_poll),
        )
    }

    /// Run until the running flag drops or the capture surface is lost.
    pub fn run(&mut self) -> Result<(), DriverError> {
        self.machine.verify()?;

        let required = [
            self.ctx.config.patterns.anchor.clone(),
            self.ctx.config.patterns.advance.clone(),
        ];
        let required: Vec<&str> = required.iter().map(String::as_str).collect();
        if !self.ctx.patterns.verify_required(&required) {
            warn!("running with missing patterns, affected conditions stay undetected");
        }

        info!("driver starting");
        self.ctx.notifier.started();
        let monitor = self.spawn_monitor()?;

        while self.ctx.running.load(Ordering::Acquire) {
            self.tick()?;
            if let Some(err) = self.ctx.fatal.take() {
                error!(%err, "stopping after capture loss");
                break;
            }
            thread::sleep(secs(self.ctx.config.timing.state_delay));
        }

        monitor.stop(secs(self.ctx.config.timing.monitor_join_timeout));
        self.ctx.vision.flush();
        self.ctx.notifier.stopped(self.ctx.stages_completed);
        info!(stages = self.ctx.stages_completed, "driver stopped");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::matcher::{Pattern, RawMatch};
    use std::collections::HashMap;

    pub struct BlankSource {
        pub width: u32,
        pub height: u32,
        pub fail: bool,
    }

    impl FrameSource for BlankSource {
        fn capture(&mut self, max_height: Option<u32>) -> Result<Frame, CaptureError> {
            if self.fail {
                return Err(CaptureError::SurfaceLost("window closed".into()));
            }
            let h = max_height.unwrap_or(self.height).min(self.height);
            Ok(Frame::new(self.width, h, vec![0u8; (self.width * h * 4) as usize]))
        }
    }

    /// Scripted matcher: hits per pattern name, filtered by threshold and
    /// clipped to the frame actually searched, so hits placed in a region
    /// the current crop does not cover stay invisible.
    pub struct ScriptedMatcher {
        pub hits: Mutex<HashMap<String, Vec<RawMatch>>>,
    }

    impl ScriptedMatcher {
        pub fn new() -> Self {
            Self { hits: Mutex::new(HashMap::new()) }
        }

        pub fn script(&self, name: &str, hits: Vec<RawMatch>) {
            self.hits.lock().unwrap().insert(name.to_string(), hits);
        }

        fn visible(&self, frame: &Frame, name: &str, threshold: f32) -> Vec<RawMatch> {
            let (ox, oy) = (frame.origin.0 as i32, frame.origin.1 as i32);
            self.hits
                .lock()
                .unwrap()
                .get(name)
                .map(|hits| {
                    hits.iter()
                        .filter(|h| {
                            h.confidence >= threshold
                                && h.x >= ox
                                && h.y >= oy
                                && h.x < ox + frame.width as i32
                                && h.y < oy + frame.height as i32
                        })
                        .map(|h| RawMatch { confidence: h.confidence, x: h.x - ox, y: h.y - oy })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    impl TemplateMatcher for ScriptedMatcher {
        fn match_one(&self, frame: &Frame, pattern: &Pattern, threshold: f32) -> Option<RawMatch> {
            self.visible(frame, &pattern.name, threshold).into_iter().next()
        }

        fn match_all(
            &self,
            frame: &Frame,
            pattern: &Pattern,
            threshold: f32,
            _min_separation: u32,
        ) -> Vec<RawMatch> {
            self.visible(frame, &pattern.name, threshold)
        }
    }

    #[derive(Clone, Default)]
    pub struct ClickLog(pub Arc<Mutex<Vec<(i32, i32)>>>);

    pub struct MockActuator {
        pub clicks: ClickLog,
        pub drags: Arc<Mutex<Vec<((i32, i32), (i32, i32))>>>,
        pub held: Arc<Mutex<Option<(i32, i32)>>>,
    }

    impl MockActuator {
        pub fn new() -> Self {
            Self {
                clicks: ClickLog::default(),
                drags: Arc::new(Mutex::new(Vec::new())),
                held: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl Actuator for MockActuator {
        fn move_to(&mut self, _x: i32, _y: i32) -> bool {
            true
        }
        fn click(&mut self, x: i32, y: i32) -> bool {
            self.clicks.0.lock().unwrap().push((x, y));
            true
        }
        fn press_down(&mut self, x: i32, y: i32) -> bool {
            *self.held.lock().unwrap() = Some((x, y));
            true
        }
        fn press_up(&mut self) -> bool {
            *self.held.lock().unwrap() = None;
            true
        }
        fn drag(&mut self, from: (i32, i32), to: (i32, i32), _duration: Duration) -> bool {
            self.drags.lock().unwrap().push((from, to));
            true
        }
        fn set_timing(&mut self, _click_delay: Duration, _move_delay: Duration) {}
    }

    pub fn pattern(name: &str) -> Pattern {
        Pattern {
            name: name.to_string(),
            width: 4,
            height: 4,
            pixels: vec![0u8; 64],
            mask: None,
        }
    }

    /// Fast test config: no real sleeps to speak of, tuning persistence off.
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.timing.interrupt_poll = 0.001;
        config.timing.search_interval = 0.0;
        config.timing.settle_delay = 0.0;
        config.timing.hold_duration = 0.01;
        config.timing.hold_check_interval = 0.005;
        config.timing.attribute_click_duration = 0.005;
        config.timing.attribute_click_interval = 0.001;
        config.timing.state_delay = 0.0;
        config.timing.sweep_duration = 0.0;
        config.timing.escape_sweep_duration = 0.0;
        config.timing.escape_sweep_cooldown = 0.0;
        config.timing.transition_retry_delay = 0.0;
        config.timing.transition_post_click_delay = 0.0;
        config.timing.recovery_retry_delay = 0.0;
        config.timing.recovery_post_click_delay = 0.0;
        config.timing.priority_button_delay = 0.0;
        config.timing.priority_followup_delay = 0.0;
        config.vision_tuning.enabled = false;
        config.vision_tuning.target.initial = 0.85;
        config.timing_tuning.enabled = false;
        config.notify.enabled = false;
        config
    }

    pub fn build_driver(
        config: Config,
        matcher: Arc<ScriptedMatcher>,
        patterns: Vec<Pattern>,
    ) -> (Driver, ClickLog, Arc<AtomicBool>) {
        let actuator = MockActuator::new();
        let clicks = actuator.clicks.clone();
        let running = Arc::new(AtomicBool::new(true));
        let driver = Driver::new(
            config,
            Box::new(BlankSource { width: 360, height: 740, fail: false }),
            matcher,
            PatternStore::from_patterns(patterns),
            Box::new(actuator),
            running.clone(),
        );
        (driver, clicks, running)
    }
}
