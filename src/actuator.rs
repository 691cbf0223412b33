//! Pointer Actuation Seam
//!
//! All surface interaction goes through one trait: moves, clicks, holds
//! and drags. Methods return `false` on failure instead of erroring; a
//! missed click is a recoverable event the timing tuner feeds on, not a
//! reason to stop the loop.

use std::time::Duration;

/// Pointer backend. Coordinates are surface-relative; implementations
/// translate to whatever the OS wants.
pub trait Actuator: Send {
    fn move_to(&mut self, x: i32, y: i32) -> bool;

    /// Move then click, honoring the configured delays.
    fn click(&mut self, x: i32, y: i32) -> bool;

    /// Press and leave the button down. Every press must be paired with
    /// `press_up` even on error paths.
    fn press_down(&mut self, x: i32, y: i32) -> bool;

    fn press_up(&mut self) -> bool;

    /// Smooth drag between two points over `duration`.
    fn drag(&mut self, from: (i32, i32), to: (i32, i32), duration: Duration) -> bool;

    /// Tuned delays pushed down from the timing tuner each tick.
    fn set_timing(&mut self, click_delay: Duration, move_delay: Duration);
}

#[cfg(feature = "input")]
pub use backend::EnigoActuator;

#[cfg(feature = "input")]
mod backend {
    use std::thread;
    use std::time::Duration;

    use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
    use tracing::warn;

    use super::Actuator;

    /// Real pointer control via enigo. `origin` maps surface coordinates
    /// onto the screen when the surface is not at (0, 0).
    pub struct EnigoActuator {
        enigo: Enigo,
        origin: (i32, i32),
        click_delay: Duration,
        move_delay: Duration,
    }

    impl EnigoActuator {
        pub fn new(origin: (i32, i32)) -> anyhow::Result<Self> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| anyhow::anyhow!("pointer backend init failed: {e}"))?;
            Ok(Self {
                enigo,
                origin,
                click_delay: Duration::from_millis(300),
                move_delay: Duration::from_millis(10),
            })
        }

        fn screen(&self, x: i32, y: i32) -> (i32, i32) {
            (x + self.origin.0, y + self.origin.1)
        }
    }

    impl Actuator for EnigoActuator {
        fn move_to(&mut self, x: i32, y: i32) -> bool {
            let (sx, sy) = self.screen(x, y);
            match self.enigo.move_mouse(sx, sy, Coordinate::Abs) {
                Ok(()) => {
                    thread::sleep(self.move_delay);
                    true
                }
                Err(err) => {
                    warn!(%err, "pointer move failed");
                    false
                }
            }
        }

        fn click(&mut self, x: i32, y: i32) -> bool {
            if !self.move_to(x, y) {
                return false;
            }
            match self.enigo.button(Button::Left, Direction::Click) {
                Ok(()) => {
                    thread::sleep(self.click_delay);
                    true
                }
                Err(err) => {
                    warn!(%err, "click failed");
                    false
                }
            }
        }

        fn press_down(&mut self, x: i32, y: i32) -> bool {
            if !self.move_to(x, y) {
                return false;
            }
            self.enigo.button(Button::Left, Direction::Press).is_ok()
        }

        fn press_up(&mut self) -> bool {
            self.enigo.button(Button::Left, Direction::Release).is_ok()
        }

        fn drag(&mut self, from: (i32, i32), to: (i32, i32), duration: Duration) -> bool {
            const STEPS: i32 = 20;

            if !self.press_down(from.0, from.1) {
                return false;
            }
            let step_pause = duration / STEPS as u32;
            for i in 1..=STEPS {
                let x = from.0 + (to.0 - from.0) * i / STEPS;
                let y = from.1 + (to.1 - from.1) * i / STEPS;
                let (sx, sy) = self.screen(x, y);
                if self.enigo.move_mouse(sx, sy, Coordinate::Abs).is_err() {
                    let _ = self.press_up();
                    return false;
                }
                thread::sleep(step_pause);
            }
            self.press_up()
        }

        fn set_timing(&mut self, click_delay: Duration, move_delay: Duration) {
            self.click_delay = click_delay;
            self.move_delay = move_delay;
        }
    }
}
