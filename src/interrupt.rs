//! Background Interrupt Monitor
//!
//! A dedicated thread watches for the priority marker while the main loop
//! is busy elsewhere. Communication is a single-token mailbox: publishing
//! overwrites any unconsumed token, consuming clears the slot, and a token
//! is observed at most once. The main loop reacts within one state-handler
//! boundary, not mid-action.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::CaptureError;

/// Which detection produced the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// The priority marker (region quorum detection)
    PrimaryEvent,
    /// The secondary priority element seen directly
    SecondaryEvent,
}

#[derive(Debug, Clone, Copy)]
pub struct InterruptToken {
    pub source: InterruptSource,
    pub confidence: f64,
    pub x: i32,
    pub y: i32,
    pub created_at: Instant,
}

impl InterruptToken {
    pub fn new(source: InterruptSource, confidence: f64, x: i32, y: i32) -> Self {
        Self { source, confidence, x, y, created_at: Instant::now() }
    }
}

/// Single-token mailbox between the monitor thread and the control loop.
///
/// The `pending` flag is a fast-path hint so the hot loop can poll without
/// taking the lock. The slot under the mutex is authoritative; a token is
/// never observed torn and never consumed twice.
pub struct InterruptSlot {
    slot: Mutex<Option<InterruptToken>>,
    pending: AtomicBool,
}

impl InterruptSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            pending: AtomicBool::new(false),
        }
    }

    /// Publish a token, overwriting any unconsumed one. The newest
    /// observation is always the one that gets handled.
    pub fn publish(&self, token: InterruptToken) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            debug!("unconsumed interrupt token overwritten");
        }
        *slot = Some(token);
        self.pending.store(true, Ordering::Release);
    }

    /// Take the token, clearing the slot. At most one caller gets it.
    pub fn consume(&self) -> Option<InterruptToken> {
        if !self.pending.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.slot.lock().unwrap();
        let token = slot.take();
        self.pending.store(false, Ordering::Release);
        token
    }

    /// Lock-free check used inside interruptible sleeps.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for InterruptSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One probe cycle of the monitor thread. Implementations own their whole
/// capture-and-detect path; nothing is shared with the main loop's caches.
pub trait PriorityProbe: Send {
    fn probe(&mut self) -> Result<Option<InterruptToken>, CaptureError>;
}

pub struct InterruptMonitor {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl InterruptMonitor {
    /// Spawn the monitor thread. It probes every `poll_interval`, skips
    /// cycles while a token is pending, and treats probe errors as
    /// transient.
    pub fn spawn(
        slot: Arc<InterruptSlot>,
        mut probe: Box<dyn PriorityProbe>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("priority-monitor".to_string())
            .spawn(move || {
                info!("priority monitor started");
                while !thread_stop.load(Ordering::Acquire) {
                    if !slot.is_pending() {
                        match probe.probe() {
                            Ok(Some(token)) => {
                                info!(
                                    source = ?token.source,
                                    confidence = token.confidence,
                                    "priority event observed in background"
                                );
                                slot.publish(token);
                            }
                            Ok(None) => {}
                            Err(err) => {
                                warn!(%err, "monitor probe failed, will retry");
                            }
                        }
                    }
                    thread::sleep(poll_interval);
                }
                info!("priority monitor stopped");
            })?;

        Ok(Self { stop, handle })
    }

    /// Signal the thread and wait up to `join_timeout` for it to exit.
    /// A thread stuck in a slow capture is detached rather than blocking
    /// shutdown forever.
    pub fn stop(self, join_timeout: Duration) {
        self.stop.store(true, Ordering::Release);
        let deadline = Instant::now() + join_timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("priority monitor did not stop in time, detaching");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn publish_then_consume_is_exactly_once() {
        let slot = InterruptSlot::new();
        assert!(!slot.is_pending());
        assert!(slot.consume().is_none());

        slot.publish(InterruptToken::new(InterruptSource::PrimaryEvent, 0.97, 50, 672));
        assert!(slot.is_pending());

        let token = slot.consume().unwrap();
        assert_eq!(token.source, InterruptSource::PrimaryEvent);
        assert_eq!((token.x, token.y), (50, 672));

        assert!(!slot.is_pending());
        assert!(slot.consume().is_none());
    }

    #[test]
    fn publish_overwrites_unconsumed_token() {
        let slot = InterruptSlot::new();
        slot.publish(InterruptToken::new(InterruptSource::PrimaryEvent, 0.90, 1, 1));
        slot.publish(InterruptToken::new(InterruptSource::SecondaryEvent, 0.95, 2, 2));

        let token = slot.consume().unwrap();
        assert_eq!(token.source, InterruptSource::SecondaryEvent);
        assert!(slot.consume().is_none());
    }

    #[test]
    fn concurrent_consumers_see_one_token_total() {
        let slot = Arc::new(InterruptSlot::new());
        slot.publish(InterruptToken::new(InterruptSource::PrimaryEvent, 0.97, 0, 0));

        let consumed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                let consumed = consumed.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        if slot.consume().is_some() {
                            consumed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::SeqCst), 1);
    }

    struct ScriptedProbe {
        cycles: Arc<AtomicUsize>,
        fire_on: usize,
    }

    impl PriorityProbe for ScriptedProbe {
        fn probe(&mut self) -> Result<Option<InterruptToken>, CaptureError> {
            let n = self.cycles.fetch_add(1, Ordering::SeqCst);
            if n == self.fire_on {
                Ok(Some(InterruptToken::new(InterruptSource::PrimaryEvent, 0.96, 50, 672)))
            } else {
                Ok(None)
            }
        }
    }

    #[test]
    fn monitor_publishes_and_stops_cleanly() {
        let slot = Arc::new(InterruptSlot::new());
        let cycles = Arc::new(AtomicUsize::new(0));
        let probe = Box::new(ScriptedProbe { cycles: cycles.clone(), fire_on: 2 });

        let monitor =
            InterruptMonitor::spawn(slot.clone(), probe, Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !slot.is_pending() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(slot.is_pending());

        monitor.stop(Duration::from_secs(1));
        let token = slot.consume().unwrap();
        assert_eq!(token.source, InterruptSource::PrimaryEvent);
    }

    #[test]
    fn monitor_skips_probing_while_token_pending() {
        struct AlwaysFire {
            probes: Arc<AtomicUsize>,
        }
        impl PriorityProbe for AlwaysFire {
            fn probe(&mut self) -> Result<Option<InterruptToken>, CaptureError> {
                self.probes.fetch_add(1, Ordering::SeqCst);
                Ok(Some(InterruptToken::new(InterruptSource::PrimaryEvent, 0.9, 0, 0)))
            }
        }

        let slot = Arc::new(InterruptSlot::new());
        let probes = Arc::new(AtomicUsize::new(0));
        let monitor = InterruptMonitor::spawn(
            slot.clone(),
            Box::new(AlwaysFire { probes: probes.clone() }),
            Duration::from_millis(2),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while probes.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        // Token stays pending; give the thread time to run more cycles.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(probes.load(Ordering::SeqCst), 1);

        monitor.stop(Duration::from_secs(1));
    }
}
