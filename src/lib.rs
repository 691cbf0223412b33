//! Screenpilot Library
//!
//! A reactive control core for screen automation: watch a surface, match
//! learned visual patterns against it, act on what is found, and stay
//! responsive to the handful of events that outrank everything else.
//!
//! The core is platform-free by default; real capture and pointer control
//! are behind the `vision` and `input` features.

pub mod assets;
pub mod capture;
pub mod config;
pub mod detect;
pub mod driver;
pub mod interrupt;
pub mod machine;
pub mod matcher;
pub mod notify;
pub mod tuning;
pub mod zones;

// Pointer actuation (trait always available, enigo backend behind `input`)
pub mod actuator;

pub use capture::{CaptureError, Frame, FrameSource};
pub use config::Config;
pub use driver::{Driver, DriverError};
pub use machine::{State, StateMachine};
