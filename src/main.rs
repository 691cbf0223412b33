//! Screenpilot - Reactive Screen Automation
//!
//! Watches a configured surface and drives it through a state machine,
//! preempting whatever it is doing the moment a priority event shows up.
//!
//! ```bash
//! screenpilot --config screenpilot.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use screenpilot::config::Config;

#[derive(Parser)]
#[command(name = "screenpilot")]
#[command(version)]
#[command(about = "Reactive screen automation driver")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "screenpilot.toml")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "screenpilot=debug"
    #[arg(long, env = "SCREENPILOT_LOG", default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .init();

    let config = Config::load(&args.config)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("stop requested");
        flag.store(false, Ordering::Release);
    })?;

    run(config, running)
}

#[cfg(feature = "computer-use")]
fn run(config: Config, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    use screenpilot::actuator::EnigoActuator;
    use screenpilot::assets::{load_png_pattern, PatternStore};
    use screenpilot::capture::MonitorSource;
    use screenpilot::driver::Driver;

    let source = MonitorSource::open(config.surface.monitor_index)
        .map_err(|e| anyhow::anyhow!("cannot open capture surface: {e}"))?;
    let actuator = EnigoActuator::new((0, 0))?;

    let mut names = config.patterns.target_variants.clone();
    names.push(config.patterns.anchor.clone());
    names.push(config.patterns.advance.clone());
    names.push(config.patterns.confirm.clone());
    names.extend(config.patterns.pickups.iter().cloned());
    let patterns = PatternStore::scan(&config.patterns.dir, &names, |path, name| {
        load_png_pattern(path, name)
    });

    let mut driver = Driver::new(
        config,
        Box::new(source),
        Arc::new(screenpilot::matcher::PixelMatcher),
        patterns,
        Box::new(actuator),
        running,
    );
    driver.run()?;
    Ok(())
}

#[cfg(not(feature = "computer-use"))]
fn run(_config: Config, _running: Arc<AtomicBool>) -> anyhow::Result<()> {
    anyhow::bail!(
        "built without the computer-use feature; \
         rebuild with --features computer-use to drive a real surface"
    )
}
