//! `operator monitor start`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ArgMatches;
use operator_runtime::{Monitor, MonitorConfig, ScriptedSubject, ShutdownFlag};

pub async fn start(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let subject_path = matches
        .get_one::<String>("subject")
        .expect("required by clap");
    let interval: u64 = matches
        .get_one::<String>("interval")
        .expect("has default")
        .parse()
        .context("--interval must be a number of seconds")?;
    if interval == 0 {
        anyhow::bail!("--interval must be at least 1 second");
    }

    let subject = ScriptedSubject::from_yaml_file(Path::new(subject_path))?;
    let invariants = subject.invariants();
    if invariants.is_empty() {
        anyhow::bail!("subject spec declares no invariants; nothing to monitor");
    }

    let shutdown = ShutdownFlag::new();
    shutdown.install_signal_handlers()?;

    let mut monitor = Monitor::new(
        Arc::new(subject),
        invariants,
        store,
        MonitorConfig {
            interval: Duration::from_secs(interval),
            ..MonitorConfig::default()
        },
        shutdown,
    );
    monitor.run().await?;
    Ok(())
}
