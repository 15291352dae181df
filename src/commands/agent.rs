//! `operator agent start`

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::ArgMatches;
use operator_runtime::{
    Agent, AgentConfig, AnthropicClient, ScriptedSubject, ShutdownFlag, ToolRegistry,
};

pub async fn start(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let subject_path = matches
        .get_one::<String>("subject")
        .expect("required by clap");
    let subject = ScriptedSubject::from_yaml_file(Path::new(subject_path))?;

    // Both of these are fatal before the loop starts: bad mode values
    // or a missing API key exit non-zero immediately.
    let config = AgentConfig::from_env()?;
    let client = Arc::new(AnthropicClient::from_env()?);

    let shutdown = ShutdownFlag::new();
    shutdown.install_signal_handlers()?;

    let agent = Agent::new(
        store,
        Arc::new(subject),
        client,
        ToolRegistry::with_defaults(),
        config,
        shutdown,
    );
    agent.run().await?;
    Ok(())
}
