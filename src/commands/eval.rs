//! `operator eval ...`: campaigns, analysis, comparison, viewer.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ArgMatches;
use operator_runtime::eval::{analysis, viewer, CampaignRun, CampaignSpec, Harness};
use operator_runtime::types::StoreError;
use operator_runtime::{AnthropicClient, HeuristicClassifier, ScriptedSubject, ShutdownFlag};

pub async fn run(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let config_path = matches
        .get_one::<String>("config")
        .expect("required by clap");
    let spec = CampaignSpec::from_yaml_file(Path::new(config_path))?;
    let subject = ScriptedSubject::from_yaml_file(&spec.subject)?;
    let chaos = subject.chaos_injector().ok_or_else(|| {
        anyhow::anyhow!(
            "subject spec '{}' declares no chaos commands",
            spec.subject.display()
        )
    })?;

    let shutdown = ShutdownFlag::new();
    shutdown.install_signal_handlers()?;

    let harness = Harness::new(store.clone(), Arc::new(subject), chaos, shutdown);
    let run = CampaignRun::from_spec(&spec);
    let campaign_id = harness.run_campaign(run).await?;

    if super::json_output(matches) {
        let campaign = store.get_campaign(campaign_id)?;
        println!("{}", serde_json::to_string_pretty(&campaign)?);
    } else {
        println!("campaign {campaign_id} finished; 'operator eval analyze {campaign_id}' to score it");
    }
    Ok(())
}

pub fn list(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let campaigns = store.list_campaigns(super::parse_limit(matches)?)?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&campaigns)?);
        return Ok(());
    }

    if campaigns.is_empty() {
        println!("no campaigns");
        return Ok(());
    }
    for campaign in &campaigns {
        let trial_count = store.list_trials(campaign.id)?.len();
        println!(
            "#{:<4} {:<24} subject={:<10} chaos={:<16} trials={}{}",
            campaign.id,
            campaign.name,
            campaign.subject_name,
            campaign.chaos_type,
            trial_count,
            if campaign.is_baseline { " [baseline]" } else { "" },
        );
    }
    Ok(())
}

pub fn show(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let id = super::parse_id(matches, "id")?;

    // Campaign ids and trial ids share the positional; try campaigns
    // first, fall back to a single trial.
    match store.get_campaign(id) {
        Ok(campaign) => {
            let trials = store.list_trials(id)?;
            if super::json_output(matches) {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "campaign": campaign,
                        "trials": trials,
                    }))?
                );
            } else {
                println!(
                    "campaign #{} {} subject={} chaos={}{}",
                    campaign.id,
                    campaign.name,
                    campaign.subject_name,
                    campaign.chaos_type,
                    if campaign.is_baseline { " [baseline]" } else { "" },
                );
                for trial in &trials {
                    println!(
                        "  trial #{:<4} {:<10} injected={} detect={} resolve={}",
                        trial.id,
                        trial.outcome,
                        trial.chaos_injected_at.format("%H:%M:%S"),
                        trial
                            .ticket_created_at
                            .map(|t| format!("{:.1}s", (t - trial.chaos_injected_at).num_milliseconds() as f64 / 1000.0))
                            .unwrap_or_else(|| "-".into()),
                        trial
                            .resolved_at
                            .map(|t| format!("{:.1}s", (t - trial.chaos_injected_at).num_milliseconds() as f64 / 1000.0))
                            .unwrap_or_else(|| "-".into()),
                    );
                }
            }
            Ok(())
        }
        Err(StoreError::CampaignNotFound { .. }) => {
            let trial = store.get_trial(id)?;
            println!("{}", serde_json::to_string_pretty(&trial)?);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn analyze(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let campaign_id = super::parse_id(matches, "campaign_id")?;
    let classifier: Box<dyn analysis::CommandClassifier> =
        match matches.get_one::<String>("classifier").expect("has default").as_str() {
            "heuristic" => Box::new(HeuristicClassifier),
            "model" => Box::new(analysis::ModelClassifier::new(
                Arc::new(AnthropicClient::from_env()?),
                "claude-3-5-haiku-20241022",
            )),
            other => anyhow::bail!("unknown classifier '{other}' (heuristic or model)"),
        };
    let analysis = analysis::analyze_campaign(&store, campaign_id, classifier.as_ref()).await?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
        return Ok(());
    }

    let summary = &analysis.summary;
    println!("campaign #{} {}", summary.campaign_id, summary.name);
    println!(
        "  trials={} resolved={} escalated={} timeout={} error={}",
        summary.trial_count,
        summary.resolved_count,
        summary.escalated_count,
        summary.timeout_count,
        summary.error_count,
    );
    println!("  win rate: {:.0}%", summary.win_rate * 100.0);
    if let Some(detect) = summary.mean_time_to_detect_sec {
        println!("  mean time to detect:  {detect:.1}s");
    }
    if let Some(resolve) = summary.mean_time_to_resolve_sec {
        println!("  mean time to resolve: {resolve:.1}s");
    }
    for trial in &analysis.trials {
        println!(
            "  trial #{:<4} {:<10} commands={} unique={} destructive={}{}",
            trial.trial_id,
            trial.outcome,
            trial.command_count,
            trial.unique_command_count,
            trial.destructive_count,
            if trial.thrashing_detected { " [thrashing]" } else { "" },
        );
    }
    Ok(())
}

pub async fn compare(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let a_id = super::parse_id(matches, "a")?;
    let b_id = super::parse_id(matches, "b")?;

    let a = analysis::analyze_campaign(&store, a_id, &HeuristicClassifier).await?;
    let b = analysis::analyze_campaign(&store, b_id, &HeuristicClassifier).await?;
    let comparison = analysis::compare_campaigns(a.summary, b.summary)?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    println!(
        "A: #{} {} win rate {:.0}%",
        comparison.a.campaign_id,
        comparison.a.name,
        comparison.a.win_rate * 100.0
    );
    println!(
        "B: #{} {} win rate {:.0}%",
        comparison.b.campaign_id,
        comparison.b.name,
        comparison.b.win_rate * 100.0
    );
    println!("winner: {:?}", comparison.winner);
    Ok(())
}

pub async fn compare_baseline(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let campaign_id = super::parse_id(matches, "id")?;
    let campaign = store.get_campaign(campaign_id)?;

    let baseline_id = match matches.get_one::<String>("baseline") {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid id"))?,
        None => store
            .list_campaigns(None)?
            .into_iter()
            .find(|c| {
                c.is_baseline
                    && c.subject_name == campaign.subject_name
                    && c.chaos_type == campaign.chaos_type
            })
            .map(|c| c.id)
            .context("no matching baseline campaign found; pass --baseline")?,
    };

    let agent = analysis::analyze_campaign(&store, campaign_id, &HeuristicClassifier).await?;
    let baseline = analysis::analyze_campaign(&store, baseline_id, &HeuristicClassifier).await?;
    let comparison = analysis::compare_baseline(agent.summary, baseline.summary)?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    println!(
        "agent:    #{} win rate {:.0}%",
        comparison.agent.campaign_id,
        comparison.agent.win_rate * 100.0
    );
    println!(
        "baseline: #{} win rate {:.0}%",
        comparison.baseline.campaign_id,
        comparison.baseline.win_rate * 100.0
    );
    println!("win rate delta: {:+.0}%", comparison.win_rate_delta * 100.0);
    if let Some(delta) = comparison.mean_detect_delta_sec {
        println!("mean detect delta:  {delta:+.1}s");
    }
    if let Some(delta) = comparison.mean_resolve_delta_sec {
        println!("mean resolve delta: {delta:+.1}s");
    }
    println!("winner: {:?}", comparison.winner);
    Ok(())
}

pub async fn viewer(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let host = matches.get_one::<String>("host").expect("has default");
    let port: u16 = matches
        .get_one::<String>("port")
        .expect("has default")
        .parse()
        .context("--port must be a number")?;

    let shutdown = ShutdownFlag::new();
    shutdown.install_signal_handlers()?;
    viewer::serve(store, host, port, shutdown).await?;
    Ok(())
}
