//! `operator audit ...`: session listing and conversation replay.

use anyhow::Result;
use clap::ArgMatches;
use operator_runtime::types::EntryType;

pub fn list(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let sessions = store.list_sessions(super::parse_limit(matches)?)?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "{:<32} ticket=#{:<5} {:<10} started={}",
            session.session_id,
            session.ticket_id,
            session.status,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(summary) = &session.outcome_summary {
            println!("    {summary}");
        }
    }
    Ok(())
}

pub fn show(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let session_id = matches
        .get_one::<String>("session_id")
        .expect("required by clap");
    let session = store
        .get_session(session_id)?
        .ok_or_else(|| anyhow::anyhow!("session {session_id} not found"))?;
    let log = store.get_log(session_id)?;

    if super::json_output(matches) {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "log": log,
            }))?
        );
        return Ok(());
    }

    println!(
        "session {} (ticket #{}) - {}",
        session.session_id, session.ticket_id, session.status
    );
    if let Some(summary) = &session.outcome_summary {
        println!("outcome: {summary}");
    }
    println!();
    for entry in &log {
        let stamp = entry.timestamp.format("%H:%M:%S");
        match entry.entry_type {
            EntryType::Reasoning => println!("[{stamp}] agent: {}", entry.content),
            EntryType::ToolCall => println!("[{stamp}]  call: {}", entry.content),
            EntryType::ToolResult => println!(
                "[{stamp}]  exit {}: {}",
                entry.exit_code.unwrap_or(-1),
                entry.content
            ),
        }
    }
    Ok(())
}
