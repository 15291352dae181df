//! `operator tickets ...`

use anyhow::Result;
use clap::ArgMatches;
use operator_runtime::types::{Ticket, TicketStatus};

pub fn list(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let status = match matches.get_one::<String>("status") {
        Some(raw) => Some(
            raw.parse::<TicketStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
        ),
        None => None,
    };
    let tickets = store.list_tickets(status, super::parse_limit(matches)?)?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&tickets)?);
        return Ok(());
    }

    if tickets.is_empty() {
        println!("no tickets");
        return Ok(());
    }
    for ticket in &tickets {
        println!(
            "#{:<5} {:<12} {:<8} {:<24} key={} opened={}",
            ticket.id,
            ticket.status,
            ticket.severity,
            ticket.invariant_name,
            ticket.violation_key,
            ticket.opened_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    let counts = store.ticket_counts()?;
    let totals: Vec<String> = counts
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!("totals: {}", totals.join(" "));
    Ok(())
}

pub fn show(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let id = super::parse_id(matches, "id")?;
    let ticket = store
        .get_ticket(id)?
        .ok_or_else(|| anyhow::anyhow!("ticket {id} not found"))?;

    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&ticket)?);
        return Ok(());
    }

    print_ticket(&ticket);
    Ok(())
}

fn print_ticket(ticket: &Ticket) {
    println!("Ticket #{}", ticket.id);
    println!("  invariant: {}", ticket.invariant_name);
    println!("  subject:   {}", ticket.subject_name);
    println!("  severity:  {}", ticket.severity);
    println!("  status:    {}", ticket.status);
    println!("  key:       {}", ticket.violation_key);
    println!("  opened:    {}", ticket.opened_at.to_rfc3339());
    if let Some(resolved_at) = ticket.resolved_at {
        println!("  closed:    {}", resolved_at.to_rfc3339());
    }
    if let Some(session) = &ticket.assigned_session_id {
        println!("  session:   {session}");
    }
    if let Some(diagnosis) = &ticket.diagnosis {
        println!("  diagnosis: {diagnosis}");
    }
    println!(
        "  details:   {}",
        serde_json::to_string_pretty(&ticket.violation_details)
            .unwrap_or_else(|_| ticket.violation_details.to_string())
    );
}
