//! `operator actions ...`: the out-of-band approval workflow.

use anyhow::Result;
use clap::ArgMatches;

fn operator_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

pub fn approve(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let id = super::parse_id(matches, "proposal_id")?;
    let approver = operator_name();
    store.approve_proposal(id, &approver)?;

    let proposal = store
        .get_proposal(id)?
        .ok_or_else(|| anyhow::anyhow!("proposal {id} not found"))?;
    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&proposal)?);
    } else {
        println!("approved proposal {id} ({}) as {approver}", proposal.action_name);
    }
    Ok(())
}

pub fn reject(matches: &ArgMatches) -> Result<()> {
    let store = super::store_from(matches)?;
    let id = super::parse_id(matches, "proposal_id")?;
    let reason = matches
        .get_one::<String>("reason")
        .expect("required by clap");
    let rejecter = operator_name();
    store.reject_proposal(id, &rejecter, reason)?;

    let proposal = store
        .get_proposal(id)?
        .ok_or_else(|| anyhow::anyhow!("proposal {id} not found"))?;
    if super::json_output(matches) {
        println!("{}", serde_json::to_string_pretty(&proposal)?);
    } else {
        println!("rejected proposal {id}: {reason}");
    }
    Ok(())
}
