//! CLI subcommand implementations.

use anyhow::Result;
use clap::ArgMatches;
use operator_runtime::{config, Store};

pub mod actions;
pub mod agent;
pub mod audit;
pub mod eval;
pub mod monitor;
pub mod tickets;

/// Open the store selected by `--db` / `OPERATOR_DB_PATH` / default.
pub fn store_from(matches: &ArgMatches) -> Result<Store> {
    let path = config::resolve_db_path(matches.get_one::<String>("db").map(String::as_str));
    Ok(Store::open(path)?)
}

/// Whether `--json` was passed.
pub fn json_output(matches: &ArgMatches) -> bool {
    matches.get_flag("json")
}

/// Parse a required positional integer id.
pub fn parse_id(matches: &ArgMatches, name: &str) -> Result<i64> {
    let raw = matches
        .get_one::<String>(name)
        .expect("required by clap");
    raw.parse()
        .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid id"))
}

/// Parse an optional `--limit N`.
pub fn parse_limit(matches: &ArgMatches) -> Result<Option<u32>> {
    match matches.get_one::<String>("limit") {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("'{raw}' is not a valid limit")),
        None => Ok(None),
    }
}
