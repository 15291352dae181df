use clap::{Arg, ArgAction, Command};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("operator")
        .version(VERSION)
        .about("Operator - autonomous remediation for distributed infrastructure")
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("PATH")
                .global(true)
                .help("Database path (default ~/.operator/operator.db, or OPERATOR_DB_PATH)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Machine-readable JSON output"),
        )
        .subcommand(
            Command::new("monitor")
                .about("Monitor daemon")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start")
                        .about("Run the monitor loop against a subject")
                        .arg(
                            Arg::new("subject")
                                .long("subject")
                                .value_name("FILE")
                                .required(true)
                                .help("Subject spec YAML"),
                        )
                        .arg(
                            Arg::new("interval")
                                .long("interval")
                                .value_name("SEC")
                                .default_value("10")
                                .help("Tick interval in seconds"),
                        ),
                ),
        )
        .subcommand(
            Command::new("agent")
                .about("Remediation agent daemon")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start")
                        .about("Run the agent loop; reads OPERATOR_SAFETY_MODE and OPERATOR_APPROVAL_MODE")
                        .arg(
                            Arg::new("subject")
                                .long("subject")
                                .value_name("FILE")
                                .required(true)
                                .help("Subject spec YAML"),
                        ),
                ),
        )
        .subcommand(
            Command::new("tickets")
                .about("Inspect tickets")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list")
                        .about("List tickets")
                        .arg(
                            Arg::new("status")
                                .long("status")
                                .value_name("STATUS")
                                .help("Filter: open, in_progress, resolved, escalated"),
                        )
                        .arg(
                            Arg::new("limit")
                                .long("limit")
                                .value_name("N")
                                .help("Maximum rows"),
                        ),
                )
                .subcommand(
                    Command::new("show").about("Show one ticket").arg(
                        Arg::new("id")
                            .value_name("TICKET_ID")
                            .required(true)
                            .help("Ticket id"),
                    ),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Inspect agent sessions")
                .subcommand_required(true)
                .subcommand(
                    Command::new("list").about("List sessions").arg(
                        Arg::new("limit")
                            .long("limit")
                            .value_name("N")
                            .help("Maximum rows"),
                    ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Replay one session's conversation")
                        .arg(
                            Arg::new("session_id")
                                .value_name("SESSION_ID")
                                .required(true)
                                .help("Session id"),
                        ),
                ),
        )
        .subcommand(
            Command::new("actions")
                .about("Approve or reject proposed actions")
                .subcommand_required(true)
                .subcommand(
                    Command::new("approve").about("Approve a validated proposal").arg(
                        Arg::new("proposal_id")
                            .value_name("PROPOSAL_ID")
                            .required(true),
                    ),
                )
                .subcommand(
                    Command::new("reject")
                        .about("Reject a validated proposal")
                        .arg(
                            Arg::new("proposal_id")
                                .value_name("PROPOSAL_ID")
                                .required(true),
                        )
                        .arg(
                            Arg::new("reason")
                                .long("reason")
                                .value_name("TEXT")
                                .required(true)
                                .help("Why the action was rejected"),
                        ),
                ),
        )
        .subcommand(
            Command::new("eval")
                .about("Evaluation campaigns")
                .subcommand_required(true)
                .subcommand(
                    Command::new("run").about("Run a campaign from config").arg(
                        Arg::new("config")
                            .value_name("CONFIG_YAML")
                            .required(true)
                            .help("Campaign config file"),
                    ),
                )
                .subcommand(
                    Command::new("list").about("List campaigns").arg(
                        Arg::new("limit")
                            .long("limit")
                            .value_name("N")
                            .help("Maximum rows"),
                    ),
                )
                .subcommand(
                    Command::new("show")
                        .about("Show a campaign (with trials) or a single trial")
                        .arg(
                            Arg::new("id")
                                .value_name("CAMPAIGN_OR_TRIAL_ID")
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new("analyze")
                        .about("Score a campaign")
                        .arg(
                            Arg::new("campaign_id")
                                .value_name("CAMPAIGN_ID")
                                .required(true),
                        )
                        .arg(
                            Arg::new("classifier")
                                .long("classifier")
                                .value_name("KIND")
                                .default_value("heuristic")
                                .help("Command classifier: heuristic, or model (temperature-0 LLM; requires ANTHROPIC_API_KEY)"),
                        ),
                )
                .subcommand(
                    Command::new("compare")
                        .about("Compare two campaigns of the same subject and chaos type")
                        .arg(Arg::new("a").value_name("CAMPAIGN_A").required(true))
                        .arg(Arg::new("b").value_name("CAMPAIGN_B").required(true)),
                )
                .subcommand(
                    Command::new("compare-baseline")
                        .about("Compare a campaign against a baseline campaign")
                        .arg(Arg::new("id").value_name("CAMPAIGN_ID").required(true))
                        .arg(
                            Arg::new("baseline")
                                .long("baseline")
                                .value_name("CAMPAIGN_ID")
                                .help("Baseline campaign (default: latest matching baseline)"),
                        ),
                )
                .subcommand(
                    Command::new("viewer")
                        .about("Start the read-only web viewer")
                        .arg(
                            Arg::new("host")
                                .long("host")
                                .value_name("HOST")
                                .default_value("127.0.0.1"),
                        )
                        .arg(
                            Arg::new("port")
                                .long("port")
                                .value_name("PORT")
                                .default_value("7878"),
                        ),
                ),
        )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let matches = cli().get_matches();

    let result = match matches.subcommand() {
        Some(("monitor", sub)) => match sub.subcommand() {
            Some(("start", sub)) => commands::monitor::start(sub).await,
            _ => unreachable!("subcommand required"),
        },
        Some(("agent", sub)) => match sub.subcommand() {
            Some(("start", sub)) => commands::agent::start(sub).await,
            _ => unreachable!("subcommand required"),
        },
        Some(("tickets", sub)) => match sub.subcommand() {
            Some(("list", sub)) => commands::tickets::list(sub),
            Some(("show", sub)) => commands::tickets::show(sub),
            _ => unreachable!("subcommand required"),
        },
        Some(("audit", sub)) => match sub.subcommand() {
            Some(("list", sub)) => commands::audit::list(sub),
            Some(("show", sub)) => commands::audit::show(sub),
            _ => unreachable!("subcommand required"),
        },
        Some(("actions", sub)) => match sub.subcommand() {
            Some(("approve", sub)) => commands::actions::approve(sub),
            Some(("reject", sub)) => commands::actions::reject(sub),
            _ => unreachable!("subcommand required"),
        },
        Some(("eval", sub)) => match sub.subcommand() {
            Some(("run", sub)) => commands::eval::run(sub).await,
            Some(("list", sub)) => commands::eval::list(sub),
            Some(("show", sub)) => commands::eval::show(sub),
            Some(("analyze", sub)) => commands::eval::analyze(sub).await,
            Some(("compare", sub)) => commands::eval::compare(sub).await,
            Some(("compare-baseline", sub)) => commands::eval::compare_baseline(sub).await,
            Some(("viewer", sub)) => commands::eval::viewer(sub).await,
            _ => unreachable!("subcommand required"),
        },
        _ => {
            println!("operator v{VERSION}");
            println!("Use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
