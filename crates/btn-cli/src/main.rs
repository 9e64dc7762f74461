use anyhow::{Context, Result};
use btn_schemas::{Event, Phase};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "btn")]
#[command(about = "Button state pipeline operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Ruleset commands
    Rules {
        #[command(subcommand)]
        cmd: RulesCmd,
    },

    /// Snapshot inspection
    State {
        #[command(subcommand)]
        cmd: StateCmd,
    },

    /// Append events to the event log by hand
    Log {
        #[command(subcommand)]
        cmd: LogCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply embedded SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum RulesCmd {
    /// Validate layered rules, print hash + canonical JSON. No DB access.
    Hash {
        /// Paths in merge order (base -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Validate layered rules and store them as the next version.
    Seed {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Print the active ruleset.
    Show,
}

#[derive(Subcommand)]
enum StateCmd {
    /// Print the latest persisted snapshot as JSON.
    Latest,
}

#[derive(Subcommand)]
enum LogCmd {
    Press {
        /// Defaults to a fresh UUID
        #[arg(long)]
        request_id: Option<String>,
    },

    Tick {
        /// CALM | WARM | HOT | CHAOS (or rank 0..=3)
        #[arg(long, value_parser = parse_phase)]
        observed_phase: Phase,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = btn_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = btn_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_global_states_table={}",
                        s.ok, s.has_global_states_table
                    );
                }
                DbCmd::Migrate => {
                    btn_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Rules { cmd } => match cmd {
            RulesCmd::Hash { paths } => {
                let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
                let loaded = btn_config::load_layered_yaml(&path_refs)?;
                btn_config::Ruleset::from_loaded(&loaded)?;
                println!("rules_hash={}", loaded.config_hash);
                println!("{}", loaded.canonical_json);
            }

            RulesCmd::Seed { config_paths } => {
                let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
                let loaded = btn_config::load_layered_yaml(&path_refs)?;
                btn_config::Ruleset::from_loaded(&loaded)?;

                let pool = btn_db::connect_from_env().await?;
                let outcome =
                    btn_db::insert_ruleset(&pool, &loaded.config_hash, &loaded.config_json)
                        .await?;
                let inserted = matches!(outcome, btn_db::RulesetInsert::Inserted { .. });
                tracing::info!(
                    rules_hash = %loaded.config_hash,
                    version = outcome.version(),
                    inserted,
                    "ruleset seeded"
                );
                println!("rules_hash={}", loaded.config_hash);
                println!("version={}", outcome.version());
                println!("inserted={inserted}");
            }

            RulesCmd::Show => {
                let pool = btn_db::connect_from_env().await?;
                let hash = btn_db::latest_rules_hash(&pool)
                    .await?
                    .context("no ruleset seeded; run `btn rules seed --config <path>`")?;
                let stored = btn_db::fetch_ruleset_by_hash(&pool, &hash)
                    .await?
                    .with_context(|| format!("active ruleset {hash} disappeared"))?;
                println!("rules_hash={}", stored.hash);
                println!("version={}", stored.version);
                println!("created_at={}", stored.created_at.to_rfc3339());
                println!("{}", serde_json::to_string_pretty(&stored.ruleset)?);
            }
        },

        Commands::State { cmd } => match cmd {
            StateCmd::Latest => {
                let pool = btn_db::connect_from_env().await?;
                match btn_db::latest_state(&pool).await? {
                    Some(st) => println!("{}", serde_json::to_string_pretty(&st)?),
                    None => println!("no_state=true"),
                }
            }
        },

        Commands::Log { cmd } => {
            let event = match cmd {
                LogCmd::Press { request_id } => Event::press(
                    request_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    Utc::now().timestamp_millis(),
                ),
                LogCmd::Tick { observed_phase } => {
                    Event::tick(Utc::now().timestamp_millis(), observed_phase)
                }
            };
            let pool = btn_db::connect_from_env().await?;
            let offset = btn_db::append_event(&pool, &event).await?;
            tracing::debug!(offset, kind = event.kind(), "event appended by operator");
            println!("appended=true kind={} offset={offset}", event.kind());
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn parse_phase(raw: &str) -> Result<Phase, String> {
    let raw = raw.trim();
    if let Ok(rank) = raw.parse::<u8>() {
        return Phase::try_from(rank);
    }
    Phase::LADDER
        .into_iter()
        .find(|p| p.as_str().eq_ignore_ascii_case(raw))
        .ok_or_else(|| format!("unknown phase '{raw}'; expected CALM | WARM | HOT | CHAOS"))
}
