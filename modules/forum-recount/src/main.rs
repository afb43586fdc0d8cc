use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use forum_api::ReqwestTransport;
use forum_recount::config::parse_id_list;
use forum_recount::{HostContext, LogSink, RecountConfig, RecountService, RunEvent, Snapshot};

#[derive(Parser)]
#[command(name = "forum-recount")]
#[command(about = "Recount forum posts per user and optionally report them to a backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recount once
    Run {
        /// Forum ids to recount (overrides FORUM_IDS)
        #[arg(long)]
        forums: Option<String>,

        /// Count each topic's opening post as well
        #[arg(long)]
        include_first_post: bool,

        /// POST the snapshot to the configured backend afterwards
        #[arg(long)]
        send: bool,

        /// Print the snapshot as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration and print it (secrets redacted)
    CheckConfig,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("forum_recount=info,forum_api=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = RecountConfig::from_env()?;
    let host = HostContext::from_env()?;

    match cli.command {
        Commands::CheckConfig => {
            config.validate()?;
            config.log_redacted();
            info!(?host, "Host context");
            Ok(())
        }
        Commands::Run {
            forums,
            include_first_post,
            send,
            json,
        } => {
            if let Some(raw) = forums {
                config.forums = parse_id_list(&raw)?;
            }
            if include_first_post {
                config.include_first_post = true;
            }
            config.validate()?;
            config.log_redacted();

            let transport = Arc::new(ReqwestTransport::new(config.request_timeout)?);
            let service = Arc::new(RecountService::new(config, transport, host)?);

            let stopper = service.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping run");
                    stopper.stop();
                }
            });

            let sink: LogSink = Arc::new(|event: &RunEvent| {
                eprintln!("[{}] {}", event.ts.format("%H:%M:%S"), event.kind.message());
            });

            let Some(snapshot) = service.run(Some(sink)).await? else {
                eprintln!("No data found.");
                return Ok(());
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print_table(&snapshot);
            }

            if send {
                let ack = service.send(&snapshot).await?;
                match ack.message {
                    Some(msg) => eprintln!("Backend: {msg}"),
                    None => eprintln!("Backend accepted snapshot"),
                }
            }
            Ok(())
        }
    }
}

fn print_table(snapshot: &Snapshot) {
    println!(
        "{} posts by {} users{}",
        snapshot.total_posts(),
        snapshot.total_users(),
        if snapshot.meta.complete { "" } else { " (partial)" }
    );
    println!("{:>4}  {:<28} {:>6}  {:>8}", "#", "user", "posts", "id");
    for (rank, entry) in snapshot.entries().enumerate() {
        let id = entry
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>4}  {:<28} {:>6}  {:>8}",
            rank + 1,
            entry.display_name,
            entry.count,
            id
        );
    }
}
