use clap::{Parser, Subcommand};
use log::{error, info};
use server::config::RoundConfiguration;
use server::events::{replay, EventChannel, EventLog, FanoutChannel, NullEventChannel};
use server::network::{Server, ServerMessage};
use server::state::ServerState;
use std::path::PathBuf;
use std::sync::Arc;

/// Foraging experiment server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hosts a live session over UDP
    Serve {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_WIDTH)]
        board_width: i32,
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_HEIGHT)]
        board_height: i32,
        /// Clients placed in one group before a new group is opened
        #[clap(short, long, default_value = "5")]
        clients_per_group: usize,
        #[clap(long, default_value = "")]
        chat_handle_prefix: String,
        /// Use slot numbers instead of letters as chat handles
        #[clap(long)]
        numeric_chat_handles: bool,
        /// Maximum number of simultaneous connections
        #[clap(short, long, default_value = "50")]
        max_clients: usize,
        /// Writes the session's event log here on shutdown
        #[clap(short, long)]
        record: Option<PathBuf>,
    },
    /// Rebuilds a session from a recorded event log and prints a summary
    Replay {
        path: PathBuf,
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_WIDTH)]
        board_width: i32,
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_HEIGHT)]
        board_height: i32,
        #[clap(short, long, default_value = "5")]
        clients_per_group: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Args::parse().command {
        Command::Serve {
            host,
            port,
            board_width,
            board_height,
            clients_per_group,
            chat_handle_prefix,
            numeric_chat_handles,
            max_clients,
            record,
        } => {
            let config = RoundConfiguration {
                board_width,
                board_height,
                clients_per_group,
                chat_handle_prefix,
                chat_handles_numeric: numeric_chat_handles,
                ..RoundConfiguration::default()
            };
            config.validate()?;
            serve(&format!("{}:{}", host, port), config, max_clients, record).await
        }
        Command::Replay {
            path,
            board_width,
            board_height,
            clients_per_group,
        } => {
            let config = RoundConfiguration {
                board_width,
                board_height,
                clients_per_group,
                ..RoundConfiguration::default()
            };
            config.validate()?;
            replay_session(path, config)
        }
    }
}

async fn serve(
    address: &str,
    config: RoundConfiguration,
    max_clients: usize,
    record: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(ServerState::new(config, Arc::new(NullEventChannel)));
    let mut server = Server::new(address, Arc::clone(&state), max_clients).await?;

    let log = Arc::new(EventLog::new());
    let channels: Vec<Arc<dyn EventChannel>> =
        vec![log.clone(), Arc::new(server.network_channel())];
    state.set_channel(Arc::new(FanoutChannel::new(channels)));

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        let _ = shutdown.send(ServerMessage::Shutdown);
    });

    server.run().await?;

    if let Some(path) = record {
        if let Err(e) = log.save_to_path(&path) {
            error!("Failed to write event log to {}: {}", path.display(), e);
            return Err(e.into());
        }
    }
    Ok(())
}

fn replay_session(path: PathBuf, config: RoundConfiguration) -> Result<(), Box<dyn std::error::Error>> {
    let events = EventLog::load_from_path(&path)?;
    let state = ServerState::new(config.clone(), Arc::new(NullEventChannel));
    state.reinitialize(config);
    let applied = replay(&state, &events)?;

    println!("Replayed {} events from {}", applied, path.display());
    for group in state.ordered_groups() {
        println!(
            "{}: {} members, {} tokens left, strategy {}",
            group.id(),
            group.size(),
            group.resource_count(),
            group
                .imposed_strategy()
                .map_or_else(|| "none".to_string(), |strategy| strategy.to_string())
        );
        for actor in group.actors() {
            println!("  {} at {} with {} tokens", actor, actor.position, actor.tokens);
        }
    }
    Ok(())
}
