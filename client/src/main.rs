use anyhow::Result;
use std::sync::Arc;
use tandem_client::command::{parse_command, Command};
use tandem_client::{connection, ClientAgent, ClientConfig, Player, SimulatedPlayer};
use tandem_proto::{format_time, RpcError, StatusReport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,info".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;
    let player = Arc::new(SimulatedPlayer::new());
    let (agent, mut disconnected) = connection::connect(&config.server_url, player).await?;

    let monitor = CancellationToken::new();
    if let Some(period) = config.drift_check {
        tokio::spawn(Arc::clone(&agent).monitor_drift(period, monitor.clone()));
    }

    println!("Commands: play, pause, seek <mm:ss|ms>, resync, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = &mut disconnected => {
                tracing::info!("Server closed the connection");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => run_command(&agent, command).await,
            Err(e) => println!("{e}"),
        }
    }

    monitor.cancel();
    Ok(())
}

async fn run_command(agent: &ClientAgent<SimulatedPlayer>, command: Command) {
    let result = match command {
        Command::Play => agent.request_play(None).await,
        Command::Pause => agent.request_pause(None).await,
        Command::Seek(target) => agent.request_seek(target).await,
        Command::Resync => agent.request_resync().await,
        Command::Status => agent.server_status().await,
        Command::Quit => return,
    };
    print_status(agent, result);
}

fn print_status(agent: &ClientAgent<SimulatedPlayer>, result: Result<StatusReport, RpcError>) {
    let local = agent.player();
    match result {
        Ok(server) => println!(
            "server {:?} at {} | local {:?} at {}",
            server.state,
            format_time(server.position),
            local.state(),
            format_time(local.position())
        ),
        Err(e) => println!("request failed: {e}"),
    }
}
