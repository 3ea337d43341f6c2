use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader as AsyncBufReader};

use vibe_chat::config::{load_dotenv, ClientConfig, RelayConfig};
use vibe_chat::server::{routes, Server};
use vibe_chat::view;
use vibe_chat::{default_channels, Backend, MessageId, MessageSynchronizer, Notification, WsTransport};

#[derive(Parser)]
#[command(name = "vibe-chat", about = "Campus chat relay and terminal client")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket relay.
    Serve,
    /// Chat from the terminal through a running relay.
    Chat {
        #[arg(long, default_value = "global")]
        channel: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
}

fn check_tls_material(config: &RelayConfig) -> io::Result<()> {
    let mut cert_reader = BufReader::new(File::open(&config.tls_cert)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "no certificates in PEM file"));
    }

    let mut key_reader = BufReader::new(File::open(&config.tls_key)?);
    match rustls_pemfile::private_key(&mut key_reader)? {
        Some(_) => Ok(()),
        None => Err(io::Error::new(io::ErrorKind::InvalidData, "no private key in PEM file")),
    }
}

async fn serve(config: RelayConfig) {
    let server = Arc::new(Server::new(Backend::new()));
    let routes = routes(server);

    match check_tls_material(&config) {
        Ok(()) => {
            info!("Starting secure relay (WSS) on {}", config.bind_addr);
            warp::serve(routes)
                .tls()
                .cert_path(&config.tls_cert)
                .key_path(&config.tls_key)
                .run(config.bind_addr)
                .await;
        }
        Err(e) => {
            warn!("TLS unavailable ({}), falling back to plain WS on {}", e, config.bind_addr);
            warp::serve(routes).run(config.bind_addr).await;
        }
    }
}

async fn chat(config: ClientConfig, channel: String) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(WsTransport::connect(&config).await?);
    let (mut sync, mut notifications) = MessageSynchronizer::new(transport, config.user.clone(), config.sync.clone());
    sync.load(channel);

    let mut lines = AsyncBufReader::new(tokio::io::stdin()).lines();
    let mut printed = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(mut line) = line? else { break };
                let command = line.trim().to_string();
                match command.as_str() {
                    "/quit" => break,
                    "/reload" => {
                        sync.reload();
                        printed.clear();
                    }
                    "/channels" => {
                        for channel in default_channels() {
                            let marker = if channel.kind().is_custom() { '@' } else { '#' };
                            println!("  {}{} {}", marker, channel.id, channel.label);
                        }
                    }
                    cmd if cmd.starts_with("/join ") => {
                        sync.load(cmd.trim_start_matches("/join ").trim());
                        println!("---- #{} ----", sync.channel_id().unwrap_or_default());
                        printed.clear();
                    }
                    cmd if cmd.starts_with("/delete ") => {
                        let own: Vec<_> = sync
                            .messages()
                            .iter()
                            .filter(|m| m.sender_id == config.user.id)
                            .map(|m| m.id.clone())
                            .collect();
                        match cmd.trim_start_matches("/delete ").trim().parse::<usize>() {
                            Ok(n) if n >= 1 && n <= own.len() => {
                                if let Err(e) = sync.delete(&own[own.len() - n]) {
                                    println!("! {e}");
                                }
                            }
                            _ => println!("! usage: /delete <n> (n-th most recent of yours)"),
                        }
                    }
                    _ => {
                        sync.submit(&mut line);
                    }
                }
            }
            () = sync.process_next() => {}
            Some(notification) = notifications.recv() => {
                if notification.is_error() {
                    println!("! {}", notification.summary());
                } else if let Notification::Received(_) = notification {
                    print!("\x07");
                }
            }
        }

        sync.process_pending();
        redraw(&sync, &config.user.id, &mut printed);
    }

    sync.close();
    Ok(())
}

/// Prints rows the terminal has not shown yet; any change to a printed row
/// reprints the channel.
fn redraw(sync: &MessageSynchronizer<WsTransport>, local_user_id: &str, printed: &mut Vec<MessageId>) {
    let messages = sync.messages();
    let rows = view::rows(messages, local_user_id);
    let start = view::unprinted(printed, messages).unwrap_or_else(|| {
        println!("---- #{} ----", sync.channel_id().unwrap_or_default());
        0
    });
    for row in &rows[start..] {
        let who = match (&row.message.sender, row.is_own) {
            (_, true) => "you".to_string(),
            (Some(sender), false) => sender.username.clone(),
            (None, false) => row.message.sender_id.clone(),
        };
        let marker = if row.is_pending { " …" } else { "" };
        println!("[{}] {}: {}{}", view::time_label(row.message), who, row.message.text, marker);
    }
    *printed = messages.iter().map(|m| m.id.clone()).collect();
}

#[tokio::main]
async fn main() {
    load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => match RelayConfig::from_env() {
            Ok(config) => serve(config).await,
            Err(e) => {
                error!("Invalid relay configuration: {}", e);
                std::process::exit(1);
            }
        },
        Command::Chat { channel, user, name } => {
            let config = match ClientConfig::from_env(user, name) {
                Ok(config) => config,
                Err(e) => {
                    error!("Invalid client configuration: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = chat(config, channel).await {
                error!("Chat session ended: {}", e);
                std::process::exit(1);
            }
        }
    }
}
