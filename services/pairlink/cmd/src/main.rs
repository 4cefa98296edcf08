//! Pairlink binary.
//!
//! Runs the rendezvous relay, a demo desktop peer, or an interactive chat
//! client that pairs with a desktop peer through the relay.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use pairlink_session::{
    listen_tcp, run_relay, split_reasoning, CompletionRouter, PairingCode, RelayTransport,
    RemoteClient, Route,
};
use pairlink_wire::{ChatMessage, Role};
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod peer;

use config::{ConnectionMode, PairlinkConfig, Preferences};
use logging::PairlinkLogFormatter;
use peer::{EchoModel, PeerOptions};

/// Remote pairing and streaming inference bridge
#[derive(Parser, Debug)]
#[command(name = "pairlink", version, about = "Pair with a desktop peer and stream completions")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    /// Configuration file path
    #[arg(long, default_value = "pairlink.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rendezvous relay
    Relay {
        /// Listen address, e.g. 0.0.0.0:7070
        #[arg(long, default_value = "0.0.0.0:7070")]
        listen: SocketAddr,
    },

    /// Run a demo desktop peer that echoes prompts
    Peer {
        /// Pairing code of the room to serve
        #[arg(long)]
        code: String,

        /// Relay address (defaults to the configured one)
        #[arg(long)]
        relay: Option<String>,

        /// Pause between streamed tokens, e.g. 40ms
        #[arg(long, default_value = "40ms")]
        token_delay: humantime::Duration,

        /// Never answer version negotiation
        #[arg(long)]
        skip_version_ack: bool,

        /// Model name reported to clients
        #[arg(long, default_value = "echo-1")]
        model_name: String,
    },

    /// Pair with a desktop peer and send prompts
    Chat {
        /// Pairing code (defaults to the last one used)
        #[arg(long)]
        code: Option<String>,

        /// Relay address (defaults to the configured one)
        #[arg(long)]
        relay: Option<String>,

        /// Reconnect mode to use and remember (defaults to the stored one)
        #[arg(long, value_enum)]
        mode: Option<ConnectionMode>,

        /// Answer locally while no peer is connected
        #[arg(long)]
        local_fallback: bool,

        /// How long to wait for the peer before giving up (or falling back)
        #[arg(long, default_value = "15s")]
        connect_timeout: humantime::Duration,

        /// System prompt prepended to the conversation
        #[arg(long)]
        system: Option<String>,

        /// Prompt to send; reads one prompt per line from stdin when omitted
        prompt: Vec<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("pairlink={}", args.log_level).parse()?)
        .add_directive(format!("pairlink_session={}", args.log_level).parse()?)
        .add_directive(format!("pairlink_wire={}", args.log_level).parse()?);

    let formatter = PairlinkLogFormatter::new("pairlink").with_color(!args.no_color);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();

    info!("Starting pairlink v{}", env!("CARGO_PKG_VERSION"));

    let config = PairlinkConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Relay { listen } => relay(listen).await,
        Command::Peer {
            code,
            relay,
            token_delay,
            skip_version_ack,
            model_name,
        } => {
            let transport = RelayTransport::new(relay.unwrap_or_else(|| config.relay.addr.clone()))
                .with_connect_timeout(config.relay.connect_timeout);
            let code = PairingCode::new(code)?;
            let options = PeerOptions {
                token_delay: token_delay.into(),
                skip_version_ack,
                model_name,
            };

            tokio::select! {
                result = peer::run_peer(Arc::new(transport), code, options) => result,
                _ = tokio::signal::ctrl_c() => {
                    component_info!("peer", "Interrupted, shutting down");
                    Ok(())
                }
            }
        }
        Command::Chat {
            code,
            relay,
            mode,
            local_fallback,
            connect_timeout,
            system,
            prompt,
        } => {
            let options = ChatOptions {
                code,
                relay,
                mode,
                local_fallback,
                connect_timeout: connect_timeout.into(),
                system,
                prompt,
            };

            tokio::select! {
                result = chat(&config, options) => result,
                _ = tokio::signal::ctrl_c() => {
                    component_info!("chat", "Interrupted");
                    Ok(())
                }
            }
        }
    }
}

async fn relay(listen: SocketAddr) -> anyhow::Result<()> {
    let listener = listen_tcp(listen)
        .await
        .with_context(|| format!("failed to bind relay on {}", listen))?;
    component_info!("relay", "Relay ready on {}", listen);

    tokio::select! {
        result = run_relay(listener) => result.context("relay stopped"),
        _ = tokio::signal::ctrl_c() => {
            component_info!("relay", "Interrupted, shutting down");
            Ok(())
        }
    }
}

struct ChatOptions {
    code: Option<String>,
    relay: Option<String>,
    mode: Option<ConnectionMode>,
    local_fallback: bool,
    connect_timeout: std::time::Duration,
    system: Option<String>,
    prompt: Vec<String>,
}

async fn chat(config: &PairlinkConfig, options: ChatOptions) -> anyhow::Result<()> {
    let mut prefs = Preferences::load(&config.preferences_path)?;

    let Some(code) = options.code.or_else(|| prefs.last_pairing_code.clone()) else {
        bail!("no pairing code given and none remembered; pass --code");
    };
    let mode = prefs.apply_mode(options.mode);

    let transport = RelayTransport::new(options.relay.unwrap_or_else(|| config.relay.addr.clone()))
        .with_connect_timeout(config.relay.connect_timeout);
    let client = RemoteClient::new(Arc::new(transport), config.to_client_config());

    client.on_connectivity(|connected| {
        if connected {
            component_info!("chat", "Peer connected");
        } else {
            component_warn!("chat", "Peer disconnected");
        }
    });
    client.on_error(|message| component_error!("chat", "{}", message));
    client.on_retry_status(|status| {
        if let Some(ms) = status.next_retry_ms {
            component_info!("chat", "Reconnect attempt {} in {}ms", status.attempt, ms);
        }
    });

    if mode == ConnectionMode::Dynamic {
        client.enable_auto_retry().await?;
    }

    let connect_result = client.connect(&code).await;
    let connected = match connect_result {
        Ok(()) => client.wait_until_connected(options.connect_timeout).await.is_ok(),
        Err(e) if options.local_fallback => {
            component_warn!("chat", "Could not reach the relay: {}", e);
            false
        }
        Err(e) => return Err(e.into()),
    };

    if connected {
        prefs.last_pairing_code = Some(code.trim().to_string());
        prefs.save(&config.preferences_path)?;
        if let Ok(model) = client.request_model_info().await {
            component_info!(
                "chat",
                "Peer model: {} (installed: {})",
                model.display_name,
                model.installed
            );
        }
    } else if !options.local_fallback {
        client.shutdown();
        bail!(
            "no peer joined room {} within {:?}",
            code,
            options.connect_timeout
        );
    }

    let mut router = CompletionRouter::new(client.clone());
    if options.local_fallback {
        router = router.with_local(Arc::new(EchoModel));
    }

    let mut conversation = Vec::new();
    if let Some(system) = options.system {
        conversation.push(ChatMessage::new(Role::System, system));
    }

    if !options.prompt.is_empty() {
        ask(&router, &mut conversation, options.prompt.join(" ")).await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            ask(&router, &mut conversation, line).await?;
        }
    }

    client.disconnect().await?;
    client.shutdown();
    Ok(())
}

/// Send one user turn with the full history and print the streamed reply
async fn ask(
    router: &CompletionRouter,
    conversation: &mut Vec<ChatMessage>,
    prompt: String,
) -> anyhow::Result<()> {
    conversation.push(ChatMessage::user(prompt));

    let (route, mut chunks) = router.complete(conversation.clone()).await?;
    if route == Route::Local {
        component_info!("chat", "Answering locally");
    }

    let mut text = String::new();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        print!("{}", chunk);
        stdout.flush().ok();
        text.push_str(&chunk);
    }
    println!();

    // Only the answer goes back into the history
    conversation.push(ChatMessage::new(
        Role::Assistant,
        split_reasoning(&text).answer,
    ));
    Ok(())
}
