//! # hearth-chat
//!
//! Terminal client for one Hearth room.
//!
//! ```text
//! HEARTH_TOKEN=<access token> hearth-chat <family_id> <room_id>
//! ```
//!
//! Lines typed on stdin are sent to the room. `/reconnect`, `/unread` and
//! `/quit` are commands.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use hearth_client::{
    init_tracing, ClientConfig, ConversationController, ConversationEvent, DecryptedMessage, Keyring,
    RestHistory, UnreadTracker,
};
use hearth_net::TransportManager;
use hearth_shared::constants::APP_NAME;
use hearth_shared::{FamilyId, RoomId};
use hearth_store::SqliteSecretStore;

fn print_message(message: &DecryptedMessage) {
    let when = message
        .created_at
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    let who = message.sender_username.as_deref().unwrap_or("?");
    println!("[{when}] {who}: {}", message.text);
}

fn parse_args() -> anyhow::Result<(FamilyId, RoomId)> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 2 {
        bail!("usage: hearth-chat <family_id> <room_id>");
    }
    let family = args[0].parse::<i64>().context("family_id must be an integer")?;
    let room = args[1].parse::<i64>().context("room_id must be an integer")?;
    Ok((FamilyId(family), RoomId(room)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting {} chat v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let (family, room) = parse_args()?;
    let token = std::env::var("HEARTH_TOKEN").context("HEARTH_TOKEN is not set")?;

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let db = config.open_database().context("opening local database")?;
    let keyring = Arc::new(Keyring::new(Arc::new(SqliteSecretStore::new(db))));
    let transport = Arc::new(TransportManager::new(config.transport_config()?));
    let history = Arc::new(RestHistory::from_config(&config)?);

    let unread = UnreadTracker::attach(transport.clone());
    unread.set_open_room(Some(room));
    if let Err(e) = transport.connect_to_notifications(&token).await {
        warn!(error = %e, "notifications unavailable");
    }

    let controller = Arc::new(ConversationController::new(
        room,
        family,
        transport.clone(),
        keyring,
        history,
    ));
    let mut events = controller.subscribe();

    if let Err(e) = controller.open(&token).await {
        if e.is_authentication_error() {
            bail!("access token rejected, log in again");
        }
        warn!(error = %e, "room not connected, use /reconnect");
    }
    for message in controller.messages() {
        print_message(&message);
    }

    let printer = {
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConversationEvent::MessageAppended { id }) => {
                        if let Some(message) = controller.messages().iter().find(|m| m.id == id) {
                            print_message(message);
                        }
                    }
                    Ok(ConversationEvent::HistoryLoaded { count, failed }) if failed > 0 => {
                        println!("-- {failed} of {count} messages could not be decrypted");
                    }
                    Ok(ConversationEvent::ServerError { message }) => println!("-- server: {message}"),
                    Ok(ConversationEvent::Connection(status)) => info!(?status, "connection"),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/unread" => println!("-- {} unread in other rooms", unread.total_unread()),
            "/reconnect" => {
                if let Err(e) = controller.reconnect(&token).await {
                    println!("-- reconnect failed: {e}");
                }
            }
            text => {
                if let Err(e) = controller.send(text) {
                    println!("-- not sent: {e}");
                }
            }
        }
    }

    controller.close();
    printer.abort();
    unread.detach();
    transport.disconnect_all();
    info!("bye");
    Ok(())
}
