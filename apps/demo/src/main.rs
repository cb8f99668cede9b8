use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{ChatClient, ConversationEvent, HostedBackend};
use shared::domain::UserId;

/// Sends one message into a conversation and tails the event stream,
/// printing reconciliation and read-state transitions as they happen.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    peer_id: i64,
    #[arg(long)]
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let backend = Arc::new(HostedBackend::new(&args.server_url)?);
    let client = ChatClient::new_with_service(backend);
    client.set_local_user(UserId(args.user_id)).await;
    client.start().await;

    let conversation = client
        .get_or_create_conversation(UserId(args.user_id), UserId(args.peer_id))
        .await?;
    println!(
        "Conversation {} with user {}",
        conversation.conversation_id.0, args.peer_id
    );

    let session = client.open_conversation(conversation).await?;
    for message in session.messages().await {
        println!("  [{:?}] {:?}", message.state, message.body);
    }

    let mut events = session.subscribe_events();
    let local_id = session.send_text_message(&args.message).await;
    println!("Sent provisional message {local_id}");

    loop {
        match events.recv().await? {
            ConversationEvent::MessageAppended(message) => {
                println!("appended: [{:?}] {:?}", message.state, message.body);
            }
            ConversationEvent::MessageConfirmed { message, .. } => {
                println!(
                    "confirmed: {} -> server id {:?}",
                    message.local_id, message.message_id
                );
            }
            ConversationEvent::MessageFailed { message, .. } => {
                println!("failed: {}", message.local_id);
            }
            ConversationEvent::MessageRead { message, .. } => {
                println!("read: {:?}", message.message_id);
            }
            ConversationEvent::MessageDismissed { local_id } => {
                println!("dismissed: {local_id}");
            }
        }
    }
}
