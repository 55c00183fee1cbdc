use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use chanlink::chat::{ChatChannel, ChatMessage};
use chanlink::peer::PeerHandle;
use chanlink::ChannelType;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A chat message together with where it came from.
#[derive(Debug, Clone)]
pub struct Received {
    pub peer: String,
    pub channel_id: u32,
    pub message: ChatMessage,
}

impl Received {
    pub fn on(peer: PeerHandle, channel_id: u32, message: ChatMessage) -> Self {
        Self {
            peer: peer.to_string(),
            channel_id,
            message,
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    channel_type: &'a str,
    channel_id: u32,
    peer: &'a str,
    msg: &'a str,
    timestamp: String,
}

pub fn print_message(received: &Received, format: OutputFormat) {
    let channel_type = ChatChannel::type_name();
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                channel_type,
                channel_id: received.channel_id,
                peer: &received.peer,
                msg: &received.message.msg,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "ID", "PEER", "MESSAGE"])
                .add_row(vec![
                    channel_type.to_string(),
                    received.channel_id.to_string(),
                    received.peer.clone(),
                    received.message.msg.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} id={} peer={} msg={}",
                channel_type, received.channel_id, received.peer, received.message.msg
            );
        }
        OutputFormat::Raw => {
            let mut out = std::io::stdout();
            let _ = out.write_all(received.message.msg.as_bytes());
            let _ = out.write_all(b"\n");
            let _ = out.flush();
        }
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
