//! Multi-channel example: two channel types share one Unix socket session.
//! The server creates its channels only when the client announces them.
//!
//! Run with:
//!   cargo run --example multi-channel

#[cfg(unix)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::fs;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chanlink::chat::{ChatChannel, ChatMessage};
    use chanlink::peer::{ChannelLink, UdsTransport};
    use chanlink::{ChannelType, Connection, ContextConfig, Json, NetworkContext, RawBytes};

    struct Telemetry;

    impl ChannelType for Telemetry {
        type Payload = RawBytes;

        fn type_name() -> &'static str {
            "demo.telemetry"
        }
    }

    let sock_dir = std::env::temp_dir().join(format!("chanlink-multi-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("multi.sock");
    let address = sock_path.to_str().ok_or("temp dir is not valid UTF-8")?;

    let server = NetworkContext::new(UdsTransport::new(), ContextConfig::default());
    let client = NetworkContext::new(UdsTransport::new(), ContextConfig::default());
    let _server_io = server.spawn_io_thread()?;
    let _client_io = client.spawn_io_thread()?;

    let listener = server.listen_on(address)?;
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<String>();
    let _accepted = listener.connected().connect(move |conn: &Arc<Connection>| {
        let weak = Arc::downgrade(conn);
        let done = done_tx.clone();
        conn.channel_linked()
            .connect(move |link: &ChannelLink| {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                eprintln!("[server] remote announced {} as {}", link.type_name, link.remote_id);
                let done = done.clone();
                if link.type_name == ChatChannel::type_name() {
                    conn.create_channel::<ChatChannel>()
                        .received()
                        .connect(move |msg: &Json<ChatMessage>| {
                            let _ = done.send(format!("chat: {}", msg.msg));
                        })
                        .detach();
                } else if link.type_name == Telemetry::type_name() {
                    conn.create_channel::<Telemetry>()
                        .received()
                        .connect(move |bytes: &RawBytes| {
                            let _ = done.send(format!("telemetry: {} bytes", bytes.len()));
                        })
                        .detach();
                }
            })
            .detach();
    });

    let connection = client.create_connection(address)?;
    let chat = connection.create_channel::<ChatChannel>();
    let telemetry = connection.create_channel::<Telemetry>();
    chat.send(&Json(ChatMessage::new("hello over chat")))?;
    telemetry.send(&RawBytes::from(vec![0u8; 64]))?;

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < 2 && Instant::now() < deadline {
        server.update();
        client.update();
        seen.extend(done_rx.try_iter());
        std::thread::sleep(Duration::from_millis(2));
    }

    for line in &seen {
        eprintln!("[server] {line}");
    }
    drop(connection);
    let _ = fs::remove_dir_all(&sock_dir);

    if seen.len() == 2 {
        Ok(())
    } else {
        Err(format!("expected 2 messages, got {}", seen.len()).into())
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("multi-channel demo requires Unix domain sockets");
}
