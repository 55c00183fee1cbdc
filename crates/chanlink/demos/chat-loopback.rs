//! Chat loopback: a client and an echo server in one process, joined by the
//! in-process network.
//!
//! Run with:
//!   cargo run --example chat-loopback

use std::sync::Arc;
use std::time::{Duration, Instant};

use chanlink::chat::{ChatChannel, ChatMessage};
use chanlink::transport::MemoryNetwork;
use chanlink::{Connection, ContextConfig, Json, NetworkContext};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let network = MemoryNetwork::new();
    let server = NetworkContext::new(network.clone(), ContextConfig::default());
    let client = NetworkContext::new(network, ContextConfig::default());
    let _server_io = server.spawn_io_thread()?;
    let _client_io = client.spawn_io_thread()?;

    let listener = server.listen_on("lobby")?;
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded::<ChatMessage>();
    let _accepted = listener.connected().connect(move |conn: &Arc<Connection>| {
        eprintln!("[server] peer connected: {}", conn.peer());
        let sink = inbound_tx.clone();
        conn.create_channel::<ChatChannel>()
            .received()
            .connect(move |payload: &Json<ChatMessage>| {
                let _ = sink.send(payload.0.clone());
            })
            .detach();
    });

    let connection = client.create_connection("lobby")?;
    let chat = connection.create_channel::<ChatChannel>();
    let (reply_tx, reply_rx) = crossbeam_channel::unbounded::<ChatMessage>();
    let _replies = chat.received().connect(move |payload: &Json<ChatMessage>| {
        let _ = reply_tx.send(payload.0.clone());
    });

    // Sent while the connection is still pending; delivered once it activates.
    chat.send(&Json(ChatMessage::new("ping")))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        server.update();
        client.update();

        for message in inbound_rx.try_iter() {
            eprintln!("[server] received: {}", message.msg);
            for conn in server.connections() {
                if let Some(echo) = conn.channel::<ChatChannel>() {
                    echo.send(&Json(message.clone()))?;
                }
            }
        }

        if let Ok(reply) = reply_rx.try_recv() {
            eprintln!("[client] echoed back: {}", reply.msg);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    Err("no echo within 5s".into())
}
