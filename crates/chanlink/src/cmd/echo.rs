use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chanlink::chat::{ChatChannel, ChatMessage};
use chanlink::{Connection, Json, NetworkContext};
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, socket_address, EchoArgs, Session, Settings};
use crate::exit::{peer_error, CliResult, SUCCESS};

pub fn run(args: EchoArgs, settings: &Settings) -> CliResult<i32> {
    let address = socket_address(&args.path)?;
    let session = Session::start(settings)?;
    let listener = session
        .context()
        .listen_on(address)
        .map_err(|err| peer_error("bind failed", err))?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let _accepted = listener
        .connected()
        .connect(move |conn: &Arc<Connection>| attach_chat(conn, tx.clone()));
    let _departed = listener.disconnected().connect(|conn: &Arc<Connection>| {
        info!(peer = %conn.peer(), "peer disconnected");
    });

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    while running.load(Ordering::SeqCst) {
        session.tick();
        for message in rx.try_iter() {
            let sent = echo_to_all(session.context(), &message);
            debug!(msg = %message.msg, peers = sent, "echoed chat message");
        }
    }

    Ok(SUCCESS)
}

fn attach_chat(conn: &Arc<Connection>, sink: Sender<ChatMessage>) {
    info!(peer = %conn.peer(), "peer connected");
    conn.create_channel::<ChatChannel>()
        .received()
        .connect(move |payload: &Json<ChatMessage>| {
            let _ = sink.send(payload.0.clone());
        })
        .detach();
}

/// Send `message` on the chat channel of every connection that has one.
fn echo_to_all(context: &NetworkContext, message: &ChatMessage) -> usize {
    let payload = Json(message.clone());
    let mut sent = 0;
    for connection in context.connections() {
        let Some(chat) = connection.channel::<ChatChannel>() else {
            continue;
        };
        match chat.send(&payload) {
            Ok(()) => sent += 1,
            Err(err) => warn!(peer = %connection.peer(), error = %err, "echo send failed"),
        }
    }
    sent
}
