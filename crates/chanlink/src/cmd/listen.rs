use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chanlink::chat::{ChatChannel, ChatMessage};
use chanlink::{Connection, Json};
use crossbeam_channel::Sender;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, socket_address, ListenArgs, Session, Settings};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat, Received};

pub fn run(args: ListenArgs, format: OutputFormat, settings: &Settings) -> CliResult<i32> {
    let address = socket_address(&args.path)?;
    let session = Session::start(settings)?;
    let listener = session
        .context()
        .listen_on(address)
        .map_err(|err| peer_error("bind failed", err))?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let _accepted = listener
        .connected()
        .connect(move |conn: &Arc<Connection>| record_chat(conn, tx.clone()));

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        session.tick();
        for received in rx.try_iter() {
            print_message(&received, format);
            printed = printed.saturating_add(1);

            if args.count.is_some_and(|count| printed >= count) {
                return Ok(SUCCESS);
            }
        }
    }

    Ok(SUCCESS)
}

fn record_chat(conn: &Arc<Connection>, sink: Sender<Received>) {
    info!(peer = %conn.peer(), "peer connected");
    let chat = conn.create_channel::<ChatChannel>();
    let channel_id = chat.id();
    let peer = conn.peer();
    chat.received()
        .connect(move |payload: &Json<ChatMessage>| {
            let _ = sink.send(Received::on(peer, channel_id, payload.0.clone()));
        })
        .detach();
}
