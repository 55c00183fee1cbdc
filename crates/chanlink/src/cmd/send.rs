use std::time::{Duration, Instant};

use chanlink::chat::{ChatChannel, ChatMessage};
use chanlink::{Connection, Json};
use crossbeam_channel::Receiver;
use tracing::info;

use crate::cmd::{parse_duration, socket_address, SendArgs, Session, Settings};
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat, Received};

pub fn run(args: SendArgs, format: OutputFormat, settings: &Settings) -> CliResult<i32> {
    let address = socket_address(&args.path)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let session = Session::start(settings)?;

    let connection = session
        .context()
        .create_connection(address)
        .map_err(|err| peer_error("connect failed", err))?;
    let chat = connection.create_channel::<ChatChannel>();
    let (tx, rx) = crossbeam_channel::unbounded();
    let _replies = chat.received().connect(move |payload: &Json<ChatMessage>| {
        let _ = tx.send(payload.0.clone());
    });

    // Held by the connection until the socket session is confirmed.
    chat.send(&Json(ChatMessage::new(args.message)))
        .map_err(|err| peer_error("send failed", err))?;

    session.wait_for_activation(&connection)?;
    info!(peer = %connection.peer(), "message sent");

    if args.wait {
        let reply = wait_for_reply(&session, &connection, &rx, wait_timeout)?;
        print_message(&Received::on(connection.peer(), chat.id(), reply), format);
    }

    Ok(SUCCESS)
}

fn wait_for_reply(
    session: &Session,
    connection: &Connection,
    replies: &Receiver<ChatMessage>,
    timeout: Duration,
) -> CliResult<ChatMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        session.tick();
        if let Ok(reply) = replies.try_recv() {
            return Ok(reply);
        }
        if connection.is_remote_disconnected() {
            return Err(CliError::new(
                FAILURE,
                "receive failed: peer disconnected before replying",
            ));
        }
        if Instant::now() >= deadline {
            return Err(CliError::new(
                TIMEOUT,
                format!("receive failed: no reply within {timeout:?}"),
            ));
        }
    }
}
