//! End-to-end behavior of two contexts joined by an in-process network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chanlink_peer::{
    ChannelLink, ChannelType, ChannelTypeRegistry, Connection, ConnectionState, ContextConfig,
    Direction, Json, MemoryNetwork, NetworkContext, PeerError, RawBytes,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    msg: String,
}

struct ChatChannel;
impl ChannelType for ChatChannel {
    type Payload = Json<ChatMessage>;
}

struct StateChannel;
impl ChannelType for StateChannel {
    type Payload = RawBytes;
}

fn message(text: &str) -> Json<ChatMessage> {
    Json(ChatMessage {
        msg: text.to_string(),
    })
}

fn contexts(config: ContextConfig) -> (MemoryNetwork, NetworkContext, NetworkContext) {
    let network = MemoryNetwork::new();
    let server = NetworkContext::new(network.clone(), config.clone());
    let client = NetworkContext::new(network.clone(), config);
    (network, server, client)
}

fn pump(contexts: &[&NetworkContext], ticks: usize) {
    for _ in 0..ticks {
        for context in contexts {
            context.poll_io().expect("poll_io should succeed");
        }
        for context in contexts {
            context.update();
        }
    }
}

type Inbox<T> = Arc<Mutex<Vec<T>>>;

fn inbox<T>() -> Inbox<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Collect every connection a listener accepts.
fn accepted(listener: &chanlink_peer::Listener) -> Inbox<Arc<Connection>> {
    let seen = inbox();
    let sink = seen.clone();
    listener
        .connected()
        .connect(move |conn: &Arc<Connection>| sink.lock().unwrap().push(conn.clone()))
        .detach();
    seen
}

fn record_chat(conn: &Connection) -> Inbox<ChatMessage> {
    let seen = inbox();
    let sink = seen.clone();
    conn.create_channel::<ChatChannel>()
        .received()
        .connect(move |payload: &Json<ChatMessage>| sink.lock().unwrap().push(payload.0.clone()))
        .detach();
    seen
}

#[test]
fn channel_type_ids_are_distinct_and_stable() {
    let registry = ChannelTypeRegistry::new();
    let chat = registry.id_of::<ChatChannel>();
    let state = registry.id_of::<StateChannel>();

    assert_ne!(chat, state);
    for _ in 0..3 {
        assert_eq!(registry.id_of::<ChatChannel>(), chat);
        assert_eq!(registry.id_of::<StateChannel>(), state);
    }
}

#[test]
fn round_trip_fires_only_the_matching_channel() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();

    let chat_seen = inbox();
    let state_seen = Arc::new(AtomicUsize::new(0));
    {
        let chat_seen = chat_seen.clone();
        let state_seen = state_seen.clone();
        listener
            .connected()
            .connect(move |conn: &Arc<Connection>| {
                let sink = chat_seen.clone();
                conn.create_channel::<ChatChannel>()
                    .received()
                    .connect(move |p: &Json<ChatMessage>| sink.lock().unwrap().push(p.0.clone()))
                    .detach();
                let count = state_seen.clone();
                conn.create_channel::<StateChannel>()
                    .received()
                    .connect(move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                    .detach();
            })
            .detach();
    }

    let conn = client.create_connection("game").unwrap();
    let chat = conn.create_channel::<ChatChannel>();
    conn.create_channel::<StateChannel>();
    chat.send(&message("hello")).unwrap();

    pump(&[&client, &server], 6);

    assert_eq!(
        *chat_seen.lock().unwrap(),
        vec![ChatMessage {
            msg: "hello".into()
        }]
    );
    assert_eq!(state_seen.load(Ordering::SeqCst), 0);
}

#[test]
fn sends_while_pending_are_flushed_in_order_on_activation() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();
    let conns = accepted(&listener);

    let conn = client.create_connection("game").unwrap();
    assert_eq!(conn.direction(), Direction::Outgoing);
    assert_eq!(conn.state(), ConnectionState::Pending);

    let chat = conn.create_channel::<ChatChannel>();
    for text in ["one", "two", "three"] {
        chat.send(&message(text)).unwrap();
    }

    // Nothing has confirmed the session yet, so everything is still held.
    client.poll_io().unwrap();
    client.update();
    assert_eq!(conn.state(), ConnectionState::Pending);
    assert_eq!(client.packet_tracker().live(), 4);

    let server_chat = Arc::new(Mutex::new(None));
    {
        let server_chat = server_chat.clone();
        let sub = listener.connected().connect(move |c: &Arc<Connection>| {
            *server_chat.lock().unwrap() = Some(record_chat(c));
        });
        pump(&[&server, &client], 6);
        drop(sub);
    }

    assert!(conn.is_active());
    assert_eq!(conns.lock().unwrap().len(), 1);
    let seen = server_chat.lock().unwrap().clone().expect("server connection");
    let texts: Vec<String> = seen.lock().unwrap().iter().map(|m| m.msg.clone()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    assert_eq!(client.packet_tracker().live(), 0);
}

#[test]
fn packets_for_missing_channel_are_buffered_until_it_exists() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();
    let conns = accepted(&listener);

    let conn = client.create_connection("game").unwrap();
    let chat = conn.create_channel::<ChatChannel>();
    for text in ["a", "b", "c"] {
        chat.send(&message(text)).unwrap();
    }
    pump(&[&client, &server], 6);

    let server_conn = conns.lock().unwrap()[0].clone();
    assert_eq!(server_conn.direction(), Direction::Incoming);
    let remote = server_conn.remote_channels();
    assert_eq!(remote.len(), 1);
    assert!(!remote[0].bound);
    assert_eq!(remote[0].buffered, 3);

    let seen = record_chat(&server_conn);
    assert!(seen.lock().unwrap().is_empty());

    pump(&[&client, &server], 3);
    let texts: Vec<String> = seen.lock().unwrap().iter().map(|m| m.msg.clone()).collect();
    assert_eq!(texts, vec!["a", "b", "c"]);

    pump(&[&client, &server], 3);
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn unconfirmed_connection_times_out() {
    let config = ContextConfig::default().with_activation_timeout(Duration::from_millis(30));
    let (_net, _server, client) = contexts(config);

    let failures = inbox();
    let sink = failures.clone();
    client
        .connection_failed()
        .connect(move |conn: &Arc<Connection>| sink.lock().unwrap().push(conn.clone()))
        .detach();

    let conn = client.create_connection("nobody-listens").unwrap();
    let chat = conn.create_channel::<ChatChannel>();
    chat.send(&message("lost")).unwrap();
    assert_eq!(client.connection_count(), 1);

    pump(&[&client], 2);
    assert!(failures.lock().unwrap().is_empty());

    std::thread::sleep(Duration::from_millis(40));
    pump(&[&client], 2);

    let failed = failures.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(Arc::ptr_eq(&failed[0], &conn));
    assert_eq!(conn.state(), ConnectionState::TimedOut);
    assert_eq!(client.connection_count(), 0);
    assert!(matches!(chat.send(&message("late")), Err(PeerError::Closed)));
    assert_eq!(client.packet_tracker().live(), 0);
}

#[test]
fn dropping_channel_with_queued_packets_does_not_leak() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();
    let conns = accepted(&listener);

    let conn = client.create_connection("game").unwrap();
    let chat = conn.create_channel::<ChatChannel>();
    pump(&[&client, &server], 4);

    let server_conn = conns.lock().unwrap()[0].clone();
    let server_chat = server_conn.create_channel::<ChatChannel>();
    pump(&[&client, &server], 2);

    for i in 0..5 {
        chat.send(&message(&format!("m{i}"))).unwrap();
    }
    client.poll_io().unwrap();
    server.poll_io().unwrap();
    assert_eq!(server_chat.pending(), 5);

    assert!(server_conn.remove_channel::<ChatChannel>());
    drop(server_chat);
    server.update();
    server.poll_io().unwrap();

    let tracker = server.packet_tracker();
    assert_eq!(tracker.live(), 0);
    assert_eq!(tracker.leaked(), 0);
}

#[test]
fn chat_ping_is_echoed_back() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("chat").unwrap();

    let server_inbox = inbox();
    {
        let server_inbox = server_inbox.clone();
        listener
            .connected()
            .connect(move |conn: &Arc<Connection>| {
                let sink = server_inbox.clone();
                conn.create_channel::<ChatChannel>()
                    .received()
                    .connect(move |p: &Json<ChatMessage>| sink.lock().unwrap().push(p.0.clone()))
                    .detach();
            })
            .detach();
    }

    let conn = client.create_connection("chat").unwrap();
    let client_inbox = record_chat(&conn);
    conn.create_channel::<ChatChannel>()
        .send(&message("ping"))
        .unwrap();

    let mut ticks = 0;
    while server_inbox.lock().unwrap().is_empty() {
        pump(&[&client, &server], 1);
        ticks += 1;
        assert!(ticks < 20, "server never received the ping");
    }
    let received: Vec<ChatMessage> = server_inbox.lock().unwrap().drain(..).collect();
    assert_eq!(received, vec![ChatMessage { msg: "ping".into() }]);

    for server_conn in server.connections() {
        if let Some(channel) = server_conn.channel::<ChatChannel>() {
            for msg in &received {
                channel.send(&Json(msg.clone())).unwrap();
            }
        }
    }

    let mut ticks = 0;
    while client_inbox.lock().unwrap().is_empty() {
        pump(&[&client, &server], 1);
        ticks += 1;
        assert!(ticks < 20, "client never received the echo");
    }
    pump(&[&client, &server], 3);
    assert_eq!(
        *client_inbox.lock().unwrap(),
        vec![ChatMessage { msg: "ping".into() }]
    );
}

#[test]
fn server_creates_channels_on_link() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();

    let links = inbox();
    {
        let links = links.clone();
        listener
            .connected()
            .connect(move |conn: &Arc<Connection>| {
                let weak = Arc::downgrade(conn);
                let links = links.clone();
                conn.channel_linked()
                    .connect(move |link: &ChannelLink| {
                        links.lock().unwrap().push(link.type_name.clone());
                        if let Some(conn) = weak.upgrade() {
                            conn.create_channel::<StateChannel>();
                        }
                    })
                    .detach();
            })
            .detach();
    }

    let conn = client.create_connection("game").unwrap();
    let state = conn.create_channel::<StateChannel>();
    pump(&[&client, &server], 6);

    assert_eq!(
        *links.lock().unwrap(),
        vec![StateChannel::type_name().to_string()]
    );
    // The server's announce reached the client in return.
    let remote = conn.remote_channels();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].type_name, StateChannel::type_name());
    assert!(remote[0].bound);
    drop(state);
}

#[test]
fn listener_reports_disconnect_with_same_connection() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("game").unwrap();
    let conns = accepted(&listener);
    let gone = inbox();
    {
        let gone = gone.clone();
        listener
            .disconnected()
            .connect(move |conn: &Arc<Connection>| gone.lock().unwrap().push(conn.clone()))
            .detach();
    }

    let conn = client.create_connection("game").unwrap();
    pump(&[&client, &server], 4);
    let server_conn = conns.lock().unwrap()[0].clone();
    assert!(listener.is_connected(&server_conn.peer()));
    assert_eq!(server.connection_count(), 1);

    conn.request_close();
    assert_eq!(conn.state(), ConnectionState::Closing);
    pump(&[&client, &server], 4);

    let gone = gone.lock().unwrap();
    assert_eq!(gone.len(), 1);
    assert!(Arc::ptr_eq(&gone[0], &server_conn));
    assert!(server_conn.is_remote_disconnected());
    assert!(!listener.is_connected(&server_conn.peer()));
    assert_eq!(server.connection_count(), 0);
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn invalid_address_fails_at_construction() {
    let (_net, _server, client) = contexts(ContextConfig::default());
    assert!(matches!(
        client.create_connection(""),
        Err(PeerError::Transport(_))
    ));
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn connection_limit_is_enforced() {
    let config = ContextConfig::default().with_max_connections(1);
    let (_net, _server, client) = contexts(config);

    let _first = client.create_connection("a").unwrap();
    assert!(matches!(
        client.create_connection("b"),
        Err(PeerError::ConnectionLimit(1))
    ));
}

#[test]
fn io_thread_drives_the_transport() {
    let (_net, server, client) = contexts(ContextConfig::default());
    let listener = server.listen_on("threaded").unwrap();
    let server_inbox = inbox();
    {
        let server_inbox = server_inbox.clone();
        listener
            .connected()
            .connect(move |conn: &Arc<Connection>| {
                let sink = server_inbox.clone();
                let weak = Arc::downgrade(conn);
                conn.create_channel::<ChatChannel>()
                    .received()
                    .connect(move |p: &Json<ChatMessage>| {
                        sink.lock().unwrap().push(p.0.clone());
                        if let Some(chat) = weak.upgrade().and_then(|c| c.channel::<ChatChannel>()) {
                            let _ = chat.send(p);
                        }
                    })
                    .detach();
            })
            .detach();
    }

    let server_io = server.spawn_io_thread().unwrap();
    let client_io = client.spawn_io_thread().unwrap();
    assert!(server_io.is_running());

    let conn = client.create_connection("threaded").unwrap();
    let client_inbox = record_chat(&conn);
    conn.create_channel::<ChatChannel>()
        .send(&message("ping"))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while client_inbox.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "echo did not arrive");
        server.update();
        client.update();
        std::thread::sleep(Duration::from_millis(1));
    }

    client_io.stop();
    server_io.stop();
    assert_eq!(server_inbox.lock().unwrap()[0].msg, "ping");
    assert_eq!(client_inbox.lock().unwrap()[0].msg, "ping");
}

#[test]
fn enqueued_io_runs_on_next_poll() {
    let (_net, server, _client) = contexts(ContextConfig::default());
    let _listener = server.listen_on("game").unwrap();

    let hosts = Arc::new(AtomicUsize::new(usize::MAX));
    let sink = hosts.clone();
    server.enqueue_io(move |io| {
        sink.store(io.host_ids().len(), Ordering::SeqCst);
    });
    assert_eq!(hosts.load(Ordering::SeqCst), usize::MAX);

    server.poll_io().unwrap();
    assert_eq!(hosts.load(Ordering::SeqCst), 1);
}
