use std::time::Duration;

use super::*;
use crate::{
    events::EventKind,
    gateway::api::MESSAGES_ENDPOINT,
    http::Method,
    support::{drain, gateway, message, FakeTransport, ScriptedDispatcher, StaticCredential},
};
use serde_json::json;
use shared::domain::UserId;
use tokio::sync::mpsc;

const GENERAL: ChannelId = ChannelId(1);
const RANDOM: ChannelId = ChannelId(2);

struct Rig {
    dispatcher: Arc<ScriptedDispatcher>,
    transport: Arc<FakeTransport>,
    coordinator: Arc<ChannelSyncCoordinator>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

fn rig(connected: bool) -> Rig {
    let dispatcher = ScriptedDispatcher::new();
    let transport = FakeTransport::new(connected);
    let gw = gateway(
        Arc::clone(&dispatcher),
        Arc::new(StaticCredential(Some("tok".into()))),
    );
    let registry = Arc::new(EventRegistry::new());
    let events = registry.channel(&EventKind::ALL);
    let push: Arc<dyn PushTransport> = transport.clone();
    let coordinator =
        ChannelSyncCoordinator::new(gw, Some(push), registry, &ClientSettings::default());
    Rig {
        dispatcher,
        transport,
        coordinator,
        events,
    }
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn join_cmd(channel: ChannelId) -> PushCommand {
    PushCommand::JoinChannel {
        channel_id: channel,
    }
}

fn leave_cmd(channel: ChannelId) -> PushCommand {
    PushCommand::LeaveChannel {
        channel_id: channel,
    }
}

#[tokio::test(start_paused = true)]
async fn join_uses_polling_while_disconnected() {
    let mut rig = rig(false);

    let mode = rig.coordinator.join(GENERAL).await;

    assert_eq!(mode, TransportMode::Poll);
    assert_eq!(rig.coordinator.active_channel(), Some(GENERAL));
    assert_eq!(rig.coordinator.poll_engine().channel(), Some(GENERAL));
    assert!(rig.transport.sent().is_empty());
    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::ChannelJoined {
            channel_id: GENERAL,
            mode: TransportMode::Poll,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn joining_the_active_channel_again_is_a_no_op() {
    let mut rig = rig(true);

    rig.coordinator.join(GENERAL).await;
    drain(&mut rig.events);
    rig.coordinator.join(GENERAL).await;

    assert_eq!(rig.transport.sent(), [join_cmd(GENERAL)]);
    assert!(drain(&mut rig.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn switching_channels_leaves_before_joining() {
    let rig = rig(true);

    rig.coordinator.join(GENERAL).await;
    rig.coordinator.join(RANDOM).await;

    assert_eq!(
        rig.transport.sent(),
        [join_cmd(GENERAL), leave_cmd(GENERAL), join_cmd(RANDOM)]
    );
    assert_eq!(rig.coordinator.active_channel(), Some(RANDOM));
}

#[tokio::test(start_paused = true)]
async fn concurrent_joins_apply_in_call_order() {
    let rig = rig(true);

    tokio::join!(
        rig.coordinator.join(GENERAL),
        rig.coordinator.join(RANDOM),
        rig.coordinator.join(ChannelId(3)),
    );

    assert_eq!(
        rig.transport.sent(),
        [
            join_cmd(GENERAL),
            leave_cmd(GENERAL),
            join_cmd(RANDOM),
            leave_cmd(RANDOM),
            join_cmd(ChannelId(3)),
        ]
    );
    assert_eq!(rig.coordinator.active_channel(), Some(ChannelId(3)));
}

#[tokio::test(start_paused = true)]
async fn channel_joined_is_emitted_even_when_the_join_frame_fails() {
    let mut rig = rig(true);
    rig.transport.fail_sends(true);

    let mode = rig.coordinator.join(GENERAL).await;

    assert_eq!(mode, TransportMode::Push);
    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::ChannelJoined {
            channel_id: GENERAL,
            mode: TransportMode::Push,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn inbound_events_are_filtered_and_deduplicated() {
    let mut rig = rig(true);
    rig.coordinator.start();
    rig.coordinator.join(GENERAL).await;
    drain(&mut rig.events);

    rig.transport
        .deliver(PushEvent::NewMessage(message(1, GENERAL.0, "hello")));
    rig.transport
        .deliver(PushEvent::NewMessage(message(2, RANDOM.0, "elsewhere")));
    rig.transport
        .deliver(PushEvent::NewMessage(message(1, GENERAL.0, "hello")));
    rig.transport.deliver(PushEvent::UserTyping {
        channel_id: GENERAL,
        user_id: UserId(9),
        username: Some("bob".into()),
    });
    rig.transport.deliver(PushEvent::UserOffline {
        channel_id: GENERAL,
        user_id: UserId(9),
    });
    tick().await;

    assert_eq!(
        drain(&mut rig.events),
        vec![
            SyncEvent::MessageAdded(message(1, GENERAL.0, "hello")),
            SyncEvent::TypingStart {
                channel_id: GENERAL,
                user_id: UserId(9),
                username: Some("bob".into()),
            },
            SyncEvent::PresenceChanged {
                channel_id: GENERAL,
                user_id: UserId(9),
                online: false,
            },
        ]
    );
    assert_eq!(rig.coordinator.router().newest_seen(), Some(MessageId(1)));
}

#[tokio::test(start_paused = true)]
async fn losing_the_push_connection_falls_back_to_polling_and_back() {
    let mut rig = rig(true);
    rig.coordinator.start();
    rig.coordinator.join(GENERAL).await;
    rig.transport
        .deliver(PushEvent::NewMessage(message(40, GENERAL.0, "last pushed")));
    tick().await;
    drain(&mut rig.events);

    rig.transport.set_connected(false);
    tick().await;

    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::TransportChanged {
            mode: TransportMode::Poll
        }]
    );
    assert_eq!(rig.coordinator.poll_engine().channel(), Some(GENERAL));
    let polls = rig.dispatcher.calls_to(MESSAGES_ENDPOINT);
    assert!(polls[0]
        .query
        .contains(&("since_message_id".to_string(), "40".to_string())));

    rig.transport.set_connected(true);
    tick().await;

    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::TransportChanged {
            mode: TransportMode::Push
        }]
    );
    assert!(!rig.coordinator.poll_engine().is_running());
    assert_eq!(
        rig.transport.sent(),
        [join_cmd(GENERAL), join_cmd(GENERAL)],
        "join intent replayed on reconnect"
    );
}

#[tokio::test(start_paused = true)]
async fn push_that_came_up_before_start_still_falls_back_when_lost() {
    let rig = rig(false);
    rig.transport.set_connected(true);
    rig.coordinator.start();

    assert_eq!(rig.coordinator.join(GENERAL).await, TransportMode::Push);
    tick().await;
    assert!(!rig.coordinator.poll_engine().is_running());

    rig.transport.set_connected(false);
    tick().await;

    assert!(rig.coordinator.poll_engine().is_running());
    assert_eq!(rig.coordinator.poll_engine().channel(), Some(GENERAL));
}

#[tokio::test(start_paused = true)]
async fn switching_channel_from_a_message_handler_drops_the_old_channel() {
    let mut rig = rig(true);
    rig.coordinator.start();
    rig.coordinator.join(ChannelId(42)).await;
    let weak = Arc::downgrade(&rig.coordinator);
    rig.coordinator
        .registry()
        .subscribe(EventKind::MessageAdded, move |_| {
            if let Some(coordinator) = weak.upgrade() {
                tokio::spawn(async move {
                    coordinator.join(ChannelId(43)).await;
                });
            }
            Ok(())
        });
    drain(&mut rig.events);

    rig.transport
        .deliver(PushEvent::NewMessage(message(7, 42, "first")));
    tick().await;
    assert_eq!(rig.coordinator.active_channel(), Some(ChannelId(43)));

    rig.transport
        .deliver(PushEvent::NewMessage(message(8, 42, "too late")));
    tick().await;

    let added: Vec<_> = drain(&mut rig.events)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::MessageAdded(message) => Some(message.id),
            _ => None,
        })
        .collect();
    assert_eq!(added, [MessageId(7)]);
}

#[tokio::test(start_paused = true)]
async fn repeated_connectivity_notifications_switch_once() {
    let mut rig = rig(false);
    rig.coordinator.start();

    rig.transport.set_connected(false);
    tick().await;
    assert!(drain(&mut rig.events).is_empty());

    rig.transport.set_connected(true);
    tick().await;
    rig.transport.set_connected(true);
    tick().await;
    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::TransportChanged {
            mode: TransportMode::Push
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn send_goes_over_push_when_connected() {
    let rig = rig(true);
    rig.coordinator.join(GENERAL).await;

    let outcome = rig.coordinator.send_message(GENERAL, "hi").await;

    assert!(matches!(outcome, SendOutcome::Pushed));
    assert!(rig.transport.sent().contains(&PushCommand::SendMessage {
        channel_id: GENERAL,
        content: "hi".into(),
    }));
    assert_eq!(rig.dispatcher.count(MESSAGES_ENDPOINT), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_push_send_falls_back_to_the_gateway() {
    let mut rig = rig(true);
    rig.coordinator.join(GENERAL).await;
    drain(&mut rig.events);
    rig.transport.fail_sends(true);
    rig.dispatcher.always_for(
        Method::Post,
        MESSAGES_ENDPOINT,
        200,
        json!({ "success": true, "message": message(77, GENERAL.0, "hi") }),
    );

    let outcome = rig.coordinator.send_message(GENERAL, "hi").await;

    match outcome {
        SendOutcome::Stored(stored) => assert_eq!(stored.id, MessageId(77)),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        drain(&mut rig.events),
        vec![SyncEvent::MessageAdded(message(77, GENERAL.0, "hi"))]
    );
}

#[tokio::test(start_paused = true)]
async fn offline_send_reports_an_error_event() {
    let mut rig = rig(false);
    rig.dispatcher
        .always_offline_for(Method::Post, MESSAGES_ENDPOINT);
    rig.coordinator.join(GENERAL).await;
    drain(&mut rig.events);

    let outcome = rig.coordinator.send_message(GENERAL, "lost").await;

    match &outcome {
        SendOutcome::Failed(err) => assert!(err.is_network_error()),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!outcome.is_delivered());
    let events = drain(&mut rig.events);
    assert!(matches!(
        events.as_slice(),
        [SyncEvent::MessageSendError { channel_id, content, .. }]
            if *channel_id == GENERAL && content == "lost"
    ));
}

#[tokio::test(start_paused = true)]
async fn leave_clears_active_channel_only_without_explicit_id() {
    let rig = rig(true);
    rig.coordinator.join(GENERAL).await;

    rig.coordinator.leave(Some(GENERAL)).await;
    assert_eq!(rig.coordinator.active_channel(), Some(GENERAL));

    rig.coordinator.leave(None).await;
    assert_eq!(rig.coordinator.active_channel(), None);
    assert_eq!(
        rig.transport.sent(),
        [join_cmd(GENERAL), leave_cmd(GENERAL), leave_cmd(GENERAL)]
    );

    rig.coordinator.leave(None).await;
    assert_eq!(rig.transport.sent().len(), 3, "nothing left to leave");
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_polling_and_listening() {
    let mut rig = rig(false);
    rig.coordinator.start();
    rig.coordinator.join(GENERAL).await;
    tick().await;
    drain(&mut rig.events);

    rig.coordinator.shutdown();
    assert!(!rig.coordinator.poll_engine().is_running());

    rig.transport.set_connected(true);
    tick().await;
    assert!(drain(&mut rig.events).is_empty());
}

#[test]
fn switching_active_channel_forgets_seen_ids() {
    let registry = Arc::new(EventRegistry::new());
    let router = InboundRouter::new(Arc::clone(&registry));

    router.set_active(Some(GENERAL));
    assert!(router.ingest(PushEvent::NewMessage(message(5, GENERAL.0, "a"))));
    assert!(!router.ingest(PushEvent::NewMessage(message(5, GENERAL.0, "a"))));
    assert_eq!(router.newest_seen(), Some(MessageId(5)));

    router.set_active(Some(RANDOM));
    assert_eq!(router.newest_seen(), None);
    assert!(!router.ingest(PushEvent::NewMessage(message(6, GENERAL.0, "late"))));

    router.set_active(None);
    assert!(!router.ingest(PushEvent::MessageDeleted {
        channel_id: RANDOM,
        message_id: MessageId(1),
    }));
}

#[test]
fn seen_ids_are_bounded() {
    let mut seen = SeenMessages::default();
    for id in 0..(SEEN_MESSAGE_CAPACITY as i64 + 10) {
        assert!(seen.record(MessageId(id)));
    }
    assert_eq!(seen.ids.len(), SEEN_MESSAGE_CAPACITY);
    assert!(seen.record(MessageId(0)), "evicted ids are accepted again");
    assert_eq!(seen.newest, Some(MessageId(SEEN_MESSAGE_CAPACITY as i64 + 9)));
}
