mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{guest, host, try_event, World};
use duet_core::call::{CallFailure, CallStatus};
use duet_core::{Command, Event};
use duet_proto::{session_topic, Envelope, Message};
use transport_bus::{Bus, ConnectOptions, PublishOptions};

async fn connected_call(world: &World) -> (common::Peer, common::Peer) {
    let (host, mut guest) = world.pair().await;
    host.send(Command::StartCall);
    guest.event(|e| matches!(e, Event::IncomingCall)).await;
    guest.send(Command::AcceptCall);
    host.call_status(CallStatus::Connected).await;
    guest.call_status(CallStatus::Connected).await;
    (host, guest)
}

fn media_released(peer: &common::Peer) -> bool {
    let captured = peer.devices.captured();
    !captured.is_empty() && captured.iter().all(|stream| stream.is_stopped())
}

#[test_timeout::tokio_timeout_test]
async fn caller_hang_up_returns_both_sides_to_idle() {
    let world = World::new();
    let (host, guest) = connected_call(&world).await;

    host.send(Command::EndCall);
    host.call_status(CallStatus::Idle).await;
    guest.call_status(CallStatus::Idle).await;
    assert!(media_released(&host));
    assert!(media_released(&guest));
}

#[test_timeout::tokio_timeout_test]
async fn callee_hang_up_returns_both_sides_to_idle() {
    let world = World::new();
    let (host, guest) = connected_call(&world).await;

    guest.send(Command::EndCall);
    guest.call_status(CallStatus::Idle).await;
    host.call_status(CallStatus::Idle).await;
    assert!(media_released(&host));
    assert!(media_released(&guest));
}

#[test_timeout::tokio_timeout_test]
async fn declined_call_is_reported_to_the_caller() {
    let world = World::new();
    let (mut host, mut guest) = world.pair().await;

    host.send(Command::StartCall);
    guest.event(|e| matches!(e, Event::IncomingCall)).await;
    guest.send(Command::RejectCall);

    host.event(|e| matches!(e, Event::CallDeclined)).await;
    host.call_status(CallStatus::Idle).await;
    guest.call_status(CallStatus::Idle).await;
    assert!(media_released(&host));
    assert!(guest.devices.captured().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn reject_without_an_offer_is_not_reported() {
    let world = World::new();
    let (mut host, _guest) = world.pair().await;

    let stray = world
        .broker
        .connect_local(ConnectOptions::new("stray"))
        .expect("connect");
    let envelope = Envelope::new(Message::CallReject {}, "stray")
        .to_json()
        .expect("encode");
    stray
        .publish(&session_topic(common::CODE), Bytes::from(envelope), PublishOptions::TRANSIENT)
        .expect("publish");

    let declined = try_event(
        &mut host.events,
        |e| matches!(e, Event::CallDeclined),
        Duration::from_millis(300),
    )
    .await;
    assert!(declined.is_none(), "idle caller must not see a decline");
    assert_eq!(host.handle.call_state().status, CallStatus::Idle);
}

#[test_timeout::tokio_timeout_test]
async fn denied_camera_fails_the_call_cleanly() {
    let world = World::new();
    let (mut host, _guest) = world.pair().await;
    host.devices.deny_permission(true);

    host.send(Command::StartCall);
    let failed = host.event(|e| matches!(e, Event::CallFailed(_))).await;
    assert!(matches!(failed, Event::CallFailed(CallFailure::PermissionDenied)));
    assert_eq!(host.handle.call_state().status, CallStatus::Idle);
}

#[test_timeout::tokio_timeout_test]
async fn partner_departure_ends_the_call() {
    let world = World::new();
    let (mut host, guest) = connected_call(&world).await;

    guest.abort();
    host.event(|e| matches!(e, Event::PartnerDisconnected { .. })).await;
    host.call_status(CallStatus::Idle).await;
    assert!(media_released(&host));
}

#[test_timeout::tokio_timeout_test]
async fn mute_and_camera_toggle_local_tracks() {
    let world = World::new();
    let (host, _guest) = connected_call(&world).await;

    host.send(Command::ToggleMute);
    host.send(Command::ToggleVideo);
    let mut call = host.handle.watch_call();
    let state = *call
        .wait_for(|c| c.muted && !c.video_enabled)
        .await
        .expect("participant running");
    assert_eq!(state.status, CallStatus::Connected);
    let local = host.devices.captured()[0].clone();
    assert!(!local.audio_enabled());
    assert!(!local.video_enabled());
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn call_without_partner_fails_after_one_retry() {
    let world = World::new();
    let mut host = world.spawn(host());
    host.connected().await;

    host.send(Command::StartCall);
    host.call_status(CallStatus::Offering).await;
    let failed = host.event(|e| matches!(e, Event::CallFailed(_))).await;
    assert!(matches!(failed, Event::CallFailed(CallFailure::PartnerUnreachable)));
    assert_eq!(host.handle.call_state().status, CallStatus::Idle);
    assert!(media_released(&host));
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn call_retry_reaches_a_partner_who_arrives_in_time() {
    let world = World::new();
    let mut host = world.spawn(host());
    host.connected().await;

    host.send(Command::StartCall);
    host.call_status(CallStatus::Offering).await;
    let mut guest = world.spawn(guest());
    host.event(|e| matches!(e, Event::PartnerJoined { .. })).await;

    guest.event(|e| matches!(e, Event::IncomingCall)).await;
    guest.send(Command::AcceptCall);
    host.call_status(CallStatus::Connected).await;
    guest.call_status(CallStatus::Connected).await;
}
