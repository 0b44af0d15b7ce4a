use std::collections::BTreeSet;
use std::time::Duration;

use mpchat_core::test_support::{Call, RecordingTransport};
use mpchat_core::{
    codec, ConnectError, ConnectFailure, DiscoveryRole, Envelope, Error, Event, Introduction,
    Notification, PeerId, PeerIdentity, PeerStatus, SessionCoordinator, SessionId, SessionState,
};
use mpchat_runtime::{service, EventSink, ServiceError, ServiceHandle, SledStore};

struct Harness {
    handle: ServiceHandle,
    sink: EventSink,
    transport: RecordingTransport,
}

fn start() -> Harness {
    let _ = tracing_subscriber::fmt::try_init();
    let transport = RecordingTransport::new();
    let me = PeerIdentity::new(PeerId::generate(), "Me");
    let store = SledStore::temporary().unwrap();
    let coordinator = SessionCoordinator::new(me, transport.clone(), store);
    let (handle, sink, _task) = service::spawn(coordinator);
    Harness {
        handle,
        sink,
        transport,
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

fn found(peer: PeerId, name: &str) -> Event {
    Event::PeerFound {
        peer,
        display_name: name.into(),
    }
}

fn connected(peer: PeerId, session: SessionId) -> Event {
    Event::SessionStateChanged {
        peer,
        session,
        state: SessionState::Connected,
        connected: vec![peer],
    }
}

/// Starts a connect in the background and returns once the invite went out.
async fn invite(h: &Harness, peer: PeerId) -> (tokio::task::JoinHandle<Result<(), ServiceError>>, SessionId) {
    let handle = h.handle.clone();
    let pending = tokio::spawn(async move { handle.connect(peer).await });
    wait_for(|| h.transport.invites().iter().any(|(p, _)| *p == peer)).await;
    let session = h
        .transport
        .invites()
        .into_iter()
        .find(|(p, _)| *p == peer)
        .map(|(_, s)| s)
        .unwrap();
    (pending, session)
}

#[tokio::test(start_paused = true)]
async fn connect_resolves_when_session_connects() {
    let h = start();
    h.handle.start_discovery().await.unwrap();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();

    let (pending, session) = invite(&h, b).await;
    h.sink.deliver(connected(b, session)).unwrap();
    pending.await.unwrap().unwrap();

    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].status, PeerStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_and_peer_stays_available() {
    let h = start();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();

    let err = h.handle.connect(b).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Core(Error::ConnectFailed(ConnectFailure::Timeout))
    ));
    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers[0].status, PeerStatus::Available);
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected_without_new_session() {
    let h = start();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();
    let (_pending, _session) = invite(&h, b).await;

    let err = h.handle.connect(b).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Core(Error::Connect(ConnectError::InProgress(p))) if p == b
    ));
    assert_eq!(h.transport.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_to_unknown_peer_fails_fast() {
    let h = start();
    let err = h.handle.connect(PeerId::generate()).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Core(Error::Connect(ConnectError::UnknownPeer(_)))
    ));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invitation_is_broadcast_and_accepted() {
    let h = start();
    let mut notes = h.handle.notifications();
    let c = PeerId::generate();
    h.sink
        .deliver(Event::InvitationReceived {
            peer: c,
            display_name: "C".into(),
        })
        .unwrap();
    let note = notes.recv().await.unwrap();
    assert!(matches!(note, Notification::InvitationReceived { peer, .. } if peer == c));

    h.handle.accept().await.unwrap();
    assert!(h
        .transport
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Respond { peer, session: Some(_) } if *peer == c)));
    let peers = h.handle.peers().await.unwrap();
    assert_eq!(peers[0].status, PeerStatus::Connecting);

    let err = h.handle.decline().await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Core(Error::Connect(ConnectError::NoPendingInvitation))
    ));
}

#[tokio::test(start_paused = true)]
async fn discovery_start_failure_is_notified() {
    let h = start();
    h.transport.fail_advertise("bluetooth off");
    let mut notes = h.handle.notifications();
    h.handle.start_discovery().await.unwrap();
    let note = notes.recv().await.unwrap();
    assert_eq!(
        note,
        Notification::DiscoveryStartFailed {
            role: DiscoveryRole::Advertiser,
            reason: "advertiser failed to start: bluetooth off".into(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn messages_flow_both_ways_and_persist() {
    let h = start();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();
    let (pending, session) = invite(&h, b).await;
    h.sink.deliver(connected(b, session)).unwrap();
    pending.await.unwrap().unwrap();

    let mut conversation = h.handle.subscribe(b).await.unwrap();
    let sent = h
        .handle
        .send_text("hello", BTreeSet::from([b]))
        .await
        .unwrap()
        .expect("sent");
    assert_eq!(conversation.recv().await.unwrap(), sent);

    let intro = Introduction {
        peer_id: b,
        display_name: "Bea".into(),
        avatar: None,
    };
    h.sink
        .deliver(Event::DataReceived {
            peer: b,
            bytes: codec::encode_introduction(&intro).unwrap(),
        })
        .unwrap();
    let reply = Envelope::text("hi back");
    h.sink
        .deliver(Event::DataReceived {
            peer: b,
            bytes: codec::encode_envelope(&reply).unwrap(),
        })
        .unwrap();
    let received = conversation.recv().await.unwrap();
    assert_eq!(received.id, reply.message_id);
    assert_eq!(received.sender, b);

    let history = h.handle.load_more_messages(b).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|m| m.id == sent.id));
    assert!(history.iter().any(|m| m.id == reply.message_id));
    assert_eq!(h.handle.known_peers().await.unwrap()[0].display_name, "Bea");
    assert!(h.handle.resend_introduction(b).await.unwrap());

    assert_eq!(h.handle.remove_all_messages().await.unwrap(), 2);
    assert!(h.handle.load_more_messages(b).await.unwrap().is_empty());
    assert_eq!(h.handle.known_peers().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_without_session_reports_failure() {
    let h = start();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();
    let result = h
        .handle
        .send_image(vec![1, 2, 3], BTreeSet::from([b]))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(h.transport.sends().is_empty());
}

#[tokio::test(start_paused = true)]
async fn removal_restarts_browsing_after_settle_delay() {
    let h = start();
    h.handle.start_discovery().await.unwrap();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();
    h.handle.remove_peer(b).await.unwrap();
    assert_eq!(h.transport.calls().last(), Some(&Call::StopBrowse));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.handle.peers().await.unwrap();
    let browses = h
        .transport
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Browse(_)))
        .count();
    assert_eq!(browses, 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_service() {
    let h = start();
    h.handle.start_discovery().await.unwrap();
    let b = PeerId::generate();
    h.sink.deliver(found(b, "B")).unwrap();
    let (pending, _session) = invite(&h, b).await;

    h.handle.shutdown().await.unwrap();
    assert!(h.transport.calls().contains(&Call::StopAdvertise));
    assert!(matches!(pending.await.unwrap(), Err(ServiceError::Closed)));
    assert!(matches!(h.handle.peers().await, Err(ServiceError::Closed)));
    assert!(h.sink.deliver(found(b, "B")).is_err());
}

#[tokio::test]
async fn start_opens_store_under_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = mpchat_runtime::Config {
        data_dir: Some(dir.path().to_path_buf()),
        ..mpchat_runtime::Config::default()
    };
    let me = PeerIdentity::new(PeerId::generate(), "Me");
    let (handle, _sink, _task) =
        mpchat_runtime::start(&config, me, RecordingTransport::new()).unwrap();
    assert!(handle.peers().await.unwrap().is_empty());
    assert!(dir.path().join("mpchat.db").exists());
    handle.shutdown().await.unwrap();
}
