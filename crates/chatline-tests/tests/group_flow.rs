use chatline::protocol::{ChatType, GroupEvent, GroupEventKind, Label, MessageKind};
use chatline_tests::harness::client::{TestClient, TestSocket, text_request};
use chatline_tests::harness::relay::TestRelay;
use chatline_tests::harness::{FRAME_TIMEOUT, SILENCE};

/// alice (owner), bob, carol in group 100; dave is not a member.
async fn crew() -> TestRelay {
    let relay = TestRelay::spawn().await.unwrap();
    relay.add_user(1, "alice");
    relay.add_user(2, "bob");
    relay.add_user(3, "carol");
    relay.add_user(4, "dave");
    relay.add_group(100, "crew", 1, &[1, 2, 3]);
    relay
}

#[tokio::test]
async fn group_message_skips_sender() {
    let relay = crew().await;
    let mut alice_socket = TestSocket::connect(&relay, 1).await.unwrap();
    let mut bob_socket = TestSocket::connect(&relay, 2).await.unwrap();

    let alice = TestClient::new(&relay, 1);
    let sent = alice.send_text(100, ChatType::Group, "hello crew").await.unwrap();
    assert_eq!(sent.to_id, 100);
    assert_eq!(sent.to_name, "crew");

    let frame = bob_socket.expect_frame(FRAME_TIMEOUT).await.unwrap();
    assert_eq!(frame.envelope(), Some(&sent));

    assert!(alice_socket.next_frame(SILENCE).await.unwrap().is_none());
    assert_eq!(relay.queued(1).await, 0);
    assert_eq!(relay.queued(3).await, 1);

    let carol = TestClient::new(&relay, 3);
    let batch = carol.getmessage().await.unwrap();
    assert_eq!(batch[0].envelope().unwrap().chat_type, ChatType::Group);

    // Received group messages are filed under the sender.
    let bob = TestClient::new(&relay, 2);
    assert_eq!(bob.history(ChatType::Group, 1, None).await.unwrap(), vec![sent]);
    assert!(bob.history(ChatType::Group, 100, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn outsiders_cannot_post() {
    let relay = crew().await;
    let dave = TestClient::new(&relay, 4);
    let (status, body) = dave
        .try_send(&text_request(100, ChatType::Group, "let me in"))
        .await
        .unwrap();
    assert_eq!(status, 403);
    assert_eq!(body["msg"], "fail");

    let (status, _) = dave
        .try_send(&text_request(555, ChatType::Group, "anyone?"))
        .await
        .unwrap();
    assert_eq!(status, 404);
}

#[tokio::test]
async fn dissolved_group_rejects_messages() {
    let relay = crew().await;
    let mut group = relay.add_group(100, "crew", 1, &[1, 2, 3]);
    group.active = false;
    relay.directory.upsert_group(group);

    let bob = TestClient::new(&relay, 2);
    let (status, _) = bob
        .try_send(&text_request(100, ChatType::Group, "hello?"))
        .await
        .unwrap();
    assert_eq!(status, 404);
}

#[tokio::test]
async fn group_recall_reaches_everyone_but_actor() {
    let relay = crew().await;
    let mut bob_socket = TestSocket::connect(&relay, 2).await.unwrap();
    let alice = TestClient::new(&relay, 1);

    let sent = alice.send_text(100, ChatType::Group, "typo").await.unwrap();
    bob_socket.expect_frame(FRAME_TIMEOUT).await.unwrap();
    alice.recall(100, ChatType::Group, sent.id).await.unwrap();

    let frame = bob_socket.expect_frame(FRAME_TIMEOUT).await.unwrap();
    assert_eq!(frame.msg, Label::Recall);
    assert_eq!(frame.tombstone().unwrap().id, sent.id);

    let carol = TestClient::new(&relay, 3);
    let labels: Vec<_> = carol.getmessage().await.unwrap().iter().map(|f| f.msg).collect();
    assert_eq!(labels, vec![Label::Ok, Label::Recall]);
    assert_eq!(relay.queued(1).await, 0);
}

#[tokio::test]
async fn group_notices_include_actor() {
    let relay = crew().await;
    let group = relay.add_group(100, "crew", 1, &[1, 2, 3]);
    let mut bob_socket = TestSocket::connect(&relay, 2).await.unwrap();

    let (status, body) = relay
        .internal(
            "/internal/group/event",
            &GroupEvent {
                actor_id: 2,
                group: group.clone(),
                kind: GroupEventKind::Announced {
                    remark: "meet at 6".to_string(),
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(status, 200);
    assert_eq!(body["data"]["data"], "[Announcement] meet at 6");

    let frame = bob_socket.expect_frame(FRAME_TIMEOUT).await.unwrap();
    let envelope = frame.envelope().unwrap();
    assert_eq!(envelope.kind, MessageKind::System);
    assert_eq!(envelope.from_id, 2);
    assert_eq!(relay.queued(1).await, 1);
    assert_eq!(relay.queued(3).await, 1);

    let (_, body) = relay
        .internal(
            "/internal/group/event",
            &GroupEvent {
                actor_id: 1,
                group,
                kind: GroupEventKind::Quit,
            },
        )
        .await
        .unwrap();
    assert_eq!(body["data"]["data"], "This group has been dissolved");
}

#[tokio::test]
async fn internal_routes_require_secret() {
    let relay = crew().await;
    let group = relay.add_group(100, "crew", 1, &[1, 2, 3]);
    let (status, body) = relay
        .internal_with(
            "/internal/group/event",
            "wrong",
            &GroupEvent {
                actor_id: 1,
                group,
                kind: GroupEventKind::Created,
            },
        )
        .await
        .unwrap();
    assert_eq!(status, 401);
    assert_eq!(body["msg"], "fail");
    assert_eq!(relay.queued(2).await, 0);
}
