use std::sync::Arc;

use duet_chat::{
    ChatCore, ChatSettings, ConversationSession, ErrorKind, SessionContext, StaticAuthenticator,
    StaticProfiles, UserId, parse_user, resolve,
};

fn user(raw: &str) -> UserId {
    parse_user(raw).expect("valid user id")
}

fn profiles() -> Arc<StaticProfiles> {
    Arc::new(
        StaticProfiles::new()
            .with_user(user("alice"), "Alice")
            .with_user(user("bob"), "Bob")
            .with_user(user("carol"), "Carol"),
    )
}

fn session_for(
    core: &ChatCore,
    local: &str,
    profiles: Arc<StaticProfiles>,
) -> (ConversationSession, Arc<StaticAuthenticator>) {
    let auth = Arc::new(StaticAuthenticator::signed_in(user(local)));
    let context = SessionContext::new(user(local), auth.clone(), profiles);
    (core.session(context), auth)
}

async fn run_alice_and_bob(core: ChatCore) {
    let profiles = profiles();
    let (mut alice, _) = session_for(&core, "alice", profiles.clone());
    let (mut bob, _) = session_for(&core, "bob", profiles);

    assert_eq!(
        resolve(&user("alice"), &user("bob")).expect("resolve"),
        resolve(&user("bob"), &user("alice")).expect("resolve")
    );

    let from_alice = alice.select_peer(&user("bob")).await.expect("alice opens");
    let from_bob = bob.select_peer(&user("alice")).await.expect("bob opens");
    assert_eq!(from_alice, from_bob);
    assert_eq!(from_alice.as_str(), "alice_bob");
    assert_eq!(
        core.conversations
            .conversations_for(&user("alice"))
            .await
            .expect("list")
            .len(),
        1
    );

    let mut bob_updates = bob.updates();
    alice.send("hi").await.expect("alice sends");

    bob_updates
        .wait_for(|view| view.snapshot.as_ref().is_some_and(|snapshot| snapshot.len() == 1))
        .await
        .expect("bob sees the message");
    let snapshot = bob.latest_snapshot().expect("snapshot");
    assert_eq!(snapshot.messages[0].sender_id, user("alice"));
    assert_eq!(snapshot.messages[0].text, "hi");
    assert_eq!(snapshot.messages[0].sender_display_name, "Alice");

    let rendered = bob.messages_for_display();
    assert!(!rendered[0].is_own);
    assert_eq!(rendered[0].sender_label, "Alice");
    assert!(alice.messages_for_display()[0].is_own);
}

#[tokio::test]
async fn alice_and_bob_exchange_a_message_in_memory() {
    run_alice_and_bob(ChatCore::in_memory()).await;
}

#[tokio::test]
async fn alice_and_bob_exchange_a_message_over_sqlite() {
    let directory = tempfile::tempdir().expect("temp dir");
    let settings = ChatSettings {
        database_path: directory.path().join("duet.db"),
        ..ChatSettings::default()
    };
    run_alice_and_bob(ChatCore::open(&settings).await.expect("open sqlite")).await;
}

#[tokio::test]
async fn switching_peers_keeps_a_single_subscription() {
    let core = ChatCore::in_memory();
    let (mut alice, _) = session_for(&core, "alice", profiles());

    let with_bob = alice.select_peer(&user("bob")).await.expect("bob");
    assert_eq!(core.log.observer_count(&with_bob), 1);

    let with_carol = alice.select_peer(&user("carol")).await.expect("carol");
    assert_eq!(core.log.observer_count(&with_bob), 0);
    assert_eq!(core.log.observer_count(&with_carol), 1);
    assert_eq!(alice.peer(), Some(&user("carol")));

    let (mut bob, _) = session_for(&core, "bob", profiles());
    bob.select_peer(&user("alice")).await.expect("bob opens");
    bob.send("are you there?").await.expect("bob sends");

    // Alice moved on to carol, so bob's message must not show up in her view.
    assert!(alice.latest_snapshot().expect("carol snapshot").is_empty());

    alice.close();
    assert!(!alice.is_subscribed());
    assert_eq!(core.log.observer_count(&with_carol), 0);
    assert!(alice.latest_snapshot().is_none());
}

#[tokio::test]
async fn dropping_a_session_releases_its_subscription() {
    let core = ChatCore::in_memory();
    let (mut alice, _) = session_for(&core, "alice", profiles());
    let conversation_id = alice.select_peer(&user("bob")).await.expect("open");

    drop(alice);
    assert_eq!(core.log.observer_count(&conversation_id), 0);
}

#[tokio::test]
async fn signed_out_user_cannot_send() {
    let core = ChatCore::in_memory();
    let (mut alice, auth) = session_for(&core, "alice", profiles());
    let conversation_id = alice.select_peer(&user("bob")).await.expect("open");

    auth.sign_out();
    let error = alice.send("hello").await.expect_err("signed out");
    assert_eq!(error.kind(), ErrorKind::Unauthorized);
    assert!(
        core.log
            .read_ordered(&conversation_id)
            .await
            .expect("read")
            .is_empty()
    );

    let error = alice.select_peer(&user("carol")).await.expect_err("signed out");
    assert_eq!(error.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn missing_profile_sends_with_placeholder_name() {
    let core = ChatCore::in_memory();
    let (mut dave, _) = session_for(&core, "dave", profiles());
    dave.select_peer(&user("alice")).await.expect("open");

    let message = dave.send("who am I?").await.expect("send");
    assert_eq!(message.sender_display_name, "Anonymous");

    let (mut erin, _) = {
        let auth = Arc::new(StaticAuthenticator::signed_in(user("erin")));
        let context = SessionContext::new(user("erin"), auth.clone(), profiles())
            .with_placeholder_display_name("Guest");
        (core.session(context), auth)
    };
    erin.select_peer(&user("alice")).await.expect("open");
    let message = erin.send("hello").await.expect("send");
    assert_eq!(message.sender_display_name, "Guest");
}

#[tokio::test]
async fn display_name_is_captured_at_send_time() {
    let core = ChatCore::in_memory();
    let profiles = profiles();
    let (mut alice, _) = session_for(&core, "alice", profiles.clone());
    alice.select_peer(&user("bob")).await.expect("open");

    alice.send("before").await.expect("send");
    profiles.upsert(user("alice"), "Alicia");
    alice.send("after").await.expect("send");

    let snapshot = alice.latest_snapshot().expect("snapshot");
    let names = snapshot
        .messages
        .iter()
        .map(|message| message.sender_display_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Alice", "Alicia"]);
}

#[tokio::test]
async fn send_without_a_conversation_or_text_is_rejected() {
    let core = ChatCore::in_memory();
    let (mut alice, _) = session_for(&core, "alice", profiles());

    let error = alice.send("hello").await.expect_err("no conversation");
    assert_eq!(error.kind(), ErrorKind::Unauthorized);

    alice.select_peer(&user("bob")).await.expect("open");
    let error = alice.send("   ").await.expect_err("blank");
    assert_eq!(error.kind(), ErrorKind::InvalidMessage);
}

#[tokio::test]
async fn peers_exclude_the_local_user() {
    let core = ChatCore::in_memory();
    let (alice, _) = session_for(&core, "alice", profiles());

    let peers = alice
        .peers()
        .await
        .expect("peers")
        .into_iter()
        .map(|profile| profile.user_id)
        .collect::<Vec<_>>();
    assert_eq!(peers, vec![user("bob"), user("carol")]);
}
