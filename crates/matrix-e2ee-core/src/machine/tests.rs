// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{sync::Arc, time::Duration};

use assert_matches2::{assert_let, assert_matches};
use futures_util::{pin_mut, FutureExt, StreamExt};
use ruma::{device_id, room_id, user_id, DeviceId, OwnedUserId, RoomId, UserId};
use serde_json::json;
use similar_asserts::assert_eq;

use super::{MachineConfig, OlmMachine, ProcessedToDeviceEvent, SyncChanges};
use crate::{
    backups::{BackupDecryptionKey, BackupSettings, BackupState},
    error::{ErrorKind, MegolmError},
    gossiping::KeyShareOutcome,
    identities::{LocalTrust, UserTrustResult},
    olm::RotationReason,
    session_manager::{
        sessions::testing::retry_settings, ImportOutcome, OutboundSessionState,
        SenderVerification,
    },
    store::{CryptoStoreError, MemoryStore},
    testing::MockHomeserver,
    transport::{RetrySettings, TransportError},
    types::events::{room_encrypted::EncryptedRoomEvent, room_key_withheld::WithheldCode},
    OlmError,
};

fn room() -> &'static RoomId {
    room_id!("!test:localhost")
}

fn alice_id() -> &'static UserId {
    user_id!("@alice:localhost")
}

fn bob_id() -> &'static UserId {
    user_id!("@bob:localhost")
}

fn config() -> MachineConfig {
    MachineConfig { retry: retry_settings(), ..Default::default() }
}

async fn machine(
    server: &MockHomeserver,
    user_id: &UserId,
    device_id: &DeviceId,
    config: MachineConfig,
) -> OlmMachine {
    let transport = server.transport_for(user_id, device_id);
    let machine =
        OlmMachine::new(user_id, device_id, MemoryStore::new(), transport, config).await.unwrap();
    assert!(machine.publish_keys().await.unwrap());

    machine
}

async fn alice_and_bob(server: &MockHomeserver) -> (OlmMachine, OlmMachine) {
    let alice = machine(server, alice_id(), device_id!("ALICE"), config()).await;
    let bob = machine(server, bob_id(), device_id!("BOB"), config()).await;

    (alice, bob)
}

fn members() -> Vec<OwnedUserId> {
    vec![alice_id().to_owned(), bob_id().to_owned()]
}

async fn sync(server: &MockHomeserver, machine: &OlmMachine) -> Vec<ProcessedToDeviceEvent> {
    let to_device_events =
        server.take_to_device_events(machine.user_id(), machine.device_id()).await;

    machine
        .receive_sync_changes(SyncChanges { to_device_events, ..Default::default() })
        .await
        .unwrap()
}

async fn send_message(sender: &OlmMachine, body: &str) -> EncryptedRoomEvent {
    let content = sender
        .encrypt_room_event(room(), "m.room.message", json!({ "body": body }))
        .await
        .unwrap();

    EncryptedRoomEvent {
        event_id: None,
        sender: sender.user_id().to_owned(),
        room_id: room().to_owned(),
        content,
    }
}

#[tokio::test]
async fn messages_reach_the_members_of_a_room() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    // Bob learns about the devices of Alice once they share a room.
    bob.room_members_changed(room(), &members()).await.unwrap();

    let result = alice.share_room_key(room(), &members()).await.unwrap();
    assert_eq!(result.shared_with, vec![(bob_id().to_owned(), device_id!("BOB").to_owned())]);
    assert!(result.withheld.is_empty());

    let processed = sync(&server, &bob).await;
    assert_let!(
        [ProcessedToDeviceEvent::RoomKey { session_id, outcome: ImportOutcome::Imported, .. }] =
            processed.as_slice()
    );
    assert_eq!(session_id, &result.session_id);

    let event = send_message(&alice, "It's a secret to everybody").await;
    let decrypted = bob.decrypt_room_event(&event).await.unwrap();

    assert_eq!(decrypted.content, json!({ "body": "It's a secret to everybody" }));
    assert_eq!(decrypted.encryption_info.sender_device.as_deref(), Some(device_id!("ALICE")));
    assert_eq!(decrypted.encryption_info.verification, SenderVerification::Unverified);
}

#[tokio::test]
async fn leaving_members_rotate_the_room_key() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    let first = alice.share_room_key(room(), &members()).await.unwrap();
    sync(&server, &bob).await;

    assert!(alice.room_members_changed(room(), &[alice_id().to_owned()]).await.unwrap());
    assert_matches!(
        alice.outbound_session_state(room()).await.unwrap(),
        OutboundSessionState::Rotating { .. }
    );

    let second = alice.share_room_key(room(), &[alice_id().to_owned()]).await.unwrap();
    assert_matches!(second.rotated, Some(RotationReason::MembershipChange));
    assert_ne!(first.session_id, second.session_id);
    assert!(second.shared_with.is_empty());
    assert!(server.take_to_device_events(bob_id(), device_id!("BOB")).await.is_empty());

    // Messages sent after Bob left use a key he never got.
    bob.room_members_changed(room(), &members()).await.unwrap();
    let event = send_message(&alice, "Bob left").await;
    assert_matches!(bob.decrypt_room_event(&event).await, Err(MegolmError::MissingRoomKey(None)));
}

/// Bob reads a message, leaves the room and rejoins. The room key Alice
/// shares with him after he rejoined never arrives.
///
/// Returns a message sent while Bob was away and one sent after he came back.
async fn leave_and_rejoin(
    server: &MockHomeserver,
    alice: &OlmMachine,
    bob: &OlmMachine,
) -> (EncryptedRoomEvent, EncryptedRoomEvent) {
    bob.room_members_changed(room(), &members()).await.unwrap();

    let first = alice.share_room_key(room(), &members()).await.unwrap();
    assert_eq!(first.shared_with, vec![(bob_id().to_owned(), device_id!("BOB").to_owned())]);
    sync(server, bob).await;

    let event = send_message(alice, "Hello Bob").await;
    let decrypted = bob.decrypt_room_event(&event).await.unwrap();
    assert_eq!(decrypted.content, json!({ "body": "Hello Bob" }));

    assert!(alice.room_members_changed(room(), &[alice_id().to_owned()]).await.unwrap());
    let away = alice.share_room_key(room(), &[alice_id().to_owned()]).await.unwrap();
    assert_matches!(away.rotated, Some(RotationReason::MembershipChange));
    assert_ne!(away.session_id, first.session_id);

    let while_away = send_message(alice, "Bob left").await;
    assert_matches!(
        bob.decrypt_room_event(&while_away).await,
        Err(MegolmError::MissingRoomKey(None))
    );

    // Bob never got the rotated session, it can be shared with him as is.
    let rejoined = alice.share_room_key(room(), &members()).await.unwrap();
    assert_eq!(rejoined.session_id, away.session_id);
    assert_ne!(rejoined.session_id, first.session_id);
    assert_eq!(rejoined.shared_with, vec![(bob_id().to_owned(), device_id!("BOB").to_owned())]);
    assert!(!server.take_to_device_events(bob_id(), device_id!("BOB")).await.is_empty());

    let after_rejoin = send_message(alice, "Welcome back").await;
    assert_matches!(
        bob.decrypt_room_event(&after_rejoin).await,
        Err(MegolmError::MissingRoomKey(None))
    );

    (while_away, after_rejoin)
}

#[tokio::test]
async fn rejoined_members_are_granted_the_new_room_key() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    let (while_away, after_rejoin) = leave_and_rejoin(&server, &alice, &bob).await;

    let processed = sync(&server, &alice).await;
    assert_let!([ProcessedToDeviceEvent::KeyRequest(Some(decision))] = processed.as_slice());
    assert_eq!(decision.info.session_id, after_rejoin.content.session_id);
    // Bob only gets the part of the session he was shared.
    assert_eq!(decision.outcome, KeyShareOutcome::Shared { message_index: 1 });

    let processed = sync(&server, &bob).await;
    assert_matches!(
        processed.as_slice(),
        [ProcessedToDeviceEvent::ForwardedRoomKey {
            outcome: Some(ImportOutcome::Imported),
            ..
        }]
    );

    let decrypted = bob.decrypt_room_event(&after_rejoin).await.unwrap();
    assert_eq!(decrypted.content, json!({ "body": "Welcome back" }));
    assert_matches!(
        bob.decrypt_room_event(&while_away).await,
        Err(MegolmError::UnknownMessageIndex { .. })
    );
}

#[tokio::test]
async fn rejoined_members_are_denied_the_room_key_once_untrusted() {
    let server = MockHomeserver::new();

    let mut alice_config = config();
    alice_config.encryption_settings.sharing_strategy.only_allow_trusted_devices = true;

    let alice = machine(&server, alice_id(), device_id!("ALICE"), alice_config).await;
    let bob = machine(&server, bob_id(), device_id!("BOB"), config()).await;

    alice.room_members_changed(room(), &members()).await.unwrap();
    alice.set_local_trust(bob_id(), device_id!("BOB"), LocalTrust::Verified).await.unwrap();

    let (_, after_rejoin) = leave_and_rejoin(&server, &alice, &bob).await;

    // Alice stops trusting Bob's device before his request arrives.
    alice.set_local_trust(bob_id(), device_id!("BOB"), LocalTrust::Unset).await.unwrap();

    let processed = sync(&server, &alice).await;
    assert_let!([ProcessedToDeviceEvent::KeyRequest(Some(decision))] = processed.as_slice());
    assert_eq!(decision.outcome, KeyShareOutcome::Withheld(WithheldCode::Unverified));

    let processed = sync(&server, &bob).await;
    assert_matches!(
        processed.as_slice(),
        [ProcessedToDeviceEvent::Withheld { code: WithheldCode::Unverified, .. }]
    );
    assert_matches!(
        bob.decrypt_room_event(&after_rejoin).await,
        Err(MegolmError::MissingRoomKey(Some(WithheldCode::Unverified)))
    );
}

#[tokio::test]
async fn logged_out_devices_are_removed_and_rotate_the_room_key() {
    let server = MockHomeserver::new();
    let (alice, _bob) = alice_and_bob(&server).await;
    let _bob_laptop = machine(&server, bob_id(), device_id!("BOBLAPTOP"), config()).await;

    let first = alice.share_room_key(room(), &members()).await.unwrap();
    assert_eq!(first.shared_with.len(), 2);

    server.delete_device(bob_id(), device_id!("BOBLAPTOP")).await;
    alice
        .receive_sync_changes(SyncChanges {
            changed_devices: vec![bob_id().to_owned()],
            ..Default::default()
        })
        .await
        .unwrap();

    let (devices, _) = alice.query_keys().await.unwrap();
    assert_eq!(devices.deleted.len(), 1);
    assert!(alice.get_device(bob_id(), device_id!("BOBLAPTOP")).await.unwrap().is_none());

    assert!(alice.room_members_changed(room(), &members()).await.unwrap());

    let second = alice.share_room_key(room(), &members()).await.unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.shared_with, vec![(bob_id().to_owned(), device_id!("BOB").to_owned())]);
}

#[tokio::test]
async fn lost_room_keys_are_requested_and_forwarded() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    bob.room_members_changed(room(), &members()).await.unwrap();
    alice.share_room_key(room(), &members()).await.unwrap();

    // The room key never makes it to Bob.
    assert!(!server.take_to_device_events(bob_id(), device_id!("BOB")).await.is_empty());

    let event = send_message(&alice, "Did you get this?").await;
    assert_matches!(bob.decrypt_room_event(&event).await, Err(MegolmError::MissingRoomKey(None)));

    let processed = sync(&server, &alice).await;
    assert_let!([ProcessedToDeviceEvent::KeyRequest(Some(decision))] = processed.as_slice());
    assert_eq!(decision.user_id, bob_id());
    assert_eq!(decision.outcome, KeyShareOutcome::Shared { message_index: 0 });

    let processed = sync(&server, &bob).await;
    assert_matches!(
        processed.as_slice(),
        [ProcessedToDeviceEvent::ForwardedRoomKey {
            outcome: Some(ImportOutcome::Imported),
            ..
        }]
    );

    let decrypted = bob.decrypt_room_event(&event).await.unwrap();
    assert_eq!(decrypted.content, json!({ "body": "Did you get this?" }));
    assert_eq!(decrypted.encryption_info.verification, SenderVerification::Unverified);
}

#[tokio::test]
async fn untrusted_devices_are_told_that_the_key_is_withheld() {
    let server = MockHomeserver::new();

    let mut alice_config = config();
    alice_config.encryption_settings.sharing_strategy.only_allow_trusted_devices = true;

    let alice = machine(&server, alice_id(), device_id!("ALICE"), alice_config).await;
    let bob = machine(&server, bob_id(), device_id!("BOB"), config()).await;

    let result = alice.share_room_key(room(), &members()).await.unwrap();
    assert!(result.shared_with.is_empty());
    assert_eq!(
        result.withheld,
        vec![(bob_id().to_owned(), device_id!("BOB").to_owned(), WithheldCode::Unverified)]
    );

    let processed = sync(&server, &bob).await;
    assert_let!(
        [ProcessedToDeviceEvent::Withheld { session_id, code: WithheldCode::Unverified, .. }] =
            processed.as_slice()
    );
    assert_eq!(session_id, &result.session_id);

    bob.room_members_changed(room(), &members()).await.unwrap();
    let event = send_message(&alice, "Not for you").await;

    assert_matches!(
        bob.decrypt_room_event(&event).await,
        Err(MegolmError::MissingRoomKey(Some(WithheldCode::Unverified)))
    );
    // A withheld key isn't requested.
    assert!(server.take_to_device_events(alice_id(), device_id!("ALICE")).await.is_empty());
}

#[tokio::test]
async fn received_room_keys_are_announced() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    let stream = bob.room_keys_received_stream();
    pin_mut!(stream);

    let result = alice.share_room_key(room(), &members()).await.unwrap();
    sync(&server, &bob).await;

    let received = stream.next().now_or_never().flatten().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].session_id, result.session_id);
    assert_eq!(received[0].room_id, room());
}

#[tokio::test]
async fn received_room_keys_get_backed_up() {
    let server = MockHomeserver::new();

    let mut bob_config = config();
    bob_config.backup = BackupSettings { max_delay: Duration::from_millis(10), batch_size: 10 };

    let alice = machine(&server, alice_id(), device_id!("ALICE"), config()).await;
    let bob = machine(&server, bob_id(), device_id!("BOB"), bob_config).await;

    let key = BackupDecryptionKey::new().unwrap();
    let version = bob.backup_machine().create_backup(&key, None).await.unwrap();
    assert_eq!(bob.backup_machine().state(), BackupState::ReadyToBackUp);

    let mut states = bob.backup_state();

    let result = alice.share_room_key(room(), &members()).await.unwrap();
    sync(&server, &bob).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.backed_up_keys(&version).await.is_empty() {
            states.next().await;
        }
    })
    .await
    .expect("the received room key should be backed up");

    let backed_up = server.backed_up_keys(&version).await;
    assert!(backed_up[room()].contains_key(&result.session_id));

    bob.close().await;
}

#[tokio::test]
async fn verifying_a_user_makes_their_devices_trusted() -> anyhow::Result<()> {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    alice.bootstrap_cross_signing().await?;
    bob.bootstrap_cross_signing().await?;

    assert!(alice.user_trust(alice_id()).await?.is_success());
    let own_device = alice.device_trust(alice_id(), device_id!("ALICE")).await?.unwrap();
    assert!(own_device.cross_signing_verified);

    bob.update_tracked_users([alice_id()]).await?;
    bob.query_keys().await?;

    assert!(bob.get_identity(alice_id()).await?.is_some());
    assert_matches!(bob.user_trust(alice_id()).await?, UserTrustResult::KeyNotSigned(_));
    let trust = bob.device_trust(alice_id(), device_id!("ALICE")).await?.unwrap();
    assert!(!trust.is_verified());

    bob.verify_user(alice_id()).await?;

    assert!(bob.user_trust(alice_id()).await?.is_success());
    let trust = bob.device_trust(alice_id(), device_id!("ALICE")).await?.unwrap();
    assert!(trust.cross_signing_verified);
    assert!(!trust.locally_verified);

    Ok(())
}

#[tokio::test]
async fn verifying_a_user_needs_cross_signing() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    alice.bootstrap_cross_signing().await.unwrap();
    bob.update_tracked_users([alice_id()]).await.unwrap();
    bob.query_keys().await.unwrap();

    let error = bob.verify_user(alice_id()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);

    let error = alice.verify_user(bob_id()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn the_account_survives_a_restart() {
    let server = MockHomeserver::new();
    let store = Arc::new(MemoryStore::new());

    let transport = server.transport_for(alice_id(), device_id!("ALICE"));
    let alice = OlmMachine::new(alice_id(), device_id!("ALICE"), store.clone(), transport, config())
        .await
        .unwrap();
    assert!(alice.publish_keys().await.unwrap());
    let identity_keys = alice.identity_keys();
    alice.close().await;

    let transport = server.transport_for(alice_id(), device_id!("ALICE"));
    let alice = OlmMachine::new(alice_id(), device_id!("ALICE"), store.clone(), transport, config())
        .await
        .unwrap();
    assert_eq!(alice.identity_keys(), identity_keys);
    assert!(!alice.publish_keys().await.unwrap());

    let transport = server.transport_for(alice_id(), device_id!("OTHER"));
    let error = OlmMachine::new(alice_id(), device_id!("OTHER"), store, transport, config())
        .await
        .unwrap_err();
    assert_matches!(error, OlmError::Store(CryptoStoreError::MismatchedAccount { .. }));
}

#[tokio::test]
async fn claimed_one_time_keys_are_replenished_on_sync() {
    let server = MockHomeserver::new();
    let (alice, _bob) = alice_and_bob(&server).await;

    assert!(!alice.publish_keys().await.unwrap());

    server.exhaust_one_time_keys(alice_id(), device_id!("ALICE")).await;
    alice
        .receive_sync_changes(SyncChanges { one_time_keys_count: Some(0), ..Default::default() })
        .await
        .unwrap();

    // The sync already uploaded a fresh batch.
    assert!(!alice.publish_keys().await.unwrap());
}

#[tokio::test]
async fn failed_key_uploads_keep_the_sync_results() {
    let server = MockHomeserver::new();
    let (alice, bob) = alice_and_bob(&server).await;

    let result = alice.share_room_key(room(), &members()).await.unwrap();
    let to_device_events = server.take_to_device_events(bob_id(), device_id!("BOB")).await;

    server
        .fail_next_requests([TransportError::Server { status: 500, message: "oops".to_owned() }])
        .await;

    let processed = bob
        .receive_sync_changes(SyncChanges {
            to_device_events,
            one_time_keys_count: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_let!(
        [ProcessedToDeviceEvent::RoomKey { session_id, outcome: ImportOutcome::Imported, .. }] =
            processed.as_slice()
    );
    assert_eq!(session_id, &result.session_id);

    // The keys that couldn't be uploaded are still pending.
    assert!(bob.publish_keys().await.unwrap());
    assert!(!bob.publish_keys().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn key_uploads_dont_hold_up_decryption() {
    let server = MockHomeserver::new();

    let mut alice_config = config();
    alice_config.retry = RetrySettings {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
    };

    let alice = machine(&server, alice_id(), device_id!("ALICE"), alice_config).await;
    let bob = machine(&server, bob_id(), device_id!("BOB"), config()).await;

    let result = bob.share_room_key(room(), &members()).await.unwrap();
    let to_device_events = server.take_to_device_events(alice_id(), device_id!("ALICE")).await;

    // Alice runs out of one-time keys while the server is unreachable.
    server.fail_next_requests(vec![TransportError::Network("down".to_owned()); 4]).await;
    let upload = tokio::spawn({
        let alice = alice.clone();
        async move {
            alice
                .receive_sync_changes(SyncChanges {
                    one_time_keys_count: Some(0),
                    ..Default::default()
                })
                .await
        }
    });

    // Let the upload run into its first backoff.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let processed = tokio::time::timeout(
        Duration::from_secs(1),
        alice.receive_sync_changes(SyncChanges { to_device_events, ..Default::default() }),
    )
    .await
    .expect("decrypting shouldn't wait for the key upload")
    .unwrap();

    assert_let!([ProcessedToDeviceEvent::RoomKey { session_id, .. }] = processed.as_slice());
    assert_eq!(session_id, &result.session_id);

    upload.await.unwrap().unwrap();
    assert!(!alice.publish_keys().await.unwrap());
}
