#![forbid(unsafe_code)]

use std::sync::Arc;

use linkup_domain::{ErrorKind, GroupId};
use linkup_protocol::ServerFrame;

use crate::server::chat_store::Page;
use crate::server::gateway::{ChatGateway, UploadedImage};
use crate::server::presence::{PresenceConfig, PresenceRegistry};
use crate::server::rooms::{RoomHub, RoomHubConfig};
use crate::server::test_support::{RecordingObjectStore, contact_pair, drain, fake_connection, new_user, stores};

struct Fixture {
	gateway: ChatGateway,
	stores: crate::server::test_support::TestStores,
	images: Arc<RecordingObjectStore>,
}

async fn fixture() -> Fixture {
	let stores = stores().await;
	let images = Arc::new(RecordingObjectStore::default());

	let gateway = ChatGateway::new(
		Arc::clone(&stores.users),
		Arc::clone(&stores.chats),
		PresenceRegistry::new(PresenceConfig::default()),
		RoomHub::new(RoomHubConfig::default()),
		Arc::clone(&images) as Arc<dyn crate::server::storage::ObjectStore>,
	);

	Fixture { gateway, stores, images }
}

#[tokio::test]
async fn first_direct_message_creates_conversation_acks_sender_and_delivers() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	// Alice has two tabs; Bob has one.
	let (a1, mut rx_a1) = fake_connection(1);
	let (a2, mut rx_a2) = fake_connection(2);
	let (b1, mut rx_b1) = fake_connection(3);
	fx.gateway.presence().add_handle(alice.id, a1).await;
	fx.gateway.presence().add_handle(alice.id, a2).await;
	fx.gateway.presence().add_handle(bob.id, b1).await;

	fx.gateway
		.send_direct_message(&alice, "hi", bob.id)
		.await
		.expect("send message");

	// Exactly one conversation, one message, persisted before fan-out.
	let history = fx
		.stores
		.chats
		.direct_history(alice.id, bob.id, Page::All)
		.await
		.expect("history")
		.expect("conversation created");
	assert_eq!(history.messages.len(), 1);
	assert_eq!(history.messages[0].content, "hi");

	// Every sender tab gets the ack.
	for rx in [&mut rx_a1, &mut rx_a2] {
		let frames = drain(rx);
		assert!(
			matches!(frames.as_slice(), [ServerFrame::SuccessMessage { content }] if content == "hi"),
			"expected a single ack, got {frames:?}"
		);
	}

	// The recipient gets the message with the sender attached.
	let frames = drain(&mut rx_b1);
	assert!(
		matches!(
			frames.as_slice(),
			[ServerFrame::NewMessage { content, from, group_id: None }]
				if content == "hi" && from.id == alice.id
		),
		"expected newMessage, got {frames:?}"
	);
}

#[tokio::test]
async fn direct_messages_from_both_directions_share_one_conversation() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	fx.gateway.send_direct_message(&alice, "hi", bob.id).await.expect("a -> b");
	fx.gateway.send_direct_message(&bob, "hello back", alice.id).await.expect("b -> a");

	let history = fx
		.stores
		.chats
		.direct_history(bob.id, alice.id, Page::All)
		.await
		.expect("history")
		.expect("conversation exists");
	assert_eq!(history.messages.len(), 2, "both messages land in the same record");
}

#[tokio::test]
async fn offline_recipient_is_not_an_error_and_message_persists() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	fx.gateway
		.send_direct_message(&alice, "hi", bob.id)
		.await
		.expect("send to offline recipient");

	let history = fx
		.stores
		.chats
		.direct_history(alice.id, bob.id, Page::All)
		.await
		.expect("history")
		.expect("conversation created");
	assert_eq!(history.messages.len(), 1);
}

#[tokio::test]
async fn direct_message_to_non_contact_is_rejected() {
	let fx = fixture().await;
	let alice = new_user(&fx.stores.users, "alice").await;
	let stranger = new_user(&fx.stores.users, "stranger").await;

	let err = fx
		.gateway
		.send_direct_message(&alice, "hi", stranger.id)
		.await
		.expect_err("non-contact must be rejected");
	assert_eq!(err.kind, ErrorKind::NotFound);

	assert!(
		fx.stores
			.chats
			.direct_history(alice.id, stranger.id, Page::All)
			.await
			.expect("history")
			.is_none(),
		"nothing persisted"
	);
}

#[tokio::test]
async fn group_flow_join_message_and_sender_exclusion() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	let group = fx
		.gateway
		.create_group(&alice, "weekend plans", &[bob.id], None)
		.await
		.expect("create group");
	let room = group.room_id.clone().expect("groups carry a room id");

	let (a1, mut rx_a1) = fake_connection(1);
	let (b1, mut rx_b1) = fake_connection(2);
	fx.gateway.presence().add_handle(alice.id, a1.clone()).await;
	fx.gateway.presence().add_handle(bob.id, b1.clone()).await;

	fx.gateway.join_room(&alice, a1, &room).await.expect("alice joins");
	fx.gateway.join_room(&bob, b1, &room).await.expect("bob joins");

	fx.gateway
		.send_group_message(&alice, "who's in?", group.id)
		.await
		.expect("group message");

	// Sender sees the ack and only the ack.
	let frames = drain(&mut rx_a1);
	assert!(
		matches!(frames.as_slice(), [ServerFrame::SuccessMessage { content }] if content == "who's in?"),
		"sender should see exactly one ack, got {frames:?}"
	);

	// The other participant gets the broadcast with the group id set.
	let frames = drain(&mut rx_b1);
	assert!(
		matches!(
			frames.as_slice(),
			[ServerFrame::NewMessage { content, from, group_id: Some(gid) }]
				if content == "who's in?" && from.id == alice.id && *gid == group.id
		),
		"expected group newMessage, got {frames:?}"
	);

	let history = fx
		.stores
		.chats
		.group_history(group.id, bob.id, Page::All)
		.await
		.expect("history")
		.expect("group exists");
	assert_eq!(history.messages.len(), 1);
}

#[tokio::test]
async fn join_room_requires_membership() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;
	let outsider = new_user(&fx.stores.users, "mallory").await;

	let group = fx
		.gateway
		.create_group(&alice, "private", &[bob.id], None)
		.await
		.expect("create group");
	let room = group.room_id.expect("room id");

	let (h, _rx) = fake_connection(9);
	let err = fx
		.gateway
		.join_room(&outsider, h, &room)
		.await
		.expect_err("outsider cannot join");
	assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn group_message_requires_membership() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;
	let outsider = new_user(&fx.stores.users, "mallory").await;

	let group = fx
		.gateway
		.create_group(&alice, "private", &[bob.id], None)
		.await
		.expect("create group");

	let err = fx
		.gateway
		.send_group_message(&outsider, "let me in", group.id)
		.await
		.expect_err("outsider cannot post");
	assert_eq!(err.kind, ErrorKind::NotFound);

	let err = fx
		.gateway
		.send_group_message(&alice, "anyone?", GroupId::new_v4())
		.await
		.expect_err("unknown group");
	assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn group_creation_rejects_non_contact_participants_and_persists_nothing() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;
	let carol = new_user(&fx.stores.users, "carol").await; // not a contact of alice

	let err = fx
		.gateway
		.create_group(&alice, "mixed", &[bob.id, carol.id], None)
		.await
		.expect_err("non-contact participant must be rejected");
	assert_eq!(err.kind, ErrorKind::NotFound);

	// No conversation and no image got persisted.
	assert!(fx.images.puts.lock().unwrap().is_empty());
	assert!(
		fx.stores
			.chats
			.find_group_by_room(
				&linkup_domain::RoomId::new("mixed_anything").unwrap(),
				alice.id
			)
			.await
			.expect("query")
			.is_none()
	);
}

#[tokio::test]
async fn group_creation_stores_image_and_compensates_on_persist_failure() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	let image = UploadedImage {
		bytes: vec![0x89, 0x50, 0x4e, 0x47],
		content_type: "image/png".to_string(),
	};
	let group = fx
		.gateway
		.create_group(&alice, "with cover", &[bob.id], Some(image))
		.await
		.expect("create group");

	assert!(group.group_image.is_some());
	assert_eq!(fx.images.puts.lock().unwrap().len(), 1);
	assert!(fx.images.deletes.lock().unwrap().is_empty());

	// Close the database out from under the store; the next creation fails
	// after the image upload and must delete the orphan.
	fx.stores.pool.close().await;

	let image = UploadedImage {
		bytes: vec![1, 2, 3],
		content_type: "image/jpeg".to_string(),
	};
	let err = fx
		.gateway
		.create_group(&alice, "doomed", &[bob.id], Some(image))
		.await
		.expect_err("persistence failure surfaces");
	assert_eq!(err.kind, ErrorKind::UpstreamFailure);

	let puts = fx.images.puts.lock().unwrap().clone();
	let deletes = fx.images.deletes.lock().unwrap().clone();
	assert_eq!(puts.len(), 2);
	assert_eq!(deletes.len(), 1);
	assert_eq!(deletes[0], puts[1], "the orphaned image is the one deleted");
}

#[tokio::test]
async fn typing_indicator_reaches_recipient_or_room_without_persistence() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	let (b1, mut rx_b1) = fake_connection(1);
	fx.gateway.presence().add_handle(bob.id, b1.clone()).await;

	fx.gateway
		.set_typing(&alice, true, None, Some(bob.id))
		.await
		.expect("typing to recipient");

	let frames = drain(&mut rx_b1);
	assert!(
		matches!(
			frames.as_slice(),
			[ServerFrame::SetTyping { typing: true, user, group_id: None }] if user.id == alice.id
		),
		"expected typing frame, got {frames:?}"
	);

	// Room variant excludes the sender's own tabs.
	let group = fx
		.gateway
		.create_group(&alice, "typing room", &[bob.id], None)
		.await
		.expect("create group");
	let room = group.room_id.expect("room id");

	let (a1, mut rx_a1) = fake_connection(2);
	fx.gateway.join_room(&alice, a1, &room).await.expect("alice joins");
	fx.gateway.join_room(&bob, b1, &room).await.expect("bob joins");

	fx.gateway
		.set_typing(&alice, true, Some(group.id), None)
		.await
		.expect("typing to room");

	assert!(drain(&mut rx_a1).is_empty(), "sender tabs excluded");
	let frames = drain(&mut rx_b1);
	assert!(
		matches!(
			frames.as_slice(),
			[ServerFrame::SetTyping { typing: true, user, group_id: Some(gid) }]
				if user.id == alice.id && *gid == group.id
		),
		"expected room typing frame, got {frames:?}"
	);

	// Typing against a group the sender is not in surfaces to the sender only.
	let outsider = new_user(&fx.stores.users, "mallory").await;
	let err = fx
		.gateway
		.set_typing(&outsider, true, Some(group.id), None)
		.await
		.expect_err("non-member typing is rejected");
	assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn presence_broadcast_fires_once_per_transition() {
	let fx = fixture().await;
	let (alice, bob) = contact_pair(&fx.stores.users).await;

	let (b1, mut rx_b1) = fake_connection(1);
	fx.gateway.presence().add_handle(bob.id, b1).await;

	// Simulate what the connection handler does on first/last handle.
	let (a1, _rx_a1) = fake_connection(2);
	let (a2, _rx_a2) = fake_connection(3);

	let came_online = fx.gateway.presence().add_handle(alice.id, a1).await;
	assert!(came_online);
	fx.gateway
		.presence()
		.broadcast(ServerFrame::OnlineUser { user_id: alice.id })
		.await;

	assert!(!fx.gateway.presence().add_handle(alice.id, a2).await);

	assert!(!fx.gateway.presence().remove_handle(alice.id, 2).await);
	let went_offline = fx.gateway.presence().remove_handle(alice.id, 3).await;
	assert!(went_offline);
	fx.gateway
		.presence()
		.broadcast(ServerFrame::OfflineUser { user_id: alice.id })
		.await;

	let frames = drain(&mut rx_b1);
	let online = frames
		.iter()
		.filter(|f| matches!(f, ServerFrame::OnlineUser { user_id } if *user_id == alice.id))
		.count();
	let offline = frames
		.iter()
		.filter(|f| matches!(f, ServerFrame::OfflineUser { user_id } if *user_id == alice.id))
		.count();
	assert_eq!(online, 1, "exactly one online event");
	assert_eq!(offline, 1, "exactly one offline event");
}
