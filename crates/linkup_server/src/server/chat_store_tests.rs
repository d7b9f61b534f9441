#![forbid(unsafe_code)]

use linkup_domain::RoomId;

use crate::server::chat_store::{ConversationKind, Page};
use crate::server::test_support::{new_user, stores};

#[tokio::test]
async fn direct_find_or_create_is_idempotent_from_either_direction() {
	let stores = stores().await;
	let a = new_user(&stores.users, "alice").await;
	let b = new_user(&stores.users, "bob").await;

	let first = stores.chats.find_or_create_direct(a.id, b.id).await.expect("create");
	let second = stores.chats.find_or_create_direct(b.id, a.id).await.expect("find");

	assert_eq!(first.id, second.id, "the unordered pair maps to one conversation");
	assert_eq!(first.kind, ConversationKind::Direct);

	stores.chats.append_message(first.id, a.id, "hi").await.expect("append");
	stores.chats.append_message(second.id, b.id, "hello back").await.expect("append");

	let history = stores
		.chats
		.direct_history(b.id, a.id, Page::All)
		.await
		.expect("history")
		.expect("conversation exists");
	assert_eq!(history.messages.len(), 2);
	assert_eq!(history.messages[0].content, "hi");
	assert_eq!(history.messages[1].content, "hello back");
}

#[tokio::test]
async fn direct_history_is_none_without_a_conversation() {
	let stores = stores().await;
	let a = new_user(&stores.users, "alice").await;
	let b = new_user(&stores.users, "bob").await;

	let history = stores.chats.direct_history(a.id, b.id, Page::All).await.expect("query");
	assert!(history.is_none());
}

#[tokio::test]
async fn messages_paginate_in_append_order() {
	let stores = stores().await;
	let a = new_user(&stores.users, "alice").await;
	let b = new_user(&stores.users, "bob").await;

	let conversation = stores.chats.find_or_create_direct(a.id, b.id).await.expect("create");
	for i in 0..7 {
		stores
			.chats
			.append_message(conversation.id, a.id, &format!("m{i}"))
			.await
			.expect("append");
	}

	let page1 = stores
		.chats
		.direct_history(a.id, b.id, Page::Numbered { page: 1, size: 3 })
		.await
		.expect("query")
		.expect("exists");
	let page3 = stores
		.chats
		.direct_history(a.id, b.id, Page::Numbered { page: 3, size: 3 })
		.await
		.expect("query")
		.expect("exists");

	assert_eq!(
		page1.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
		["m0", "m1", "m2"]
	);
	assert_eq!(
		page3.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
		["m6"]
	);
}

#[tokio::test]
async fn page_query_parsing_handles_the_all_sentinel() {
	assert_eq!(Page::from_query(Some("all"), None), Page::All);
	assert_eq!(Page::from_query(Some("ALL"), Some("9")), Page::All);
	assert_eq!(Page::from_query(Some("2"), Some("5")), Page::Numbered { page: 2, size: 5 });
	assert_eq!(
		Page::from_query(None, None),
		Page::Numbered {
			page: 1,
			size: Page::DEFAULT_SIZE
		}
	);
	// Garbage falls back to defaults instead of failing the request.
	assert_eq!(
		Page::from_query(Some("x"), Some("0")),
		Page::Numbered {
			page: 1,
			size: Page::DEFAULT_SIZE
		}
	);
}

#[tokio::test]
async fn groups_are_visible_to_participants_only() {
	let stores = stores().await;
	let a = new_user(&stores.users, "alice").await;
	let b = new_user(&stores.users, "bob").await;
	let outsider = new_user(&stores.users, "mallory").await;

	let room = RoomId::new("weekend_plans_1").expect("room id");
	let group = stores
		.chats
		.create_group("weekend plans", &room, None, a.id, &[b.id])
		.await
		.expect("create group");

	assert_eq!(group.kind, ConversationKind::Group);
	assert!(group.participants.contains(&a.id), "creator is always a participant");
	assert!(group.participants.contains(&b.id));

	assert!(stores.chats.find_group(group.id, b.id).await.expect("query").is_some());
	assert!(stores.chats.find_group(group.id, outsider.id).await.expect("query").is_none());

	assert!(
		stores
			.chats
			.find_group_by_room(&room, a.id)
			.await
			.expect("query")
			.is_some()
	);
	assert!(
		stores
			.chats
			.find_group_by_room(&room, outsider.id)
			.await
			.expect("query")
			.is_none()
	);
}

#[tokio::test]
async fn duplicate_room_id_is_a_conflict() {
	let stores = stores().await;
	let a = new_user(&stores.users, "alice").await;

	let room = RoomId::new("clashing_room").expect("room id");
	stores
		.chats
		.create_group("one", &room, None, a.id, &[a.id])
		.await
		.expect("create group");

	let err = stores
		.chats
		.create_group("two", &room, None, a.id, &[a.id])
		.await
		.expect_err("same room id must conflict");
	assert_eq!(err.kind, linkup_domain::ErrorKind::Conflict);
}
