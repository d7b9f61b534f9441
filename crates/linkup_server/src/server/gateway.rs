#![forbid(unsafe_code)]

use std::sync::Arc;

use linkup_domain::{ApiError, GroupId, RoomId, UserId};
use linkup_protocol::{PublicUser, ServerFrame};
use tracing::{debug, warn};

use crate::server::chat_store::{ChatStore, Conversation};
use crate::server::presence::{ConnectionHandle, PresenceRegistry};
use crate::server::rooms::RoomHub;
use crate::server::storage::ObjectStore;
use crate::server::users::{UserSnapshot, UserStore};

/// An uploaded group image awaiting storage.
pub struct UploadedImage {
	pub bytes: Vec<u8>,
	pub content_type: String,
}

impl UploadedImage {
	fn extension(&self) -> &'static str {
		match self.content_type.as_str() {
			"image/png" => "png",
			"image/gif" => "gif",
			"image/webp" => "webp",
			_ => "jpg",
		}
	}
}

/// Per-connection event router. Each handler is independently fallible; the
/// connection loop turns a returned error into a `custom_error` frame scoped
/// to the offending connection.
pub struct ChatGateway {
	users: Arc<UserStore>,
	chats: Arc<ChatStore>,
	presence: PresenceRegistry,
	rooms: RoomHub,
	images: Arc<dyn ObjectStore>,
}

impl ChatGateway {
	pub fn new(
		users: Arc<UserStore>,
		chats: Arc<ChatStore>,
		presence: PresenceRegistry,
		rooms: RoomHub,
		images: Arc<dyn ObjectStore>,
	) -> Self {
		Self {
			users,
			chats,
			presence,
			rooms,
			images,
		}
	}

	pub fn presence(&self) -> &PresenceRegistry {
		&self.presence
	}

	pub fn rooms(&self) -> &RoomHub {
		&self.rooms
	}

	/// Direct message: find-or-create the pair conversation, persist, then
	/// ack the sender and deliver to whichever recipient handles are live.
	pub async fn send_direct_message(&self, sender: &UserSnapshot, content: &str, send_to: UserId) -> Result<(), ApiError> {
		if !self.users.is_contact(sender.id, send_to).await? {
			return Err(ApiError::not_found("invalid recipient contact"));
		}

		let conversation = self.chats.find_or_create_direct(sender.id, send_to).await?;
		self.chats.append_message(conversation.id, sender.id, content).await?;

		metrics::counter!("linkup_server_direct_messages_total").increment(1);

		// Persisted; fan-out is best effort from here.
		self.presence
			.send_to_user(
				sender.id,
				ServerFrame::SuccessMessage {
					content: content.to_string(),
				},
			)
			.await;

		let delivered = self
			.presence
			.send_to_user(
				send_to,
				ServerFrame::NewMessage {
					content: content.to_string(),
					from: public_user(sender),
					group_id: None,
				},
			)
			.await;

		// An offline recipient is not an error; the message is already durable.
		debug!(from = %sender.id, to = %send_to, delivered, "direct message routed");
		Ok(())
	}

	/// Subscribe the connection to a room it is a participant of.
	pub async fn join_room(&self, requester: &UserSnapshot, handle: ConnectionHandle, room_id: &RoomId) -> Result<(), ApiError> {
		let conversation = self
			.chats
			.find_group_by_room(room_id, requester.id)
			.await?
			.ok_or_else(|| ApiError::not_found("no matching room"))?;

		let room = conversation.room_id.unwrap_or_else(|| room_id.clone());
		self.rooms.join(room, requester.id, handle).await;
		Ok(())
	}

	/// Group message: verify membership, persist, ack the sender's handles
	/// and broadcast to the rest of the room.
	pub async fn send_group_message(&self, sender: &UserSnapshot, content: &str, group_id: GroupId) -> Result<(), ApiError> {
		let conversation = self
			.chats
			.find_group(group_id, sender.id)
			.await?
			.ok_or_else(|| ApiError::not_found("no matching chatting group"))?;

		self.chats.append_message(conversation.id, sender.id, content).await?;

		metrics::counter!("linkup_server_group_messages_total").increment(1);

		self.presence
			.send_to_user(
				sender.id,
				ServerFrame::SuccessMessage {
					content: content.to_string(),
				},
			)
			.await;

		if let Some(room) = conversation.room_id {
			self.rooms
				.publish_except_user(
					&room,
					sender.id,
					ServerFrame::NewMessage {
						content: content.to_string(),
						from: public_user(sender),
						group_id: Some(group_id),
					},
				)
				.await;
		}

		Ok(())
	}

	/// Typing indicator: fire-and-forget to a single recipient or a room. No
	/// persistence, no acknowledgment.
	pub async fn set_typing(
		&self,
		sender: &UserSnapshot,
		typing: bool,
		group_id: Option<GroupId>,
		send_to: Option<UserId>,
	) -> Result<(), ApiError> {
		if let Some(to) = send_to {
			self.presence
				.send_to_user(
					to,
					ServerFrame::SetTyping {
						typing,
						user: public_user(sender),
						group_id: None,
					},
				)
				.await;
			return Ok(());
		}

		if let Some(group_id) = group_id {
			let conversation = self
				.chats
				.find_group(group_id, sender.id)
				.await?
				.ok_or_else(|| ApiError::not_found("no matching chatting group"))?;

			if let Some(room) = conversation.room_id {
				self.rooms
					.publish_except_user(
						&room,
						sender.id,
						ServerFrame::SetTyping {
							typing,
							user: public_user(sender),
							group_id: Some(group_id),
						},
					)
					.await;
			}
		}

		Ok(())
	}

	/// Synchronous group creation. Every listed participant must already be a
	/// contact of the creator; a stored image is deleted again if persistence
	/// fails afterwards.
	pub async fn create_group(
		&self,
		creator: &UserSnapshot,
		name: &str,
		participants: &[UserId],
		image: Option<UploadedImage>,
	) -> Result<Conversation, ApiError> {
		let name = name.trim();
		if name.is_empty() || participants.is_empty() {
			return Err(ApiError::not_found("group name and participants are required"));
		}

		let known = self.users.count_contacts_among(creator.id, participants).await?;
		if known != participants.len() {
			return Err(ApiError::not_found("some or all recipients are invalid"));
		}

		let room_id = RoomId::new(format!(
			"{}_{}",
			name.split_whitespace().collect::<Vec<_>>().join("_"),
			uuid::Uuid::new_v4()
		))
		.map_err(ApiError::upstream)?;

		let mut image_key: Option<String> = None;
		if let Some(image) = image {
			let key = format!("chat/{}/cover.{}", room_id, image.extension());
			self.images.put(&key, &image.bytes).await.map_err(ApiError::upstream)?;
			image_key = Some(key);
		}

		let created = self
			.chats
			.create_group(name, &room_id, image_key.as_deref(), creator.id, participants)
			.await;

		match created {
			Ok(conversation) => {
				metrics::counter!("linkup_server_groups_created_total").increment(1);
				Ok(conversation)
			}
			Err(e) => {
				// No transaction spans the chat store and object storage, so
				// compensate before surfacing the failure.
				if let Some(key) = image_key
					&& let Err(del) = self.images.delete(&key).await
				{
					warn!(key, error = %del, "failed to delete orphaned group image");
				}
				Err(e)
			}
		}
	}
}

fn public_user(user: &UserSnapshot) -> PublicUser {
	PublicUser {
		id: user.id,
		username: user.username.clone(),
	}
}
