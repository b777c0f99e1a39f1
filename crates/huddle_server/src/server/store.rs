#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use huddle_domain::{MemberRole, Membership, MessageId, MessageRecord, RoomId, RoomRecord, SenderType, UserId};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// The persistent store is the single source of truth for rooms,
/// membership, messages, and presence. The hub consults it before
/// honoring every state-changing client request; the in-memory
/// registry/index are never trusted as authorization.
#[async_trait::async_trait]
pub trait ChatStore: Send + Sync {
	/// Membership Authority: is `user` a member of `room`, and with
	/// which role?
	async fn find_membership(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Membership>>;

	async fn member_count(&self, room: &RoomId) -> anyhow::Result<u64>;

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()>;

	/// Promote the longest-tenured non-owner member (earliest
	/// `joined_at`, ties broken by user id) to owner. Returns the
	/// promoted user, if any.
	async fn promote_earliest_member(&self, room: &RoomId) -> anyhow::Result<Option<UserId>>;

	async fn find_room(&self, room: &RoomId) -> anyhow::Result<Option<RoomRecord>>;

	async fn update_room_title(&self, room: &RoomId, title: &str) -> anyhow::Result<Option<RoomRecord>>;

	/// Delete a room; members and messages go with it.
	async fn delete_room(&self, room: &RoomId) -> anyhow::Result<()>;

	async fn create_message(
		&self,
		room: &RoomId,
		sender_type: SenderType,
		sender: Option<&UserId>,
		content: &str,
	) -> anyhow::Result<MessageRecord>;

	async fn find_message(&self, id: &MessageId) -> anyhow::Result<Option<MessageRecord>>;

	async fn set_message_content(&self, id: &MessageId, content: &str) -> anyhow::Result<Option<MessageRecord>>;

	async fn display_name(&self, user: &UserId) -> anyhow::Result<Option<String>>;

	/// Stamp the user's online flag and last-seen time. Called only on
	/// 0→1 and 1→0 connection-count transitions to bound write volume.
	async fn set_user_presence(&self, user: &UserId, online: bool, at_unix_ms: i64) -> anyhow::Result<()>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgChatStore {
	pool: sqlx::PgPool,
}

impl PgChatStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
		sqlx::migrate!("./migrations").run(&pool).await.context("run migrations")?;
		Ok(Self { pool })
	}
}

type MessageRow = (String, String, String, Option<String>, String, i64);

fn message_from_row(row: MessageRow) -> anyhow::Result<MessageRecord> {
	let (id, room_id, sender_type, sender_user_id, content, created_at) = row;
	Ok(MessageRecord {
		id: MessageId::new(id).map_err(|e| anyhow!(e))?,
		room_id: RoomId::new(room_id).map_err(|e| anyhow!(e))?,
		sender_type: sender_type.parse::<SenderType>().map_err(|e| anyhow!(e))?,
		sender_user_id: sender_user_id
			.map(|u| UserId::new(u).map_err(|e| anyhow!(e)))
			.transpose()?,
		content,
		created_at_unix_ms: created_at,
	})
}

type RoomRow = (String, String, String, String, i64);

fn room_from_row(row: RoomRow) -> anyhow::Result<RoomRecord> {
	let (id, title, room_type, created_by, created_at) = row;
	Ok(RoomRecord {
		id: RoomId::new(id).map_err(|e| anyhow!(e))?,
		title,
		room_type,
		created_by: UserId::new(created_by).map_err(|e| anyhow!(e))?,
		created_at_unix_ms: created_at,
	})
}

#[async_trait::async_trait]
impl ChatStore for PgChatStore {
	async fn find_membership(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Membership>> {
		let row: Option<(String, i64)> =
			sqlx::query_as("SELECT role, joined_at FROM room_members WHERE room_id = $1 AND user_id = $2")
				.bind(room.as_str())
				.bind(user.as_str())
				.fetch_optional(&self.pool)
				.await
				.context("select membership")?;

		let Some((role, joined_at)) = row else {
			return Ok(None);
		};

		Ok(Some(Membership {
			room_id: room.clone(),
			user_id: user.clone(),
			role: role.parse::<MemberRole>().map_err(|e| anyhow!(e))?,
			joined_at_unix_ms: joined_at,
		}))
	}

	async fn member_count(&self, room: &RoomId) -> anyhow::Result<u64> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM room_members WHERE room_id = $1")
			.bind(room.as_str())
			.fetch_one(&self.pool)
			.await
			.context("count members")?;
		Ok(count.max(0) as u64)
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
			.bind(room.as_str())
			.bind(user.as_str())
			.execute(&self.pool)
			.await
			.context("delete membership")?;
		Ok(())
	}

	async fn promote_earliest_member(&self, room: &RoomId) -> anyhow::Result<Option<UserId>> {
		let row: Option<(String,)> = sqlx::query_as(
			"UPDATE room_members SET role = 'owner' \
			WHERE room_id = $1 AND user_id = ( \
				SELECT user_id FROM room_members \
				WHERE room_id = $1 AND role <> 'owner' \
				ORDER BY joined_at ASC, user_id ASC LIMIT 1 \
			) RETURNING user_id",
		)
		.bind(room.as_str())
		.fetch_optional(&self.pool)
		.await
		.context("promote member")?;

		row.map(|(u,)| UserId::new(u).map_err(|e| anyhow!(e))).transpose()
	}

	async fn find_room(&self, room: &RoomId) -> anyhow::Result<Option<RoomRecord>> {
		let row: Option<RoomRow> =
			sqlx::query_as("SELECT id, title, room_type, created_by, created_at FROM rooms WHERE id = $1")
				.bind(room.as_str())
				.fetch_optional(&self.pool)
				.await
				.context("select room")?;
		row.map(room_from_row).transpose()
	}

	async fn update_room_title(&self, room: &RoomId, title: &str) -> anyhow::Result<Option<RoomRecord>> {
		let row: Option<RoomRow> = sqlx::query_as(
			"UPDATE rooms SET title = $2 WHERE id = $1 RETURNING id, title, room_type, created_by, created_at",
		)
		.bind(room.as_str())
		.bind(title)
		.fetch_optional(&self.pool)
		.await
		.context("update room title")?;
		row.map(room_from_row).transpose()
	}

	async fn delete_room(&self, room: &RoomId) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM rooms WHERE id = $1")
			.bind(room.as_str())
			.execute(&self.pool)
			.await
			.context("delete room")?;
		Ok(())
	}

	async fn create_message(
		&self,
		room: &RoomId,
		sender_type: SenderType,
		sender: Option<&UserId>,
		content: &str,
	) -> anyhow::Result<MessageRecord> {
		let record = MessageRecord {
			id: MessageId::random(),
			room_id: room.clone(),
			sender_type,
			sender_user_id: sender.cloned(),
			content: content.to_string(),
			created_at_unix_ms: unix_ms_now(),
		};

		sqlx::query(
			"INSERT INTO messages (id, room_id, sender_type, sender_user_id, content, created_at) \
			VALUES ($1, $2, $3, $4, $5, $6)",
		)
		.bind(record.id.as_str())
		.bind(record.room_id.as_str())
		.bind(record.sender_type.as_str())
		.bind(record.sender_user_id.as_ref().map(|u| u.as_str()))
		.bind(&record.content)
		.bind(record.created_at_unix_ms)
		.execute(&self.pool)
		.await
		.context("insert message")?;

		Ok(record)
	}

	async fn find_message(&self, id: &MessageId) -> anyhow::Result<Option<MessageRecord>> {
		let row: Option<MessageRow> = sqlx::query_as(
			"SELECT id, room_id, sender_type, sender_user_id, content, created_at FROM messages WHERE id = $1",
		)
		.bind(id.as_str())
		.fetch_optional(&self.pool)
		.await
		.context("select message")?;
		row.map(message_from_row).transpose()
	}

	async fn set_message_content(&self, id: &MessageId, content: &str) -> anyhow::Result<Option<MessageRecord>> {
		let row: Option<MessageRow> = sqlx::query_as(
			"UPDATE messages SET content = $2 WHERE id = $1 \
			RETURNING id, room_id, sender_type, sender_user_id, content, created_at",
		)
		.bind(id.as_str())
		.bind(content)
		.fetch_optional(&self.pool)
		.await
		.context("update message content")?;
		row.map(message_from_row).transpose()
	}

	async fn display_name(&self, user: &UserId) -> anyhow::Result<Option<String>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT display_name FROM users WHERE id = $1")
			.bind(user.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select display name")?;
		Ok(row.map(|(name,)| name))
	}

	async fn set_user_presence(&self, user: &UserId, online: bool, at_unix_ms: i64) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO users (id, is_online, last_seen_at) VALUES ($1, $2, $3) \
			ON CONFLICT (id) DO UPDATE SET is_online = EXCLUDED.is_online, last_seen_at = EXCLUDED.last_seen_at",
		)
		.bind(user.as_str())
		.bind(online)
		.bind(at_unix_ms)
		.execute(&self.pool)
		.await
		.context("upsert presence")?;
		Ok(())
	}
}

/// In-memory store used for dev mode and tests. Mirrors the Postgres
/// backend's semantics, including room-delete cascades.
#[derive(Default)]
pub struct MemoryChatStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	users: HashMap<UserId, UserRow>,
	rooms: HashMap<RoomId, RoomRecord>,
	members: HashMap<RoomId, HashMap<UserId, Membership>>,
	messages: HashMap<MessageId, MessageRecord>,
}

#[derive(Debug, Clone, Default)]
struct UserRow {
	display_name: String,
	is_online: bool,
	last_seen_at: i64,
}

impl MemoryChatStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn seed_user(&self, user: UserId, display_name: &str) {
		let mut inner = self.inner.lock().await;
		inner.users.insert(
			user,
			UserRow {
				display_name: display_name.to_string(),
				..UserRow::default()
			},
		);
	}

	/// Seed a room with an owner, like the HTTP room-create path would.
	pub async fn seed_room(&self, room: RoomId, title: &str, owner: UserId) {
		let mut inner = self.inner.lock().await;
		let now = unix_ms_now();
		inner.rooms.insert(
			room.clone(),
			RoomRecord {
				id: room.clone(),
				title: title.to_string(),
				room_type: "group".to_string(),
				created_by: owner.clone(),
				created_at_unix_ms: now,
			},
		);
		inner.members.entry(room.clone()).or_default().insert(
			owner.clone(),
			Membership {
				room_id: room,
				user_id: owner,
				role: MemberRole::Owner,
				joined_at_unix_ms: now,
			},
		);
	}

	/// Seed an additional member, like the HTTP invite path would.
	pub async fn seed_member(&self, room: RoomId, user: UserId, role: MemberRole, joined_at_unix_ms: i64) {
		let mut inner = self.inner.lock().await;
		inner.members.entry(room.clone()).or_default().insert(
			user.clone(),
			Membership {
				room_id: room,
				user_id: user,
				role,
				joined_at_unix_ms,
			},
		);
	}

	/// Presence snapshot for assertions.
	pub async fn presence_of(&self, user: &UserId) -> Option<(bool, i64)> {
		let inner = self.inner.lock().await;
		inner.users.get(user).map(|u| (u.is_online, u.last_seen_at))
	}
}

#[async_trait::async_trait]
impl ChatStore for MemoryChatStore {
	async fn find_membership(&self, room: &RoomId, user: &UserId) -> anyhow::Result<Option<Membership>> {
		let inner = self.inner.lock().await;
		Ok(inner.members.get(room).and_then(|m| m.get(user)).cloned())
	}

	async fn member_count(&self, room: &RoomId) -> anyhow::Result<u64> {
		let inner = self.inner.lock().await;
		Ok(inner.members.get(room).map(|m| m.len() as u64).unwrap_or(0))
	}

	async fn remove_member(&self, room: &RoomId, user: &UserId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		if let Some(members) = inner.members.get_mut(room) {
			members.remove(user);
			if members.is_empty() {
				inner.members.remove(room);
			}
		}
		Ok(())
	}

	async fn promote_earliest_member(&self, room: &RoomId) -> anyhow::Result<Option<UserId>> {
		let mut inner = self.inner.lock().await;
		let Some(members) = inner.members.get_mut(room) else {
			return Ok(None);
		};

		let candidate = members
			.values()
			.filter(|m| m.role != MemberRole::Owner)
			.min_by(|a, b| {
				a.joined_at_unix_ms
					.cmp(&b.joined_at_unix_ms)
					.then_with(|| a.user_id.cmp(&b.user_id))
			})
			.map(|m| m.user_id.clone());

		if let Some(user) = candidate.as_ref()
			&& let Some(membership) = members.get_mut(user)
		{
			membership.role = MemberRole::Owner;
		}

		Ok(candidate)
	}

	async fn find_room(&self, room: &RoomId) -> anyhow::Result<Option<RoomRecord>> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(room).cloned())
	}

	async fn update_room_title(&self, room: &RoomId, title: &str) -> anyhow::Result<Option<RoomRecord>> {
		let mut inner = self.inner.lock().await;
		match inner.rooms.get_mut(room) {
			Some(record) => {
				record.title = title.to_string();
				Ok(Some(record.clone()))
			}
			None => Ok(None),
		}
	}

	async fn delete_room(&self, room: &RoomId) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		inner.rooms.remove(room);
		inner.members.remove(room);
		inner.messages.retain(|_, m| m.room_id != *room);
		Ok(())
	}

	async fn create_message(
		&self,
		room: &RoomId,
		sender_type: SenderType,
		sender: Option<&UserId>,
		content: &str,
	) -> anyhow::Result<MessageRecord> {
		let mut inner = self.inner.lock().await;
		if !inner.rooms.contains_key(room) {
			return Err(anyhow!("room not found: {room}"));
		}

		let record = MessageRecord {
			id: MessageId::random(),
			room_id: room.clone(),
			sender_type,
			sender_user_id: sender.cloned(),
			content: content.to_string(),
			created_at_unix_ms: unix_ms_now(),
		};
		inner.messages.insert(record.id.clone(), record.clone());
		Ok(record)
	}

	async fn find_message(&self, id: &MessageId) -> anyhow::Result<Option<MessageRecord>> {
		let inner = self.inner.lock().await;
		Ok(inner.messages.get(id).cloned())
	}

	async fn set_message_content(&self, id: &MessageId, content: &str) -> anyhow::Result<Option<MessageRecord>> {
		let mut inner = self.inner.lock().await;
		match inner.messages.get_mut(id) {
			Some(record) => {
				record.content = content.to_string();
				Ok(Some(record.clone()))
			}
			None => Ok(None),
		}
	}

	async fn display_name(&self, user: &UserId) -> anyhow::Result<Option<String>> {
		let inner = self.inner.lock().await;
		Ok(inner.users.get(user).map(|u| u.display_name.clone()))
	}

	async fn set_user_presence(&self, user: &UserId, online: bool, at_unix_ms: i64) -> anyhow::Result<()> {
		let mut inner = self.inner.lock().await;
		let row = inner.users.entry(user.clone()).or_default();
		row.is_online = online;
		row.last_seen_at = at_unix_ms;
		Ok(())
	}
}
