//! Replicated entity types.
//!
//! Every entity carries the id assigned by the live platform, the id of the
//! guild (scope) that owns it and a logical-delete `active` flag. The engine
//! never removes rows; removal on the live side flips `active` to false.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::profile::ProfileHistoryEntry;

/// Identifier of a guild, the isolation boundary for entity ids.
pub type ScopeId = String;

/// Identifier of an entity within its kind.
pub type EntityId = String;

fn default_active() -> bool {
    true
}

/// The entity types tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Guild,
    Channel,
    Role,
    Member,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Guild,
        EntityKind::Channel,
        EntityKind::Role,
        EntityKind::Member,
        EntityKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Guild => "guild",
            EntityKind::Channel => "channel",
            EntityKind::Role => "role",
            EntityKind::Member => "member",
            EntityKind::Message => "message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown entity kind: {0}")]
pub struct UnknownEntityKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guild" => Ok(EntityKind::Guild),
            "channel" => Ok(EntityKind::Channel),
            "role" => Ok(EntityKind::Role),
            "member" => Ok(EntityKind::Member),
            "message" => Ok(EntityKind::Message),
            other => Err(UnknownEntityKind(other.to_string())),
        }
    }
}

/// A guild (community)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guild {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Member count as cached by the platform connection
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub approximate_member_count: Option<u64>,
    #[serde(default)]
    pub approximate_presence_count: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Guild {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            icon: None,
            owner_id: None,
            member_count: None,
            approximate_member_count: None,
            approximate_presence_count: None,
            active: true,
        }
    }
}

/// Channel flavours. Only some carry messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Announcement,
    Thread,
    Forum,
    Stage,
}

impl ChannelKind {
    /// Whether messages can be posted directly in this channel
    pub fn is_message_bearing(&self) -> bool {
        matches!(
            self,
            ChannelKind::Text | ChannelKind::Voice | ChannelKind::Announcement | ChannelKind::Thread
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub last_message_id: Option<String>,
    /// Timestamp of the newest message, when the platform cache knows it
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Channel {
    pub fn new(
        id: impl Into<String>,
        guild_id: impl Into<String>,
        name: impl Into<String>,
        kind: ChannelKind,
    ) -> Self {
        Self {
            id: id.into(),
            guild_id: guild_id.into(),
            name: name.into(),
            kind,
            parent_id: None,
            position: 0,
            topic: None,
            nsfw: false,
            last_message_id: None,
            last_message_at: None,
            active: true,
        }
    }

    pub fn with_last_message_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_message_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub mentionable: bool,
    #[serde(default)]
    pub managed: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Role {
    pub fn new(id: impl Into<String>, guild_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            guild_id: guild_id.into(),
            name: name.into(),
            color: 0,
            position: 0,
            permissions: "0".to_string(),
            hoist: false,
            mentionable: false,
            managed: false,
            active: true,
        }
    }
}

/// A user's membership in a guild.
///
/// Identity is the composite `guild_id:user_id`. Profile history is embedded
/// in the row and owned by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub guild_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub guild_avatar: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub accent_color: Option<u32>,
    #[serde(default)]
    pub public_flags: u64,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub premium_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub profile_hash: Option<String>,
    #[serde(default)]
    pub profile_history: Vec<ProfileHistoryEntry>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Member {
    pub fn new(
        guild_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            global_name: None,
            nickname: None,
            avatar: None,
            guild_avatar: None,
            banner: None,
            accent_color: None,
            public_flags: 0,
            bot: false,
            roles: BTreeSet::new(),
            joined_at: None,
            premium_since: None,
            profile_hash: None,
            profile_history: Vec::new(),
            active: true,
        }
    }

    /// Composite replica id for a member
    pub fn composite_id(guild_id: &str, user_id: &str) -> String {
        format!("{}:{}", guild_id, user_id)
    }

    pub fn entity_id(&self) -> String {
        Self::composite_id(&self.guild_id, &self.user_id)
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub author_id: String,
    /// Author is an automated account
    #[serde(default)]
    pub author_bot: bool,
    /// Platform-generated message (joins, pins, boosts)
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachment_count: u32,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        guild_id: impl Into<String>,
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            author_id: author_id.into(),
            author_bot: false,
            system: false,
            content: String::new(),
            created_at,
            edited_at: None,
            attachment_count: 0,
            reply_to: None,
            active: true,
        }
    }

    /// Messages from bots or the platform itself are never replicated
    pub fn is_automated(&self) -> bool {
        self.author_bot || self.system
    }

    /// Latest modification time: the edit time, else creation
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.created_at)
    }
}

/// Any replicated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum Entity {
    Guild(Guild),
    Channel(Channel),
    Role(Role),
    Member(Member),
    Message(Message),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Guild(_) => EntityKind::Guild,
            Entity::Channel(_) => EntityKind::Channel,
            Entity::Role(_) => EntityKind::Role,
            Entity::Member(_) => EntityKind::Member,
            Entity::Message(_) => EntityKind::Message,
        }
    }

    /// Replica id. Members use the composite `guild:user` id.
    pub fn id(&self) -> EntityId {
        match self {
            Entity::Guild(g) => g.id.clone(),
            Entity::Channel(c) => c.id.clone(),
            Entity::Role(r) => r.id.clone(),
            Entity::Member(m) => m.entity_id(),
            Entity::Message(m) => m.id.clone(),
        }
    }

    pub fn scope_id(&self) -> &str {
        match self {
            Entity::Guild(g) => &g.id,
            Entity::Channel(c) => &c.guild_id,
            Entity::Role(r) => &r.guild_id,
            Entity::Member(m) => &m.guild_id,
            Entity::Message(m) => &m.guild_id,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Entity::Guild(g) => g.active,
            Entity::Channel(c) => c.active,
            Entity::Role(r) => r.active,
            Entity::Member(m) => m.active,
            Entity::Message(m) => m.active,
        }
    }

    pub fn set_active(&mut self, active: bool) {
        match self {
            Entity::Guild(g) => g.active = active,
            Entity::Channel(c) => c.active = active,
            Entity::Role(r) => r.active = active,
            Entity::Member(m) => m.active = active,
            Entity::Message(m) => m.active = active,
        }
    }

    /// Modification time reported by the platform, where one exists
    pub fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Entity::Message(m) => Some(m.last_modified()),
            _ => None,
        }
    }

    pub fn as_member(&self) -> Option<&Member> {
        match self {
            Entity::Member(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Entity::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match self {
            Entity::Channel(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Guild> for Entity {
    fn from(value: Guild) -> Self {
        Entity::Guild(value)
    }
}

impl From<Channel> for Entity {
    fn from(value: Channel) -> Self {
        Entity::Channel(value)
    }
}

impl From<Role> for Entity {
    fn from(value: Role) -> Self {
        Entity::Role(value)
    }
}

impl From<Member> for Entity {
    fn from(value: Member) -> Self {
        Entity::Member(value)
    }
}

impl From<Message> for Entity {
    fn from(value: Message) -> Self {
        Entity::Message(value)
    }
}
