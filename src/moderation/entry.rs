//! Moderation entries
//!
//! This module defines the moderation record (the "case") and the kinds of
//! punishment it can describe.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of punishment a moderation entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeVariation {
    /// Server ban
    Ban,
    /// Server kick
    Kick,
    /// Ban immediately followed by an unban, used to purge messages
    SoftBan,
    /// Muted role
    Mute,
    /// Discord communication timeout
    Timeout,
    /// Warning
    Warning,
    /// Restriction from sending attachments
    RestrictedAttachment,
    /// Restriction from embedding links
    RestrictedEmbed,
    /// Restriction from using external emojis
    RestrictedEmoji,
    /// Restriction from adding reactions
    RestrictedReaction,
    /// Restriction from sending messages
    RestrictedText,
    /// Restriction from connecting to voice channels
    RestrictedVoice,
}

impl TypeVariation {
    /// Every punishment kind, in declaration order
    pub const ALL: [Self; 12] = [
        Self::Ban,
        Self::Kick,
        Self::SoftBan,
        Self::Mute,
        Self::Timeout,
        Self::Warning,
        Self::RestrictedAttachment,
        Self::RestrictedEmbed,
        Self::RestrictedEmoji,
        Self::RestrictedReaction,
        Self::RestrictedText,
        Self::RestrictedVoice,
    ];

    /// Name of the scheduled task that lifts this punishment once its duration
    /// elapses. Kinds that cannot be undone, or whose timer is kept by Discord,
    /// have none.
    #[must_use]
    pub fn undo_task_name(self) -> Option<&'static str> {
        match self {
            Self::Ban => Some("moderationEndBan"),
            Self::Mute => Some("moderationEndMute"),
            Self::Warning => Some("moderationEndWarning"),
            Self::RestrictedAttachment => Some("moderationEndRestrictionAttachment"),
            Self::RestrictedEmbed => Some("moderationEndRestrictionEmbed"),
            Self::RestrictedEmoji => Some("moderationEndRestrictionEmoji"),
            Self::RestrictedReaction => Some("moderationEndRestrictionReaction"),
            Self::RestrictedText => Some("moderationEndRestrictionText"),
            Self::RestrictedVoice => Some("moderationEndRestrictionVoice"),
            Self::Kick | Self::SoftBan | Self::Timeout => None,
        }
    }

    /// Reverse lookup of [`TypeVariation::undo_task_name`]
    #[must_use]
    pub fn from_undo_task_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.undo_task_name() == Some(name))
    }

    /// Whether this kind is enforced through a guild role
    #[must_use]
    pub fn is_role_based(self) -> bool {
        matches!(
            self,
            Self::Mute
                | Self::RestrictedAttachment
                | Self::RestrictedEmbed
                | Self::RestrictedEmoji
                | Self::RestrictedReaction
                | Self::RestrictedText
                | Self::RestrictedVoice
        )
    }
}

impl fmt::Display for TypeVariation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ban => write!(f, "Ban"),
            Self::Kick => write!(f, "Kick"),
            Self::SoftBan => write!(f, "Soft Ban"),
            Self::Mute => write!(f, "Mute"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Warning => write!(f, "Warning"),
            Self::RestrictedAttachment => write!(f, "Attachment Restriction"),
            Self::RestrictedEmbed => write!(f, "Embed Restriction"),
            Self::RestrictedEmoji => write!(f, "Emoji Restriction"),
            Self::RestrictedReaction => write!(f, "Reaction Restriction"),
            Self::RestrictedText => write!(f, "Text Restriction"),
            Self::RestrictedVoice => write!(f, "Voice Restriction"),
        }
    }
}

bitflags::bitflags! {
    /// Flags describing how an entry relates to other entries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TypeMetadata: u8 {
        /// The entry records the reversal of an earlier punishment
        const UNDO = 1 << 0;
    }
}

impl Default for TypeMetadata {
    fn default() -> Self {
        Self::empty()
    }
}

/// Kind-specific payload attached to an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtraData {
    /// The role that enforces a role-based punishment
    Role { role_id: u64 },
}

impl ExtraData {
    /// The role carried by this payload, if any
    #[must_use]
    pub fn role_id(&self) -> Option<u64> {
        match self {
            Self::Role { role_id } => Some(*role_id),
        }
    }
}

/// Caller-supplied fields for a new entry
#[derive(Debug, Clone, Default)]
pub struct CreateData {
    pub kind: Option<TypeVariation>,
    pub user_id: Option<u64>,
    pub moderator_id: Option<u64>,
    pub reason: Option<String>,
    /// Duration in milliseconds
    pub duration: Option<u64>,
    pub extra_data: Option<ExtraData>,
    pub metadata: TypeMetadata,
}

/// An entry that has been built but not persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftEntry {
    pub guild_id: u64,
    pub kind: TypeVariation,
    pub user_id: u64,
    pub moderator_id: u64,
    pub reason: Option<String>,
    /// Duration in milliseconds, `None` for permanent punishments
    pub duration: Option<u64>,
    pub extra_data: Option<ExtraData>,
    pub metadata: TypeMetadata,
    pub created_at: DateTime<Utc>,
}

impl DraftEntry {
    /// Whether this draft records a reversal
    #[must_use]
    pub fn is_undo(&self) -> bool {
        self.metadata.contains(TypeMetadata::UNDO)
    }

    /// When the punishment elapses, if it is temporary
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expiry(self.created_at, self.duration)
    }

    /// Attach the sequential id assigned at insertion time
    #[must_use]
    pub fn into_entry(self, id: u64) -> Entry {
        Entry {
            id,
            guild_id: self.guild_id,
            kind: self.kind,
            user_id: self.user_id,
            moderator_id: self.moderator_id,
            reason: self.reason,
            duration: self.duration,
            extra_data: self.extra_data,
            metadata: self.metadata,
            created_at: self.created_at,
            completed: false,
            archived: false,
        }
    }
}

/// A persisted moderation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Sequential id, unique within the guild
    pub id: u64,
    pub guild_id: u64,
    pub kind: TypeVariation,
    pub user_id: u64,
    pub moderator_id: u64,
    pub reason: Option<String>,
    /// Duration in milliseconds, `None` for permanent punishments
    pub duration: Option<u64>,
    pub extra_data: Option<ExtraData>,
    pub metadata: TypeMetadata,
    pub created_at: DateTime<Utc>,
    /// The duration elapsed and the punishment was lifted
    pub completed: bool,
    /// Closed by a moderator without waiting for the duration
    pub archived: bool,
}

impl Entry {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived
    }

    /// Completed and archived entries are both closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.completed || self.archived
    }

    #[must_use]
    pub fn is_undo(&self) -> bool {
        self.metadata.contains(TypeMetadata::UNDO)
    }

    /// Whether the entry has a non-zero duration
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.duration.is_some_and(|duration| duration > 0)
    }

    /// When the punishment elapses, if it is temporary
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        expiry(self.created_at, self.duration)
    }

    /// Milliseconds since the epoch at which the punishment elapses
    #[must_use]
    pub fn expires_timestamp(&self) -> Option<i64> {
        self.expires_at().map(|at| at.timestamp_millis())
    }
}

fn expiry(created_at: DateTime<Utc>, duration: Option<u64>) -> Option<DateTime<Utc>> {
    let duration = duration.filter(|duration| *duration > 0)?;
    let millis = i64::try_from(duration).ok()?;
    created_at.checked_add_signed(Duration::milliseconds(millis))
}

/// Selection criteria for fetching entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub user_id: Option<u64>,
    pub kind: Option<TypeVariation>,
}

impl EntryFilter {
    /// Every entry for a user
    #[must_use]
    pub fn user(user_id: u64) -> Self {
        Self {
            user_id: Some(user_id),
            kind: None,
        }
    }

    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        self.user_id.is_none_or(|user_id| entry.user_id == user_id)
            && self.kind.is_none_or(|kind| entry.kind == kind)
    }
}
