use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CampaignId, CampaignStatus, ChannelId, ChannelType, ConversationId, MessageId, MessageStatus,
    ScheduleType, StreamStatus, TemplateId, TemplateType, UserId, UserType,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub user_type: UserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub spiritual_gifts: Vec<String>,
    #[serde(default)]
    pub communication_preferences: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_type: Option<UserType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub message: String,
    pub tokens: AuthTokens,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Django REST framework page envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// List endpoints answer either with a page envelope or a bare array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Page(Paginated<T>),
    Items(Vec<T>),
}

impl<T> Listing<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Page(page) => page.results,
            Listing::Items(items) => items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub subject: String,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: UserId,
    pub sender_name: String,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConversationMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationChannel {
    pub id: ChannelId,
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub is_active: bool,
}

/// Outbound/inbound campaign message, as listed by `/messages/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub from_user_name: String,
    #[serde(default)]
    pub to_user_name: String,
    #[serde(default)]
    pub subject: String,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for `/messages/`. `status` also accepts the pseudo-status
/// `unread`, which is why it is a plain string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<CampaignId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl MessageFilter {
    pub fn unread(limit: u32) -> Self {
        Self {
            status: Some("unread".to_string()),
            campaign: None,
            limit: Some(limit),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: TemplateId,
    pub name: String,
    pub template_type: TemplateType,
    #[serde(default)]
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub template_type: TemplateType,
    pub subject: String,
    pub content: String,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCampaign {
    pub id: CampaignId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template_name: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    #[serde(default)]
    pub audience_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub template: TemplateId,
    #[serde(default)]
    pub audience_filter: serde_json::Map<String, serde_json::Value>,
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCampaignRequest {
    pub send_now: bool,
}

/// Quick-send of a template to a filtered audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub template_id: TemplateId,
    #[serde(default)]
    pub audience_filters: serde_json::Map<String, serde_json::Value>,
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub is_enabled: bool,
    #[serde(default)]
    pub opt_in_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationPreferences {
    pub user_id: UserId,
    #[serde(default)]
    pub preferences: BTreeMap<String, ChannelPreference>,
    #[serde(default)]
    pub global_opt_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceToggle {
    pub is_enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub preferences: BTreeMap<String, PreferenceToggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_opt_out: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTime {
    pub day: String,
    pub time: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub service_times: Vec<ServiceTime>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRef {
    pub id: String,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStream {
    pub id: String,
    pub branch: BranchRef,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub stream_url: String,
    #[serde(default)]
    pub platform: String,
    pub status: StreamStatus,
    #[serde(default)]
    pub viewers: u64,
}

/// Participant reference carried inside chat frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameUser {
    pub id: UserId,
    pub name: String,
}

/// Message as broadcast by the chat consumer when it is first sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMessage {
    pub id: MessageId,
    pub content: String,
    pub sender: FrameUser,
    pub timestamp: DateTime<Utc>,
}

/// A chat message in either of the shapes the chat socket emits: live
/// broadcasts use [`LiveMessage`], history replays use the REST serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Stored(ConversationMessage),
    Live(LiveMessage),
}

impl WireMessage {
    pub fn into_message(self, conversation: ConversationId) -> ConversationMessage {
        match self {
            WireMessage::Stored(message) => message,
            WireMessage::Live(live) => ConversationMessage {
                id: live.id,
                conversation,
                sender: live.sender.id,
                sender_name: live.sender.name,
                content: live.content,
                is_read: false,
                created_at: live.timestamp,
            },
        }
    }
}

/// Frames received on `/ws/chat/<conversation_id>/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChatMessage {
        message: WireMessage,
    },
    TypingIndicator {
        user: FrameUser,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
        user: FrameUser,
    },
    ConversationHistory {
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    #[serde(other)]
    Unknown,
}

/// Frames sent on `/ws/chat/<conversation_id>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage { message: String },
    Typing { is_typing: bool },
    ReadReceipt { message_id: MessageId },
}
