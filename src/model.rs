//! Wire records exchanged with the CRM backend.
//!
//! Field names follow the backend's JSON. Fields this crate doesn't interpret
//! are kept in `extra` so a record can be written back to the cache unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub messages_seen: bool,
    #[serde(default)]
    pub sent_by_me: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_customer_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cre_name: Option<CreRef>,
    #[serde(default)]
    pub page_info: Option<PageInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreRef {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "nameAsPerNID", default)]
    pub name_as_per_nid: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub page_name: String,
    #[serde(default)]
    pub page_profile_picture: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationFilters {
    #[serde(default)]
    pub cre_names: Vec<Value>,
    #[serde(default)]
    pub pages: Vec<PageInfo>,
    #[serde(default)]
    pub statuses: Vec<String>,
}

/// `GET /lead/conversation`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    #[serde(default)]
    pub total_leads: u64,
    #[serde(default)]
    pub total_pages: u64,
    #[serde(default)]
    pub current_page: u64,
    #[serde(default)]
    pub leads: Vec<Conversation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<ConversationFilters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", default)]
    pub storage_id: Option<String>,
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sent_by_me: bool,
    #[serde(default)]
    pub file_url: Vec<String>,
    #[serde(default)]
    pub is_sticker: bool,
    #[serde(default)]
    pub is_automated_message: bool,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

/// `GET /lead/conversation/{id}/messages/`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageThread {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub messages_seen: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentAuthor {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "nameAsPerNID", default)]
    pub name_as_per_nid: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub comment_by: Option<CommentAuthor>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `GET /lead/{id}/comments`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommentList {
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Payload of the `newComment_{leadId}` socket event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEvent {
    pub lead_id: String,
    pub comment: Comment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    #[serde(rename = "_id")]
    pub id: String,
    pub time: DateTime<Utc>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLog {
    pub recipient_number: String,
    pub call_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_duration: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub phone: Vec<String>,
    #[serde(default)]
    pub messages_seen: bool,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub cre_name: Option<CreRef>,
    #[serde(default)]
    pub comment: Vec<Comment>,
    #[serde(default)]
    pub reminder: Vec<Reminder>,
    #[serde(default)]
    pub call_logs: Vec<CallLog>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `GET /lead?...`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadPage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub total_pages: u64,
    #[serde(default)]
    pub leads: Vec<Lead>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Filters for `GET /lead`. Unset or empty fields are left out of the query
/// string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadFilter {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub source: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub assigned_cre: Option<String>,
    pub sales_executive: Option<String>,
}

impl LeadFilter {
    /// Query pairs in the order the backend documents them; page and limit
    /// default to 1 and 100.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.unwrap_or(1).to_string()),
            ("limit", self.limit.unwrap_or(100).to_string()),
        ];
        let optional = [
            ("status", &self.status),
            ("source", &self.source),
            ("startDate", &self.start_date),
            ("endDate", &self.end_date),
            ("assignedCre", &self.assigned_cre),
            ("salesExecutive", &self.sales_executive),
        ];
        for (name, value) in optional {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                pairs.push((name, value.clone()));
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewLead {
    pub name: String,
    pub phone: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cre: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewComment {
    pub comment: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReminder {
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<NewComment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_last_reminder: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCallLog {
    pub recipient_number: String,
    pub call_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_duration: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub message_type: String,
    pub content: OutgoingContent,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutgoingContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message_type: "text".to_string(),
            content: OutgoingContent {
                text: Some(text.into()),
                urls: Vec::new(),
            },
        }
    }

    pub fn attachments(message_type: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            message_type: message_type.into(),
            content: OutgoingContent { text: None, urls },
        }
    }
}

/// Server acknowledgement carrying a message and, for most lead mutations,
/// the updated lead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub lead: Option<Lead>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderAck {
    pub status: String,
    #[serde(default)]
    pub reminders: Vec<Reminder>,
}
