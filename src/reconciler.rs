//! Merges socket push events into cached query results.
//!
//! One socket handler exists per (event, scope). Cache entries that need it
//! take a reference when they are created and release it from their teardown
//! cleanup; the handler is removed from the socket with the last reference.

use crate::api::keys;
use crate::cache::{mutator, CacheData, Cleanup, EntityCache};
use crate::model::{Comment, CommentEvent, Conversation, Message, MessageThread};
use crate::transport::socket::{handler, Handler, SocketClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CONVERSATION_EVENT: &str = "conversation";

pub fn message_event(conversation_id: &str) -> String {
    format!("fbMessage{conversation_id}")
}

pub fn comment_event(lead_id: &str) -> String {
    format!("newComment_{lead_id}")
}

/// Insert or move `conversation` so the list stays sorted newest first.
///
/// The list must already be sorted (see [`normalize_conversations`]). An
/// existing record with the same `_id` is replaced; among equal timestamps the
/// pushed record goes first. Records without a last-message time sort last.
pub fn upsert_conversation(list: &mut Vec<Conversation>, conversation: Conversation) {
    if let Some(pos) = list.iter().position(|c| c.id == conversation.id) {
        list.remove(pos);
    }
    let at = list.partition_point(|c| c.last_message_time > conversation.last_message_time);
    list.insert(at, conversation);
}

/// Drop duplicate `_id`s (first one wins) and stably sort newest first.
pub fn normalize_conversations(list: &mut Vec<Conversation>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|c| seen.insert(c.id.clone()));
    list.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
}

/// Append unless a message with the same `messageId` is already present.
pub fn append_message(thread: &mut MessageThread, message: Message) -> bool {
    if thread
        .messages
        .iter()
        .any(|m| m.message_id == message.message_id)
    {
        return false;
    }
    thread.messages.push(message);
    true
}

/// Append unless a comment with the same `_id` is already present.
pub fn append_comment(comments: &mut Vec<Comment>, comment: Comment) -> bool {
    if comments.iter().any(|c| c.id == comment.id) {
        return false;
    }
    comments.push(comment);
    true
}

struct Listener {
    handler: Handler,
    refs: usize,
}

/// Owns the socket listeners that keep cached views live.
#[derive(Clone)]
pub struct Reconciler {
    socket: Arc<SocketClient>,
    cache: EntityCache,
    listeners: Arc<Mutex<HashMap<String, Listener>>>,
}

impl Reconciler {
    pub fn new(socket: Arc<SocketClient>, cache: EntityCache) -> Self {
        Self {
            socket,
            cache,
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// References currently held on `event`'s handler.
    pub fn listener_refs(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, |l| l.refs)
    }

    /// Keep every cached conversation list in step with `conversation` events.
    pub fn attach_conversations(&self) -> Cleanup {
        let cache = self.cache.clone();
        self.retain(CONVERSATION_EVENT.to_string(), move || {
            handler(move |payload| {
                match serde_json::from_value::<Conversation>(payload.clone()) {
                    Ok(conversation) => {
                        apply_conversation(&cache, conversation);
                    }
                    Err(e) => warn!("Ignoring malformed conversation event: {}", e),
                }
            })
        })
    }

    /// Keep the thread of `conversation_id` in step with its message events.
    pub fn attach_messages(&self, conversation_id: &str) -> Cleanup {
        let cache = self.cache.clone();
        let id = conversation_id.to_string();
        self.retain(message_event(conversation_id), move || {
            handler(move |payload| match serde_json::from_value::<Message>(payload.clone()) {
                Ok(message) => {
                    apply_message(&cache, &id, message);
                }
                Err(e) => warn!("Ignoring malformed message event for {}: {}", id, e),
            })
        })
    }

    /// Keep the lead detail and comment list of `lead_id` in step with its
    /// comment events.
    pub fn attach_comments(&self, lead_id: &str) -> Cleanup {
        let cache = self.cache.clone();
        let id = lead_id.to_string();
        self.retain(comment_event(lead_id), move || {
            handler(move |payload| {
                match serde_json::from_value::<CommentEvent>(payload.clone()) {
                    Ok(event) => {
                        if event.lead_id != id {
                            debug!("Comment event for {} delivered on {}", event.lead_id, id);
                        }
                        apply_comment(&cache, &id, event.comment);
                    }
                    Err(e) => warn!("Ignoring malformed comment event for {}: {}", id, e),
                }
            })
        })
    }

    fn retain(&self, event: String, make: impl FnOnce() -> Handler) -> Cleanup {
        {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(&event) {
                Some(listener) => listener.refs += 1,
                None => {
                    let handler = make();
                    self.socket.on(&event, handler.clone());
                    listeners.insert(event.clone(), Listener { handler, refs: 1 });
                }
            }
        }

        let listeners = self.listeners.clone();
        let socket = self.socket.clone();
        Box::new(move || {
            let mut listeners = listeners.lock();
            let Some(listener) = listeners.get_mut(&event) else {
                return;
            };
            listener.refs -= 1;
            if listener.refs == 0 {
                if let Some(listener) = listeners.remove(&event) {
                    socket.off(&event, &listener.handler);
                }
            }
        })
    }

    /// Detach every listener regardless of references.
    pub fn detach_all(&self) {
        let mut listeners = self.listeners.lock();
        for (event, listener) in listeners.drain() {
            self.socket.off(&event, &listener.handler);
        }
    }
}

/// Upsert into every cached conversation list. Returns the number of lists.
pub fn apply_conversation(cache: &EntityCache, conversation: Conversation) -> usize {
    let lists = cache.keys_for(keys::CONVERSATIONS);
    debug!(
        "Conversation {} pushed to {} lists",
        conversation.id,
        lists.len()
    );
    let m = mutator(move |data| {
        if let CacheData::Conversations(page) = data {
            upsert_conversation(&mut page.leads, conversation.clone());
        }
    });
    cache.update_many(lists.into_iter().map(|k| (k, m.clone())).collect())
}

pub fn apply_message(cache: &EntityCache, conversation_id: &str, message: Message) -> bool {
    cache.update(
        &keys::messages(conversation_id),
        mutator(move |data| {
            if let CacheData::Messages(thread) = data {
                append_message(thread, message.clone());
            }
        }),
    )
}

/// Append to the lead detail and the comment list in one atomic update.
pub fn apply_comment(cache: &EntityCache, lead_id: &str, comment: Comment) -> usize {
    let for_lead = comment.clone();
    cache.update_many(vec![
        (
            keys::lead(lead_id),
            mutator(move |data| {
                if let CacheData::Lead(lead) = data {
                    append_comment(&mut lead.comment, for_lead.clone());
                }
            }),
        ),
        (
            keys::comments(lead_id),
            mutator(move |data| {
                if let CacheData::Comments(list) = data {
                    append_comment(&mut list.comments, comment.clone());
                }
            }),
        ),
    ])
}
