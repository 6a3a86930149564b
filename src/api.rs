//! Typed queries and mutations over the CRM endpoints.
//!
//! Queries return a [`Subscription`] on a shared cache entry; live views attach
//! their socket listeners when the entry is created. Mutations go straight to
//! the server and invalidate the tags they affect.

use crate::auth::{Department, User, UserDetail};
use crate::cache::{mutator, CacheData, EntityCache, Fetcher, QueryKey, Subscription, Tag};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    Ack, CommentList, ConversationPage, Lead, LeadFilter, LeadPage, MessageThread, NewCallLog,
    NewComment, NewLead, NewReminder, OutgoingMessage, ReminderAck,
};
use crate::optimistic::OptimisticController;
use crate::reconciler::{normalize_conversations, Reconciler};
use crate::transport::rest::RestClient;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Cache keys for every query.
pub mod keys {
    use crate::cache::QueryKey;
    use crate::model::LeadFilter;
    use serde_json::json;

    pub const CONVERSATIONS: &str = "conversations";
    pub const MESSAGES: &str = "conversation_messages";
    pub const LEAD: &str = "lead";
    pub const LEADS: &str = "leads";
    pub const COMMENTS: &str = "comments";
    pub const USER: &str = "user";
    pub const USERS: &str = "users";
    pub const DEPARTMENT: &str = "department";

    pub fn conversations(page: u32, limit: u32, cre_id: Option<&str>) -> QueryKey {
        QueryKey::new(
            CONVERSATIONS,
            &json!({ "page": page, "limit": limit, "creId": cre_id }),
        )
    }

    pub fn messages(conversation_id: &str) -> QueryKey {
        QueryKey::new(MESSAGES, conversation_id)
    }

    pub fn lead(id: &str) -> QueryKey {
        QueryKey::new(LEAD, id)
    }

    pub fn leads(filter: &LeadFilter) -> QueryKey {
        QueryKey::new(LEADS, &filter.query_pairs())
    }

    pub fn comments(lead_id: &str) -> QueryKey {
        QueryKey::new(COMMENTS, lead_id)
    }

    pub fn user(id: &str) -> QueryKey {
        QueryKey::new(USER, id)
    }

    pub fn users(department: Option<&str>, role: Option<&str>) -> QueryKey {
        QueryKey::new(USERS, &json!({ "departmentName": department, "roleName": role }))
    }

    pub fn department(id: &str) -> QueryKey {
        QueryKey::new(DEPARTMENT, id)
    }
}

fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<CacheData>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Decode a JSON cache entry into `T`.
pub async fn load_json<T: DeserializeOwned>(sub: &mut Subscription) -> SyncResult<T> {
    let data = sub.loaded().await?;
    match data.as_json() {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Err(SyncError::Decode(format!("{} does not hold JSON", sub.key()))),
    }
}

#[derive(Clone)]
pub struct CrmApi {
    rest: RestClient,
    cache: EntityCache,
    reconciler: Reconciler,
    optimistic: OptimisticController,
}

impl CrmApi {
    pub fn new(rest: RestClient, cache: EntityCache, reconciler: Reconciler) -> Self {
        let optimistic = OptimisticController::new(cache.clone());
        Self {
            rest,
            cache,
            reconciler,
            optimistic,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    // Queries

    /// Conversation list, newest first, kept live by `conversation` events.
    pub fn conversations(&self, page: u32, limit: u32, cre_id: Option<&str>) -> Subscription {
        let cre_id = cre_id.filter(|c| !c.is_empty());
        let rest = self.rest.clone();
        let mut query = vec![("page", page.to_string()), ("limit", limit.to_string())];
        if let Some(cre_id) = cre_id {
            query.push(("creId", cre_id.to_string()));
        }
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let query = query.clone();
            async move {
                let mut page: ConversationPage = rest.get_query("/lead/conversation", &query).await?;
                normalize_conversations(&mut page.leads);
                Ok(CacheData::Conversations(page))
            }
        });

        let reconciler = self.reconciler.clone();
        self.cache.subscribe_with(
            keys::conversations(page, limit, cre_id),
            vec![],
            fetch,
            move || Some(reconciler.attach_conversations()),
        )
    }

    /// Message thread of one conversation, kept live by `fbMessage{id}` events.
    pub fn conversation_messages(&self, id: &str) -> Subscription {
        let rest = self.rest.clone();
        let path = format!("/lead/conversation/{id}/messages/");
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let path = path.clone();
            async move {
                let thread: MessageThread = rest.get(&path).await?;
                Ok(CacheData::Messages(thread))
            }
        });

        let reconciler = self.reconciler.clone();
        let conversation_id = id.to_string();
        self.cache.subscribe_with(keys::messages(id), vec![], fetch, move || {
            Some(reconciler.attach_messages(&conversation_id))
        })
    }

    pub fn lead(&self, id: &str) -> Subscription {
        let rest = self.rest.clone();
        let path = format!("/lead/{id}");
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let path = path.clone();
            async move {
                let lead: Lead = rest.get(&path).await?;
                Ok(CacheData::Lead(lead))
            }
        });

        let reconciler = self.reconciler.clone();
        let lead_id = id.to_string();
        self.cache.subscribe_with(
            keys::lead(id),
            vec![Tag::Lead(id.to_string())],
            fetch,
            move || Some(reconciler.attach_comments(&lead_id)),
        )
    }

    pub fn leads(&self, filter: &LeadFilter) -> Subscription {
        let rest = self.rest.clone();
        let query = filter.query_pairs();
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let query = query.clone();
            async move {
                let page: LeadPage = rest.get_query("/lead", &query).await?;
                Ok(CacheData::Leads(page))
            }
        });
        self.cache.subscribe(keys::leads(filter), vec![Tag::Leads], fetch)
    }

    pub fn comments(&self, lead_id: &str) -> Subscription {
        let rest = self.rest.clone();
        let path = format!("/lead/{lead_id}/comments");
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let path = path.clone();
            async move {
                let list: CommentList = rest.get(&path).await?;
                Ok(CacheData::Comments(list))
            }
        });

        let reconciler = self.reconciler.clone();
        let id = lead_id.to_string();
        self.cache.subscribe_with(
            keys::comments(lead_id),
            vec![Tag::Comment(lead_id.to_string())],
            fetch,
            move || Some(reconciler.attach_comments(&id)),
        )
    }

    fn json_query(&self, key: QueryKey, path: String) -> Subscription {
        let rest = self.rest.clone();
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let path = path.clone();
            async move {
                let value: Value = rest.get(&path).await?;
                Ok(CacheData::Json(value))
            }
        });
        self.cache.subscribe(key, vec![], fetch)
    }

    pub fn user(&self, id: &str) -> Subscription {
        self.json_query(keys::user(id), format!("/users/{id}"))
    }

    /// Users filtered by department, and by role within that department.
    pub fn users(&self, department: Option<&str>, role: Option<&str>) -> Subscription {
        let department = department.filter(|d| !d.is_empty());
        let role = role.filter(|_| department.is_some()).filter(|r| !r.is_empty());

        let rest = self.rest.clone();
        let mut query: Vec<(&'static str, String)> = Vec::new();
        if let Some(department) = department {
            query.push(("departmentName", department.to_string()));
        }
        if let Some(role) = role {
            query.push(("roleName", role.to_string()));
        }
        let fetch = fetcher(move || {
            let rest = rest.clone();
            let query = query.clone();
            async move {
                let value: Value = rest.get_query("/users", &query).await?;
                Ok(CacheData::Json(value))
            }
        });
        self.cache.subscribe(keys::users(department, role), vec![], fetch)
    }

    pub fn department(&self, id: &str) -> Subscription {
        self.json_query(keys::department(id), format!("/users/departments/{id}"))
    }

    pub async fn fetch_user(&self, id: &str) -> SyncResult<UserDetail> {
        load_json(&mut self.user(id)).await
    }

    pub async fn fetch_users(
        &self,
        department: Option<&str>,
        role: Option<&str>,
    ) -> SyncResult<Vec<User>> {
        load_json(&mut self.users(department, role)).await
    }

    pub async fn fetch_department(&self, id: &str) -> SyncResult<Department> {
        load_json(&mut self.department(id)).await
    }

    // Mutations

    fn invalidate(&self, tags: Vec<Tag>) {
        let refetched = self.cache.invalidate_tags(&tags);
        debug!("Invalidated {:?}, {} refetches", tags, refetched);
    }

    pub async fn create_lead(&self, lead: &NewLead) -> SyncResult<Ack> {
        let ack: Ack = self.rest.post("/lead", lead).await?;
        info!("Created lead {}", lead.name);
        self.invalidate(vec![Tag::Leads]);
        Ok(ack)
    }

    pub async fn update_requirements(&self, id: &str, requirements: &[String]) -> SyncResult<Ack> {
        self.rest
            .put(
                &format!("/lead/{id}/requirements"),
                &json!({ "requirements": requirements }),
            )
            .await
    }

    pub async fn add_phone(
        &self,
        id: &str,
        phone_number: &str,
        comment: Option<&str>,
    ) -> SyncResult<Ack> {
        self.rest
            .put(
                &format!("/lead/{id}/add-phone-number"),
                &json!({ "phoneNumber": phone_number, "comment": comment }),
            )
            .await
    }

    /// Answers with the lead's reminder list after the change.
    pub async fn add_reminder(
        &self,
        id: &str,
        reminder: &NewReminder,
    ) -> SyncResult<ReminderAck> {
        let ack: ReminderAck = self
            .rest
            .post(&format!("/lead/{id}/reminders"), reminder)
            .await?;
        self.invalidate(vec![Tag::Lead(id.to_string())]);
        Ok(ack)
    }

    pub async fn update_reminder_status(
        &self,
        lead_id: &str,
        reminder_id: &str,
        status: &str,
    ) -> SyncResult<Value> {
        let response: Value = self
            .rest
            .put(
                &format!("/lead/{lead_id}/reminders/{reminder_id}"),
                &json!({ "status": status }),
            )
            .await?;
        self.invalidate(vec![Tag::Lead(lead_id.to_string())]);
        Ok(response)
    }

    /// Mark a conversation's messages as seen, showing it immediately in every
    /// cached conversation list and the conversation's thread.
    pub async fn mark_as_seen(&self, id: &str) -> SyncResult<()> {
        let mut targets = self.cache.keys_for(keys::CONVERSATIONS);
        targets.push(keys::messages(id));

        let conversation_id = id.to_string();
        let patch = mutator(move |data| match data {
            CacheData::Conversations(page) => {
                if let Some(c) = page.leads.iter_mut().find(|c| c.id == conversation_id) {
                    c.messages_seen = true;
                }
            }
            CacheData::Messages(thread) => thread.messages_seen = true,
            _ => {}
        });
        let handle = self
            .optimistic
            .apply(format!("conversation {id}"), targets, patch);

        let path = format!("/lead/conversation/{id}/mark-messages-seen");
        self.optimistic
            .run(handle, self.rest.send::<Value>(Method::PUT, &path, None))
            .await?;

        self.invalidate(vec![Tag::Lead(id.to_string())]);
        Ok(())
    }

    pub async fn add_call_log(&self, id: &str, call: &NewCallLog) -> SyncResult<Ack> {
        let ack: Ack = self
            .rest
            .post(&format!("/lead/{id}/call-logs"), call)
            .await?;
        self.invalidate(vec![Tag::Lead(id.to_string())]);
        Ok(ack)
    }

    pub async fn send_message(&self, id: &str, message: &OutgoingMessage) -> SyncResult<Value> {
        self.rest
            .post(&format!("/lead/conversation/{id}/messages"), message)
            .await
    }

    /// The new comment reaches cached views through the `newComment_{id}` event.
    pub async fn add_comment(&self, id: &str, comment: &NewComment) -> SyncResult<Value> {
        self.rest
            .post(&format!("/lead/{id}/comments"), comment)
            .await
    }

    pub async fn update_lead(&self, id: &str, changes: &Value) -> SyncResult<Ack> {
        let ack: Ack = self.rest.put(&format!("/lead/{id}"), changes).await?;
        self.invalidate(vec![Tag::Lead(id.to_string())]);
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_distinguish_arguments() {
        assert_ne!(keys::conversations(1, 100, None), keys::conversations(1, 100, Some("c1")));
        assert_eq!(keys::lead("L1"), keys::lead("L1"));
        assert_ne!(keys::lead("L1"), keys::comments("L1"));
        assert_eq!(keys::messages("A").to_string(), r#"conversation_messages("A")"#);
    }

    #[test]
    fn lead_filter_key_ignores_empty_fields() {
        let blank = LeadFilter {
            status: Some(String::new()),
            ..LeadFilter::default()
        };
        assert_eq!(keys::leads(&blank), keys::leads(&LeadFilter::default()));
    }
}
