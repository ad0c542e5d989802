//! Cached REST resources: the communications API and the public site API.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{CampaignId, ConversationId, TemplateId},
    protocol::{
        Branch, CommunicationChannel, CommunicationPreferences, Conversation, ConversationMessage,
        CreateCampaignRequest, CreateTemplateRequest, Listing, LiveStream, Message, MessageCampaign,
        MessageFilter, MessageTemplate, SendCampaignRequest, SendConversationMessageRequest,
        SendMessageRequest, UpdatePreferencesRequest, UpdateTemplateRequest,
    },
};
use tokio::sync::watch;

use crate::{
    cache::{Mutation, PollHandle, QueryCache, QueryKey, QueryOptions, QueryState},
    error::Result,
    http::ApiClient,
};

/// Cache keys shared by queries, mutations and the chat socket.
pub mod keys {
    use shared::domain::{CampaignId, ConversationId, TemplateId};

    use crate::cache::QueryKey;

    pub fn conversations() -> QueryKey {
        QueryKey::resource("communication-conversations")
    }

    pub fn conversation(id: ConversationId) -> QueryKey {
        QueryKey::resource("communication-conversation").with(id)
    }

    pub fn conversation_messages(id: ConversationId) -> QueryKey {
        QueryKey::resource("communication-conversation-messages").with(id)
    }

    pub fn messages() -> QueryKey {
        QueryKey::resource("communication-messages")
    }

    pub fn templates() -> QueryKey {
        QueryKey::resource("communication-templates")
    }

    pub fn template(id: TemplateId) -> QueryKey {
        QueryKey::resource("communication-template").with(id)
    }

    pub fn campaigns() -> QueryKey {
        QueryKey::resource("communication-campaigns")
    }

    pub fn campaign(id: CampaignId) -> QueryKey {
        QueryKey::resource("communication-campaign").with(id)
    }

    pub fn preferences() -> QueryKey {
        QueryKey::resource("communication-preferences")
    }

    pub fn channels() -> QueryKey {
        QueryKey::resource("communication-channels")
    }

    pub fn branches() -> QueryKey {
        QueryKey::resource("branches")
    }

    pub fn live_streams() -> QueryKey {
        QueryKey::new(["streams", "live"])
    }

    pub fn upcoming_streams() -> QueryKey {
        QueryKey::new(["streams", "upcoming"])
    }
}

const LIVE_INTERVAL: Duration = Duration::from_secs(30);

async fn cached_list<T>(
    api: &ApiClient,
    cache: &QueryCache,
    key: QueryKey,
    options: QueryOptions,
    endpoint: String,
) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let api = api.clone();
    cache
        .fetch(&key, options, move || async move {
            api.get::<Listing<T>>(&endpoint).await.map(Listing::into_vec)
        })
        .await
}

async fn cached_item<T>(
    api: &ApiClient,
    cache: &QueryCache,
    key: QueryKey,
    options: QueryOptions,
    endpoint: String,
) -> Result<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let api = api.clone();
    cache
        .fetch(&key, options, move || async move { api.get::<T>(&endpoint).await })
        .await
}

fn poll_list<T>(
    api: &ApiClient,
    cache: &QueryCache,
    key: QueryKey,
    endpoint: &str,
) -> (PollHandle, watch::Receiver<QueryState<Vec<T>>>)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let api = api.clone();
    let endpoint = endpoint.to_string();
    cache.poll(key, LIVE_INTERVAL, move || {
        let api = api.clone();
        let endpoint = endpoint.clone();
        async move { api.get::<Listing<T>>(&endpoint).await.map(Listing::into_vec) }
    })
}

/// Member messaging, templates, campaigns and preferences under
/// `/communications/api`.
#[derive(Clone)]
pub struct CommunicationsApi {
    api: ApiClient,
    cache: QueryCache,
}

impl CommunicationsApi {
    pub fn new(api: ApiClient, cache: QueryCache) -> Self {
        Self { api, cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::conversations(),
            QueryOptions::default(),
            "/conversations/".into(),
        )
        .await
    }

    pub fn watch_conversations(&self) -> (PollHandle, watch::Receiver<QueryState<Vec<Conversation>>>) {
        poll_list(&self.api, &self.cache, keys::conversations(), "/conversations/")
    }

    pub async fn conversation(&self, id: ConversationId) -> Result<Conversation> {
        cached_item(
            &self.api,
            &self.cache,
            keys::conversation(id),
            QueryOptions::default(),
            format!("/conversations/{id}/"),
        )
        .await
    }

    pub async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<ConversationMessage>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::conversation_messages(id),
            QueryOptions::LIVE,
            format!("/conversations/{id}/messages/"),
        )
        .await
    }

    pub fn watch_conversation_messages(
        &self,
        id: ConversationId,
    ) -> (PollHandle, watch::Receiver<QueryState<Vec<ConversationMessage>>>) {
        poll_list(
            &self.api,
            &self.cache,
            keys::conversation_messages(id),
            &format!("/conversations/{id}/messages/"),
        )
    }

    pub async fn send_conversation_message(
        &self,
        id: ConversationId,
        content: &str,
    ) -> Result<ConversationMessage> {
        let body = SendConversationMessageRequest {
            content: content.to_string(),
        };
        let mutation = Mutation::new("Error sending message")
            .invalidate(keys::conversation_messages(id))
            .on_success("Message sent", "Your message has been delivered");
        self.cache
            .mutate(
                mutation,
                self.api
                    .post(&format!("/conversations/{id}/send_message/"), &body),
            )
            .await
    }

    pub async fn messages(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let api = self.api.clone();
        let query = filter.clone();
        let key = keys::messages().with(serde_json::to_string(filter)?);
        self.cache
            .fetch(&key, QueryOptions::MESSAGES, move || async move {
                api.get_with_query::<Listing<Message>, _>("/messages/", &query)
                    .await
                    .map(Listing::into_vec)
            })
            .await
    }

    /// Quick-send of a template to an audience.
    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<Value> {
        let mutation = Mutation::new("Error sending messages")
            .invalidate(keys::messages())
            .on_success("Messages sent", "Your messages have been queued for delivery.");
        self.cache
            .mutate(mutation, self.api.post("/send-message/", request))
            .await
    }

    pub async fn templates(&self) -> Result<Vec<MessageTemplate>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::templates(),
            QueryOptions::TEMPLATES,
            "/templates/".into(),
        )
        .await
    }

    pub async fn template(&self, id: TemplateId) -> Result<MessageTemplate> {
        cached_item(
            &self.api,
            &self.cache,
            keys::template(id),
            QueryOptions::default(),
            format!("/templates/{id}/"),
        )
        .await
    }

    pub async fn create_template(&self, request: &CreateTemplateRequest) -> Result<MessageTemplate> {
        let mutation = Mutation::new("Error creating template")
            .invalidate(keys::templates())
            .on_success("Template created", "Message template has been created successfully.");
        self.cache
            .mutate(mutation, self.api.post("/templates/", request))
            .await
    }

    pub async fn update_template(
        &self,
        id: TemplateId,
        request: &UpdateTemplateRequest,
    ) -> Result<MessageTemplate> {
        let mutation = Mutation::new("Error updating template")
            .invalidate(keys::templates())
            .invalidate(keys::template(id))
            .on_success("Template updated", "Message template has been updated successfully.");
        self.cache
            .mutate(mutation, self.api.patch(&format!("/templates/{id}/"), request))
            .await
    }

    pub async fn delete_template(&self, id: TemplateId) -> Result<()> {
        let mutation = Mutation::new("Error deleting template")
            .invalidate(keys::templates())
            .on_success("Template deleted", "Message template has been deleted successfully.");
        self.cache
            .mutate(mutation, self.api.delete(&format!("/templates/{id}/")))
            .await
    }

    pub async fn campaigns(&self) -> Result<Vec<MessageCampaign>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::campaigns(),
            QueryOptions::CAMPAIGNS,
            "/campaigns/".into(),
        )
        .await
    }

    pub async fn campaign(&self, id: CampaignId) -> Result<MessageCampaign> {
        cached_item(
            &self.api,
            &self.cache,
            keys::campaign(id),
            QueryOptions::default(),
            format!("/campaigns/{id}/"),
        )
        .await
    }

    pub async fn create_campaign(&self, request: &CreateCampaignRequest) -> Result<MessageCampaign> {
        let mutation = Mutation::new("Error creating campaign")
            .invalidate(keys::campaigns())
            .on_success("Campaign created", "Message campaign has been created successfully.");
        self.cache
            .mutate(mutation, self.api.post("/campaigns/", request))
            .await
    }

    pub async fn send_campaign(&self, id: CampaignId, send_now: bool) -> Result<Value> {
        let mutation = Mutation::new("Error sending campaign")
            .invalidate(keys::campaigns())
            .invalidate(keys::campaign(id))
            .on_success("Campaign sent", "Message campaign has been queued for sending.");
        self.cache
            .mutate(
                mutation,
                self.api.post(
                    &format!("/campaigns/{id}/send/"),
                    &SendCampaignRequest { send_now },
                ),
            )
            .await
    }

    pub async fn preferences(&self) -> Result<CommunicationPreferences> {
        cached_item(
            &self.api,
            &self.cache,
            keys::preferences(),
            QueryOptions::PREFERENCES,
            "/preferences/".into(),
        )
        .await
    }

    pub async fn update_preferences(&self, request: &UpdatePreferencesRequest) -> Result<Value> {
        let mutation = Mutation::new("Error updating preferences")
            .invalidate(keys::preferences())
            .on_success(
                "Preferences updated",
                "Your communication preferences have been updated.",
            );
        self.cache
            .mutate(mutation, self.api.post("/preferences/", request))
            .await
    }

    pub async fn channels(&self) -> Result<Vec<CommunicationChannel>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::channels(),
            QueryOptions::default(),
            "/channels/".into(),
        )
        .await
    }
}

/// Branch directory and live streams on the main API.
#[derive(Clone)]
pub struct PublicApi {
    api: ApiClient,
    cache: QueryCache,
}

impl PublicApi {
    pub fn new(api: ApiClient, cache: QueryCache) -> Self {
        Self { api, cache }
    }

    pub async fn branches(&self) -> Result<Vec<Branch>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::branches(),
            QueryOptions::BRANCHES,
            "/branches/".into(),
        )
        .await
    }

    pub async fn branch(&self, slug: &str) -> Result<Branch> {
        cached_item(
            &self.api,
            &self.cache,
            keys::branches().with(slug),
            QueryOptions::default(),
            format!("/branches/{slug}/"),
        )
        .await
    }

    pub async fn live_streams(&self) -> Result<Vec<LiveStream>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::live_streams(),
            QueryOptions::LIVE,
            "/streams/live/".into(),
        )
        .await
    }

    pub fn watch_live_streams(&self) -> (PollHandle, watch::Receiver<QueryState<Vec<LiveStream>>>) {
        poll_list(&self.api, &self.cache, keys::live_streams(), "/streams/live/")
    }

    pub async fn upcoming_streams(&self) -> Result<Vec<LiveStream>> {
        cached_list(
            &self.api,
            &self.cache,
            keys::upcoming_streams(),
            QueryOptions::default(),
            "/streams/upcoming/".into(),
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
