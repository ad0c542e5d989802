//! Unread counts derived from the unread-messages and conversations queries.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::MessageId,
    protocol::{Conversation, Message, MessageFilter},
};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    api::{keys, CommunicationsApi},
    cache::{PollHandle, QueryKey, QueryState},
    error::Result,
    realtime::ChatSession,
};

pub const UNREAD_LIMIT: u32 = 50;
pub const AGGREGATE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationSummary {
    pub unread_messages: Vec<Message>,
    pub active_conversations: Vec<Conversation>,
    pub total_unread: usize,
    pub has_unread: bool,
}

impl NotificationSummary {
    pub fn new(unread_messages: Vec<Message>, active_conversations: Vec<Conversation>) -> Self {
        let total_unread = unread_messages.len();
        Self {
            unread_messages,
            active_conversations,
            total_unread,
            has_unread: total_unread > 0,
        }
    }
}

#[derive(Clone)]
pub struct Notifications {
    communications: CommunicationsApi,
}

impl Notifications {
    pub fn new(communications: CommunicationsApi) -> Self {
        Self { communications }
    }

    fn unread_filter() -> MessageFilter {
        MessageFilter::unread(UNREAD_LIMIT)
    }

    fn source_keys() -> Result<[QueryKey; 2]> {
        let unread = keys::messages().with(serde_json::to_string(&Self::unread_filter())?);
        Ok([unread, keys::conversations()])
    }

    /// Counts from the cached source queries. Either query failing fails the
    /// summary.
    pub async fn summary(&self) -> Result<NotificationSummary> {
        let filter = Self::unread_filter();
        let (unread, conversations) = tokio::try_join!(
            self.communications.messages(&filter),
            self.communications.conversations(),
        )?;
        Ok(NotificationSummary::new(unread, conversations))
    }

    /// Summary recomputed from freshly fetched sources.
    pub async fn refresh(&self) -> Result<NotificationSummary> {
        for key in Self::source_keys()? {
            self.communications.cache().invalidate(&key);
        }
        self.summary().await
    }

    /// Recomputes the summary every [`AGGREGATE_INTERVAL`] until the handle
    /// is dropped.
    pub fn watch(&self) -> (PollHandle, watch::Receiver<QueryState<NotificationSummary>>) {
        let (tx, rx) = watch::channel(QueryState::default());
        let notifications = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AGGREGATE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = notifications.refresh().await;
                tx.send_modify(|state| {
                    match result {
                        Ok(summary) => {
                            debug!(total_unread = summary.total_unread, "notification summary updated");
                            state.data = Some(summary);
                            state.error = None;
                        }
                        Err(err) => state.error = Some(Arc::new(err)),
                    }
                    state.updated_at = Some(Instant::now());
                });
                if tx.is_closed() {
                    break;
                }
            }
        });
        (PollHandle::new(task), rx)
    }

    /// Sends a read receipt over `chat` when one is open and refreshes the
    /// message lists. Returns whether a receipt went out.
    pub fn mark_as_read(&self, message_id: MessageId, chat: Option<&ChatSession>) -> bool {
        let sent = chat.is_some_and(|chat| chat.send_read_receipt(message_id));
        self.communications.cache().invalidate(&keys::messages());
        sent
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
