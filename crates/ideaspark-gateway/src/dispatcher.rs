use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use ideaspark_types::events::{GatewayEvent, TypingState};
use ideaspark_types::models::Message;

/// Push channel to connected users. Delivery is best-effort: both methods
/// report whether the event reached a live connection and never fail.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_message(&self, user_id: Uuid, message: &Message) -> bool;
    async fn notify_typing(&self, user_id: Uuid, state: TypingState) -> bool;
}

/// Routes events to the one live connection each user holds.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-user targeted channel. Returns (conn_id, receiver).
    /// A newer connection replaces the older one, whose receiver then closes.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some((previous, _)) = self
            .inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx))
        {
            debug!("Connection {} for {} replaced by {}", previous, user_id, conn_id);
        }
        (conn_id, rx)
    }

    /// Unregister a per-user targeted channel, but only if conn_id matches.
    pub async fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to a specific user. False when the user has no
    /// live connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.user_channels.read().await;
        match channels.get(&user_id) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.user_channels.read().await.contains_key(&user_id)
    }
}

#[async_trait]
impl Notifier for Dispatcher {
    async fn notify_message(&self, user_id: Uuid, message: &Message) -> bool {
        self.send_to_user(
            user_id,
            GatewayEvent::MessageCreate {
                message: message.clone(),
            },
        )
        .await
    }

    async fn notify_typing(&self, user_id: Uuid, state: TypingState) -> bool {
        self.send_to_user(user_id, GatewayEvent::Typing(state)).await
    }
}
