use std::sync::Arc;

use ideaspark_db::Database;
use ideaspark_gateway::Dispatcher;

use crate::cache::RateLimiter;
use crate::queue::JobQueue;
use crate::service::ConversationService;

pub type AppState = Arc<AppStateInner>;

/// Handles shared by every request. Built once by the binary; nothing here
/// is reached through a global.
pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub conversations: ConversationService,
    pub queue: JobQueue,
    pub limiter: RateLimiter,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub daily_ideas: i64,
}
