//! Conversation, message and idea operations with ownership checked at the
//! point of access. Sending a message hands the reply to the pipeline and
//! returns as soon as the message is stored.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use ideaspark_db::Database;
use ideaspark_db::collections::{CONVERSATIONS, IDEAS, MESSAGES, decode};
use ideaspark_db::pagination::{
    self, CursorRequest, PageDefaults, PageRequest, aggregate_page, cursor_aggregate,
    cursor_paginate, find_page,
};
use ideaspark_db::query::{FindQuery, Filter, Pipeline};
use ideaspark_types::models::{Conversation, Idea, IdeaCategory, Message};
use ideaspark_types::pagination::{CursorPage, Page, PaginationQuery, SortOrder};

use crate::AppError;
use crate::reply::{ReplyJob, ReplyPipeline};

pub const MAX_CONTENT_CHARS: usize = 5000;
pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_PAGE_LIMIT: u32 = 100;
const DERIVED_TITLE_CHARS: usize = 50;

/// Most recently active conversations first.
const FEED: PageDefaults = PageDefaults {
    limit: 20,
    sort_field: "lastMessageAt",
    sort_order: SortOrder::Desc,
};

#[derive(Clone)]
pub struct ConversationService {
    db: Arc<Database>,
    replies: ReplyPipeline,
    daily_ideas: i64,
}

impl ConversationService {
    pub fn new(db: Arc<Database>, replies: ReplyPipeline, daily_ideas: i64) -> Self {
        Self {
            db,
            replies,
            daily_ideas,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn replies(&self) -> &ReplyPipeline {
        &self.replies
    }

    // -- Conversations --

    /// Create a conversation with its first message and start the reply.
    /// Without a title, one is cut from the message.
    pub async fn create_conversation(
        &self,
        owner: Uuid,
        title: Option<&str>,
        first_message: &str,
    ) -> Result<Conversation, AppError> {
        let content = validate_content(first_message)?;
        let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) if t.chars().count() > MAX_TITLE_CHARS => {
                return Err(AppError::Validation(format!(
                    "Title must be at most {} characters",
                    MAX_TITLE_CHARS
                )));
            }
            Some(t) => t.to_string(),
            None => derive_title(&content),
        };

        let text = content.clone();
        let (conversation, message) = self
            .db
            .run(move |db| db.create_conversation(owner, &title, &text))
            .await?;
        info!("Conversation {} created by {}", conversation.id, owner);

        self.start_reply(ReplyJob {
            conversation_id: conversation.id,
            owner,
            trigger_message_id: message.id,
            content,
        });
        Ok(conversation)
    }

    pub async fn list_conversations(
        &self,
        owner: Uuid,
        query: &PaginationQuery,
    ) -> Result<Page<Conversation>, AppError> {
        check_query(query)?;
        let request = PageRequest::resolve(query, PageDefaults::RECENT_FIRST);
        let page = find_page(
            &self.db,
            &CONVERSATIONS,
            FindQuery::new(Filter::eq("userId", owner.to_string())),
            &request,
        )
        .await?;
        Ok(page.try_map(decode)?)
    }

    /// Infinite-scroll feed ordered by latest activity.
    pub async fn conversation_feed(
        &self,
        owner: Uuid,
        query: &PaginationQuery,
    ) -> Result<CursorPage<Conversation>, AppError> {
        check_query(query)?;
        let request = CursorRequest::resolve(query, FEED);
        let pipeline = Pipeline::new().matching(Filter::eq("userId", owner.to_string()));
        let page = cursor_aggregate(&self.db, &CONVERSATIONS, pipeline, &request).await?;
        Ok(page.try_map(decode)?)
    }

    /// Soft-delete an owned conversation.
    pub async fn delete_conversation(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
    ) -> Result<(), AppError> {
        let conversation = self
            .db
            .run(move |db| db.get_conversation(conversation_id))
            .await?;
        if conversation.user_id != owner {
            return Err(AppError::Forbidden(
                "User not authorized for this conversation".into(),
            ));
        }
        self.db
            .run(move |db| db.soft_delete(&CONVERSATIONS, conversation_id))
            .await?;
        info!("Conversation {} deleted by {}", conversation_id, owner);
        Ok(())
    }

    // -- Messages --

    /// Store the owner's message, spending one idea from the daily budget,
    /// and start the reply. The reply is not awaited.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
        content: &str,
    ) -> Result<Message, AppError> {
        let content = validate_content(content)?;
        let daily_ideas = self.daily_ideas;
        let text = content.clone();
        let message = self
            .db
            .run(move |db| db.insert_user_message(conversation_id, owner, &text, daily_ideas))
            .await?;
        debug!("Message {} stored in {}", message.id, conversation_id);

        self.start_reply(ReplyJob {
            conversation_id,
            owner,
            trigger_message_id: message.id,
            content,
        });
        Ok(message)
    }

    /// Offset page of messages, oldest first, with ideas resolved inline.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
        query: &PaginationQuery,
    ) -> Result<Page<Message>, AppError> {
        check_query(query)?;
        self.ensure_visible(conversation_id, owner).await?;
        let request = PageRequest::resolve(query, PageDefaults::CHRONOLOGICAL);
        let page = find_page(
            &self.db,
            &MESSAGES,
            messages_of(conversation_id).join("idea"),
            &request,
        )
        .await?;
        Ok(page.try_map(decode)?)
    }

    /// Cursor page of messages, newest first by default.
    pub async fn scroll_messages(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
        query: &PaginationQuery,
    ) -> Result<CursorPage<Message>, AppError> {
        check_query(query)?;
        self.ensure_visible(conversation_id, owner).await?;
        let request = CursorRequest::resolve(query, PageDefaults::CURSOR);
        let page = cursor_paginate(
            &self.db,
            &MESSAGES,
            messages_of(conversation_id).join("idea"),
            &request,
        )
        .await?;
        Ok(page.try_map(decode)?)
    }

    /// Persist an assistant message. The owner is looked up from the
    /// conversation; a conversation deleted in the meantime is `NotFound`.
    pub async fn append_system_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, AppError> {
        let content = content.to_string();
        let message = self
            .db
            .run(move |db| db.insert_system_message(conversation_id, &content))
            .await?;
        Ok(message)
    }

    /// Up to `limit` most recent messages before the reply to `exclude`,
    /// oldest first.
    pub async fn recent_history(
        &self,
        conversation_id: Uuid,
        owner: Uuid,
        exclude: Uuid,
        limit: u32,
    ) -> Result<Vec<Message>, AppError> {
        self.ensure_visible(conversation_id, owner).await?;
        let query = PaginationQuery {
            limit: Some(limit),
            sort_field: Some("createdAt".into()),
            sort_order: Some(SortOrder::Desc),
            ..PaginationQuery::default()
        };
        let request = PageRequest::resolve(&query, PageDefaults::CHRONOLOGICAL);
        let filter = Filter::eq("conversationId", conversation_id.to_string())
            .and(Filter::ne("id", exclude.to_string()));
        let page = find_page(&self.db, &MESSAGES, FindQuery::new(filter), &request).await?;

        let mut messages = page.try_map(decode::<Message>)?.data;
        messages.reverse();
        Ok(messages)
    }

    // -- Ideas --

    /// Offset page of the owner's ideas, optionally narrowed to a category.
    pub async fn list_ideas(
        &self,
        owner: Uuid,
        category: Option<IdeaCategory>,
        query: &PaginationQuery,
    ) -> Result<Page<Idea>, AppError> {
        check_query(query)?;
        let mut pipeline = Pipeline::new().matching(Filter::eq("userId", owner.to_string()));
        if let Some(category) = category.filter(|c| *c != IdeaCategory::All) {
            pipeline = pipeline.matching(Filter::eq("category", category.as_str()));
        }
        let request = PageRequest::resolve(query, PageDefaults::RECENT_FIRST);
        let page = aggregate_page(&self.db, &IDEAS, pipeline, &request).await?;
        Ok(page.try_map(decode)?)
    }

    pub async fn count_ideas(&self, owner: Uuid) -> Result<u64, AppError> {
        let query = FindQuery::new(Filter::eq("userId", owner.to_string()));
        Ok(pagination::count(&self.db, &IDEAS, query).await?)
    }

    fn start_reply(&self, job: ReplyJob) {
        // Detached: the pipeline absorbs its own failures.
        let _ = self.replies.spawn(self.clone(), job);
    }

    /// A conversation the caller does not own is reported as missing.
    async fn ensure_visible(&self, conversation_id: Uuid, owner: Uuid) -> Result<(), AppError> {
        let conversation = self
            .db
            .run(move |db| db.get_conversation(conversation_id))
            .await?;
        if conversation.user_id != owner {
            return Err(AppError::NotFound("Conversation not found".into()));
        }
        Ok(())
    }
}

fn messages_of(conversation_id: Uuid) -> FindQuery {
    FindQuery::new(Filter::eq("conversationId", conversation_id.to_string()))
}

fn validate_content(content: &str) -> Result<String, AppError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("Message content cannot be empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation(format!(
            "Message content must be at most {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(content.to_string())
}

fn check_query(query: &PaginationQuery) -> Result<(), AppError> {
    if query.page == Some(0) {
        return Err(AppError::Validation("page must be at least 1".into()));
    }
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
    }
    Ok(())
}

/// First line of the message, cut to a short title.
pub fn derive_title(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= DERIVED_TITLE_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(DERIVED_TITLE_CHARS).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::tests::{Script, Sent, setup};
    use ideaspark_types::models::{IdeaIcon, NewIdea, Sender};
    use std::time::Duration;

    async fn user(service: &ConversationService, name: &str, ideas: i64) -> Uuid {
        let name = name.to_string();
        service
            .db()
            .run(move |db| db.create_user(&name, "hash", None, ideas))
            .await
            .unwrap()
            .id
    }

    /// A conversation created straight in the store, so no reply runs.
    async fn quiet_conversation(service: &ConversationService, owner: Uuid, first: &str) -> Uuid {
        let first = first.to_string();
        service
            .db()
            .run(move |db| db.create_conversation(owner, "Quiet", &first))
            .await
            .unwrap()
            .0
            .id
    }

    async fn message_count(service: &ConversationService, conversation: Uuid, owner: Uuid) -> u64 {
        service
            .list_messages(conversation, owner, &PaginationQuery::default())
            .await
            .unwrap()
            .meta
            .total
    }

    fn idea(title: &str, category: IdeaCategory) -> NewIdea {
        NewIdea {
            title: title.into(),
            summary: "summary".into(),
            category,
            icon: IdeaIcon::Book,
            problem_solved: "problem".into(),
            target_audience: "students".into(),
            core_features: vec!["flashcards".into()],
            benefits: vec![],
            tech_stack: vec!["rust".into()],
            monetization: vec![],
            challenges: vec![],
            next_steps: vec![],
        }
    }

    #[tokio::test]
    async fn study_app_conversation_gets_one_reply() {
        let (service, provider, notifier) = setup(Script::Reply("Great! Who is it for?"));
        let owner = user(&service, "ada", 10).await;

        let conversation = service
            .create_conversation(owner, None, "I want to build a study app")
            .await
            .unwrap();
        assert_eq!(conversation.title, "I want to build a study app");
        assert_eq!(conversation.user_id, owner);

        tokio::time::timeout(Duration::from_secs(5), notifier.delivered.notified())
            .await
            .unwrap();

        let requests = provider.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].turns.last().map(|t| t.text.as_str()),
            Some("I want to build a study app")
        );
        drop(requests);

        let page = service
            .list_messages(conversation.id, owner, &PaginationQuery::default())
            .await
            .unwrap();
        let texts: Vec<(Sender, &str)> = page
            .data
            .iter()
            .map(|m| (m.sender, m.content.as_str()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (Sender::User, "I want to build a study app"),
                (Sender::System, "Great! Who is it for?"),
            ]
        );
        assert!(notifier
            .sent
            .lock()
            .await
            .contains(&Sent::Message("Great! Who is it for?".into())));
    }

    #[tokio::test]
    async fn send_spends_quota_and_returns_before_the_reply() {
        let (service, _, notifier) = setup(Script::Reply("noted"));
        let owner = user(&service, "ada", 2).await;
        let conversation = quiet_conversation(&service, owner, "hello").await;

        let message = service
            .send_message(conversation, owner, "  more details  ")
            .await
            .unwrap();
        assert_eq!(message.content, "more details");
        assert_eq!(message.sender, Sender::User);

        let remaining = service
            .db()
            .run(move |db| db.get_user(owner))
            .await
            .unwrap()
            .remaining_ideas;
        assert_eq!(remaining, 1);

        tokio::time::timeout(Duration::from_secs(5), notifier.delivered.notified())
            .await
            .unwrap();
        assert_eq!(message_count(&service, conversation, owner).await, 3);
    }

    #[tokio::test]
    async fn empty_quota_rejects_without_storing() {
        let (service, provider, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 0).await;
        let conversation = quiet_conversation(&service, owner, "hello").await;

        let err = service
            .send_message(conversation, owner, "one more")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded));
        assert_eq!(message_count(&service, conversation, owner).await, 1);
        assert!(provider.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn strangers_cannot_post_or_read() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let stranger = user(&service, "eve", 10).await;
        let conversation = quiet_conversation(&service, owner, "private").await;

        let err = service
            .send_message(conversation, stranger, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let quota = service
            .db()
            .run(move |db| db.get_user(stranger))
            .await
            .unwrap()
            .remaining_ideas;
        assert_eq!(quota, 10);
        assert_eq!(message_count(&service, conversation, owner).await, 1);

        let err = service
            .list_messages(conversation, stranger, &PaginationQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = service
            .delete_conversation(conversation, stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let err = service
            .send_message(Uuid::now_v7(), owner, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn input_is_validated() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;

        let err = service.create_conversation(owner, None, "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let long_title = "t".repeat(MAX_TITLE_CHARS + 1);
        let err = service
            .create_conversation(owner, Some(&long_title), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let query = PaginationQuery {
            limit: Some(MAX_PAGE_LIMIT + 1),
            ..PaginationQuery::default()
        };
        let err = service.list_conversations(owner, &query).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let query = PaginationQuery {
            sort_field: Some("password".into()),
            ..PaginationQuery::default()
        };
        let err = service.list_conversations(owner, &query).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn deleted_conversations_drop_out_of_listings() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let keep = quiet_conversation(&service, owner, "keep").await;
        let gone = quiet_conversation(&service, owner, "gone").await;

        service.delete_conversation(gone, owner).await.unwrap();

        let page = service
            .list_conversations(owner, &PaginationQuery::default())
            .await
            .unwrap();
        assert_eq!(page.meta.total, 1);
        assert_eq!(page.data[0].id, keep);

        let err = service
            .send_message(gone, owner, "hello?")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn feed_walks_by_latest_activity() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(quiet_conversation(&service, owner, &format!("c{}", i)).await);
        }
        // Activity in the oldest conversation moves it to the front.
        let oldest = ids[0];
        service
            .db()
            .run(move |db| db.insert_system_message(oldest, "bump"))
            .await
            .unwrap();

        let first = service
            .conversation_feed(
                owner,
                &PaginationQuery {
                    limit: Some(2),
                    ..PaginationQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(first.has_next_page);
        assert_eq!(
            first.data.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![ids[0], ids[2]]
        );

        let second = service
            .conversation_feed(
                owner,
                &PaginationQuery {
                    limit: Some(2),
                    cursor: first.next_cursor.clone(),
                    ..PaginationQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(!second.has_next_page);
        assert!(second.next_cursor.is_none());
        assert_eq!(second.data.iter().map(|c| c.id).collect::<Vec<_>>(), vec![ids[1]]);
    }

    #[tokio::test]
    async fn scroll_rejects_foreign_cursors() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let conversation = quiet_conversation(&service, owner, "hello").await;

        let err = service
            .scroll_messages(
                conversation,
                owner,
                &PaginationQuery {
                    cursor: Some("not a cursor".into()),
                    ..PaginationQuery::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCursor(_)));

        let page = service
            .scroll_messages(conversation, owner, &PaginationQuery::default())
            .await
            .unwrap();
        assert_eq!(page.data.len(), 1);
        assert!(!page.has_next_page);
    }

    #[tokio::test]
    async fn ideas_filter_by_category_and_resolve_on_messages() {
        let (service, _, _) = setup(Script::Reply("never"));
        let owner = user(&service, "ada", 10).await;
        let conversation = quiet_conversation(&service, owner, "ideas please").await;

        for (title, category) in [
            ("Flashcards", IdeaCategory::Learning),
            ("Tutor marketplace", IdeaCategory::Startup),
            ("Quiz bot", IdeaCategory::Learning),
        ] {
            let idea = idea(title, category);
            service
                .db()
                .run(move |db| {
                    let message = db.insert_system_message(conversation, "here is one")?;
                    db.insert_idea(message.id, &idea)
                })
                .await
                .unwrap();
        }

        let learning = service
            .list_ideas(owner, Some(IdeaCategory::Learning), &PaginationQuery::default())
            .await
            .unwrap();
        assert_eq!(learning.meta.total, 2);
        assert!(learning.data.iter().all(|i| i.category == IdeaCategory::Learning));

        let all = service
            .list_ideas(owner, Some(IdeaCategory::All), &PaginationQuery::default())
            .await
            .unwrap();
        assert_eq!(all.meta.total, 3);
        assert_eq!(service.count_ideas(owner).await.unwrap(), 3);

        let messages = service
            .list_messages(conversation, owner, &PaginationQuery::default())
            .await
            .unwrap();
        let with_ideas: Vec<_> = messages.data.iter().filter(|m| m.contains_idea).collect();
        assert_eq!(with_ideas.len(), 3);
        assert!(with_ideas.iter().all(|m| m.idea.is_some()));
    }

    #[test]
    fn titles_are_cut_from_the_first_line() {
        assert_eq!(derive_title("Short one\nmore"), "Short one");
        let long = "word ".repeat(20);
        let title = derive_title(&long);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= DERIVED_TITLE_CHARS + 3);
    }
}
