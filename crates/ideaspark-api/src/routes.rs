use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
};

use crate::middleware::{rate_limit, require_auth};
use crate::state::AppState;
use crate::{admin, auth, conversations};

/// REST routes. The WebSocket gateway and health check are mounted by the
/// binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/me", get(auth::me))
        .route(
            "/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route("/conversations/feed", get(conversations::conversation_feed))
        .route(
            "/conversations/{conversation_id}",
            delete(conversations::delete_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(conversations::send_message).get(conversations::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages/scroll",
            get(conversations::scroll_messages),
        )
        .route("/ideas", get(conversations::list_ideas))
        .route("/admin/jobs/failed", get(admin::failed_jobs))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use ideaspark_db::Database;
    use ideaspark_gateway::Dispatcher;
    use ideaspark_types::models::UserRole;

    use crate::auth::create_token;
    use crate::cache::{MemoryStore, RateLimiter};
    use crate::queue::{JobQueue, QueueConfig};
    use crate::reply::ReplyPipeline;
    use crate::reply::tests::{Script, StubProvider};
    use crate::service::ConversationService;
    use crate::state::AppStateInner;

    const SECRET: &str = "test-secret";

    fn test_state(max_requests: i64) -> AppState {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let pipeline = ReplyPipeline::new(
            StubProvider::new(Script::Reply("Tell me more.")),
            Arc::new(dispatcher.clone()),
            Duration::from_secs(1),
        );
        Arc::new(AppStateInner {
            conversations: ConversationService::new(db.clone(), pipeline, 10),
            queue: JobQueue::new(db.clone(), QueueConfig::default(), vec![]),
            limiter: RateLimiter::new(
                Arc::new(MemoryStore::new()),
                Duration::from_secs(900),
                max_requests,
            ),
            db,
            dispatcher,
            jwt_secret: SECRET.into(),
            token_ttl_days: 1,
            daily_ideas: 10,
        })
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn register(app: &Router, username: &str) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "username": username, "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn missing_token_gets_the_error_envelope() {
        let app = router(test_state(100));
        let (status, body) = call(&app, "GET", "/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["errorCode"], "UNAUTHORIZED");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn register_create_and_list() {
        let app = router(test_state(100));
        let token = register(&app, "ada").await;

        let (status, body) = call(
            &app,
            "POST",
            "/conversations",
            Some(&token),
            Some(json!({ "message": "I want to build a study app" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["title"], "I want to build a study app");

        let (status, body) = call(
            &app,
            "GET",
            "/conversations?page=1&limit=5",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["meta"]["total"], 1);
        assert_eq!(body["data"]["meta"]["limit"], 5);

        // Starting a conversation does not spend the daily budget.
        let (status, body) = call(&app, "GET", "/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["username"], "ada");
        assert_eq!(body["data"]["remainingIdeas"], 10);
    }

    #[tokio::test]
    async fn login_checks_the_password() {
        let app = router(test_state(100));
        register(&app, "ada").await;

        let (status, body) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "ada", "password": "correct horse" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["token"].is_string());

        let (status, _) = call(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "ada", "password": "battery staple" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "username": "ada", "password": "another one" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["errorCode"], "CONFLICT");
    }

    #[tokio::test]
    async fn registering_with_email_queues_a_welcome() {
        let state = test_state(100);
        let app = router(state.clone());
        let (status, _) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({
                "username": "ada",
                "password": "correct horse",
                "email": "ada@example.com",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let job = state
            .db
            .claim_job(chrono::Duration::seconds(30))
            .unwrap()
            .unwrap();
        assert_eq!(job.kind, "welcome_email");
        assert_eq!(job.payload["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn other_users_conversations_are_off_limits() {
        let app = router(test_state(100));
        let owner = register(&app, "ada").await;
        let stranger = register(&app, "eve").await;

        let (_, body) = call(
            &app,
            "POST",
            "/conversations",
            Some(&owner),
            Some(json!({ "title": "Secret", "message": "my idea" })),
        )
        .await;
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/conversations/{}/messages", id),
            Some(&stranger),
            Some(json!({ "content": "let me in" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["errorCode"], "FORBIDDEN");

        let (status, body) = call(
            &app,
            "GET",
            &format!("/conversations/{}/messages", id),
            Some(&stranger),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["errorCode"], "NOT_FOUND");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/conversations/{}/messages", Uuid::now_v7()),
            Some(&owner),
            Some(json!({ "content": "anyone?" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_cursor_is_a_client_error() {
        let app = router(test_state(100));
        let token = register(&app, "ada").await;
        let (status, body) = call(
            &app,
            "GET",
            "/conversations/feed?cursor=garbage",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["errorCode"], "INVALID_CURSOR");
    }

    #[tokio::test]
    async fn requests_past_the_budget_are_rate_limited() {
        let app = router(test_state(2));
        let token = register(&app, "ada").await;
        for _ in 0..2 {
            let (status, _) = call(&app, "GET", "/me", Some(&token), None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = call(&app, "GET", "/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["errorCode"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn failed_jobs_need_the_admin_role() {
        let app = router(test_state(100));
        let user = register(&app, "ada").await;
        let (status, _) = call(&app, "GET", "/admin/jobs/failed", Some(&user), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin = create_token(SECRET, Uuid::now_v7(), "root", UserRole::Admin, 1).unwrap();
        let (status, body) = call(&app, "GET", "/admin/jobs/failed", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }
}
