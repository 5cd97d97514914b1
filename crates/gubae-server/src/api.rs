use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use gubae_chat::{ChatService, CommunityUpdate, NewCommunity, OutgoingMessage, Presence};
use gubae_shared::{ConversationId, MessageId, UserId, Visibility};
use gubae_store::{Conversation, Message, MessageView};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::identity::Identity;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/conversations", get(search_communities).post(create_community))
        .route("/me/conversations", get(my_conversations))
        .route("/conversations/direct", post(create_direct))
        .route(
            "/conversations/:id",
            get(get_conversation).patch(update_conversation),
        )
        .route("/conversations/:id/join", post(join))
        .route("/conversations/:id/leave", post(leave))
        .route("/conversations/:id/invite", post(invite))
        .route("/conversations/:id/promote", post(promote))
        .route("/conversations/:id/demote", post(demote))
        .route("/conversations/:id/deactivate", post(deactivate))
        .route("/conversations/:id/online", get(online_members))
        .route(
            "/conversations/:id/messages",
            get(fetch_history).post(send_message),
        )
        .route("/direct/:user_id/messages", post(send_direct))
        .route("/users/:user_id/presence", get(presence))
        .route("/messages/:id", patch(edit_message).delete(delete_message))
        .route(
            "/messages/:id/reactions",
            post(add_reaction).delete(remove_reaction),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    name: String,
    version: &'static str,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
struct CreateCommunityRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    rules: Vec<String>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct UpdateCommunityRequest {
    name: Option<String>,
    description: Option<String>,
    rules: Option<Vec<String>>,
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct TargetRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    after: u64,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
    expected_revision: Option<u64>,
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

#[derive(Serialize)]
struct InviteResponse {
    invited: bool,
}

#[derive(Serialize)]
struct OnlineResponse {
    online: Vec<UserId>,
}

// ─── Handlers ───

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn search_communities(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.chat.search_communities(&caller, &query.q)?))
}

async fn my_conversations(
    State(state): State<AppState>,
    Identity(caller): Identity,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    Ok(Json(state.chat.my_conversations(&caller)?))
}

async fn create_community(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Json(req): Json<CreateCommunityRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let created = state.chat.create_community(
        &caller,
        NewCommunity {
            name: req.name,
            description: req.description,
            visibility: req.visibility,
            rules: req.rules,
            avatar_url: req.avatar_url,
        },
    )?;
    info!(conversation = %created.id, "Community created via API");
    Ok(Json(created))
}

async fn create_direct(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.create_or_get_direct(&caller, &req.user_id)?))
}

async fn get_conversation(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.get_conversation(id, &caller)?))
}

async fn update_conversation(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Json(req): Json<UpdateCommunityRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let update = CommunityUpdate {
        name: req.name,
        description: req.description,
        rules: req.rules,
        avatar_url: req.avatar_url,
    };
    Ok(Json(state.chat.update_community(id, &caller, update)?))
}

/// Joining twice answers 200 with the unchanged conversation.
async fn join(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    match state.chat.join(id, &caller) {
        Ok(c) => Ok(Json(c)),
        Err(e) if e.is_soft() => Ok(Json(state.chat.get_conversation(id, &caller)?)),
        Err(e) => Err(e.into()),
    }
}

async fn leave(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.leave(id, &caller)?))
}

async fn invite(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<InviteResponse>, ApiError> {
    match state.chat.invite(id, &caller, &req.user_id) {
        Ok(()) => Ok(Json(InviteResponse { invited: true })),
        Err(e) if e.is_soft() => Ok(Json(InviteResponse { invited: false })),
        Err(e) => Err(e.into()),
    }
}

async fn promote(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.promote(id, &caller, &req.user_id)?))
}

async fn demote(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.demote(id, &caller, &req.user_id)?))
}

async fn deactivate(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.chat.deactivate(id, &caller)?))
}

async fn online_members(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
) -> Result<Json<OnlineResponse>, ApiError> {
    let online = state.chat.online_members(id, &caller)?;
    Ok(Json(OnlineResponse { online }))
}

async fn presence(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(user_id): Path<UserId>,
) -> Result<Json<Presence>, ApiError> {
    Ok(Json(state.chat.presence(&caller, &user_id)?))
}

async fn fetch_history(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let limit = query.limit.unwrap_or(state.config.history_page_limit);
    Ok(Json(state.chat.fetch_history(id, &caller, query.after, limit)?))
}

async fn send_message(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<ConversationId>,
    Json(outgoing): Json<OutgoingMessage>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(state.chat.send_message(id, &caller, outgoing).await?))
}

async fn send_direct(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(user_id): Path<UserId>,
    Json(outgoing): Json<OutgoingMessage>,
) -> Result<Json<Message>, ApiError> {
    Ok(Json(state.chat.send_direct(&caller, &user_id, outgoing).await?))
}

async fn edit_message(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<MessageId>,
    Json(req): Json<EditRequest>,
) -> Result<Json<MessageView>, ApiError> {
    Ok(Json(state.chat.edit_message(
        id,
        &caller,
        &req.content,
        req.expected_revision,
    )?))
}

async fn delete_message(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<MessageId>,
) -> Result<Json<MessageView>, ApiError> {
    Ok(Json(state.chat.delete_message(id, &caller)?))
}

async fn add_reaction(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<MessageId>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<MessageView>, ApiError> {
    Ok(Json(state.chat.react(id, &caller, &req.emoji)?))
}

async fn remove_reaction(
    State(state): State<AppState>,
    Identity(caller): Identity,
    Path(id): Path<MessageId>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<MessageView>, ApiError> {
    Ok(Json(state.chat.unreact(id, &caller, &req.emoji)?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use gubae_chat::ChatConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState {
            chat: Arc::new(ChatService::open_in_memory(ChatConfig::default()).unwrap()),
            rate_limiter: RateLimiter::new(1_000.0, 1_000.0),
            config: Arc::new(ServerConfig::default()),
        };
        build_router(state)
    }

    fn request(method: &str, uri: &str, user: Option<(&str, &str)>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = user {
            builder = builder.header("x-user-id", id).header("x-user-role", role);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_401() {
        let (status, body) = call(&app(), request("GET", "/me/conversations", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_community_flow() {
        let app = app();
        let pastor = Some(("pastor", "owner"));
        let bob = Some(("bob", "member"));

        let (status, _) = call(
            &app,
            request("POST", "/conversations", bob, Some(json!({ "name": "Youth" }))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, community) = call(
            &app,
            request(
                "POST",
                "/conversations",
                pastor,
                Some(json!({
                    "name": "Youth",
                    "visibility": "public",
                    "rules": ["Be kind"],
                    "avatar_url": "https://cdn.example/youth.png",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(community["avatar_url"], "https://cdn.example/youth.png");
        let id = community["id"].as_str().unwrap().to_string();

        let join = format!("/conversations/{id}/join");
        assert_eq!(call(&app, request("POST", &join, bob, None)).await.0, StatusCode::OK);
        // Joining again is a soft success.
        let (status, body) = call(&app, request("POST", &join, bob, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["members"].as_array().unwrap().len(), 2);

        let messages = format!("/conversations/{id}/messages");
        let (status, sent) = call(
            &app,
            request("POST", &messages, pastor, Some(json!({ "content": "Welcome!" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["seq"], 1);

        let (status, _) = call(
            &app,
            request("POST", &messages, bob, Some(json!({ "content": "   " }))),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, history) =
            call(&app, request("GET", &format!("{messages}?after=0&limit=10"), bob, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["message"]["content"], "Welcome!");

        let (status, body) = call(&app, request("GET", &messages, Some(("eve", "member")), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Action not permitted");
    }

    #[tokio::test]
    async fn test_message_overlay_routes() {
        let app = app();
        let alice = Some(("alice", "member"));
        let bob = Some(("bob", "member"));

        let (status, sent) = call(
            &app,
            request("POST", "/direct/bob/messages", alice, Some(json!({ "content": "Selam" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let message = format!("/messages/{}", sent["id"].as_str().unwrap());

        let (status, _) = call(
            &app,
            request("PATCH", &message, bob, Some(json!({ "content": "changed" }))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let reactions = format!("{message}/reactions");
        let (status, view) = call(
            &app,
            request("POST", &reactions, bob, Some(json!({ "emoji": "🙏" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["overlay"]["revision"], 1);

        let (status, _) = call(
            &app,
            request(
                "PATCH",
                &message,
                alice,
                Some(json!({ "content": "Selam!", "expected_revision": 0 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, view) = call(&app, request("DELETE", &message, alice, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["overlay"]["deleted"], true);

        let unknown = format!("/messages/{}", MessageId::new());
        let (status, _) = call(&app, request("DELETE", &unknown, alice, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
