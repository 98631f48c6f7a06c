use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::{Extension, Json};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::*;
use crate::events::DONE_SENTINEL;
use crate::models::*;
use crate::prompts;
use crate::rate_limit::Policy;
use crate::relay::{self, ProjectDefaults};
use crate::types::{BotTemplate, DeploymentKind, Slug, non_blank};
use crate::{AppState, moderation};

// ============================================================================
// Middleware
// ============================================================================

/// Identity used for rate limiting: `X-Client-ID`, then the first
/// `X-Forwarded-For` address, then `anonymous`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let key = header("X-Client-ID")
            .or_else(|| {
                header("X-Forwarded-For")
                    .and_then(|v| v.split(',').next())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or("anonymous");
        Self(key.to_string())
    }

    fn scoped(&self, operation: &str) -> String {
        format!("{}:{}", operation, self.0)
    }
}

pub async fn client_key_middleware(mut request: Request, next: Next) -> Response {
    let key = ClientKey::from_headers(request.headers());
    request.extensions_mut().insert(key);
    next.run(request).await
}

const SITE_CSP: &str = "default-src 'self'; script-src 'self' 'unsafe-inline'; \
     style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; \
     font-src 'self' https://fonts.gstatic.com; connect-src 'self'; \
     frame-ancestors 'none'; base-uri 'self'; form-action 'self'";

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let site_page = request.uri().path().starts_with("/s/");
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if site_page {
        headers.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(SITE_CSP));
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    }
    response
}

fn enforce(state: &AppState, client: &ClientKey, operation: &str, policy: Policy) -> Result<()> {
    let decision = state.limiter.check(&client.scoped(operation), policy);
    if decision.allowed {
        return Ok(());
    }
    let retry_after = decision.retry_after_secs(state.limiter.now());
    log::warn!(
        "Rate limit hit: op={} client={} retry_after={}s",
        operation,
        client.0,
        retry_after
    );
    Err(AppError::rate_limit(retry_after))
}

// ============================================================================
// SSE
// ============================================================================

/// Frames each payload as one `data:` event and closes with `[DONE]`.
fn event_stream(
    mut payloads: BoxStream<'static, String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(data) = payloads.next().await {
            yield Ok(Event::default().data(data));
        }
        yield Ok(Event::default().data(DONE_SENTINEL));
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// ============================================================================
// Code generation
// ============================================================================

/// POST /api/bots/generate-code
///
/// Streams `{"chunk"}` events, then one `{"done": true, ...}` or
/// `{"error"}` event, then `[DONE]`.
pub async fn generate_code_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<GenerateCodeRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let description = non_blank(request.description.as_deref());
    let template_id = non_blank(request.template.as_deref());
    if description.is_none() && template_id.is_none() {
        return Err(AppError::validation("Description or template is required"));
    }
    enforce(&state, &client, "generate", state.limits.generation)?;

    let template = template_id.and_then(BotTemplate::lookup);
    log::info!(
        "Generating project: template={:?} description_len={}",
        template,
        description.map_or(0, str::len)
    );

    let events = relay::open_relay(
        state.llm.clone(),
        prompts::generation(description, template),
        ProjectDefaults::generation(),
    )
    .await;
    Ok(event_stream(events.map(|e| e.to_data()).boxed()))
}

/// POST /api/bots/refine-code
pub async fn refine_code_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<RefineCodeRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut errors = ValidationErrors::new();
    if request.files.is_empty() {
        errors.add(ValidationError::required("files"));
    }
    if request.instruction.trim().is_empty() {
        errors.add(ValidationError::required("instruction"));
    }
    errors.finish()?;
    enforce(&state, &client, "refine", state.limits.generation)?;

    let bot_name = non_blank(request.bot_name.as_deref());
    let bot_description = non_blank(request.bot_description.as_deref());
    log::info!(
        "Refining project: {} files, instruction_len={}",
        request.files.len(),
        request.instruction.len()
    );

    let events = relay::open_relay(
        state.llm.clone(),
        prompts::refinement(&request.files, request.instruction.trim(), bot_name, bot_description),
        ProjectDefaults::refinement(bot_name, bot_description),
    )
    .await;
    Ok(event_stream(events.map(|e| e.to_data()).boxed()))
}

/// POST /api/bots/generate-prompt
pub async fn generate_prompt_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<GenerateCodeRequest>,
) -> Result<Json<GeneratedPrompt>> {
    let description = non_blank(request.description.as_deref());
    let template = non_blank(request.template.as_deref());
    if description.is_none() && template.is_none() {
        return Err(AppError::validation("Description or template is required"));
    }
    enforce(&state, &client, "generate-prompt", state.limits.generation)?;

    let content = state
        .llm
        .complete(prompts::persona(description, template))
        .await
        .context("Failed to generate prompt")?;

    let mut prompt: GeneratedPrompt = serde_json::from_str(content.trim())
        .map_err(|e| AppError::upstream(format!("Failed to generate prompt: {}", e)))?;
    if !prompt.suggested_slug.is_empty() {
        prompt.suggested_slug = Slug::sanitize(&prompt.suggested_slug);
    }
    Ok(Json(prompt))
}

// ============================================================================
// Bots
// ============================================================================

/// POST /api/bots
pub async fn publish_bot_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<PublishBotRequest>,
) -> Result<Json<UpsertOutcome>> {
    let slug = non_blank(request.slug.as_deref());
    let name = non_blank(request.name.as_deref());
    let system_prompt = non_blank(request.system_prompt.as_deref());

    let mut errors = ValidationErrors::new();
    for (field, value) in [("slug", slug), ("name", name), ("system_prompt", system_prompt)] {
        if value.is_none() {
            errors.add(ValidationError::required(field));
        }
    }
    errors.finish()?;
    let (Some(slug), Some(name), Some(system_prompt)) = (slug, name, system_prompt) else {
        return Err(AppError::validation("slug, name and system_prompt are required"));
    };

    let slug = Slug::parse(slug)?;
    let description = request.description.as_deref().unwrap_or_default().trim();
    moderation::check(name)?;
    moderation::check(description)?;
    enforce(&state, &client, "publish", state.limits.publish)?;

    let outcome = state
        .bots
        .upsert_bot(NewBot {
            slug: slug.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            system_prompt: system_prompt.to_string(),
            template: non_blank(request.template.as_deref()).map(str::to_string),
            avatar: non_blank(request.avatar.as_deref()).map(str::to_string),
            wallet_address: non_blank(request.wallet_address.as_deref()).map(str::to_string),
        })
        .await?;

    log::info!(
        "Bot {} {}",
        outcome.slug,
        if outcome.updated { "updated" } else { "created" }
    );
    Ok(Json(outcome))
}

const MAX_PAGE_SIZE: i64 = 50;

/// GET /api/bots?wallet=&page=&limit=
pub async fn list_bots_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Query(query): Query<ListBotsQuery>,
) -> Result<Json<BotPage>> {
    enforce(&state, &client, "list", state.limits.default)?;

    let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
    let page = query.page.unwrap_or(1).clamp(1, i64::MAX / MAX_PAGE_SIZE);
    let wallet = non_blank(query.wallet.as_deref());

    let (bots, total) = state.bots.list_bots(wallet, page, limit).await?;
    Ok(Json(BotPage {
        bots: bots.into_iter().map(BotSummary::from).collect(),
        total,
        page,
        limit,
    }))
}

/// DELETE /api/bots
pub async fn delete_bot_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteBotRequest>,
) -> Result<Json<serde_json::Value>> {
    let wallet = non_blank(request.wallet.as_deref());
    let (Some(id), Some(wallet)) = (request.id, wallet) else {
        return Err(AppError::validation("id and wallet are required"));
    };

    let owned = state
        .bots
        .find_bot(id)
        .await?
        .is_some_and(|bot| bot.wallet_address.as_deref() == Some(wallet));
    if !owned {
        return Err(AppError::forbidden("Not authorized"));
    }

    state.bots.delete_bot(id).await?;
    log::info!("Bot {} deleted", id);
    Ok(Json(serde_json::json!({ "success": true })))
}

/// GET /api/bot-info/{slug}
pub async fn bot_info_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Json<BotSummary>> {
    let bot = state
        .bots
        .find_bot_by_slug(&slug)
        .await?
        .ok_or_else(|| AppError::not_found("Bot"))?;
    Ok(Json(bot.into()))
}

// ============================================================================
// Chat
// ============================================================================

/// POST /api/chat/{slug}
///
/// Streams `{"content"}` events for a published bot, then `[DONE]`.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Path(slug): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let Some(messages) = request.messages else {
        return Err(ValidationError::required("messages").into());
    };

    let bot = state
        .bots
        .find_bot_by_slug(&slug)
        .await?
        .ok_or_else(|| AppError::not_found("Bot"))?;
    enforce(&state, &client, "chat", state.limits.chat)?;

    state.bots.record_message(bot.id).await?;

    let events = relay::open_chat(state.llm.clone(), prompts::chat(&bot.system_prompt, &messages)).await;
    Ok(event_stream(events.map(|e| e.to_data()).boxed()))
}

/// POST /api/test-chat
pub async fn test_chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<TestChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let system_prompt = non_blank(request.system_prompt.as_deref());
    let mut errors = ValidationErrors::new();
    if system_prompt.is_none() {
        errors.add(ValidationError::required("system_prompt"));
    }
    if request.messages.is_none() {
        errors.add(ValidationError::required("messages"));
    }
    errors.finish()?;
    let (Some(system_prompt), Some(messages)) = (system_prompt, request.messages.as_deref()) else {
        return Err(AppError::validation("system_prompt and messages are required"));
    };
    enforce(&state, &client, "test-chat", state.limits.chat)?;

    let events = relay::open_chat(state.llm.clone(), prompts::chat(system_prompt, messages)).await;
    Ok(event_stream(events.map(|e| e.to_data()).boxed()))
}

// ============================================================================
// Sites
// ============================================================================

/// POST /api/publish
pub async fn publish_site_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<PublishSiteRequest>,
) -> Result<Json<PublishSiteResponse>> {
    let slug = non_blank(request.slug.as_deref());
    let html = request.html.as_deref().filter(|h| !h.trim().is_empty());
    let (Some(slug), Some(html)) = (slug, html) else {
        return Err(AppError::validation("slug and html are required"));
    };
    let slug = Slug::parse_with_max(slug, Slug::SITE_MAX_LEN)?;
    enforce(&state, &client, "publish", state.limits.publish)?;

    let site_name = non_blank(request.site_name.as_deref())
        .unwrap_or(slug.as_str())
        .to_string();
    let (id, updated) = state
        .sites
        .upsert_site(NewSite {
            slug: slug.to_string(),
            html: html.to_string(),
            site_name,
            template: non_blank(request.template.as_deref()).map(str::to_string),
            description: non_blank(request.description.as_deref()).map(str::to_string),
            wallet_address: non_blank(request.wallet_address.as_deref()).map(str::to_string),
        })
        .await?;

    log::info!("Site {} published ({} bytes)", slug, html.len());
    Ok(Json(PublishSiteResponse {
        id,
        url: format!("/s/{}", slug),
        slug: slug.into(),
        updated,
    }))
}

/// GET /s/{slug}
pub async fn serve_site_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Response> {
    let Some(site) = state.sites.find_site(&slug).await? else {
        return Ok((StatusCode::NOT_FOUND, "Not Found").into_response());
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "public, max-age=60, s-maxage=300"),
        ],
        site.html,
    )
        .into_response())
}

// ============================================================================
// Browser deployments
// ============================================================================

/// GET /api/user-bots
pub async fn list_user_bots_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Query(query): Query<UserBotsQuery>,
) -> Result<Json<UserBotList>> {
    let browser_id = non_blank(query.browser_id.as_deref())
        .ok_or_else(|| AppError::validation("browser_id required"))?;
    enforce(&state, &client, "user-bots", state.limits.default)?;

    let bots = state.user_bots.list_user_bots(browser_id).await?;
    Ok(Json(UserBotList { bots }))
}

/// POST /api/user-bots
pub async fn save_user_bot_handler(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientKey>,
    Json(request): Json<SaveUserBotRequest>,
) -> Result<Json<SaveUserBotResponse>> {
    let browser_id = non_blank(request.browser_id.as_deref());
    let name = non_blank(request.name.as_deref());
    let kind = non_blank(request.kind.as_deref());
    let url = non_blank(request.url.as_deref());
    let (Some(browser_id), Some(name), Some(kind), Some(url)) = (browser_id, name, kind, url)
    else {
        return Err(AppError::validation("browser_id, name, type, url required"));
    };
    let kind: DeploymentKind = kind
        .parse()
        .map_err(|_| AppError::validation("type must be 'github' or 'webai'"))?;
    enforce(&state, &client, "publish", state.limits.publish)?;

    let (id, created) = state
        .user_bots
        .save_user_bot(NewUserBot {
            browser_id: browser_id.to_string(),
            name: name.to_string(),
            description: request.description.unwrap_or_default().trim().to_string(),
            kind,
            url: url.to_string(),
            repo_name: non_blank(request.repo_name.as_deref()).map(str::to_string),
            slug: non_blank(request.slug.as_deref()).map(str::to_string),
        })
        .await?;

    if created {
        log::info!("Deployment {} saved for browser {} ({})", url, browser_id, kind.as_ref());
    }
    Ok(Json(SaveUserBotResponse {
        id,
        exists: !created,
        created,
    }))
}

/// DELETE /api/user-bots
pub async fn delete_user_bot_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteUserBotRequest>,
) -> Result<Json<serde_json::Value>> {
    let browser_id = non_blank(request.browser_id.as_deref());
    let (Some(id), Some(browser_id)) = (request.id, browser_id) else {
        return Err(AppError::validation("id and browser_id required"));
    };

    if state.user_bots.delete_user_bot(id, browser_id).await? {
        log::info!("Deployment {} removed", id);
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

// ============================================================================
// Health
// ============================================================================

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus::healthy(state.bots.backend(), state.llm.name()))
}
