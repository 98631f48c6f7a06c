pub mod client;
pub mod error;
pub mod events;
pub mod handlers;
pub mod init;
pub mod llm;
pub mod models;
pub mod moderation;
pub mod prompts;
pub mod rate_limit;
pub mod relay;
pub mod sse;
pub mod storage;
pub mod types;
pub mod wizard;

pub use crate::storage::{AiConfig, AppState};

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::cors::{Any, CorsLayer};

use crate::handlers::*;

pub fn create_app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/bots/generate-code", post(generate_code_handler))
        .route("/api/bots/refine-code", post(refine_code_handler))
        .route("/api/bots/generate-prompt", post(generate_prompt_handler))
        .route(
            "/api/bots",
            get(list_bots_handler)
                .post(publish_bot_handler)
                .delete(delete_bot_handler),
        )
        .route(
            "/api/user-bots",
            get(list_user_bots_handler)
                .post(save_user_bot_handler)
                .delete(delete_user_bot_handler),
        )
        .route("/api/bot-info/{slug}", get(bot_info_handler))
        .route("/api/chat/{slug}", post(chat_handler))
        .route("/api/test-chat", post(test_chat_handler))
        .route("/api/publish", post(publish_site_handler))
        .route("/s/{slug}", get(serve_site_handler))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(client_key_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, RelayClient, partial_paths};
    use crate::events::StreamEvent;
    use crate::llm::{Script, ScriptedBackend};
    use crate::models::{GenerateCodeRequest, RefineCodeRequest};
    use crate::wizard::{Applied, Mode, Wizard};

    async fn spawn_server(backend: ScriptedBackend) -> String {
        let state = Arc::new(AppState::in_memory(Arc::new(backend)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_app_router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_generate_end_to_end_drives_wizard() {
        let base = spawn_server(ScriptedBackend::demo()).await;
        let client = RelayClient::new(base).with_client_id("e2e");

        let mut wizard = Wizard::new();
        wizard.describe("a trivia quiz bot").unwrap();
        let ticket = wizard.start_generation().unwrap();
        assert_eq!(wizard.mode(), Mode::Generating);

        let mut text = String::new();
        let mut progress = Vec::new();
        let outcome = client
            .generate(
                &GenerateCodeRequest {
                    description: Some("a trivia quiz bot".to_string()),
                    template: None,
                },
                |event, so_far| {
                    if let StreamEvent::Chunk(chunk) = event {
                        text.push_str(chunk);
                        progress.push(partial_paths(so_far).len());
                    }
                },
            )
            .await;

        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(serde_json::from_str::<serde_json::Value>(&text).is_ok());

        let applied = wizard.finish_generation(ticket, outcome.map_err(|e| e.to_string()));
        assert_eq!(applied, Applied::Yes);
        assert_eq!(wizard.mode(), Mode::Editing);
        let project = wizard.state().project().unwrap().clone();
        assert_eq!(project.name, "Trivia Quiz Bot");
        assert!(project.files.len() >= 12);

        let ticket = wizard.start_refinement("add a leaderboard").unwrap();
        let refined = client
            .refine(
                &RefineCodeRequest {
                    files: project.files.clone(),
                    instruction: "add a leaderboard".to_string(),
                    bot_name: Some(project.name.clone()),
                    bot_description: None,
                },
                |_, _| {},
            )
            .await;
        let applied = wizard.finish_refinement(ticket, refined.map_err(|e| e.to_string()));
        assert_eq!(applied, Applied::Yes);
        assert_eq!(wizard.mode(), Mode::Editing);
    }

    #[tokio::test]
    async fn test_client_surfaces_validation_and_rejection() {
        let base = spawn_server(ScriptedBackend::new(Script::Chunks(vec![
            "not json".to_string(),
        ])))
        .await;
        let client = RelayClient::new(base);

        let rejected = client.generate(&GenerateCodeRequest::default(), |_, _| {}).await;
        assert_eq!(
            rejected,
            Err(ClientError::Http {
                status: 422,
                message: "Description or template is required".to_string(),
            })
        );

        let failed = client
            .generate(
                &GenerateCodeRequest {
                    description: Some("anything".to_string()),
                    template: None,
                },
                |_, _| {},
            )
            .await;
        assert_eq!(
            failed,
            Err(ClientError::Server("Failed to parse AI response".to_string()))
        );
    }
}
