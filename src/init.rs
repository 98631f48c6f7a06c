use std::error::Error;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use crate::llm::create_backend;
use crate::rate_limit::{RateLimiter, RateLimits};
use crate::storage::{BotStore, MemoryStore, PgStore, SiteStore, UserBotStore};
use crate::{AiConfig, AppState};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    /// Without it the server keeps bots and sites in memory.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
        })
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");
    let ai_config = AiConfig::from_env()?;
    log::info!("✅ Ai Configuration loaded");

    let (bots, sites, user_bots): (
        Arc<dyn BotStore>,
        Arc<dyn SiteStore>,
        Arc<dyn UserBotStore>,
    ) = match &config.database_url {
        Some(url) => {
            log::info!("📊 Connecting to PostgreSQL...");
            let db = setup_database(url).await?;
            log::info!("✅ PostgreSQL connected");

            log::info!("🔄 Running migrations...");
            sqlx::migrate!("./migrations").run(&db).await?;
            log::info!("✅ Migrations completed");

            let store = Arc::new(PgStore::new(db));
            (store.clone(), store.clone(), store)
        }
        None => {
            log::warn!("⚠️  DATABASE_URL not set, bots and sites live in memory");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store.clone(), store)
        }
    };

    let llm = create_backend(&ai_config)?;
    log::info!("✅ LLM backend: {}", llm.name());

    let limits = RateLimits::from_env();
    log::info!(
        "⏱️  Rate limits: generation {}/{}s, chat {}/{}s, publish {}/{}s",
        limits.generation.max,
        limits.generation.window.as_secs(),
        limits.chat.max,
        limits.chat.window.as_secs(),
        limits.publish.max,
        limits.publish.window.as_secs()
    );

    let state = Arc::new(AppState {
        bots,
        sites,
        user_bots,
        llm,
        limiter: Arc::new(RateLimiter::default()),
        limits,
        ai_config,
    });
    Ok((config, state))
}

// ============================================================================
// Setup Functions
// ============================================================================

async fn setup_database(url: &str) -> Result<sqlx::PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(50).connect(url).await
}
