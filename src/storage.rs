use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::*;
use crate::llm::CompletionBackend;
use crate::models::*;
use crate::rate_limit::{RateLimiter, RateLimits};

// ============================================================================
// AppState && AiConfig
// ============================================================================
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub code_model: String,
    pub chat_model: String,
    pub timeout_secs: u64,
}

impl AiConfig {
    pub fn from_env() -> std::result::Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            code_model: std::env::var("CODE_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            chat_model: std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_secs: std::env::var("LLM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,
        })
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            code_model: "gpt-4o".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            timeout_secs: 300,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub bots: Arc<dyn BotStore>,
    pub sites: Arc<dyn SiteStore>,
    pub user_bots: Arc<dyn UserBotStore>,
    pub llm: Arc<dyn CompletionBackend>,
    pub limiter: Arc<RateLimiter>,
    pub limits: RateLimits,
    pub ai_config: AiConfig,
}

impl AppState {
    /// State backed by [`MemoryStore`], used without a database and in tests.
    pub fn in_memory(llm: Arc<dyn CompletionBackend>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            bots: store.clone(),
            sites: store.clone(),
            user_bots: store,
            llm,
            limiter: Arc::new(RateLimiter::default()),
            limits: RateLimits::default(),
            ai_config: AiConfig::default(),
        }
    }
}

// ============================================================================
// Store traits
// ============================================================================

#[async_trait]
pub trait BotStore: Send + Sync {
    /// Short name shown in health output.
    fn backend(&self) -> &'static str;

    /// Inserts by slug, or updates the existing bot in place. The owner is
    /// kept unless the new record names one.
    async fn upsert_bot(&self, bot: NewBot) -> Result<UpsertOutcome>;

    /// Newest first. With `wallet` only that owner's bots, otherwise public
    /// bots. Returns the page and the total matching count.
    async fn list_bots(
        &self,
        wallet: Option<&str>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<BotRecord>, i64)>;

    async fn find_bot(&self, id: Uuid) -> Result<Option<BotRecord>>;

    async fn find_bot_by_slug(&self, slug: &str) -> Result<Option<BotRecord>>;

    async fn delete_bot(&self, id: Uuid) -> Result<bool>;

    /// Single atomic increment of `message_count`.
    async fn record_message(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Returns the site id and whether an existing site was replaced.
    async fn upsert_site(&self, site: NewSite) -> Result<(Uuid, bool)>;

    async fn find_site(&self, slug: &str) -> Result<Option<PublishedSite>>;
}

/// Deployments a browser has made, deduplicated by url.
#[async_trait]
pub trait UserBotStore: Send + Sync {
    /// Returns the id and whether a new entry was created. Saving a url the
    /// browser already has returns the existing id.
    async fn save_user_bot(&self, bot: NewUserBot) -> Result<(Uuid, bool)>;

    /// Newest first.
    async fn list_user_bots(&self, browser_id: &str) -> Result<Vec<UserBot>>;

    async fn delete_user_bot(&self, id: Uuid, browser_id: &str) -> Result<bool>;
}

fn offset(page: i64, limit: i64) -> i64 {
    (page.max(1) - 1).saturating_mul(limit.max(0))
}

// ============================================================================
// Postgres
// ============================================================================

const BOT_COLUMNS: &str = "id, slug, name, description, system_prompt, template, avatar, \
     wallet_address, is_public, message_count, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BotStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_bot(&self, bot: NewBot) -> Result<UpsertOutcome> {
        // xmax is non-zero only for rows touched by the ON CONFLICT branch.
        let (id, updated): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO bots (id, slug, name, description, system_prompt, template, avatar, wallet_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (slug) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                system_prompt = EXCLUDED.system_prompt,
                template = EXCLUDED.template,
                avatar = EXCLUDED.avatar,
                wallet_address = COALESCE(EXCLUDED.wallet_address, bots.wallet_address),
                updated_at = NOW()
            RETURNING id, (xmax <> 0) AS updated
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&bot.slug)
        .bind(&bot.name)
        .bind(&bot.description)
        .bind(&bot.system_prompt)
        .bind(&bot.template)
        .bind(&bot.avatar)
        .bind(&bot.wallet_address)
        .fetch_one(&self.db)
        .await?;

        Ok(UpsertOutcome {
            id,
            slug: bot.slug,
            updated,
        })
    }

    async fn list_bots(
        &self,
        wallet: Option<&str>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<BotRecord>, i64)> {
        let filter = "CASE WHEN $1::text IS NULL THEN is_public ELSE wallet_address = $1 END";

        let bots = sqlx::query_as::<_, BotRecord>(&format!(
            "SELECT {} FROM bots WHERE {} ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            BOT_COLUMNS, filter
        ))
        .bind(wallet)
        .bind(limit)
        .bind(offset(page, limit))
        .fetch_all(&self.db)
        .await?;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM bots WHERE {}", filter))
            .bind(wallet)
            .fetch_one(&self.db)
            .await?;

        Ok((bots, total))
    }

    async fn find_bot(&self, id: Uuid) -> Result<Option<BotRecord>> {
        let bot = sqlx::query_as::<_, BotRecord>(&format!(
            "SELECT {} FROM bots WHERE id = $1",
            BOT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(bot)
    }

    async fn find_bot_by_slug(&self, slug: &str) -> Result<Option<BotRecord>> {
        let bot = sqlx::query_as::<_, BotRecord>(&format!(
            "SELECT {} FROM bots WHERE slug = $1",
            BOT_COLUMNS
        ))
        .bind(slug)
        .fetch_optional(&self.db)
        .await?;
        Ok(bot)
    }

    async fn delete_bot(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bots WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_message(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE bots SET message_count = message_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SiteStore for PgStore {
    async fn upsert_site(&self, site: NewSite) -> Result<(Uuid, bool)> {
        let row: (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO published_sites (id, slug, html, site_name, template, description, wallet_address)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (slug) DO UPDATE SET
                html = EXCLUDED.html,
                site_name = EXCLUDED.site_name,
                template = EXCLUDED.template,
                description = EXCLUDED.description,
                wallet_address = COALESCE(EXCLUDED.wallet_address, published_sites.wallet_address),
                updated_at = NOW()
            RETURNING id, (xmax <> 0) AS updated
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&site.slug)
        .bind(&site.html)
        .bind(&site.site_name)
        .bind(&site.template)
        .bind(&site.description)
        .bind(&site.wallet_address)
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_site(&self, slug: &str) -> Result<Option<PublishedSite>> {
        let site = sqlx::query_as::<_, PublishedSite>(
            r#"
            SELECT id, slug, html, site_name, template, description, wallet_address, created_at, updated_at
            FROM published_sites
            WHERE slug = $1
            "#,
        )
        .bind(slug)
        .fetch_optional(&self.db)
        .await?;
        Ok(site)
    }
}

#[async_trait]
impl UserBotStore for PgStore {
    async fn save_user_bot(&self, bot: NewUserBot) -> Result<(Uuid, bool)> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO user_bots (id, browser_id, name, description, kind, url, repo_name, slug)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (browser_id, url) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&bot.browser_id)
        .bind(&bot.name)
        .bind(&bot.description)
        .bind(bot.kind.as_ref())
        .bind(&bot.url)
        .bind(&bot.repo_name)
        .bind(&bot.slug)
        .fetch_optional(&self.db)
        .await?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let existing: Uuid =
            sqlx::query_scalar("SELECT id FROM user_bots WHERE browser_id = $1 AND url = $2")
                .bind(&bot.browser_id)
                .bind(&bot.url)
                .fetch_one(&self.db)
                .await?;
        Ok((existing, false))
    }

    async fn list_user_bots(&self, browser_id: &str) -> Result<Vec<UserBot>> {
        let bots = sqlx::query_as::<_, UserBot>(
            r#"
            SELECT id, browser_id, name, description, kind, url, repo_name, slug, created_at
            FROM user_bots
            WHERE browser_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(browser_id)
        .fetch_all(&self.db)
        .await?;
        Ok(bots)
    }

    async fn delete_user_bot(&self, id: Uuid, browser_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_bots WHERE id = $1 AND browser_id = $2")
            .bind(id)
            .bind(browser_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    bots: RwLock<HashMap<Uuid, BotRecord>>,
    sites: RwLock<HashMap<String, PublishedSite>>,
    user_bots: RwLock<Vec<UserBot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BotStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert_bot(&self, bot: NewBot) -> Result<UpsertOutcome> {
        let mut bots = self.bots.write().await;
        let now = Utc::now();

        if let Some(existing) = bots.values_mut().find(|b| b.slug == bot.slug) {
            existing.name = bot.name;
            existing.description = bot.description;
            existing.system_prompt = bot.system_prompt;
            existing.template = bot.template;
            existing.avatar = bot.avatar;
            if bot.wallet_address.is_some() {
                existing.wallet_address = bot.wallet_address;
            }
            existing.updated_at = now;
            return Ok(UpsertOutcome {
                id: existing.id,
                slug: bot.slug,
                updated: true,
            });
        }

        let record = BotRecord {
            id: Uuid::now_v7(),
            slug: bot.slug.clone(),
            name: bot.name,
            description: bot.description,
            system_prompt: bot.system_prompt,
            template: bot.template,
            avatar: bot.avatar,
            wallet_address: bot.wallet_address,
            is_public: true,
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        bots.insert(id, record);

        Ok(UpsertOutcome {
            id,
            slug: bot.slug,
            updated: false,
        })
    }

    async fn list_bots(
        &self,
        wallet: Option<&str>,
        page: i64,
        limit: i64,
    ) -> Result<(Vec<BotRecord>, i64)> {
        let bots = self.bots.read().await;
        let mut matching: Vec<&BotRecord> = bots
            .values()
            .filter(|b| match wallet {
                Some(w) => b.wallet_address.as_deref() == Some(w),
                None => b.is_public,
            })
            .collect();
        // v7 ids break ties between bots created in the same instant.
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(usize::try_from(offset(page, limit)).unwrap_or(usize::MAX))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn find_bot(&self, id: Uuid) -> Result<Option<BotRecord>> {
        Ok(self.bots.read().await.get(&id).cloned())
    }

    async fn find_bot_by_slug(&self, slug: &str) -> Result<Option<BotRecord>> {
        Ok(self
            .bots
            .read()
            .await
            .values()
            .find(|b| b.slug == slug)
            .cloned())
    }

    async fn delete_bot(&self, id: Uuid) -> Result<bool> {
        Ok(self.bots.write().await.remove(&id).is_some())
    }

    async fn record_message(&self, id: Uuid) -> Result<()> {
        if let Some(bot) = self.bots.write().await.get_mut(&id) {
            bot.message_count += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn upsert_site(&self, site: NewSite) -> Result<(Uuid, bool)> {
        let mut sites = self.sites.write().await;
        let now = Utc::now();

        if let Some(existing) = sites.get_mut(&site.slug) {
            existing.html = site.html;
            existing.site_name = site.site_name;
            existing.template = site.template;
            existing.description = site.description;
            if site.wallet_address.is_some() {
                existing.wallet_address = site.wallet_address;
            }
            existing.updated_at = now;
            return Ok((existing.id, true));
        }

        let id = Uuid::now_v7();
        sites.insert(
            site.slug.clone(),
            PublishedSite {
                id,
                slug: site.slug,
                html: site.html,
                site_name: site.site_name,
                template: site.template,
                description: site.description,
                wallet_address: site.wallet_address,
                created_at: now,
                updated_at: now,
            },
        );
        Ok((id, false))
    }

    async fn find_site(&self, slug: &str) -> Result<Option<PublishedSite>> {
        Ok(self.sites.read().await.get(slug).cloned())
    }
}

#[async_trait]
impl UserBotStore for MemoryStore {
    async fn save_user_bot(&self, bot: NewUserBot) -> Result<(Uuid, bool)> {
        let mut user_bots = self.user_bots.write().await;
        if let Some(existing) = user_bots
            .iter()
            .find(|b| b.browser_id == bot.browser_id && b.url == bot.url)
        {
            return Ok((existing.id, false));
        }

        let id = Uuid::now_v7();
        user_bots.push(UserBot {
            id,
            browser_id: bot.browser_id,
            name: bot.name,
            description: bot.description,
            kind: bot.kind,
            url: bot.url,
            repo_name: bot.repo_name,
            slug: bot.slug,
            created_at: Utc::now(),
        });
        Ok((id, true))
    }

    async fn list_user_bots(&self, browser_id: &str) -> Result<Vec<UserBot>> {
        let user_bots = self.user_bots.read().await;
        let mut matching: Vec<UserBot> = user_bots
            .iter()
            .filter(|b| b.browser_id == browser_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(matching)
    }

    async fn delete_user_bot(&self, id: Uuid, browser_id: &str) -> Result<bool> {
        let mut user_bots = self.user_bots.write().await;
        let before = user_bots.len();
        user_bots.retain(|b| !(b.id == id && b.browser_id == browser_id));
        Ok(user_bots.len() < before)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentKind;
    use tokio_test::assert_ok;

    fn new_bot(slug: &str, wallet: Option<&str>) -> NewBot {
        NewBot {
            slug: slug.to_string(),
            name: format!("Bot {}", slug),
            description: String::new(),
            system_prompt: "You are helpful".to_string(),
            template: None,
            avatar: None,
            wallet_address: wallet.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place_and_keeps_owner() {
        let store = MemoryStore::new();
        let created = assert_ok!(store.upsert_bot(new_bot("quiz", Some("w1"))).await);
        assert!(!created.updated);

        let mut changed = new_bot("quiz", None);
        changed.name = "Quiz Master".to_string();
        let updated = assert_ok!(store.upsert_bot(changed).await);
        assert!(updated.updated);
        assert_eq!(updated.id, created.id);

        let bot = store.find_bot_by_slug("quiz").await.unwrap().unwrap();
        assert_eq!(bot.name, "Quiz Master");
        assert_eq!(bot.wallet_address.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .upsert_bot(new_bot(&format!("bot-{}", i), Some("w1")))
                .await
                .unwrap();
        }
        store.upsert_bot(new_bot("other", Some("w2"))).await.unwrap();

        let (page, total) = store.list_bots(Some("w1"), 2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].slug, "bot-2");

        let (public, total) = store.list_bots(None, 1, 20).await.unwrap();
        assert_eq!(total, 6);
        assert_eq!(public[0].slug, "other");
    }

    #[tokio::test]
    async fn test_message_count_increments() {
        let store = Arc::new(MemoryStore::new());
        let id = store.upsert_bot(new_bot("chatty", None)).await.unwrap().id;

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.record_message(id).await })
            })
            .collect();
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }

        let bot = store.find_bot(id).await.unwrap().unwrap();
        assert_eq!(bot.message_count, 10);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();
        let outcome = store.upsert_bot(new_bot("gone", None)).await.unwrap();
        assert!(store.delete_bot(outcome.id).await.unwrap());
        assert!(!store.delete_bot(outcome.id).await.unwrap());
        assert!(store.find_bot(outcome.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_site_upsert() {
        let store = MemoryStore::new();
        let site = NewSite {
            slug: "landing".to_string(),
            html: "<h1>v1</h1>".to_string(),
            site_name: "landing".to_string(),
            template: None,
            description: None,
            wallet_address: Some("w1".to_string()),
        };
        let (id, updated) = store.upsert_site(site.clone()).await.unwrap();
        assert!(!updated);

        let (same_id, updated) = store
            .upsert_site(NewSite {
                html: "<h1>v2</h1>".to_string(),
                wallet_address: None,
                ..site
            })
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(same_id, id);

        let stored = store.find_site("landing").await.unwrap().unwrap();
        assert_eq!(stored.html, "<h1>v2</h1>");
        assert_eq!(stored.wallet_address.as_deref(), Some("w1"));
    }

    fn deployment(browser: &str, url: &str) -> NewUserBot {
        NewUserBot {
            browser_id: browser.to_string(),
            name: "Quiz".to_string(),
            description: String::new(),
            kind: DeploymentKind::Webai,
            url: url.to_string(),
            repo_name: None,
            slug: Some("quiz".to_string()),
        }
    }

    #[tokio::test]
    async fn test_user_bots_dedupe_by_url_per_browser() {
        let store = MemoryStore::new();
        let (id, created) = assert_ok!(store.save_user_bot(deployment("b1", "/s/quiz")).await);
        assert!(created);

        let (again, created) = assert_ok!(store.save_user_bot(deployment("b1", "/s/quiz")).await);
        assert!(!created);
        assert_eq!(again, id);

        let (_, created) = assert_ok!(store.save_user_bot(deployment("b2", "/s/quiz")).await);
        assert!(created);
        store
            .save_user_bot(deployment("b1", "https://github.com/me/quiz"))
            .await
            .unwrap();

        let mine = store.list_user_bots("b1").await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].url, "https://github.com/me/quiz");
    }

    #[tokio::test]
    async fn test_user_bot_delete_requires_matching_browser() {
        let store = MemoryStore::new();
        let (id, _) = store.save_user_bot(deployment("b1", "/s/quiz")).await.unwrap();

        assert!(!store.delete_user_bot(id, "b2").await.unwrap());
        assert!(store.delete_user_bot(id, "b1").await.unwrap());
        assert!(store.list_user_bots("b1").await.unwrap().is_empty());
    }

    #[test]
    fn test_offset() {
        assert_eq!(offset(1, 20), 0);
        assert_eq!(offset(3, 20), 40);
        assert_eq!(offset(0, 20), 0);
        assert_eq!(offset(i64::MAX, 50), i64::MAX);
    }
}
