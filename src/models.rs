use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::DeploymentKind;

// ============================================================================
// Generated projects
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotFile {
    pub path: String,
    pub content: String,
    /// Any other keys the model attached to the entry, kept as sent.
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BotFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Structured result of a generation or refinement stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedProject {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub suggested_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
    pub files: Vec<BotFile>,
}

impl GeneratedProject {
    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn file(&self, path: &str) -> Option<&BotFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

// ============================================================================
// Generation requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerateCodeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RefineCodeRequest {
    #[serde(default)]
    pub files: Vec<BotFile>,
    #[serde(default)]
    pub instruction: String,
    #[serde(default, alias = "botName", skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, alias = "botDescription", skip_serializing_if = "Option::is_none")]
    pub bot_description: Option<String>,
}

/// One-shot bot persona produced by the prompt generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedPrompt {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggested_slug: String,
}

// ============================================================================
// Chat
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestChatRequest {
    #[serde(alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
}

// ============================================================================
// Bots
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct BotRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub template: Option<String>,
    pub avatar: Option<String>,
    pub wallet_address: Option<String>,
    pub is_public: bool,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public projection used by the gallery and bot-info endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotSummary {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub template: Option<String>,
    pub avatar: Option<String>,
    pub wallet_address: Option<String>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

impl From<BotRecord> for BotSummary {
    fn from(bot: BotRecord) -> Self {
        Self {
            id: bot.id,
            slug: bot.slug,
            name: bot.name,
            description: bot.description,
            template: bot.template,
            avatar: bot.avatar,
            wallet_address: bot.wallet_address,
            message_count: bot.message_count,
            created_at: bot.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PublishBotRequest {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    pub template: Option<String>,
    pub avatar: Option<String>,
    #[serde(alias = "walletAddress")]
    pub wallet_address: Option<String>,
}

/// Validated write model for a bot upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBot {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub template: Option<String>,
    pub avatar: Option<String>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub slug: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub updated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListBotsQuery {
    pub wallet: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotPage {
    pub bots: Vec<BotSummary>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteBotRequest {
    pub id: Option<Uuid>,
    pub wallet: Option<String>,
}

// ============================================================================
// Published sites
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct PublishedSite {
    pub id: Uuid,
    pub slug: String,
    pub html: String,
    pub site_name: String,
    pub template: Option<String>,
    pub description: Option<String>,
    pub wallet_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PublishSiteRequest {
    pub slug: Option<String>,
    pub html: Option<String>,
    #[serde(alias = "walletAddress")]
    pub wallet_address: Option<String>,
    #[serde(alias = "siteName")]
    pub site_name: Option<String>,
    pub template: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSite {
    pub slug: String,
    pub html: String,
    pub site_name: String,
    pub template: Option<String>,
    pub description: Option<String>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSiteResponse {
    pub id: Uuid,
    pub slug: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub updated: bool,
}

// ============================================================================
// Browser deployments
// ============================================================================

/// A deployment remembered for one browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct UserBot {
    pub id: Uuid,
    pub browser_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    #[sqlx(try_from = "String")]
    pub kind: DeploymentKind,
    pub url: String,
    pub repo_name: Option<String>,
    pub slug: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SaveUserBotRequest {
    #[serde(alias = "browserId")]
    pub browser_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub url: Option<String>,
    #[serde(alias = "repoName")]
    pub repo_name: Option<String>,
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUserBot {
    pub browser_id: String,
    pub name: String,
    pub description: String,
    pub kind: DeploymentKind,
    pub url: String,
    pub repo_name: Option<String>,
    pub slug: Option<String>,
}

/// `exists` when the browser already saved this url, `created` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveUserBotResponse {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub created: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserBotsQuery {
    #[serde(alias = "browserId")]
    pub browser_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBotList {
    pub bots: Vec<UserBot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteUserBotRequest {
    pub id: Option<Uuid>,
    #[serde(alias = "browserId")]
    pub browser_id: Option<String>,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub store: String,
    pub llm: String,
}

impl HealthStatus {
    pub fn healthy(store: &str, llm: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                store: store.to_string(),
                llm: llm.to_string(),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_project_lookup() {
        let project = GeneratedProject {
            name: "Quiz".to_string(),
            description: String::new(),
            system_prompt: String::new(),
            suggested_slug: "quiz".to_string(),
            change_summary: None,
            files: vec![BotFile::new("app.py", "print()"), BotFile::new("README.md", "# Quiz")],
        };

        assert_eq!(project.paths(), vec!["app.py", "README.md"]);
        assert_eq!(project.file("README.md").unwrap().content, "# Quiz");
        assert!(project.file("missing.py").is_none());
    }

    #[test]
    fn test_chat_message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
        let parsed: ChatMessage = serde_json::from_str(r#"{"role":"user","content":"yo"}"#).unwrap();
        assert_eq!(parsed, ChatMessage::user("yo"));
    }

    #[test]
    fn test_upsert_outcome_omits_false_updated() {
        let outcome = UpsertOutcome {
            id: Uuid::nil(),
            slug: "bot".to_string(),
            updated: false,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json.get("updated").is_none());
    }

    #[test]
    fn test_publish_request_accepts_camel_case() {
        let request: PublishBotRequest = serde_json::from_str(
            r#"{"slug":"quiz","name":"Quiz","systemPrompt":"Ask","walletAddress":"w1"}"#,
        )
        .unwrap();
        assert_eq!(request.system_prompt.as_deref(), Some("Ask"));
        assert_eq!(request.wallet_address.as_deref(), Some("w1"));
    }
}
