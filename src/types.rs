use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{AsRefStr, EnumIter, EnumString};

use crate::error::AppError;

// ============================================================================
// Slug
// ============================================================================

/// Normalized, URL-safe public lookup key for a bot or a published site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlugError {
    #[error("Slug must be at least {min} characters")]
    TooShort { min: usize },
    #[error("Slug must be under {max} characters")]
    TooLong { max: usize },
}

impl Slug {
    pub const MIN_LEN: usize = 2;
    /// Upper bound applied to published sites.
    pub const SITE_MAX_LEN: usize = 64;

    /// Lowercases, maps every char outside `[a-z0-9-]` to `-`, collapses
    /// hyphen runs and trims hyphens from both ends.
    pub fn sanitize(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for c in raw.trim().chars().flat_map(char::to_lowercase) {
            let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            };
            if c == '-' && out.ends_with('-') {
                continue;
            }
            out.push(c);
        }
        out.trim_matches('-').to_string()
    }

    pub fn parse(raw: &str) -> Result<Self, SlugError> {
        let clean = Self::sanitize(raw);
        if clean.len() < Self::MIN_LEN {
            return Err(SlugError::TooShort { min: Self::MIN_LEN });
        }
        Ok(Self(clean))
    }

    pub fn parse_with_max(raw: &str, max: usize) -> Result<Self, SlugError> {
        let slug = Self::parse(raw)?;
        if slug.0.len() > max {
            return Err(SlugError::TooLong { max });
        }
        Ok(slug)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl From<SlugError> for AppError {
    fn from(err: SlugError) -> Self {
        AppError::validation(err.to_string())
    }
}

// ============================================================================
// Bot Templates
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BotTemplate {
    Blackjack,
    Trivia,
    Storyteller,
    StudyAssistant,
    CodeAssistant,
    TradingAnalyst,
    FitnessCoach,
    LanguageTutor,
    RecipeChef,
    DungeonMaster,
    DebatePartner,
}

impl BotTemplate {
    /// Lenient lookup: unknown template ids yield `None` instead of an error.
    pub fn lookup(id: &str) -> Option<Self> {
        Self::from_str(id.trim()).ok()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Blackjack => "Blackjack Game",
            Self::Trivia => "Trivia Quiz",
            Self::Storyteller => "Story Adventure",
            Self::StudyAssistant => "Study Assistant",
            Self::CodeAssistant => "Code Helper",
            Self::TradingAnalyst => "Trading Analyst",
            Self::FitnessCoach => "Fitness Coach",
            Self::LanguageTutor => "Language Tutor",
            Self::RecipeChef => "Recipe Chef",
            Self::DungeonMaster => "D&D Master",
            Self::DebatePartner => "Debate Partner",
        }
    }

    /// Hint injected into the code generation prompt.
    pub fn context_hint(&self) -> &'static str {
        match self {
            Self::Blackjack => {
                "A blackjack card game bot. Full card deck, dealing, hit/stand, ace handling, bust detection, dealer AI, win/loss/push tracking, score history."
            }
            Self::Trivia => {
                "A trivia quiz bot. Has 50+ built-in questions across categories (science, history, pop culture, geography, sports). Tracks score, gives hints, multiple difficulty levels."
            }
            Self::Storyteller => {
                "An interactive story adventure bot. Has branching storylines, character inventory, health/stats, multiple endings. Text-based RPG style."
            }
            Self::StudyAssistant => {
                "A study assistant with built-in flashcard system, spaced repetition, quiz mode, topic explanations from a knowledge base, progress tracking."
            }
            Self::CodeAssistant => {
                "A code helper bot with built-in code templates, syntax references, common algorithm implementations, code formatting, language detection."
            }
            Self::TradingAnalyst => {
                "A trading analysis bot with built-in technical indicators (RSI, MACD, moving averages), pattern recognition, portfolio tracking, risk calculator."
            }
            Self::FitnessCoach => {
                "A fitness coach with built-in workout database (100+ exercises), routine generator, rep/set tracking, BMI calculator, progress logging."
            }
            Self::LanguageTutor => {
                "A language tutor with built-in vocabulary database, grammar rules, conjugation tables, practice exercises, quiz mode, progress tracking."
            }
            Self::RecipeChef => {
                "A recipe bot with built-in recipe database (50+ recipes), ingredient matching, dietary filter, step-by-step instructions, shopping list generator."
            }
            Self::DungeonMaster => {
                "A D&D dungeon master bot. Has character creation, dice rolling engine, combat system, inventory management, procedurally generated dungeons, monster database."
            }
            Self::DebatePartner => {
                "A debate bot with built-in argument frameworks, logical fallacy detection, counterargument generation, scoring system, topic database."
            }
        }
    }
}

impl fmt::Display for BotTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

// ============================================================================
// Deployment kinds
// ============================================================================

/// Where a browser deployed a generated bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeploymentKind {
    /// Pushed to a GitHub repository.
    Github,
    /// Hosted chat endpoint on this service.
    Webai,
}

impl TryFrom<String> for DeploymentKind {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(value.trim())
    }
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// `Some(trimmed)` when the value is present and not blank.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_deployment_kind_names() {
        assert_eq!(DeploymentKind::try_from("github".to_string()), Ok(DeploymentKind::Github));
        assert_eq!(DeploymentKind::Webai.as_ref(), "webai");
        assert!(DeploymentKind::try_from("gitlab".to_string()).is_err());
    }

    #[test]
    fn test_slug_sanitize_examples() {
        assert_eq!(Slug::parse("My Bot!!").unwrap().as_str(), "my-bot");
        assert_eq!(Slug::parse("--a--b--").unwrap().as_str(), "a-b");
        assert_eq!(Slug::sanitize("  Trivia   Quiz 2000 "), "trivia-quiz-2000");
    }

    #[test]
    fn test_slug_rejects_short_input() {
        assert_eq!(Slug::parse(""), Err(SlugError::TooShort { min: 2 }));
        assert_eq!(Slug::parse("a"), Err(SlugError::TooShort { min: 2 }));
        assert_eq!(Slug::parse("!!!"), Err(SlugError::TooShort { min: 2 }));
        assert_eq!(Slug::parse("-x-"), Err(SlugError::TooShort { min: 2 }));
    }

    #[test]
    fn test_slug_non_ascii_becomes_hyphen() {
        assert_eq!(Slug::sanitize("Café Bot"), "caf-bot");
    }

    #[test]
    fn test_slug_max_len() {
        let long = "a".repeat(65);
        assert_eq!(
            Slug::parse_with_max(&long, Slug::SITE_MAX_LEN),
            Err(SlugError::TooLong { max: 64 })
        );
        assert!(Slug::parse_with_max(&"a".repeat(64), Slug::SITE_MAX_LEN).is_ok());
    }

    #[test]
    fn test_slug_is_idempotent() {
        let once = Slug::sanitize("Hello__World!! 42");
        assert_eq!(Slug::sanitize(&once), once);
    }

    #[test]
    fn test_slug_deserialize_sanitizes() {
        let slug: Slug = serde_json::from_str("\"Fancy Bot\"").unwrap();
        assert_eq!(slug.as_str(), "fancy-bot");
        assert!(serde_json::from_str::<Slug>("\"?\"").is_err());
    }

    #[test]
    fn test_template_lookup() {
        assert_eq!(BotTemplate::lookup("trivia"), Some(BotTemplate::Trivia));
        assert_eq!(
            BotTemplate::lookup("dungeon_master"),
            Some(BotTemplate::DungeonMaster)
        );
        assert_eq!(BotTemplate::lookup("spaceship"), None);
    }

    #[test]
    fn test_every_template_has_hint_and_round_trips() {
        for template in BotTemplate::iter() {
            assert!(!template.context_hint().is_empty());
            assert_eq!(BotTemplate::lookup(template.as_ref()), Some(template));
        }
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank(Some("  x ")), Some("x"));
        assert_eq!(non_blank(Some("   ")), None);
        assert_eq!(non_blank(None), None);
    }
}
