//! Prompt composition for the upstream model.

use crate::llm::{CompletionRequest, ModelTier, PromptMessage};
use crate::models::{BotFile, ChatMessage};
use crate::types::BotTemplate;

/// Number of trailing conversation messages forwarded upstream.
pub const CHAT_HISTORY_LIMIT: usize = 20;

const CODE_MAX_TOKENS: u32 = 16_000;
const CHAT_MAX_TOKENS: u32 = 2_000;
const PERSONA_MAX_TOKENS: u32 = 1_000;

const GENERATION_SYSTEM: &str = r#"You are an elite Python developer who creates impressive, production-grade AI bot projects.

CRITICAL: The bot must be 100% SELF-CONTAINED. NO external AI APIs and no API keys for AI services. All bot logic, responses and intelligence must be built into the Python code itself: pattern matching, state machines, built-in knowledge databases, game engines, algorithms and decision trees.

Generate a FULL modular project for a custom chatbot web application (12-18 files, real directories, not a flat pile of files):

1. app.py: minimal entry point, imports the app from the bot/ package, runs on the PORT env var (default 3000)
2. config.py: bot name, version, description, default settings and limits
3. bot/__init__.py: creates the Flask app and registers routes
4. bot/routes.py: GET / serves the frontend, POST /api/chat, GET /api/health, GET /api/stats, CORS enabled
5. bot/engine.py: THE CORE, all bot intelligence, session-aware, at least 250 lines
6. bot/models.py: dataclasses and enums for session and game state
7. bot/knowledge.py: built-in knowledge base, at least 100 lines of real data
8. bot/responses.py: greeting, error and help templates with personality
9. bot/utils.py: input parsing, formatting and validation helpers
10. static/css/style.css: modern dark theme with CSS variables, chat bubbles, animations, responsive
11. static/js/app.js: session id, fetch-based messaging, typing indicator, markdown-lite rendering
12. templates/index.html: Jinja2 template linking the static CSS and JS, uses {{ bot_name }}
13. tests/test_engine.py: unit tests for the engine
14. tests/__init__.py: empty
15. requirements.txt: flask>=3.0.0, flask-cors>=4.0.0, pytest>=8.0.0
16. README.md: features, project tree, setup, Docker instructions, architecture
17. Dockerfile: python:3.11-slim, installs requirements, exposes 3000, runs app.py
18. docker-compose.yml
19. .gitignore
20. .env.example

ABSOLUTE RULES:
- ZERO external AI dependencies.
- Generate COMPLETE working code. No "..." or "TODO" placeholders, no empty stubs.
- python app.py, open the browser, and the chat works.
- Docstrings, type hints, clean imports, PEP 8, relative imports inside bot/.

Also generate a "system_prompt" field: a 300-500 word description of exactly how the bot behaves (personality, rules, capabilities). It is used for testing on the platform, not in the generated code.

Return JSON:
{
  "name": "Short catchy name (2-4 words)",
  "description": "One-line description (under 100 chars)",
  "system_prompt": "Detailed behavior description",
  "suggested_slug": "url-friendly-slug",
  "files": [
    { "path": "app.py", "content": "..." },
    { "path": "bot/engine.py", "content": "..." }
  ]
}"#;

const REFINEMENT_SYSTEM: &str = r#"You are an elite Python developer. The user has an existing bot project and wants to modify it.

Below is the COMPLETE current source code of the project:

%FILES%

The user wants the following change:
"%INSTRUCTION%"

Apply the requested change. You may modify existing files, add files, or remove files by leaving them out.

RULES:
- Return ALL files, not just the changed ones. The response replaces the entire project.
- Keep the same project structure (bot/, static/, templates/, tests/).
- The bot must remain 100% self-contained, with NO external AI APIs. Implement anything that would need one with built-in logic.
- All code must be complete and working. No "..." or "TODO" placeholders.
- Keep the existing personality and features unless the user asks to change them.
- Update README.md and tests when the change warrants it.

Update "name", "description" and "system_prompt" only if the change warrants it.

Return JSON:
{
  "name": "%BOT_NAME%",
  "description": "%BOT_DESCRIPTION%",
  "system_prompt": "Updated behavior description (300-500 words)",
  "suggested_slug": "url-friendly-slug",
  "change_summary": "Brief 1-2 sentence summary of what was changed",
  "files": [
    { "path": "app.py", "content": "..." }
  ]
}"#;

const PERSONA_SYSTEM: &str = r#"You are an expert AI prompt engineer. Given a description of a desired AI assistant, generate an optimized system prompt that will make the assistant perform excellently.

Return JSON with these fields:
{
  "name": "Short catchy name for the bot (2-4 words)",
  "system_prompt": "The full system prompt, 200-400 words, specific about personality, tone, capabilities and behavior rules",
  "description": "One-line description of the bot (under 100 chars)",
  "suggested_slug": "url-friendly-slug"
}

Guidelines for the system prompt:
- Start with a clear identity statement ("You are...")
- Define personality and tone
- List specific capabilities
- Add behavior rules (what to do and what NOT to do)
- Include formatting instructions where appropriate
- If the bot is about crypto or trading, add a disclaimer that it is not financial advice"#;

/// Project generation from a description and/or a template.
pub fn generation(description: Option<&str>, template: Option<BotTemplate>) -> CompletionRequest {
    let mut lines = Vec::new();
    if let Some(description) = description {
        lines.push(format!("User's description: {}", description));
    }
    if let Some(template) = template {
        lines.push(format!("Template context: {}", template.context_hint()));
    }

    CompletionRequest::new(
        ModelTier::Code,
        vec![
            PromptMessage::system(GENERATION_SYSTEM),
            PromptMessage::user(lines.join("\n")),
        ],
    )
    .max_tokens(CODE_MAX_TOKENS)
    .temperature(0.7)
    .json()
}

/// Rewrites the whole project according to `instruction`.
pub fn refinement(
    files: &[BotFile],
    instruction: &str,
    bot_name: Option<&str>,
    bot_description: Option<&str>,
) -> CompletionRequest {
    let system = REFINEMENT_SYSTEM
        .replace("%BOT_NAME%", bot_name.unwrap_or("My Bot"))
        .replace("%BOT_DESCRIPTION%", bot_description.unwrap_or_default())
        .replace("%INSTRUCTION%", instruction)
        .replace("%FILES%", &files_summary(files));

    CompletionRequest::new(
        ModelTier::Code,
        vec![
            PromptMessage::system(system),
            PromptMessage::user(format!("{}{}", REFINE_PREFIX, instruction)),
        ],
    )
    .max_tokens(CODE_MAX_TOKENS)
    .temperature(0.7)
    .json()
}

pub fn persona(description: Option<&str>, template: Option<&str>) -> CompletionRequest {
    let mut lines = Vec::new();
    if let Some(description) = description {
        lines.push(format!("User description: {}", description));
    }
    if let Some(template) = template {
        lines.push(format!("Template category: {}", template));
    }

    CompletionRequest::new(
        ModelTier::Chat,
        vec![
            PromptMessage::system(PERSONA_SYSTEM),
            PromptMessage::user(lines.join("\n")),
        ],
    )
    .max_tokens(PERSONA_MAX_TOKENS)
    .temperature(0.8)
    .json()
}

/// Chat turn: the bot's system prompt followed by the tail of the history.
pub fn chat(system_prompt: &str, messages: &[ChatMessage]) -> CompletionRequest {
    let start = messages.len().saturating_sub(CHAT_HISTORY_LIMIT);
    let mut prompt = Vec::with_capacity(CHAT_HISTORY_LIMIT + 1);
    prompt.push(PromptMessage::system(system_prompt));
    prompt.extend(messages[start..].iter().map(PromptMessage::from));

    CompletionRequest::new(ModelTier::Chat, prompt)
        .max_tokens(CHAT_MAX_TOKENS)
        .temperature(0.7)
}

/// Every file as a `═══ path ═══` header followed by its content.
pub fn files_summary(files: &[BotFile]) -> String {
    files
        .iter()
        .map(|f| format!("═══ {} ═══\n{}", f.path, f.content))
        .collect::<Vec<String>>()
        .join("\n\n")
}

const FILES_START: &str = "source code of the project:\n\n";
const FILES_END: &str = "\n\nThe user wants the following change:";

/// Prefix of the user turn in a refinement request.
pub const REFINE_PREFIX: &str = "Apply this change to my bot: ";

/// Recovers the file set embedded in a refinement system prompt.
pub fn refinement_files(system: &str) -> Option<Vec<BotFile>> {
    let start = system.find(FILES_START)? + FILES_START.len();
    let end = system.rfind(FILES_END)?;
    (start <= end).then(|| parse_files_summary(&system[start..end]))
}

/// Inverse of [`files_summary`].
pub fn parse_files_summary(summary: &str) -> Vec<BotFile> {
    fn flush(files: &mut [BotFile], lines: &mut Vec<&str>) {
        if let Some(file) = files.last_mut() {
            file.content = lines.join("\n");
        }
        lines.clear();
    }

    let mut files: Vec<BotFile> = Vec::new();
    let mut lines: Vec<&str> = Vec::new();

    for line in summary.split('\n') {
        let header = line
            .strip_prefix("═══ ")
            .and_then(|rest| rest.strip_suffix(" ═══"));
        match header {
            Some(path) => {
                // The "\n\n" separator leaves one extra trailing newline.
                if lines.last() == Some(&"") {
                    lines.pop();
                }
                flush(&mut files, &mut lines);
                files.push(BotFile::new(path, ""));
            }
            None => lines.push(line),
        }
    }
    flush(&mut files, &mut lines);
    files
}
