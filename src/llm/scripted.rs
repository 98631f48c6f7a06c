//! Scripted backend for tests and for running without an API key.
//!
//! Each call to [`CompletionBackend::stream`] pops the next [`Script`]; when
//! the queue is empty the fallback script is used.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{ChunkStream, CompletionBackend, CompletionRequest, ModelTier};
use super::LlmError;
use crate::models::{BotFile, GeneratedProject};
use crate::prompts;
use crate::types::Slug;

#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these fragments and end cleanly.
    Chunks(Vec<String>),
    /// The upstream call fails before any fragment.
    FailToStart(LlmError),
    /// Stream the fragments, then break the transport.
    BreakAfter { chunks: Vec<String>, error: LlmError },
    /// Answer like a model would for the kind of request: a chat reply, the
    /// submitted files back for a refinement, otherwise a generated project.
    Demo,
}

impl Script {
    /// Splits `text` into fragments of at most `size` chars.
    pub fn chunked(text: &str, size: usize) -> Self {
        Self::Chunks(split_chars(text, size))
    }
}

fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

pub struct ScriptedBackend {
    queue: Mutex<VecDeque<Script>>,
    fallback: Script,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(fallback: Script) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Streams demo answers in small fragments, like a real model would.
    pub fn demo() -> Self {
        Self::new(Script::Demo).with_delay(Duration::from_millis(5))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, script: Script) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(script);
        }
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_script(&self) -> Script {
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, LlmError> {
        let script = self.next_script();
        let outcome = match script {
            Script::Chunks(chunks) => Ok((chunks, None)),
            Script::FailToStart(error) => Err(error),
            Script::BreakAfter { chunks, error } => Ok((chunks, Some(error))),
            Script::Demo => demo_response(&request).map(|text| (split_chars(&text, 24), None)),
        };
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let (chunks, tail) = outcome?;

        let delay = self.delay;
        let items = chunks
            .into_iter()
            .map(Ok)
            .chain(tail.map(Err))
            .collect::<Vec<Result<String, LlmError>>>();

        let stream = tokio_stream::iter(items).then(move |item| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

fn demo_response(request: &CompletionRequest) -> Result<String, LlmError> {
    let user = request.last_user().unwrap_or_default();
    if request.tier == ModelTier::Chat && !request.json_mode {
        return Ok(demo_reply(request.system().unwrap_or_default(), user));
    }

    let document = match request.system().and_then(prompts::refinement_files) {
        Some(files) => {
            let instruction = user.strip_prefix(prompts::REFINE_PREFIX).unwrap_or(user);
            serde_json::json!({
                "change_summary": format!(
                    "Demo mode: noted \"{}\", files left unchanged",
                    instruction.trim()
                ),
                "files": files,
            })
        }
        None => serde_json::to_value(demo_project(user))
            .map_err(|e| LlmError::Completion(e.to_string()))?,
    };
    serde_json::to_string(&document).map_err(|e| LlmError::Completion(e.to_string()))
}

/// In-character reply built from the bot's system prompt.
fn demo_reply(system_prompt: &str, message: &str) -> String {
    let identity = system_prompt
        .split_once("You are ")
        .map(|(_, rest)| rest.split([',', '.', '\n']).next().unwrap_or(rest).trim())
        .filter(|name| !name.is_empty())
        .unwrap_or("your assistant");
    let message = message.trim();
    if message.is_empty() {
        return format!("Hi! I'm {}. What would you like to talk about?", identity);
    }
    format!(
        "Hi! I'm {}. You said: \"{}\". I'm running in demo mode, so my answers stay short.",
        identity, message
    )
}

/// A complete, self-contained bot project derived from a description.
pub fn demo_project(description: &str) -> GeneratedProject {
    let from_template = || {
        description
            .lines()
            .find_map(|l| l.strip_prefix("Template context: "))
            .and_then(|hint| hint.split('.').next())
    };
    let description = description
        .lines()
        .find_map(|l| {
            l.strip_prefix("User's description: ")
                .or_else(|| l.strip_prefix("User description: "))
        })
        .or_else(from_template)
        .unwrap_or(description)
        .trim();
    let topic = if description.is_empty() {
        "chat bot"
    } else {
        description
    };
    let name = title_case(topic.trim_start_matches("a ").trim_start_matches("an "));
    let slug = Slug::sanitize(&name);
    let slug = if slug.len() < Slug::MIN_LEN {
        "my-bot".to_string()
    } else {
        slug
    };

    let files = vec![
        BotFile::new(
            "app.py",
            "from bot import create_app\nimport os\n\napp = create_app()\n\nif __name__ == \"__main__\":\n    app.run(host=\"0.0.0.0\", port=int(os.environ.get(\"PORT\", 3000)))\n",
        ),
        BotFile::new(
            "config.py",
            format!("BOT_NAME = {:?}\nVERSION = \"1.0.0\"\nMAX_HISTORY = 50\n", name),
        ),
        BotFile::new(
            "bot/__init__.py",
            "from flask import Flask\nfrom flask_cors import CORS\n\n\ndef create_app():\n    from .routes import register\n    app = Flask(__name__, static_folder=\"../static\", template_folder=\"../templates\")\n    CORS(app)\n    register(app)\n    return app\n",
        ),
        BotFile::new(
            "bot/routes.py",
            "from flask import jsonify, render_template, request\nfrom .engine import Engine\n\nengine = Engine()\n\n\ndef register(app):\n    @app.get(\"/\")\n    def index():\n        return render_template(\"index.html\")\n\n    @app.post(\"/api/chat\")\n    def chat():\n        body = request.get_json(force=True)\n        return jsonify(reply=engine.reply(body.get(\"session_id\", \"anon\"), body.get(\"message\", \"\")))\n\n    @app.get(\"/api/health\")\n    def health():\n        return jsonify(status=\"ok\")\n\n    @app.get(\"/api/stats\")\n    def stats():\n        return jsonify(engine.stats())\n",
        ),
        BotFile::new(
            "bot/engine.py",
            format!(
                "from .knowledge import FACTS\nfrom .responses import greeting\n\n\nclass Engine:\n    \"\"\"Core logic for {name}.\"\"\"\n\n    def __init__(self):\n        self.sessions = {{}}\n        self.messages = 0\n\n    def reply(self, session_id: str, message: str) -> str:\n        self.messages += 1\n        state = self.sessions.setdefault(session_id, {{\"turns\": 0}})\n        state[\"turns\"] += 1\n        if state[\"turns\"] == 1:\n            return greeting()\n        return FACTS[state[\"turns\"] % len(FACTS)]\n\n    def stats(self) -> dict:\n        return {{\"sessions\": len(self.sessions), \"messages\": self.messages}}\n"
            ),
        ),
        BotFile::new(
            "bot/models.py",
            "from dataclasses import dataclass, field\n\n\n@dataclass\nclass Session:\n    session_id: str\n    turns: int = 0\n    history: list = field(default_factory=list)\n",
        ),
        BotFile::new(
            "bot/knowledge.py",
            format!("FACTS = [\n    \"Welcome to {name}!\",\n    \"Ask me anything about {topic}.\",\n    \"Type 'help' to see what I can do.\",\n]\n"),
        ),
        BotFile::new(
            "bot/responses.py",
            format!("def greeting() -> str:\n    return \"Hi! I am {name}.\"\n"),
        ),
        BotFile::new(
            "bot/utils.py",
            "def clean(text: str) -> str:\n    return \" \".join(text.split()).strip()\n",
        ),
        BotFile::new(
            "static/css/style.css",
            ":root { --bg: #0f0f23; --text: #fff; --accent: #6366f1; }\nbody { background: var(--bg); color: var(--text); font-family: Inter, sans-serif; }\n",
        ),
        BotFile::new(
            "static/js/app.js",
            "const sessionId = crypto.randomUUID();\nasync function send(message) {\n  const res = await fetch('/api/chat', { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify({ session_id: sessionId, message }) });\n  return (await res.json()).reply;\n}\n",
        ),
        BotFile::new(
            "templates/index.html",
            "<!doctype html>\n<html>\n<head><link rel=\"stylesheet\" href=\"/static/css/style.css\"></head>\n<body><h1>{{ bot_name }}</h1><script src=\"/static/js/app.js\"></script></body>\n</html>\n",
        ),
        BotFile::new("tests/__init__.py", ""),
        BotFile::new(
            "tests/test_engine.py",
            "from bot.engine import Engine\n\n\ndef test_first_reply_is_greeting():\n    assert \"Hi\" in Engine().reply(\"s\", \"hello\")\n",
        ),
        BotFile::new("requirements.txt", "flask>=3.0.0\nflask-cors>=4.0.0\npytest>=8.0.0\n"),
        BotFile::new(
            "README.md",
            format!("# {name}\n\n{topic}\n\n## Run\n\n```\npip install -r requirements.txt\npython app.py\n```\n"),
        ),
        BotFile::new(
            "Dockerfile",
            "FROM python:3.11-slim\nWORKDIR /app\nCOPY requirements.txt .\nRUN pip install --no-cache-dir -r requirements.txt\nCOPY . .\nEXPOSE 3000\nCMD [\"python\", \"app.py\"]\n",
        ),
        BotFile::new(".gitignore", "venv/\n__pycache__/\n.env\n"),
    ];

    GeneratedProject {
        name: name.clone(),
        description: format!("A self-contained {}", topic),
        system_prompt: format!(
            "You are {}, a friendly assistant focused on {}. Stay on topic and keep answers short.",
            name, topic
        ),
        suggested_slug: slug,
        change_summary: None,
        files,
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
