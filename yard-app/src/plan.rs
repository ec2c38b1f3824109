//! Execution plans: a short step list derived from a turn's first tool-call
//! batch, announced to the user, and extended when the model strays from it.

use crate::failover::state::write_atomic;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use yard_llm::{ChatMessage, ToolCall};

const PLAN_SLUG_CHARS_MAX: usize = 48;
const PLAN_STEP_CHARS_MAX: usize = 120;
const PLANNER_REQUEST_CHARS_MAX: usize = 1200;
const PLANNER_CANDIDATES_MAX: usize = 10;
const CLOSING_STEPS: [&str; 2] = ["Validate intermediate results", "Summarize outcome"];
const NO_STEP_FALLBACK: &str = "Execute required operation";

static NUMBERED_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s*[).\-:]\s+").expect("numbered step regex"));
static BULLETED_STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*•]\s+").expect("bulleted step regex"));
static SLUG_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("slug separator regex"));

const PLANNER_SYSTEM_PROMPT: &str = "You are an execution planner for a personal automation agent. \
The agent can run shell commands, read, write and list files in its workspace, and wait.\n\
Return only a numbered list of concrete execution steps.\n\
- Prefer 4-6 steps; fewer are fine for simple tasks.\n\
- Use short imperative phrases grounded in the request and the candidate tool actions.\n\
- No headings, notes, explanations or markdown fences.";

/// One short imperative phrase for a tool call.
pub fn summarize_tool_call(call: &ToolCall) -> String {
    let name = call.name.trim();
    if name.is_empty() {
        return NO_STEP_FALLBACK.to_string();
    }
    let args = call.arguments_json();
    let path = args
        .get("path")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|p| !p.is_empty());

    match name {
        "exec" => summarize_command(args.get("command").and_then(|v| v.as_str()).unwrap_or("")),
        "read_file" => path.map_or("Read required files".to_string(), |p| {
            format!("Read {}", short_path(p))
        }),
        "write_file" => path.map_or("Write updated files".to_string(), |p| {
            format!("Write {}", short_path(p))
        }),
        "list_dir" => path.map_or("List directory contents".to_string(), |p| {
            format!("List {}", short_path(p))
        }),
        "web_search" => "Search the web for required context".to_string(),
        "web_fetch" => "Fetch and inspect referenced content".to_string(),
        "spawn" | "subagent" => "Delegate a focused subtask".to_string(),
        "sleep" => "Wait before continuing".to_string(),
        other => format!("Run {other}"),
    }
}

fn summarize_command(command: &str) -> String {
    let mut command = command.trim();
    for separator in [" && ", " | ", " ; "] {
        if let Some(idx) = command.find(separator).filter(|i| *i > 0) {
            command = &command[..idx];
            break;
        }
    }
    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some(base) = parts.first().copied() else {
        return "Run shell command".to_string();
    };
    let sub = parts.get(1).copied();

    match base {
        "ls" | "dir" => "Inspect directory contents".to_string(),
        "cat" | "head" | "tail" => "Inspect file contents".to_string(),
        "rg" | "grep" | "find" => "Search codebase for relevant entries".to_string(),
        "git" | "cargo" | "go" | "npm" | "pnpm" | "yarn" => match sub {
            Some(sub) => format!("Run {base} {sub}"),
            None => format!("Run {base} command"),
        },
        "python" | "python3" => "Run Python script".to_string(),
        _ => {
            let head = parts[..parts.len().min(3)].join(" ");
            format!("Run command: {}", truncate_chars(&head, PLAN_SLUG_CHARS_MAX))
        }
    }
}

fn short_path(path: &str) -> String {
    match Path::new(path).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => path.to_string(),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Deduplicated step phrases for a batch, capped at `max_steps`. Deterministic
/// for a given batch.
pub fn derive(calls: &[ToolCall], max_steps: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    calls
        .iter()
        .map(summarize_tool_call)
        .filter(|step| seen.insert(step.clone()))
        .take(max_steps)
        .collect()
}

/// The plan for one turn.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    announced: bool,
    steps: Vec<String>,
    allowed_tools: HashSet<String>,
    max_steps: usize,
}

impl ExecutionPlan {
    pub fn new(max_steps: usize) -> Self {
        Self {
            max_steps: max_steps.max(1),
            ..Self::default()
        }
    }

    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.allowed_tools.contains(tool_name)
    }

    /// Fixes the plan from the first tool-call batch. `steps` overrides the
    /// derived phrases (planner output); it is capped the same way.
    pub fn announce(&mut self, calls: &[ToolCall], steps: Option<Vec<String>>) -> &[String] {
        let mut steps = steps
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| derive(calls, self.max_steps));
        steps.truncate(self.max_steps);
        if steps.is_empty() {
            steps.push(NO_STEP_FALLBACK.to_string());
        }
        self.steps = steps;
        for call in calls {
            let name = call.name.trim();
            if !name.is_empty() {
                self.allowed_tools.insert(name.to_string());
            }
        }
        self.announced = true;
        &self.steps
    }

    /// Records a call to a tool outside the plan and returns the step to
    /// announce. Once the plan holds `max_steps` the step is announced but not kept.
    pub fn append_deviation(&mut self, call: &ToolCall) -> Option<String> {
        let name = call.name.trim();
        if name.is_empty() || !self.allowed_tools.insert(name.to_string()) {
            return None;
        }
        let step = summarize_tool_call(call);
        if self.steps.contains(&step) {
            return None;
        }
        if self.steps.len() < self.max_steps {
            self.steps.push(step.clone());
        }
        Some(step)
    }

    /// Steps as shown to the user: padded with closing steps up to `min_steps`.
    pub fn display_steps(&self, min_steps: usize) -> Vec<String> {
        let mut out = self.steps.clone();
        for closing in CLOSING_STEPS {
            if out.len() >= min_steps.min(self.max_steps) {
                break;
            }
            if !out.iter().any(|s| s == closing) {
                out.push(closing.to_string());
            }
        }
        out
    }
}

pub fn format_announcement(steps: &[String], plan_path: Option<&Path>) -> String {
    let mut lines = vec!["Execution plan:".to_string()];
    for (i, step) in steps.iter().enumerate() {
        lines.push(format!("{}. {step}", i + 1));
    }
    if let Some(path) = plan_path {
        lines.push(format!("Plan file: `{}`", path.display()));
    }
    lines.push("Note: plan may adapt if a step fails.".to_string());
    lines.join("\n")
}

pub fn format_update(step: &str) -> String {
    format!("Plan update:\n- {step}")
}

/// Lowercased, non-alphanumeric runs collapsed to `-`, at most 48 chars.
pub fn slugify(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let slug = SLUG_SEPARATOR_RE.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let slug: String = slug.chars().take(PLAN_SLUG_CHARS_MAX).collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

/// Parses a planner reply. Only numbered or bulleted lines count as steps.
pub fn parse_plan_steps(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut steps = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_lowercase();
        if lower.contains("execution plan") || lower.contains("plan file:") || lower.contains("note:")
        {
            continue;
        }
        let step = if NUMBERED_STEP_RE.is_match(line) {
            NUMBERED_STEP_RE.replace(line, "")
        } else if BULLETED_STEP_RE.is_match(line) {
            BULLETED_STEP_RE.replace(line, "")
        } else {
            continue;
        };
        let step = step.trim().trim_matches(|c: char| c == '`' || c == '*' || c == '_').trim();
        if step.is_empty() {
            continue;
        }
        let step: String = step.chars().take(PLAN_STEP_CHARS_MAX).collect();
        let step = step.trim().to_string();
        if seen.insert(step.to_lowercase()) {
            steps.push(step);
        }
    }
    steps
}

/// Prompt for the optional planner model.
pub fn planner_messages(request: &str, calls: &[ToolCall]) -> Vec<ChatMessage> {
    let request = request.trim();
    let request = if request.is_empty() {
        "(empty)".to_string()
    } else {
        truncate_chars(request, PLANNER_REQUEST_CHARS_MAX)
    };
    let candidates = derive(calls, PLANNER_CANDIDATES_MAX)
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {step}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    vec![
        ChatMessage::system(PLANNER_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "User request:\n{request}\n\nCandidate tool actions:\n{candidates}\n\nReturn only the numbered list."
        )),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct PlanMetadata {
    pub session_key: String,
    pub correlation_id: String,
    pub model: String,
}

/// Plan artifacts under `<data_dir>/plans`.
#[derive(Debug, Clone)]
pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the plan atomically and returns its path.
    pub fn persist(
        &self,
        steps: &[String],
        meta: &PlanMetadata,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        let title = steps
            .iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("task");
        let path = self.dir.join(format!(
            "{}_{}.md",
            now.format("%Y-%m-%d_%H%M%S"),
            slugify(title)
        ));

        let mut lines = vec![
            "---".to_string(),
            format!("session_key: {:?}", meta.session_key),
            format!("correlation_id: {:?}", meta.correlation_id),
            format!("model: {:?}", meta.model),
            format!(
                "created_at_utc: {:?}",
                now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            ),
            "plan_mode: true".to_string(),
            "---".to_string(),
            String::new(),
            "# Execution Plan".to_string(),
            String::new(),
        ];
        for (i, step) in steps.iter().enumerate() {
            lines.push(format!("{}. {step}", i + 1));
        }
        lines.push(String::new());
        lines.push("_Note: plan may adapt if a step fails._".to_string());
        let content = lines.join("\n") + "\n";

        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }
}
