//! Switchyard configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchyardConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    /// Tried in order when the active model is rate limited.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_system_prompt() -> String {
    "You are Switchyard, a personal automation agent. Use the available tools to get \
     things done and keep replies short."
        .to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// Redirects OpenAI-compatible traffic (local gateways, proxies).
    pub openai_base_url: Option<String>,
}

impl KeysConfig {
    /// Anthropic models (`claude-*`, `anthropic/*`) use the Anthropic key; everything
    /// else goes through the OpenAI-compatible key.
    pub fn for_model(&self, model: &str) -> Option<&str> {
        let model = model.trim().to_ascii_lowercase();
        let key = if model.starts_with("claude-") || model.starts_with("anthropic/") {
            self.anthropic_api_key.as_deref()
        } else {
            self.openai_api_key.as_deref()
        };
        key.map(str::trim).filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_summarize_message_threshold")]
    pub summarize_message_threshold: usize,
    #[serde(default = "default_summarize_token_percent")]
    pub summarize_token_percent: usize,
    #[serde(default = "default_summarize_keep_recent")]
    pub summarize_keep_recent: usize,
}

fn default_max_tool_iterations() -> usize {
    20
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_context_window() -> usize {
    128_000
}

fn default_summarize_message_threshold() -> usize {
    20
}

fn default_summarize_token_percent() -> usize {
    75
}

fn default_summarize_keep_recent() -> usize {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_max_tool_iterations(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            context_window: default_context_window(),
            summarize_message_threshold: default_summarize_message_threshold(),
            summarize_token_percent: default_summarize_token_percent(),
            summarize_keep_recent: default_summarize_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum time spent on a fallback before the primary is probed.
    #[serde(default = "default_hold_minutes")]
    pub hold_minutes: u64,
    #[serde(default = "default_probe_interval_minutes")]
    pub probe_interval_minutes: u64,
    #[serde(default = "default_probe_success_threshold")]
    pub probe_success_threshold: u32,
    #[serde(default = "default_probe_failure_backoff_minutes")]
    pub probe_failure_backoff_minutes: u64,
    #[serde(default = "default_true")]
    pub switchback_requires_approval: bool,
    #[serde(default = "default_switchback_prompt_cooldown_minutes")]
    pub switchback_prompt_cooldown_minutes: u64,
    #[serde(default = "default_true")]
    pub notify_on_switch: bool,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_hold_minutes() -> u64 {
    300
}

fn default_probe_interval_minutes() -> u64 {
    60
}

fn default_probe_success_threshold() -> u32 {
    2
}

fn default_probe_failure_backoff_minutes() -> u64 {
    10
}

fn default_switchback_prompt_cooldown_minutes() -> u64 {
    60
}

fn default_probe_timeout_seconds() -> u64 {
    20
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hold_minutes: default_hold_minutes(),
            probe_interval_minutes: default_probe_interval_minutes(),
            probe_success_threshold: default_probe_success_threshold(),
            probe_failure_backoff_minutes: default_probe_failure_backoff_minutes(),
            switchback_requires_approval: true,
            switchback_prompt_cooldown_minutes: default_switchback_prompt_cooldown_minutes(),
            notify_on_switch: true,
            probe_timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

impl FailoverConfig {
    pub fn hold(&self) -> chrono::Duration {
        minutes(self.hold_minutes)
    }

    pub fn probe_interval(&self) -> chrono::Duration {
        minutes(self.probe_interval_minutes)
    }

    pub fn probe_failure_backoff(&self) -> chrono::Duration {
        minutes(self.probe_failure_backoff_minutes)
    }

    pub fn prompt_cooldown(&self) -> chrono::Duration {
        minutes(self.switchback_prompt_cooldown_minutes)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds.max(1))
    }
}

fn minutes(value: u64) -> chrono::Duration {
    chrono::Duration::minutes(i64::try_from(value).unwrap_or(i64::MAX / 60_000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_plan_min_steps")]
    pub min_steps: usize,
    #[serde(default = "default_plan_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_true")]
    pub persist: bool,
    /// When set, this model rewrites the derived steps into a nicer plan.
    #[serde(default)]
    pub planner_model: Option<String>,
}

fn default_plan_min_steps() -> usize {
    4
}

fn default_plan_max_steps() -> usize {
    6
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_steps: default_plan_min_steps(),
            max_steps: default_plan_max_steps(),
            persist: true,
            planner_model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub exec_enabled: bool,
    #[serde(default = "default_exec_timeout_seconds")]
    pub exec_timeout_seconds: u64,
    #[serde(default = "default_exec_output_max_chars")]
    pub exec_output_max_chars: usize,
}

fn default_exec_timeout_seconds() -> u64 {
    60
}

fn default_exec_output_max_chars() -> usize {
    10_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            exec_enabled: true,
            exec_timeout_seconds: default_exec_timeout_seconds(),
            exec_output_max_chars: default_exec_output_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_webchat_port")]
    pub port: u16,
}

fn default_webchat_port() -> u16 {
    3000
}

impl Default for WebChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_webchat_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_http_timeout_seconds() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_max_in_flight: default_http_max_in_flight(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

impl SwitchyardConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("config {}: {e}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: SwitchyardConfig =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("parse: {e}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SWITCHYARD_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = get("SWITCHYARD_FALLBACK_MODELS") {
            self.general.fallback_models = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.keys.openai_base_url = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.agent.max_tool_iterations == 0 {
            return Err(anyhow::anyhow!("agent.max_tool_iterations must be > 0"));
        }
        if self.failover.probe_success_threshold == 0 {
            return Err(anyhow::anyhow!(
                "failover.probe_success_threshold must be > 0"
            ));
        }
        if self.plan.max_steps == 0 {
            return Err(anyhow::anyhow!("plan.max_steps must be > 0"));
        }
        if self.plan.min_steps > self.plan.max_steps {
            return Err(anyhow::anyhow!(
                "plan.min_steps ({}) must be <= plan.max_steps ({})",
                self.plan.min_steps,
                self.plan.max_steps
            ));
        }
        if self.channels.webchat.enabled && self.channels.webchat.port == 0 {
            return Err(anyhow::anyhow!("channels.webchat.port must be > 0"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.general
            .data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.tools
            .workspace_root
            .clone()
            .unwrap_or_else(|| self.data_dir().join("workspace"))
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.data_dir().join("plans")
    }

    pub fn failover_state_path(&self) -> PathBuf {
        self.data_dir().join("state").join("failover.json")
    }

    pub fn usage_path(&self) -> PathBuf {
        self.data_dir().join("state").join("usage.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }
}

fn switchyard_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".switchyard")
}

pub fn default_config_path() -> PathBuf {
    switchyard_home().join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    switchyard_home().join("data")
}

pub const CONFIG_TEMPLATE: &str = r#"[general]
model = "claude-sonnet-4-5"
fallback_models = ["gpt-4o-mini"]

[keys]
# anthropic_api_key = "..."
# openai_api_key = "..."

[failover]
hold_minutes = 300
probe_interval_minutes = 60
probe_success_threshold = 2
switchback_requires_approval = true

[plan]
min_steps = 4
max_steps = 6

[channels.webchat]
enabled = true
port = 3000

[channels.telegram]
enabled = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(raw: &str) -> anyhow::Result<SwitchyardConfig> {
        let cfg: SwitchyardConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse("[general]\nmodel = \"gpt-4o\"\n").unwrap();
        assert!(cfg.general.fallback_models.is_empty());
        assert_eq!(cfg.agent.max_tool_iterations, 20);
        assert_eq!(cfg.failover.hold_minutes, 300);
        assert_eq!(cfg.failover.probe_success_threshold, 2);
        assert!(cfg.failover.switchback_requires_approval);
        assert_eq!((cfg.plan.min_steps, cfg.plan.max_steps), (4, 6));
        assert_eq!(cfg.channels.webchat.port, 3000);
        assert!(!cfg.channels.telegram.enabled);
        assert_eq!(cfg.failover.hold(), chrono::Duration::minutes(300));
    }

    #[test]
    fn template_parses() {
        let cfg = parse(CONFIG_TEMPLATE).unwrap();
        assert_eq!(cfg.general.fallback_models, vec!["gpt-4o-mini".to_string()]);
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        for raw in [
            "[general]\nmodel = \" \"\n",
            "[general]\nmodel = \"m\"\n[agent]\nmax_tool_iterations = 0\n",
            "[general]\nmodel = \"m\"\n[failover]\nprobe_success_threshold = 0\n",
            "[general]\nmodel = \"m\"\n[plan]\nmin_steps = 7\nmax_steps = 6\n",
            "[general]\nmodel = \"m\"\n[plan]\nmin_steps = 0\nmax_steps = 0\n",
            "[general]\nmodel = \"m\"\n[channels.webchat]\nport = 0\n",
            "[general]\nmodel = \"m\"\n[channels.telegram]\nenabled = true\n",
        ] {
            assert!(parse(raw).is_err(), "expected rejection for {raw:?}");
        }
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = parse("[general]\nmodel = \"gpt-4o\"\n").unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("SWITCHYARD_MODEL", "claude-sonnet-4-5"),
            ("SWITCHYARD_FALLBACK_MODELS", " gpt-4o , ,o3-mini"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "  "),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ]);
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.general.model, "claude-sonnet-4-5");
        assert_eq!(cfg.general.fallback_models, vec!["gpt-4o", "o3-mini"]);
        assert!(cfg.keys.openai_api_key.is_none());
        assert!(cfg.channels.telegram.enabled);
        assert_eq!(cfg.keys.for_model("claude-sonnet-4-5"), Some("sk-ant"));
        assert_eq!(cfg.keys.for_model("gpt-4o"), None);
    }

    #[test]
    fn data_paths_hang_off_data_dir() {
        let cfg = parse("[general]\nmodel = \"m\"\ndata_dir = \"/srv/yard\"\n").unwrap();
        assert_eq!(cfg.failover_state_path(), PathBuf::from("/srv/yard/state/failover.json"));
        assert_eq!(cfg.usage_path(), PathBuf::from("/srv/yard/state/usage.json"));
        assert_eq!(cfg.plans_dir(), PathBuf::from("/srv/yard/plans"));
        assert_eq!(cfg.workspace_root(), PathBuf::from("/srv/yard/workspace"));
    }
}
