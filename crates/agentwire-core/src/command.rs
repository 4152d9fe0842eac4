//! Command-line construction and CLI discovery for the agent subprocess.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DiscoveryError;

/// Binary name looked up on `PATH`.
pub const CLI_BINARY: &str = "claude";

/// Environment variable identifying SDK-driven invocations.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";

/// Value of [`ENTRYPOINT_ENV`] for this crate.
pub const ENTRYPOINT: &str = "sdk-rust";

/// Environment variable carrying this crate's version.
pub const VERSION_ENV: &str = "AGENTWIRE_VERSION";

/// Permission handling mode passed through `--permission-mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Options for one agent subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Explicit CLI path; discovery runs when unset.
    pub cli_path: Option<PathBuf>,
    /// Working directory; must exist when set.
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: Option<PermissionMode>,
    pub max_turns: Option<u32>,
    /// Session ID to resume.
    pub resume: Option<String>,
    pub continue_conversation: bool,
    pub add_dirs: Vec<PathBuf>,
    /// Settings file path or inline JSON.
    pub settings: Option<String>,
    /// Arbitrary `--flag [value]` pairs appended last.
    pub extra_args: BTreeMap<String, Option<String>>,
    /// Extra environment for the subprocess.
    pub env: HashMap<String, String>,
}

/// Fully resolved command line for the agent subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// Build the command line for `options`, running `cli_path`.
pub fn build_command(options: &AgentOptions, cli_path: &Path) -> CommandSpec {
    let mut args: Vec<String> = [
        "--output-format",
        "stream-json",
        "--verbose",
        "--input-format",
        "stream-json",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect();

    let mut flag = |name: &str, value: Option<String>| {
        args.push(name.to_string());
        if let Some(value) = value {
            args.push(value);
        }
    };

    if let Some(ref prompt) = options.system_prompt {
        flag("--system-prompt", Some(prompt.clone()));
    }
    if let Some(ref prompt) = options.append_system_prompt {
        flag("--append-system-prompt", Some(prompt.clone()));
    }
    if !options.allowed_tools.is_empty() {
        flag("--allowedTools", Some(options.allowed_tools.join(",")));
    }
    if !options.disallowed_tools.is_empty() {
        flag("--disallowedTools", Some(options.disallowed_tools.join(",")));
    }
    if let Some(mode) = options.permission_mode {
        flag("--permission-mode", Some(mode.as_str().to_string()));
    }
    if let Some(turns) = options.max_turns {
        flag("--max-turns", Some(turns.to_string()));
    }
    if let Some(ref model) = options.model {
        flag("--model", Some(model.clone()));
    }
    if options.continue_conversation {
        flag("--continue", None);
    }
    if let Some(ref session) = options.resume {
        flag("--resume", Some(session.clone()));
    }
    for dir in &options.add_dirs {
        flag("--add-dir", Some(dir.display().to_string()));
    }
    if let Some(ref settings) = options.settings {
        flag("--settings", Some(settings.clone()));
    }
    for (name, value) in &options.extra_args {
        flag(&format!("--{}", name.trim_start_matches('-')), value.clone());
    }

    // Caller-supplied env first so the identification vars always win.
    let mut env: Vec<(String, String)> = options
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();
    env.push((ENTRYPOINT_ENV.to_string(), ENTRYPOINT.to_string()));
    env.push((
        VERSION_ENV.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    ));

    CommandSpec {
        program: cli_path.to_path_buf(),
        args,
        env,
        cwd: options.cwd.clone(),
    }
}

/// Locate the agent CLI: `PATH` first, then well-known install locations.
pub fn discover() -> Result<PathBuf, DiscoveryError> {
    if let Ok(path) = which::which(CLI_BINARY) {
        debug!(path = %path.display(), "Found agent CLI on PATH");
        return Ok(path);
    }

    let candidates = fallback_locations(dirs::home_dir().as_deref());
    for candidate in &candidates {
        if candidate.is_file() {
            debug!(path = %candidate.display(), "Found agent CLI in fallback location");
            return Ok(candidate.clone());
        }
    }

    Err(DiscoveryError {
        searched: candidates,
    })
}

/// Resolve the CLI path: explicit option, then `configured`, then discovery.
pub fn resolve_cli_path(
    options: &AgentOptions,
    configured: Option<&Path>,
) -> Result<PathBuf, DiscoveryError> {
    if let Some(ref path) = options.cli_path {
        return Ok(path.clone());
    }
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    discover()
}

fn fallback_locations(home: Option<&Path>) -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(home) = home {
        for dir in [
            ".npm-global/bin",
            ".local/bin",
            "node_modules/.bin",
            ".yarn/bin",
            ".claude/local",
        ] {
            locations.push(home.join(dir).join(CLI_BINARY));
        }
    }
    locations.push(PathBuf::from("/usr/local/bin").join(CLI_BINARY));
    locations
}
