//! Configuration loading for the hub binary and other registry owners.
//!
//! Reads `mcp-hub.yaml` (or a `.json` file with the same shape), resolves
//! `${VAR}` / `${VAR:-default}` references and `~`, and produces the
//! `LaunchSpec` map plus `RegistrySettings` that `ServerRegistry::new`
//! takes. The registry itself never touches the filesystem.
//!
//! ```yaml
//! servers:
//!   standards:
//!     command: python
//!     args: ["-m", "standards_server"]
//!     cwd: servers/standards
//!     venv: .venv
//!   context7:
//!     command: npx
//!     args: ["-y", "@upstash/context7-mcp"]
//!     env:
//!       CONTEXT7_TOKEN: ${CONTEXT7_TOKEN:-}
//! supervisor:
//!   health_interval_ms: 2000
//!   max_restarts: 3
//!   auto_restart: true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::errors::SupervisorError;
use super::registry::{HandshakeSpec, RegistrySettings};
use super::types::LaunchSpec;

/// Default config file name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "mcp-hub.yaml";

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_HUB_CONFIG";

// ─── File Schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    supervisor: SupervisorConfig,
}

/// One `servers:` entry.
#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    /// Relative paths resolve against the config file's directory.
    #[serde(default)]
    cwd: Option<String>,
    /// Optional Python virtual environment. When `{venv}/bin/{command}`
    /// exists it replaces `command`, and `VIRTUAL_ENV` + `PATH` are injected.
    #[serde(default)]
    venv: Option<String>,
    #[serde(default = "default_true")]
    inherit_env: bool,
}

fn default_true() -> bool {
    true
}

/// Optional `supervisor:` section. Absent fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SupervisorConfig {
    health_interval_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    max_restarts: Option<u32>,
    restart_backoff_ms: Option<u64>,
    auto_restart: Option<bool>,
    timeout_threshold: Option<u32>,
    malformed_threshold: Option<u64>,
    max_frame_bytes: Option<usize>,
    stderr_lines: Option<usize>,
    call_timeout_ms: Option<u64>,
    handshake: Option<HandshakeConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HandshakeConfig {
    method: Option<String>,
    params: Option<Value>,
    timeout_ms: Option<u64>,
    /// Empty string disables the follow-up notification.
    initialized_notification: Option<String>,
}

impl SupervisorConfig {
    fn into_settings(self) -> RegistrySettings {
        let mut settings = RegistrySettings::default();
        let ms = Duration::from_millis;

        if let Some(v) = self.health_interval_ms {
            settings.health_interval = ms(v);
        }
        if let Some(v) = self.grace_period_ms {
            settings.grace_period = ms(v);
        }
        if let Some(v) = self.max_restarts {
            settings.max_restarts = v;
        }
        if let Some(v) = self.restart_backoff_ms {
            settings.restart_backoff = ms(v);
        }
        if let Some(v) = self.auto_restart {
            settings.auto_restart = v;
        }
        if let Some(v) = self.timeout_threshold {
            settings.timeout_threshold = v;
        }
        if let Some(v) = self.malformed_threshold {
            settings.malformed_threshold = v;
        }
        if let Some(v) = self.max_frame_bytes {
            settings.handle.max_frame_bytes = v;
        }
        if let Some(v) = self.stderr_lines {
            settings.handle.stderr_lines = v;
        }
        if let Some(v) = self.call_timeout_ms {
            settings.default_call_timeout = ms(v);
        }
        if let Some(handshake) = self.handshake {
            settings.handshake = handshake.into_spec();
        }
        settings
    }
}

impl HandshakeConfig {
    fn into_spec(self) -> HandshakeSpec {
        let mut spec = HandshakeSpec::default();
        if let Some(method) = self.method {
            // A custom method gets no default initialize params.
            if method != spec.method {
                spec.params = None;
            }
            spec.method = method;
        }
        if self.params.is_some() {
            spec.params = self.params;
        }
        if let Some(v) = self.timeout_ms {
            spec.timeout = Duration::from_millis(v);
        }
        if let Some(notification) = self.initialized_notification {
            spec.initialized_notification = (!notification.is_empty()).then_some(notification);
        }
        spec
    }
}

// ─── Resolved Config ─────────────────────────────────────────────────────────

/// A loaded configuration, ready for `ServerRegistry::new`.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub servers: BTreeMap<String, LaunchSpec>,
    pub settings: RegistrySettings,
    /// File the configuration was read from.
    pub source: PathBuf,
}

/// Find the config file.
///
/// Resolution order:
/// 1. `MCP_HUB_CONFIG` environment variable
/// 2. `mcp-hub.yaml` in `start` or any of its ancestors
pub fn find_config_path(start: &Path) -> Result<PathBuf, SupervisorError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(SupervisorError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load and resolve a configuration file.
pub fn load_config(path: &Path) -> Result<HubConfig, SupervisorError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SupervisorError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file: ConfigFile = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| SupervisorError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| SupervisorError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let servers = file
        .servers
        .into_iter()
        .map(|(name, server)| {
            let spec = resolve_server(&name, server, &base_dir)?;
            Ok((name, spec))
        })
        .collect::<Result<BTreeMap<_, _>, SupervisorError>>()?;

    tracing::info!(
        path = %path.display(),
        servers = servers.len(),
        "configuration loaded"
    );

    Ok(HubConfig {
        servers,
        settings: file.supervisor.into_settings(),
        source: path.to_path_buf(),
    })
}

fn resolve_server(
    name: &str,
    server: ServerConfig,
    base_dir: &Path,
) -> Result<LaunchSpec, SupervisorError> {
    if server.command.trim().is_empty() {
        return Err(SupervisorError::ConfigError {
            reason: format!("server '{name}' has an empty command"),
        });
    }

    let cwd = server.cwd.as_deref().map(|dir| resolve_path(dir, base_dir));
    let mut command = server.command.clone();
    let mut extra_env = BTreeMap::new();

    if let Some(venv) = server.venv.as_deref() {
        let venv_dir = resolve_path(venv, cwd.as_deref().unwrap_or(base_dir));
        let bin_dir = venv_dir.join(venv_bin_dir());
        let candidate = bin_dir.join(&server.command);
        if candidate.exists() {
            command = candidate.display().to_string();
            extra_env.insert("VIRTUAL_ENV".to_string(), venv_dir.display().to_string());
            let path = std::env::var_os("PATH").unwrap_or_default();
            let joined = std::env::join_paths(
                std::iter::once(bin_dir.clone()).chain(std::env::split_paths(&path)),
            )
            .map_err(|e| SupervisorError::ConfigError {
                reason: format!("server '{name}': cannot build PATH: {e}"),
            })?;
            extra_env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        } else {
            tracing::warn!(
                server = name,
                venv = %venv_dir.display(),
                "venv binary not found, using command as given"
            );
        }
    }

    let mut spec = LaunchSpec::new(command).with_args(server.args);
    for (key, value) in extra_env.into_iter().chain(server.env) {
        spec = spec.with_env(key, value);
    }
    if let Some(dir) = cwd {
        spec = spec.with_cwd(dir);
    }
    if !server.inherit_env {
        spec = spec.isolated_env();
    }
    Ok(spec)
}

fn resolve_path(raw: &str, base: &Path) -> PathBuf {
    let expanded = PathBuf::from(expand_tilde(raw));
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn venv_bin_dir() -> &'static str {
    if cfg!(windows) {
        "Scripts"
    } else {
        "bin"
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become the empty string.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_HUB_TEST_UNSET__");
        let result = interpolate_env_vars("cmd: ${__MCP_HUB_TEST_UNSET__:-/fallback/bin}");
        assert_eq!(result, "cmd: /fallback/bin");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_HUB_TEST_SET__", "/custom/bin");
        let result = interpolate_env_vars("${__MCP_HUB_TEST_SET__:-/fallback/bin}");
        assert_eq!(result, "/custom/bin");
        std::env::remove_var("__MCP_HUB_TEST_SET__");
    }

    #[test]
    fn test_interpolate_unset_without_default_is_empty() {
        std::env::remove_var("__MCP_HUB_TEST_EMPTY__");
        assert_eq!(interpolate_env_vars("a${__MCP_HUB_TEST_EMPTY__}b"), "ab");
        assert_eq!(interpolate_env_vars("plain $text"), "plain $text");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_load_yaml_resolves_cwd_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "mcp-hub.yaml",
            r#"
servers:
  echo:
    command: echo-server
    args: ["--banner"]
    cwd: work
    env:
      GREETING: hello
  isolated:
    command: /bin/true
    inherit_env: false
supervisor:
  max_restarts: 5
  restart_backoff_ms: 0
  auto_restart: true
  handshake:
    method: ping
    timeout_ms: 500
    initialized_notification: ""
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.servers.len(), 2);

        let echo = &config.servers["echo"];
        assert_eq!(echo.command(), "echo-server");
        assert_eq!(echo.args(), ["--banner"]);
        assert_eq!(echo.cwd(), Some(dir.path().join("work").as_path()));
        assert_eq!(echo.env()["GREETING"], "hello");
        assert!(echo.inherits_env());
        assert!(!config.servers["isolated"].inherits_env());

        let settings = &config.settings;
        assert_eq!(settings.max_restarts, 5);
        assert!(settings.restart_backoff.is_zero());
        assert!(settings.auto_restart);
        assert_eq!(settings.handshake.method, "ping");
        assert!(settings.handshake.params.is_none());
        assert_eq!(settings.handshake.timeout, Duration::from_millis(500));
        assert!(settings.handshake.initialized_notification.is_none());
        // Untouched fields keep their defaults.
        assert_eq!(settings.timeout_threshold, RegistrySettings::default().timeout_threshold);
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "servers.json",
            r#"{"servers": {"echo": {"command": "echo-server", "args": ["--mute"]}}}"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.servers["echo"].args(), ["--mute"]);
        assert_eq!(config.source, path);
    }

    #[cfg(unix)]
    #[test]
    fn test_venv_rewrites_command() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("srv/.venv/bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("python"), "").unwrap();

        let path = write(
            dir.path(),
            "mcp-hub.yaml",
            "servers:\n  py:\n    command: python\n    cwd: srv\n    venv: .venv\n  plain:\n    command: node\n    venv: missing\n",
        );
        let config = load_config(&path).unwrap();

        let py = &config.servers["py"];
        assert_eq!(py.command(), bin.join("python").display().to_string());
        assert_eq!(
            py.env()["VIRTUAL_ENV"],
            dir.path().join("srv/.venv").display().to_string()
        );
        assert!(py.env()["PATH"].starts_with(&bin.display().to_string()));

        // No binary in the venv: command is left alone.
        assert_eq!(config.servers["plain"].command(), "node");
        assert!(!config.servers["plain"].env().contains_key("VIRTUAL_ENV"));
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_config(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, SupervisorError::ConfigError { .. }));

        let garbage = write(dir.path(), "bad.yaml", "servers: [not, a, map");
        assert!(matches!(
            load_config(&garbage),
            Err(SupervisorError::ConfigError { .. })
        ));

        let empty_cmd = write(dir.path(), "empty.yaml", "servers:\n  x:\n    command: \"  \"\n");
        let err = load_config(&empty_cmd).unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_find_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let config = write(dir.path(), CONFIG_FILE_NAME, "servers: {}\n");

        std::env::remove_var(CONFIG_ENV_VAR);
        assert_eq!(find_config_path(&nested).unwrap(), config);

        let explicit = write(dir.path(), "other.yaml", "servers: {}\n");
        std::env::set_var(CONFIG_ENV_VAR, &explicit);
        assert_eq!(find_config_path(&nested).unwrap(), explicit);
        std::env::remove_var(CONFIG_ENV_VAR);
    }
}
