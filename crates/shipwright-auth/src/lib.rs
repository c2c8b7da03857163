//! Authentication and token resolution for the Shipwright daemon.
//!
//! The supervisor's preflight check (run every 5 minutes)
//! needs to know whether the tracker and the AI worker both have usable
//! credentials *before* spawning anything — a worker that fails on an
//! auth error burns a job slot for nothing. [`resolve_token`] finds a
//! token for a named service in order:
//!
//! 1. `SHIPWRIGHT_<SERVICE>_TOKEN` (service upper-cased, `-` -> `_`)
//! 2. the service's well-known fallback environment variable, if any
//!    (`tracker` -> `GITHUB_TOKEN`, `ai` -> `ANTHROPIC_API_KEY`)
//! 3. `$SHIPWRIGHT_HOME/credentials.toml` (defaults to `~/.shipwright`)
//!
//! # Example
//!
//! ```
//! use shipwright_auth::resolve_token;
//!
//! let auth = resolve_token("tracker", None);
//! if !auth.detected {
//!     eprintln!("no tracker credentials found");
//! }
//! ```

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Environment variable holding the Shipwright config/credentials home.
pub const SHIPWRIGHT_HOME_ENV: &str = "SHIPWRIGHT_HOME";

/// Credentials file name under the Shipwright home.
pub const CREDENTIALS_FILE: &str = "credentials.toml";

/// Service name for the issue tracker.
pub const SERVICE_TRACKER: &str = "tracker";

/// Service name for the AI worker.
pub const SERVICE_AI: &str = "ai";

/// Resolved authentication state for one service.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    /// The resolved token, if any.
    pub token: Option<String>,
    /// Where it came from.
    pub source: TokenSource,
    /// Whether a usable token was found.
    pub detected: bool,
}

/// Source of a resolved token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenSource {
    #[default]
    None,
    /// `SHIPWRIGHT_<SERVICE>_TOKEN`.
    EnvService,
    /// The service's well-known fallback env var.
    EnvFallback,
    /// `$SHIPWRIGHT_HOME/credentials.toml`.
    CredentialsFile,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::None => write!(f, "none"),
            TokenSource::EnvService => write!(f, "SHIPWRIGHT_<SERVICE>_TOKEN"),
            TokenSource::EnvFallback => write!(f, "fallback environment variable"),
            TokenSource::CredentialsFile => write!(f, "credentials.toml"),
        }
    }
}

/// The well-known fallback environment variable for a service, if one
/// exists.
fn fallback_env_for(service: &str) -> Option<&'static str> {
    match service {
        SERVICE_TRACKER => Some("GITHUB_TOKEN"),
        SERVICE_AI => Some("ANTHROPIC_API_KEY"),
        _ => None,
    }
}

/// Resolve the authentication token for `service` ("tracker", "ai", or a
/// custom service name matching a `[services.<name>]` table in the
/// credentials file).
pub fn resolve_token(service: &str, shipwright_home: Option<&Path>) -> AuthInfo {
    let service_env = format!(
        "SHIPWRIGHT_{}_TOKEN",
        service.to_uppercase().replace('-', "_")
    );
    if let Ok(token) = env::var(&service_env)
        && !token.is_empty()
    {
        return AuthInfo {
            token: Some(token),
            source: TokenSource::EnvService,
            detected: true,
        };
    }

    if let Some(fallback) = fallback_env_for(service)
        && let Ok(token) = env::var(fallback)
        && !token.is_empty()
    {
        return AuthInfo {
            token: Some(token),
            source: TokenSource::EnvFallback,
            detected: true,
        };
    }

    let home = shipwright_home_path(shipwright_home);
    let credentials_path = home.join(CREDENTIALS_FILE);
    if let Ok(token) = token_from_credentials_file(&credentials_path, service) {
        return AuthInfo {
            token: Some(token),
            source: TokenSource::CredentialsFile,
            detected: true,
        };
    }

    AuthInfo::default()
}

/// Whether a token is available for `service`.
pub fn has_token(service: &str, shipwright_home: Option<&Path>) -> bool {
    resolve_token(service, shipwright_home).detected
}

/// Result of the supervisor's periodic auth preflight:
/// both the tracker and the AI worker need usable credentials, or the
/// daemon auto-pauses.
#[derive(Debug, Clone, Copy)]
pub struct AuthPreflight {
    pub tracker_ok: bool,
    pub ai_ok: bool,
}

impl AuthPreflight {
    pub fn ok(&self) -> bool {
        self.tracker_ok && self.ai_ok
    }

    /// Which credential is missing, for the auto-pause reason string.
    pub fn failure_reason(&self) -> Option<&'static str> {
        if !self.tracker_ok {
            Some("tracker authentication failed")
        } else if !self.ai_ok {
            Some("AI worker authentication failed")
        } else {
            None
        }
    }
}

/// Run the preflight check: resolve both the tracker and AI tokens.
/// This checks *presence*, not validity against the live service — a
/// stale-but-present token still passes here and fails loudly on first
/// use, which the supervisor's failure classifier turns into an
/// `AuthFailure` auto-pause anyway.
pub fn preflight(shipwright_home: Option<&Path>) -> AuthPreflight {
    AuthPreflight {
        tracker_ok: has_token(SERVICE_TRACKER, shipwright_home),
        ai_ok: has_token(SERVICE_AI, shipwright_home),
    }
}

/// Get the Shipwright home directory: explicit override, then
/// `$SHIPWRIGHT_HOME`, then `~/.shipwright`.
pub fn shipwright_home_path(shipwright_home: Option<&Path>) -> PathBuf {
    if let Some(path) = shipwright_home {
        return path.to_path_buf();
    }

    if let Ok(path) = env::var(SHIPWRIGHT_HOME_ENV) {
        return PathBuf::from(path);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".shipwright");
    }

    PathBuf::from(".shipwright")
}

/// Read a token for `service` from `credentials.toml`. Supports a
/// `[services.<name>]` table per service, plus a bare top-level `token`
/// key as a single-service shorthand.
fn token_from_credentials_file(path: &Path, service: &str) -> Result<String> {
    if !path.exists() {
        return Err(anyhow::anyhow!("credentials file not found"));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials file: {}", path.display()))?;

    let credentials: toml::Value = toml::from_str(&content)
        .with_context(|| format!("failed to parse credentials file: {}", path.display()))?;

    if let Some(token) = credentials
        .get("services")
        .and_then(|s| s.get(service))
        .and_then(|s| s.get("token"))
        .and_then(|t| t.as_str())
    {
        return Ok(token.to_string());
    }

    if let Some(token) = credentials.get("token").and_then(|t| t.as_str()) {
        return Ok(token.to_string());
    }

    Err(anyhow::anyhow!("token not found for service: {service}"))
}

/// List the services configured in a credentials file.
pub fn list_configured_services(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials file: {}", path.display()))?;

    let credentials: toml::Value = toml::from_str(&content)
        .with_context(|| format!("failed to parse credentials file: {}", path.display()))?;

    let mut services = Vec::new();
    if let Some(table) = credentials.get("services").and_then(|s| s.as_table()) {
        for name in table.keys() {
            services.push(name.clone());
        }
    }
    Ok(services)
}

/// Mask a token for safe display (show first 4 and last 4 chars).
pub fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "*".repeat(token.len());
    }
    format!("{}****{}", &token[..4], &token[token.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mask_token_short() {
        assert_eq!(mask_token("abc"), "***");
        assert_eq!(mask_token("abcdefgh"), "********");
    }

    #[test]
    fn mask_token_long() {
        assert_eq!(mask_token("abcdefghijklmnop"), "abcd****mnop");
    }

    #[test]
    fn shipwright_home_path_uses_override() {
        let td = tempdir().expect("tempdir");
        let path = shipwright_home_path(Some(td.path()));
        assert_eq!(path, td.path());
    }

    #[test]
    fn resolve_token_from_service_env() {
        temp_env::with_var("SHIPWRIGHT_TRACKER_TOKEN", Some("test-token"), || {
            let auth = resolve_token(SERVICE_TRACKER, None);
            assert!(auth.detected);
            assert_eq!(auth.token, Some("test-token".to_string()));
            assert_eq!(auth.source, TokenSource::EnvService);
        });
    }

    #[test]
    fn resolve_token_from_fallback_env() {
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_TRACKER_TOKEN", None::<String>),
                ("GITHUB_TOKEN", Some("gh-token")),
            ],
            || {
                let auth = resolve_token(SERVICE_TRACKER, None);
                assert!(auth.detected);
                assert_eq!(auth.token, Some("gh-token".to_string()));
                assert_eq!(auth.source, TokenSource::EnvFallback);
            },
        );
    }

    #[test]
    fn resolve_token_none_found() {
        let td = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_CUSTOM_TOKEN", None::<String>),
            ],
            || {
                let auth = resolve_token("custom", Some(td.path()));
                assert!(!auth.detected);
                assert!(auth.token.is_none());
            },
        );
    }

    #[test]
    fn token_from_credentials_file_service_table() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CREDENTIALS_FILE);

        std::fs::write(
            &path,
            r#"
[services.tracker]
token = "creds-token"
"#,
        )
        .expect("write");

        let token = token_from_credentials_file(&path, SERVICE_TRACKER).unwrap();
        assert_eq!(token, "creds-token");
    }

    #[test]
    fn token_from_credentials_file_bare_token_shorthand() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CREDENTIALS_FILE);

        std::fs::write(&path, "token = \"solo-token\"\n").expect("write");

        let token = token_from_credentials_file(&path, "anything").unwrap();
        assert_eq!(token, "solo-token");
    }

    #[test]
    fn token_from_credentials_file_missing() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nonexistent.toml");

        let result = token_from_credentials_file(&path, SERVICE_TRACKER);
        assert!(result.is_err());
    }

    #[test]
    fn list_configured_services_works() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CREDENTIALS_FILE);

        std::fs::write(
            &path,
            r#"
[services.tracker]
token = "a"

[services.ai]
token = "b"
"#,
        )
        .expect("write");

        let services = list_configured_services(&path).unwrap();
        assert!(services.contains(&SERVICE_TRACKER.to_string()));
        assert!(services.contains(&SERVICE_AI.to_string()));
    }

    #[test]
    fn token_source_display() {
        assert_eq!(TokenSource::None.to_string(), "none");
        assert_eq!(
            TokenSource::EnvService.to_string(),
            "SHIPWRIGHT_<SERVICE>_TOKEN"
        );
    }

    #[test]
    fn preflight_fails_closed_without_tokens() {
        let td = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_TRACKER_TOKEN", None::<String>),
                ("GITHUB_TOKEN", None::<String>),
                ("SHIPWRIGHT_AI_TOKEN", None::<String>),
                ("ANTHROPIC_API_KEY", None::<String>),
            ],
            || {
                let result = preflight(Some(td.path()));
                assert!(!result.ok());
                assert!(result.failure_reason().is_some());
            },
        );
    }

    #[test]
    fn preflight_ok_reports_no_failure_reason() {
        let td = tempdir().expect("tempdir");
        temp_env::with_vars(
            [
                ("SHIPWRIGHT_TRACKER_TOKEN", Some("t")),
                ("SHIPWRIGHT_AI_TOKEN", Some("a")),
            ],
            || {
                let result = preflight(Some(td.path()));
                assert!(result.ok());
                assert!(result.failure_reason().is_none());
            },
        );
    }
}
