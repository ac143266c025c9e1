//! Configuration: JSON file plus command-line overrides.
//!
//! The JSON dialect is tolerant: `//` and `/* */` comments and trailing
//! commas are stripped before parsing. The core assumes the resolved
//! [`Settings`] are valid; everything here degrades with warnings or
//! fails before any connection is made.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::auth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => bail!("unknown role '{}'", other),
        }
    }
}

/// What to do about remote files that no longer exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DanglingPolicy {
    /// Delete them (the plan is applied unchanged).
    #[default]
    Remove,
    /// Strip deletions from the plan before committing.
    Keep,
    /// Refuse to sync when the plan would delete anything.
    Panic,
}

impl DanglingPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "remove" => Ok(DanglingPolicy::Remove),
            "keep" => Ok(DanglingPolicy::Keep),
            "panic" => Ok(DanglingPolicy::Panic),
            other => bail!("unknown dangling policy '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: Option<PathBuf>,
}

/// One fully resolved workspace. Constructed once at start-up, immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub name: String,
    /// Name announced to the server during auth.
    pub remote_name: String,
    pub role: Role,
    pub path: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub aes_key: Option<[u8; auth::KEY_LEN]>,
    pub ignore_patterns: Vec<String>,
    pub protect_patterns: Vec<String>,
    pub tls: Option<TlsMaterial>,
}

#[derive(Debug)]
pub struct Settings {
    pub mode: Mode,
    pub host: String,
    pub port: u16,
    pub dangling: DanglingPolicy,
    /// Listener-level TLS material (server mode).
    pub tls: Option<TlsMaterial>,
    pub workspaces: Vec<WorkspaceConfig>,
}

pub const DEFAULT_PORT: u16 = 9322;

// Raw JSON shapes.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    ssl: Option<RawSsl>,
    #[serde(default)]
    secret: Option<RawSecret>,
    #[serde(default)]
    filter: Option<RawFilter>,
    #[serde(default)]
    workspaces: Vec<RawWorkspace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkspace {
    name: String,
    #[serde(default)]
    remote_name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    path: PathBuf,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    secret: Option<RawSecret>,
    #[serde(default)]
    ssl: Option<RawSsl>,
    #[serde(default)]
    filter: Option<RawFilter>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSecret {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawFilter {
    #[serde(rename = "override", default)]
    override_globals: bool,
    #[serde(default)]
    ignore: Vec<String>,
    #[serde(default)]
    protect: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSsl {
    cert: PathBuf,
    #[serde(default)]
    key: Option<PathBuf>,
}

/// Command-line values that override or stand in for the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub server: bool,
    pub client: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workspace: Option<String>,
    pub path: Option<PathBuf>,
    pub secret: Option<String>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub dangling: Option<String>,
}

pub fn load_config_file(path: &Path) -> Result<RawConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let clean = strip_json_relaxations(&text);
    serde_json::from_str(&clean).with_context(|| format!("parse config {}", path.display()))
}

/// Merge the config file (if any) with command-line overrides into the
/// final immutable settings.
pub fn resolve(raw: Option<RawConfig>, cli: Overrides) -> Result<Settings> {
    let raw = raw.unwrap_or_default();

    let mode = if cli.server {
        Mode::Server
    } else if cli.client {
        Mode::Client
    } else {
        match raw.mode.as_deref() {
            Some("server") => Mode::Server,
            Some("client") => Mode::Client,
            Some(other) => bail!("unknown mode '{}'", other),
            None => bail!("mode not set: pass --server or --client, or set \"mode\""),
        }
    };

    let host = cli
        .host
        .or(raw.host)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.or(raw.port).unwrap_or(DEFAULT_PORT);
    let dangling = match cli.dangling.as_deref() {
        Some(s) => DanglingPolicy::parse(s)?,
        None => DanglingPolicy::default(),
    };

    let global_secret = match (&cli.secret, &raw.secret) {
        (Some(s), _) => Some(s.as_bytes().to_vec()),
        (None, Some(raw)) => Some(decode_secret(raw)?),
        (None, None) => None,
    };
    let global_ssl = match (&cli.ssl_cert, &raw.ssl) {
        (Some(cert), _) => Some(TlsMaterial {
            cert: cert.clone(),
            key: cli.ssl_key.clone(),
        }),
        (None, Some(ssl)) => Some(TlsMaterial {
            cert: ssl.cert.clone(),
            key: ssl.key.clone(),
        }),
        (None, None) => None,
    };
    let global_filter = raw.filter.clone().unwrap_or_default();

    let default_role = match mode {
        Mode::Server => Role::Server,
        Mode::Client => Role::Client,
    };

    let mut workspaces = Vec::new();
    for ws in &raw.workspaces {
        let role = match &ws.role {
            Some(r) => Role::parse(r)?,
            None => default_role,
        };
        let secret = match &ws.secret {
            Some(raw) => Some(decode_secret(raw)?),
            None => global_secret.clone(),
        };
        let tls = match &ws.ssl {
            Some(ssl) => Some(TlsMaterial {
                cert: ssl.cert.clone(),
                key: ssl.key.clone(),
            }),
            None => global_ssl.clone(),
        };
        let filter = ws.filter.clone().unwrap_or_default();
        let (ignore, protect) = if filter.override_globals {
            (filter.ignore, filter.protect)
        } else {
            let mut ignore = global_filter.ignore.clone();
            ignore.extend(filter.ignore);
            let mut protect = global_filter.protect.clone();
            protect.extend(filter.protect);
            (ignore, protect)
        };
        workspaces.push(WorkspaceConfig {
            name: ws.name.clone(),
            remote_name: ws.remote_name.clone().unwrap_or_else(|| ws.name.clone()),
            role,
            path: ws.path.clone(),
            host: ws.host.clone(),
            port: ws.port,
            aes_key: secret.as_deref().map(auth::derive_key),
            ignore_patterns: ignore,
            protect_patterns: protect,
            tls,
        });
    }

    // A bare --workspace/--path pair works without a config file.
    if let (Some(name), Some(path)) = (&cli.workspace, &cli.path) {
        if !workspaces.iter().any(|w| &w.name == name) {
            workspaces.push(WorkspaceConfig {
                name: name.clone(),
                remote_name: name.clone(),
                role: default_role,
                path: path.clone(),
                host: None,
                port: None,
                aes_key: global_secret.as_deref().map(auth::derive_key),
                ignore_patterns: global_filter.ignore.clone(),
                protect_patterns: global_filter.protect.clone(),
                tls: global_ssl.clone(),
            });
        }
    } else if let Some(path) = &cli.path {
        // --path alone retargets the selected (or only) workspace.
        if let Some(ws) = match &cli.workspace {
            Some(name) => workspaces.iter_mut().find(|w| &w.name == name),
            None => workspaces.first_mut(),
        } {
            ws.path = path.clone();
        }
    }

    if workspaces.is_empty() {
        bail!("no workspaces configured");
    }
    let mut seen = std::collections::HashSet::new();
    for ws in &workspaces {
        if !seen.insert((ws.role, ws.name.clone())) {
            bail!("duplicate workspace ({:?}, {})", ws.role, ws.name);
        }
        if ws.aes_key.is_none() {
            warn!(
                "workspace {} has no secret: authentication is effectively disabled",
                ws.name
            );
        }
    }

    Ok(Settings {
        mode,
        host,
        port,
        dangling,
        tls: global_ssl,
        workspaces,
    })
}

/// Pick the workspace a client run should sync.
pub fn select_workspace<'a>(
    settings: &'a Settings,
    name: Option<&str>,
) -> Result<&'a WorkspaceConfig> {
    let candidates: Vec<&WorkspaceConfig> = settings
        .workspaces
        .iter()
        .filter(|w| w.role == Role::Client || settings.mode == Mode::Client)
        .collect();
    match name {
        Some(name) => candidates
            .into_iter()
            .find(|w| w.name == name)
            .with_context(|| format!("workspace '{}' not configured", name)),
        None => {
            if candidates.len() == 1 {
                Ok(candidates[0])
            } else {
                bail!(
                    "{} client workspaces configured; pick one with --workspace",
                    candidates.len()
                )
            }
        }
    }
}

fn decode_secret(raw: &RawSecret) -> Result<Vec<u8>> {
    let b64 = base64::engine::general_purpose::STANDARD;
    match raw.kind.as_str() {
        "string" => Ok(raw.value.as_bytes().to_vec()),
        "base64" => b64
            .decode(raw.value.trim())
            .context("decode base64 secret"),
        "file-string" => {
            let text = std::fs::read_to_string(&raw.value)
                .with_context(|| format!("read secret file {}", raw.value))?;
            Ok(text.trim_end().as_bytes().to_vec())
        }
        "file-base64" => {
            let text = std::fs::read_to_string(&raw.value)
                .with_context(|| format!("read secret file {}", raw.value))?;
            b64.decode(text.trim()).context("decode base64 secret file")
        }
        other => bail!("unknown secret type '{}'", other),
    }
}

/// Strip `//` and `/* */` comments and trailing commas, preserving string
/// literals, so plain `serde_json` can parse the relaxed dialect.
/// Comments go first so a comma trailed by a comment still counts as
/// trailing.
pub fn strip_json_relaxations(input: &str) -> String {
    let without_comments = strip_comments(input.as_bytes());
    let without_commas = strip_trailing_commas(&without_comments);
    String::from_utf8_lossy(&without_commas).into_owned()
}

fn strip_comments(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if c == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if c == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            b'"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn strip_trailing_commas(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if c == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if c == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == b'"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == b',' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    {
        // global settings
        "mode": "client",
        "port": 9400,
        "host": "sync.example",
        "secret": { "type": "string", "value": "hunter2" },
        "filter": {
            "ignore": ["*.tmp"],
            "protect": ["*.log"],
        },
        "workspaces": [
            {
                "name": "docs",
                "remoteName": "docs-main",
                "path": "/data/docs",
                "filter": { "ignore": ["drafts/"] },
            },
            {
                "name": "scratch",
                "path": "/data/scratch",
                "filter": { "override": true, "ignore": ["*.o"] },
            },
        ]
    }
    "#;

    fn parse(text: &str) -> RawConfig {
        serde_json::from_str(&strip_json_relaxations(text)).unwrap()
    }

    #[test]
    fn relaxed_json_parses() {
        let raw = parse(SAMPLE);
        let settings = resolve(Some(raw), Overrides::default()).unwrap();
        assert_eq!(settings.mode, Mode::Client);
        assert_eq!(settings.port, 9400);
        assert_eq!(settings.workspaces.len(), 2);
    }

    #[test]
    fn trailing_comma_before_comment_is_stripped() {
        let text = "{ \"a\": 1, // last entry\n }";
        let v: serde_json::Value = serde_json::from_str(&strip_json_relaxations(text)).unwrap();
        assert_eq!(v["a"], 1);
        let text = "[ 1, 2, /* tail */ ]";
        let v: serde_json::Value = serde_json::from_str(&strip_json_relaxations(text)).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);
    }

    #[test]
    fn comment_stripping_preserves_strings() {
        let text = r#"{ "a": "slash // not comment", "b": "star /* stays */" }"#;
        let v: serde_json::Value = serde_json::from_str(&strip_json_relaxations(text)).unwrap();
        assert_eq!(v["a"], "slash // not comment");
        assert_eq!(v["b"], "star /* stays */");
    }

    #[test]
    fn filter_lists_merge_unless_overridden() {
        let raw = parse(SAMPLE);
        let settings = resolve(Some(raw), Overrides::default()).unwrap();
        let docs = &settings.workspaces[0];
        assert_eq!(docs.ignore_patterns, vec!["*.tmp", "drafts/"]);
        assert_eq!(docs.protect_patterns, vec!["*.log"]);
        let scratch = &settings.workspaces[1];
        assert_eq!(scratch.ignore_patterns, vec!["*.o"]);
        assert!(scratch.protect_patterns.is_empty());
    }

    #[test]
    fn secrets_become_derived_keys() {
        let raw = parse(SAMPLE);
        let settings = resolve(Some(raw), Overrides::default()).unwrap();
        let key = settings.workspaces[0].aes_key.unwrap();
        assert_eq!(key, auth::derive_key(b"hunter2"));
    }

    #[test]
    fn base64_secret_decodes() {
        let raw = RawSecret {
            kind: "base64".into(),
            value: base64::engine::general_purpose::STANDARD.encode(b"hunter2"),
        };
        assert_eq!(decode_secret(&raw).unwrap(), b"hunter2");
        let bad = RawSecret {
            kind: "base64".into(),
            value: "!!!".into(),
        };
        assert!(decode_secret(&bad).is_err());
    }

    #[test]
    fn remote_name_defaults_to_name() {
        let raw = parse(SAMPLE);
        let settings = resolve(Some(raw), Overrides::default()).unwrap();
        assert_eq!(settings.workspaces[0].remote_name, "docs-main");
        assert_eq!(settings.workspaces[1].remote_name, "scratch");
    }

    #[test]
    fn cli_only_workspace_works_without_config() {
        let cli = Overrides {
            client: true,
            workspace: Some("adhoc".into()),
            path: Some("/tmp/ws".into()),
            secret: Some("s3cret".into()),
            ..Default::default()
        };
        let settings = resolve(None, cli).unwrap();
        assert_eq!(settings.workspaces.len(), 1);
        assert_eq!(settings.workspaces[0].name, "adhoc");
        assert!(settings.workspaces[0].aes_key.is_some());
    }

    #[test]
    fn duplicate_workspaces_are_rejected() {
        let text = r#"{ "mode": "server", "workspaces": [
            { "name": "a", "path": "/x" },
            { "name": "a", "path": "/y" }
        ]}"#;
        assert!(resolve(Some(parse(text)), Overrides::default()).is_err());
    }

    #[test]
    fn missing_mode_is_an_error() {
        let text = r#"{ "workspaces": [{ "name": "a", "path": "/x" }] }"#;
        assert!(resolve(Some(parse(text)), Overrides::default()).is_err());
    }

    #[test]
    fn select_workspace_by_name() {
        let raw = parse(SAMPLE);
        let settings = resolve(Some(raw), Overrides::default()).unwrap();
        assert_eq!(
            select_workspace(&settings, Some("scratch")).unwrap().name,
            "scratch"
        );
        assert!(select_workspace(&settings, Some("nope")).is_err());
        assert!(select_workspace(&settings, None).is_err()); // ambiguous
    }
}
