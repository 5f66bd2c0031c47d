use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::ferry::tunnel::client::GracePeriod;

const CONFIG_ENV: &str = "FERRY_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["ferry.toml", "ferry.yaml", "ferry.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConfigPathSource::Flag => "flag",
            ConfigPathSource::Env => "env",
            ConfigPathSource::Cwd => "cwd",
            ConfigPathSource::Default => "default",
        })
    }
}

/// Picks the config file: `--config`, then `FERRY_CONFIG`, then a
/// `ferry.{toml,yaml,yml}` in the working directory, then the OS default.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap usually folds the env var into the flag; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/ferry/ferry.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "ferry", "ferry")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ferry.toml"))
    }
}

/// Writes the commented default template when `path` does not exist yet.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Public listener: tunnel traffic by subdomain, the API on the bare domain.
    pub api_addr: String,
    /// Where tunnel clients dial in to lend sockets.
    pub tunnel_addr: String,
    pub domain: Option<String>,
    pub max_sockets: usize,
    pub grace: GracePeriod,
    pub max_header_bytes: usize,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub api_addr: Option<String>,
    pub tunnel_addr: Option<String>,
    pub domain: Option<String>,
    pub max_sockets: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_addr: Option<String>,
    tunnel_addr: Option<String>,
    domain: Option<String>,
    max_sockets: Option<i64>,
    grace_timeout_ms: Option<i64>,
    max_header_bytes: Option<i64>,
    timeouts: Option<FileTimeouts>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let max_sockets = fc.max_sockets.unwrap_or(10);
        if max_sockets < 1 {
            anyhow::bail!("config: max_sockets must be at least 1 (got {max_sockets})");
        }

        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(l.level.as_ref()) {
                logging.level = level;
            }
            if let Some(format) = non_empty(l.format.as_ref()) {
                logging.format = format;
            }
            if let Some(output) = non_empty(l.output.as_ref()) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        let handshake_ms = fc
            .timeouts
            .as_ref()
            .and_then(|t| t.handshake_timeout_ms)
            .unwrap_or(3000)
            .max(0) as u64;

        let max_header_bytes = match fc.max_header_bytes.unwrap_or(0).max(0) as usize {
            0 => 16 * 1024,
            n => n,
        };

        Ok(Config {
            api_addr: non_empty(fc.api_addr.as_ref()).unwrap_or_else(|| ":80".into()),
            tunnel_addr: non_empty(fc.tunnel_addr.as_ref()).unwrap_or_else(|| ":3030".into()),
            domain: non_empty(fc.domain.as_ref()).map(|d| d.to_ascii_lowercase()),
            max_sockets: max_sockets as usize,
            grace: GracePeriod::from_millis(fc.grace_timeout_ms.unwrap_or(3000).max(0) as u64),
            max_header_bytes,
            timeouts: Timeouts {
                handshake_timeout: Duration::from_millis(if handshake_ms == 0 {
                    3000
                } else {
                    handshake_ms
                }),
            },
            logging,
        })
    }

    pub fn apply_overrides(&mut self, o: Overrides) -> anyhow::Result<()> {
        if let Some(addr) = non_empty(o.api_addr.as_ref()) {
            self.api_addr = addr;
        }
        if let Some(addr) = non_empty(o.tunnel_addr.as_ref()) {
            self.tunnel_addr = addr;
        }
        if let Some(domain) = non_empty(o.domain.as_ref()) {
            self.domain = Some(domain.to_ascii_lowercase());
        }
        if let Some(n) = o.max_sockets {
            if n == 0 {
                anyhow::bail!("config: --max-sockets must be at least 1");
            }
            self.max_sockets = n;
        }
        Ok(())
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# ferry configuration (auto-generated)
#
# This file was created because ferry could not find a configuration file at
# the resolved config path. It is runnable as is.
#
# Public traffic for <id>.<domain> is forwarded to the tunnel client that
# registered <id>; requests to the bare domain reach the HTTP API.

api_addr = ":80"
tunnel_addr = ":3030"
# domain = "tunnel.example.com"

# Sockets a single tunnel client may lend at once.
max_sockets = 10

# Tear a tunnel down after it has had no sockets for this long (0 disables).
grace_timeout_ms = 3000

[timeouts]
handshake_timeout_ms = 3000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# ferry configuration (auto-generated)
#
# This file was created because ferry could not find a configuration file at
# the resolved config path. It is runnable as is.
#
# Public traffic for <id>.<domain> is forwarded to the tunnel client that
# registered <id>; requests to the bare domain reach the HTTP API.

api_addr: ":80"
tunnel_addr: ":3030"
# domain: "tunnel.example.com"

# Sockets a single tunnel client may lend at once.
max_sockets: 10

# Tear a tunnel down after it has had no sockets for this long (0 disables).
grace_timeout_ms: 3000

timeouts:
  handshake_timeout_ms: 3000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
