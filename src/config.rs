#![forbid(unsafe_code)]

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use url::Url;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PLATFORM_URL: &str = "https://www.tiktok.com";
pub const DEFAULT_BROWSER: &str = "chromium";
pub const DEFAULT_SUBSCRIBERS_FILE: &str = "subscribers.txt";
pub const DEFAULT_ITEM_LIMIT: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 2;
pub const DEFAULT_MIN_VIDEO_BYTES: u64 = 16 * 1024;

const FETCH_TIMEOUT_RANGE: (u64, u64) = (5, 120);
const FETCH_ATTEMPTS_RANGE: (u32, u32) = (1, 5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("building http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Where posts come from for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSource {
    /// External helper program that owns the platform session.
    Command(PathBuf),
    /// Directory of pre-fetched `<creator>.json` dumps.
    Dump(PathBuf),
}

/// Fully resolved configuration for one run. Built once and passed down
/// explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    pub credential: String,
    pub media_root: PathBuf,
    pub public_base_url: Url,
    pub platform_url: String,
    pub render_headless: bool,
    pub force_refresh: bool,
    pub item_limit: usize,
    pub proxy: Option<String>,
    pub browser: String,
    pub upstream: UpstreamSource,
    pub subscribers_file: PathBuf,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub min_video_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub media_root: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub force_refresh: Option<bool>,
    pub item_limit: Option<usize>,
    pub subscribers_file: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings, ConfigError> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<Settings, ConfigError> {
    let lookup = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| lookup_value(key, file_vars, &env_lookup))
    };

    let credential =
        lookup(&["SESSION_CREDENTIAL", "MS_TOKEN"]).ok_or(ConfigError::Missing("SESSION_CREDENTIAL"))?;
    let media_root = overrides
        .media_root
        .or_else(|| lookup(&["MEDIA_ROOT"]).map(PathBuf::from))
        .ok_or(ConfigError::Missing("MEDIA_ROOT"))?;
    let public_base_url = overrides
        .public_base_url
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup(&["PUBLIC_BASE_URL"]))
        .ok_or(ConfigError::Missing("PUBLIC_BASE_URL"))?;
    let public_base_url = parse_public_base(&public_base_url)?;
    let platform_url = lookup(&["PLATFORM_URL"]).unwrap_or_else(|| DEFAULT_PLATFORM_URL.to_string());

    let render_headless = match lookup(&["RENDER_HEADLESS"]) {
        Some(value) => parse_flag("RENDER_HEADLESS", &value)?,
        None => true,
    };
    let force_refresh = match overrides.force_refresh {
        Some(value) => value,
        None => match lookup(&["FORCE_REFRESH", "FORCE_LAST_REFRESH"]) {
            Some(value) => parse_flag("FORCE_REFRESH", &value)?,
            None => false,
        },
    };
    let item_limit = match overrides.item_limit {
        Some(value) => value,
        None => parse_number("ITEM_LIMIT", lookup(&["ITEM_LIMIT", "MAX_VIDEOS"]))?
            .unwrap_or(DEFAULT_ITEM_LIMIT),
    };
    if item_limit == 0 {
        return Err(ConfigError::Invalid {
            key: "ITEM_LIMIT",
            value: "0".into(),
        });
    }

    let upstream = match (lookup(&["UPSTREAM_COMMAND"]), lookup(&["UPSTREAM_DUMP_DIR"])) {
        (Some(command), _) => UpstreamSource::Command(PathBuf::from(command)),
        (None, Some(dir)) => UpstreamSource::Dump(PathBuf::from(dir)),
        (None, None) => return Err(ConfigError::Missing("UPSTREAM_COMMAND or UPSTREAM_DUMP_DIR")),
    };

    let subscribers_file = overrides
        .subscribers_file
        .or_else(|| lookup(&["SUBSCRIBERS_FILE"]).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SUBSCRIBERS_FILE));
    let concurrency = match overrides.concurrency {
        Some(value) => value,
        None => parse_number("CONCURRENCY", lookup(&["CONCURRENCY"]))?
            .unwrap_or(DEFAULT_CONCURRENCY),
    }
    .max(1);

    let fetch_timeout_secs: u64 = parse_number("FETCH_TIMEOUT_SECS", lookup(&["FETCH_TIMEOUT_SECS"]))?
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS)
        .clamp(FETCH_TIMEOUT_RANGE.0, FETCH_TIMEOUT_RANGE.1);
    let fetch_attempts: u32 = parse_number("FETCH_ATTEMPTS", lookup(&["FETCH_ATTEMPTS"]))?
        .unwrap_or(DEFAULT_FETCH_ATTEMPTS)
        .clamp(FETCH_ATTEMPTS_RANGE.0, FETCH_ATTEMPTS_RANGE.1);
    let min_video_bytes = parse_number("MIN_VIDEO_BYTES", lookup(&["MIN_VIDEO_BYTES"]))?
        .unwrap_or(DEFAULT_MIN_VIDEO_BYTES);

    Ok(Settings {
        credential,
        media_root,
        public_base_url,
        platform_url,
        render_headless,
        force_refresh,
        item_limit,
        proxy: lookup(&["PROXY"]),
        browser: lookup(&["BROWSER", "TIKTOK_BROWSER"]).unwrap_or_else(|| DEFAULT_BROWSER.to_string()),
        upstream,
        subscribers_file,
        concurrency,
        fetch_timeout: Duration::from_secs(fetch_timeout_secs),
        fetch_attempts,
        min_video_bytes,
    })
}

/// Public base URLs must be absolute http(s) and always end in `/` so asset
/// paths can be appended verbatim.
fn parse_public_base(raw: &str) -> Result<Url, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: "PUBLIC_BASE_URL",
        value: raw.to_string(),
    };
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key,
                value: raw.clone(),
            })
        })
        .transpose()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
