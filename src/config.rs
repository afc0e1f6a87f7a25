use crate::asset_path::Namespace;
use crate::error::VcServeError;
use crate::origin::{DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_ATTEMPTS};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

pub const DEFAULT_VCSKY_URL: &str = "https://cdn.dos.zone/vcsky/";
pub const DEFAULT_VCBR_URL: &str = "https://br.cdn.dos.zone/vcsky/";

/// How a namespace resolves requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveMode {
    /// Serve from disk only; never touch the network
    LocalOnly,
    /// Serve from disk, fetching and caching misses from the origin
    Cached,
    /// Relay every request to the origin without caching
    Passthrough,
}

impl ResolveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveMode::LocalOnly => "local",
            ResolveMode::Cached => "cache",
            ResolveMode::Passthrough => "passthrough",
        }
    }
}

/// Per-namespace policy, fixed at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct NamespacePolicy {
    pub local_only: bool,
    pub cache_enabled: bool,
    /// Always ends with `/`
    pub origin_base_url: String,
    pub local_root: PathBuf,
}

impl NamespacePolicy {
    /// `local_only` wins over `cache_enabled`.
    pub fn mode(&self) -> ResolveMode {
        match (self.local_only, self.cache_enabled) {
            (true, _) => ResolveMode::LocalOnly,
            (false, true) => ResolveMode::Cached,
            (false, false) => ResolveMode::Passthrough,
        }
    }
}

/// Credentials for the optional basic-auth gate.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicAuth {
    pub login: String,
    pub password: String,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub vcsky: NamespacePolicy,
    pub vcbr: NamespacePolicy,
    /// Prebuilt web client bundle
    pub dist_dir: PathBuf,
    /// Injected into the app shell in place of the `custom_saves` query check
    pub custom_saves: bool,
    /// Only affects the URL printed at startup
    pub cheats: bool,
    pub auth: Option<BasicAuth>,
    pub fetch_timeout_secs: u64,
    pub fetch_max_attempts: u32,
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, VcServeError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(VcServeError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, VcServeError> {
    match env::var(name) {
        Ok(raw) => parse_bool(name, &raw),
        Err(_) => Ok(default),
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, VcServeError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| VcServeError::Config(format!("{} has an invalid value: '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Validate an origin base URL and make sure it ends with `/`.
///
/// Only `http://` and `https://` URLs with a host are accepted.
pub fn normalize_origin_url(raw: &str) -> Result<String, VcServeError> {
    let parsed = Url::parse(raw.trim())
        .map_err(|_| VcServeError::Config(format!("Invalid origin URL: {}", raw)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(VcServeError::Config(format!(
                "Scheme '{}' not allowed for origin {}, only http/https",
                scheme, raw
            )));
        }
    }
    if parsed.host().is_none() {
        return Err(VcServeError::Config(format!("No host in origin URL: {}", raw)));
    }

    let mut url = parsed.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    Ok(url)
}

fn namespace_from_env(
    namespace: Namespace,
    default_url: &str,
) -> Result<NamespacePolicy, VcServeError> {
    let prefix = namespace.as_str().to_uppercase();
    let local_only = env_bool(&format!("{}_LOCAL", prefix), true)?;
    let cache_enabled = env_bool(&format!("{}_CACHE", prefix), false)?;
    let origin = env::var(format!("{}_URL", prefix)).unwrap_or_else(|_| default_url.to_string());
    let local_root = env::var(format!("{}_DIR", prefix))
        .unwrap_or_else(|_| namespace.as_str().to_string());

    Ok(NamespacePolicy {
        local_only,
        cache_enabled,
        origin_base_url: normalize_origin_url(&origin)?,
        local_root: PathBuf::from(local_root),
    })
}

impl Config {
    /// Load configuration from environment variables.
    /// Every setting has a default matching a fully offline local setup.
    pub fn from_env() -> Result<Self, VcServeError> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 8000u16)?;

        let vcsky = namespace_from_env(Namespace::Vcsky, DEFAULT_VCSKY_URL)?;
        let vcbr = namespace_from_env(Namespace::Vcbr, DEFAULT_VCBR_URL)?;

        let dist_dir = PathBuf::from(env::var("DIST_DIR").unwrap_or_else(|_| "dist".to_string()));
        let custom_saves = env_bool("CUSTOM_SAVES", false)?;
        let cheats = env_bool("CHEATS", false)?;

        // Basic auth is all-or-nothing
        let auth = match (env::var("AUTH_LOGIN").ok(), env::var("AUTH_PASSWORD").ok()) {
            (Some(login), Some(password)) => Some(BasicAuth { login, password }),
            (None, None) => None,
            _ => {
                return Err(VcServeError::Config(
                    "AUTH_LOGIN and AUTH_PASSWORD must be set together".to_string(),
                ));
            }
        };

        let fetch_timeout_secs = env_parse("FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?;
        if fetch_timeout_secs == 0 {
            return Err(VcServeError::Config(
                "FETCH_TIMEOUT_SECS must be greater than zero".to_string(),
            ));
        }
        let fetch_max_attempts = env_parse("FETCH_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;

        Ok(Config {
            host,
            port,
            vcsky,
            vcbr,
            dist_dir,
            custom_saves,
            cheats,
            auth,
            fetch_timeout_secs,
            fetch_max_attempts,
        })
    }

    pub fn policy(&self, namespace: Namespace) -> &NamespacePolicy {
        match namespace {
            Namespace::Vcsky => &self.vcsky,
            Namespace::Vcbr => &self.vcbr,
        }
    }

    /// URL to open in a browser once the server is up.
    pub fn public_url(&self) -> String {
        let mut url = format!("http://localhost:{}", self.port);
        if self.cheats {
            url.push_str("/?cheats=1");
        }
        url
    }
}
