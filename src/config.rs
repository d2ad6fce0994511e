use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Scope URL of the application; manifest entries resolve against it
  pub origin: Option<String>,
  /// Cache name prefix shared by every generation
  pub cache_name: String,
  /// Version token embedded in the generation name; bump on every deploy
  pub version: String,
  /// Assets precached at install, in order
  pub manifest: Vec<String>,
  /// Document served when the network is unreachable
  pub shell: String,
  /// Store 4xx/5xx responses like any other response
  pub store_error_responses: bool,
  /// SQLite database path (default: $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
  /// Address the proxy server listens on
  pub listen: SocketAddr,
  /// Transport timeout for network fetches; none by default
  pub timeout_secs: Option<u64>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      cache_name: "vocabforge".to_string(),
      version: "v1".to_string(),
      manifest: vec![
        "./".to_string(),
        "./index.html".to_string(),
        "./manifest.webmanifest".to_string(),
        "./icon.svg".to_string(),
      ],
      shell: "./index.html".to_string(),
      store_error_responses: true,
      database: None,
      listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
      timeout_secs: None,
    }
  }
}

/// Settings for one deployed version, with every URL resolved.
#[derive(Debug, Clone)]
pub struct Deployment {
  pub scope: Url,
  pub generation: String,
  pub manifest: Vec<Url>,
  pub shell: Url,
  pub store_error_responses: bool,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to defaults when no file exists; `origin` must then be given
  /// on the command line.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Generation name for the configured version, e.g. `vocabforge-v1`.
  pub fn generation(&self) -> String {
    format!("{}-{}", self.cache_name, self.version)
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }

  /// Resolve the origin, manifest and shell into absolute URLs.
  pub fn deployment(&self) -> Result<Deployment> {
    let origin = self
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("No origin configured. Set `origin` in the config file or pass --origin"))?;
    let scope = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    if scope.cannot_be_a_base() {
      return Err(eyre!("Origin {} cannot be used as a base URL", origin));
    }

    let resolve = |entry: &str| {
      scope
        .join(entry)
        .map_err(|e| eyre!("Invalid manifest entry {}: {}", entry, e))
    };

    let manifest = self
      .manifest
      .iter()
      .map(|entry| resolve(entry))
      .collect::<Result<Vec<_>>>()?;
    let shell = resolve(&self.shell)?;
    if shell.origin() != scope.origin() {
      return Err(eyre!("Shell document {} is not on the application origin", shell));
    }

    Ok(Deployment {
      generation: self.generation(),
      manifest,
      shell,
      store_error_responses: self.store_error_responses,
      scope,
    })
  }
}
