#![deny(warnings)]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]

//! INI-style configuration loading: one file (or several, merged) into a section/key lookup,
//! plus typed accessors for the sections this system recognizes.

use std::collections::HashMap;
use std::path::Path;

use ini::Ini;

#[derive(Debug)]
pub struct Config {
  ini: Ini,
}

fn fail<T>(msg: String) -> Result<T, String> {
  Err(msg)
}

impl Config {
  pub fn parse<P: AsRef<Path>>(file: P) -> Result<Config, String> {
    let ini = Ini::load_from_file(file.as_ref()).map_err(|e| {
      format!("Failed to parse config file {}: {e}", file.as_ref().display())
    })?;
    if ini.section(Some("redis")).is_some() {
      return fail(format!(
        "Config file {} has a [redis] section; use [broker] instead.",
        file.as_ref().display()
      ));
    }
    Ok(Config { ini })
  }

  /// Loads and merges several config files in order; later files override earlier ones'
  /// section/key pairs, mirroring the teacher's layered-config precedence.
  pub fn merged<P: AsRef<Path>>(files: &[P]) -> Result<Config, String> {
    let mut merged = Ini::new();
    for file in files {
      let parsed = Config::parse(file)?;
      for (section, properties) in parsed.ini.iter() {
        for (key, value) in properties.iter() {
          merged
            .with_section(section)
            .set(key.to_string(), value.to_string());
        }
      }
    }
    Ok(Config { ini: merged })
  }

  fn get(&self, section: &str, key: &str) -> Option<&str> {
    self.ini.section(Some(section)).and_then(|p| p.get(key))
  }

  pub fn get_string(&self, section: &str, key: &str) -> Option<String> {
    self.get(section, key).map(str::to_string)
  }

  pub fn require_string(&self, section: &str, key: &str) -> Result<String, String> {
    self
      .get_string(section, key)
      .ok_or_else(|| format!("Missing required config option [{section}] {key}"))
  }

  pub fn get_u64(&self, section: &str, key: &str) -> Result<Option<u64>, String> {
    match self.get(section, key) {
      None => Ok(None),
      Some(raw) => raw
        .parse::<u64>()
        .map(Some)
        .map_err(|e| format!("Expected [{section}] {key} to be an integer, got {raw:?}: {e}")),
    }
  }

  pub fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>, String> {
    match self.get(section, key) {
      None => Ok(None),
      Some(raw) => match raw {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        other => Err(format!("Expected [{section}] {key} to be a boolean, got {other:?}")),
      },
    }
  }

  pub fn get_string_list(&self, section: &str, key: &str) -> Vec<String> {
    self
      .get(section, key)
      .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
      .unwrap_or_default()
  }

  /// Collects every `localmount_.<name>` section's `root` key, keyed by `<name>`.
  pub fn local_mounts(&self) -> HashMap<String, String> {
    let mut mounts = HashMap::new();
    for (section, properties) in self.ini.iter() {
      let Some(name) = section.and_then(|s| s.strip_prefix("localmount_.")) else {
        continue;
      };
      if let Some(root) = properties.get("root") {
        mounts.insert(name.to_string(), root.to_string());
      }
    }
    mounts
  }
}

/// `app.*`: dispatchable-method allow-list and worker autodiscovery.
pub struct AppSection {
  pub allowed_imports: Vec<String>,
  pub autodiscover: Vec<String>,
}

impl AppSection {
  pub fn load(config: &Config) -> AppSection {
    AppSection {
      allowed_imports: config.get_string_list("app", "allowed_imports"),
      autodiscover: config.get_string_list("app", "autodiscover"),
    }
  }
}

/// `broker.*`: connection details plus the TTL applied to queue-tracking and distributed-map
/// entries.
pub struct BrokerSection {
  pub name: String,
  pub url: String,
  pub port: Option<u64>,
  pub db: Option<u64>,
  pub result_expires: u64,
}

const DEFAULT_RESULT_EXPIRES_SECONDS: u64 = 86_400;

impl BrokerSection {
  pub fn load(config: &Config) -> Result<BrokerSection, String> {
    Ok(BrokerSection {
      name: config.require_string("broker", "name")?,
      url: config.require_string("broker", "url")?,
      port: config.get_u64("broker", "port")?,
      db: config.get_u64("broker", "db")?,
      result_expires: config
        .get_u64("broker", "result_expires")?
        .unwrap_or(DEFAULT_RESULT_EXPIRES_SECONDS),
    })
  }
}

/// `worker.*`: process-local worker pool sizing.
pub struct WorkerSection {
  pub workers: usize,
  pub queues: Vec<String>,
  pub max_memory: Option<u64>,
}

impl WorkerSection {
  pub fn load(config: &Config) -> Result<WorkerSection, String> {
    Ok(WorkerSection {
      workers: config.get_u64("worker", "workers")?.unwrap_or(1) as usize,
      queues: config.get_string_list("worker", "queues"),
      max_memory: config.get_u64("worker", "max_memory")?,
    })
  }
}

/// `localcache.*`: the local mirror's root directory and byte budget.
pub struct LocalCacheSection {
  pub path: String,
  pub limit_bytes: u64,
}

impl LocalCacheSection {
  pub fn load(config: &Config) -> Result<LocalCacheSection, String> {
    let gb_limit = config.get_u64("localcache", "limit")?.unwrap_or(10);
    Ok(LocalCacheSection {
      path: config.require_string("localcache", "path")?,
      limit_bytes: gb_limit * 1024 * 1024 * 1024,
    })
  }
}

/// `remotestorage.*`: the active scheme allow-list and the default scheme new installs use.
pub struct RemoteStorageSection {
  pub use_remotes: Vec<String>,
  pub default: String,
}

impl RemoteStorageSection {
  pub fn load(config: &Config) -> Result<RemoteStorageSection, String> {
    Ok(RemoteStorageSection {
      use_remotes: config.get_string_list("remotestorage", "use_remotes"),
      default: config.require_string("remotestorage", "default")?,
    })
  }
}

/// `webserver.*`: the dispatch front-end's HTTP listener configuration.
pub struct WebServerSection {
  pub host: String,
  pub port: u16,
  pub workers: usize,
  pub max_requests: Option<u64>,
  pub timeout_seconds: u64,
  pub uploads_dir: String,
}

impl WebServerSection {
  pub fn load(config: &Config) -> Result<WebServerSection, String> {
    Ok(WebServerSection {
      host: config.get_string("webserver", "host").unwrap_or_else(|| "127.0.0.1".to_string()),
      port: config
        .get_u64("webserver", "port")?
        .map(|p| p as u16)
        .unwrap_or(8000),
      workers: config.get_u64("webserver", "workers")?.unwrap_or(1) as usize,
      max_requests: config.get_u64("webserver", "max_requests")?,
      timeout_seconds: config.get_u64("webserver", "timeout")?.unwrap_or(30),
      uploads_dir: config
        .get_string("webserver", "uploads_dir")
        .unwrap_or_else(|| "/tmp/uploads".to_string()),
    })
  }
}

/// `logging.*`: sink path, minimum level, and rotation policy.
pub struct LoggingSection {
  pub path: Option<String>,
  pub level: String,
  pub logrotate: Option<String>,
}

impl LoggingSection {
  pub fn load(config: &Config) -> LoggingSection {
    LoggingSection {
      path: config.get_string("logging", "path"),
      level: config.get_string("logging", "level").unwrap_or_else(|| "info".to_string()),
      logrotate: config.get_string("logging", "logrotate"),
    }
  }
}
