// Builder configuration
// Loaded from an optional JSON file, then overridden by JUDGEKIT_* environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Caps applied to captured stdout/stderr of a sandboxed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
    pub max_line_chars: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10_000,
            max_lines: 50,
            max_line_chars: 200,
        }
    }
}

/// Executables used by the compile and launch steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub cc: String,
    pub cxx: String,
    pub javac: String,
    pub java: String,
    pub python: String,
    pub ruby: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            cc: "gcc".to_string(),
            cxx: "g++".to_string(),
            javac: "javac".to_string(),
            java: "java".to_string(),
            python: "python3".to_string(),
            ruby: "ruby".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Disabling the sandbox is only meant for controlled test environments.
    /// Deadlines are still enforced; rlimits and the syscall filter are not.
    pub sandbox_enabled: bool,
    /// Heap ceiling exported to the preload allocator for native programs.
    pub heap_size_bytes: u64,
    /// Address-space ceiling for native and interpreted programs.
    pub memory_limit_bytes: u64,
    pub jvm_heap_mb: u32,
    pub cpu_time_secs: u64,
    pub file_size_bytes: u64,
    pub stack_bytes: u64,
    pub max_open_files: u64,
    pub preload_library: Option<PathBuf>,
    pub test_timeout_ms: u64,
    pub total_timeout_ms: Option<u64>,
    pub compile_timeout_ms: u64,
    pub temp_dir: PathBuf,
    pub pool_size: usize,
    pub queue_capacity: usize,
    /// Test cases of one submission that may run at the same time.
    pub test_concurrency: usize,
    /// Upper bound on sandboxed processes alive at once across the pool.
    pub max_sandboxes: Option<usize>,
    pub output: OutputLimits,
    pub toolchain: Toolchain,
    pub testers_path: Option<PathBuf>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            heap_size_bytes: 8 * 1024 * 1024,
            memory_limit_bytes: 512 * 1024 * 1024,
            jvm_heap_mb: 128,
            cpu_time_secs: 10,
            file_size_bytes: 0,
            stack_bytes: 8 * 1024 * 1024,
            max_open_files: 64,
            preload_library: None,
            test_timeout_ms: 8_000,
            total_timeout_ms: Some(120_000),
            compile_timeout_ms: 30_000,
            temp_dir: std::env::temp_dir(),
            pool_size: 2,
            queue_capacity: 64,
            test_concurrency: 2,
            max_sandboxes: None,
            output: OutputLimits::default(),
            toolchain: Toolchain::default(),
            testers_path: None,
        }
    }
}

impl BuilderConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults (or `path` when given) with environment overrides applied.
    pub fn from_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `JUDGEKIT_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("JUDGEKIT_SANDBOX_ENABLED") {
            self.sandbox_enabled = parse_bool("JUDGEKIT_SANDBOX_ENABLED", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_SANDBOX_HEAP_BYTES") {
            self.heap_size_bytes = parse("JUDGEKIT_SANDBOX_HEAP_BYTES", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_MEMORY_LIMIT_BYTES") {
            self.memory_limit_bytes = parse("JUDGEKIT_MEMORY_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_CPU_TIME_SECS") {
            self.cpu_time_secs = parse("JUDGEKIT_CPU_TIME_SECS", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_TEST_TIMEOUT_MS") {
            self.test_timeout_ms = parse("JUDGEKIT_TEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_TOTAL_TIMEOUT_MS") {
            let ms: u64 = parse("JUDGEKIT_TOTAL_TIMEOUT_MS", &v)?;
            self.total_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(v) = get("JUDGEKIT_TMPDIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = get("JUDGEKIT_POOL_SIZE") {
            self.pool_size = parse("JUDGEKIT_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_QUEUE_CAPACITY") {
            self.queue_capacity = parse("JUDGEKIT_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_TEST_CONCURRENCY") {
            self.test_concurrency = parse("JUDGEKIT_TEST_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("JUDGEKIT_TESTERS") {
            self.testers_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("JUDGEKIT_PRELOAD_LIBRARY") {
            self.preload_library = Some(PathBuf::from(v));
        }
        if let Some(v) = get("JUDGEKIT_CC") {
            self.toolchain.cc = v;
        }
        if let Some(v) = get("JUDGEKIT_CXX") {
            self.toolchain.cxx = v;
        }
        if let Some(v) = get("JUDGEKIT_JAVAC") {
            self.toolchain.javac = v;
        }
        if let Some(v) = get("JUDGEKIT_JAVA") {
            self.toolchain.java = v;
        }
        if let Some(v) = get("JUDGEKIT_PYTHON") {
            self.toolchain.python = v;
        }
        if let Some(v) = get("JUDGEKIT_RUBY") {
            self.toolchain.ruby = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.test_concurrency == 0 {
            return Err(ConfigError::Invalid("test_concurrency must be at least 1".into()));
        }
        if self.test_timeout_ms == 0 {
            return Err(ConfigError::Invalid("test_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Admission limit for concurrently running sandboxes.
    pub fn sandbox_permits(&self) -> usize {
        self.max_sandboxes
            .unwrap_or(self.pool_size * self.test_concurrency)
            .max(1)
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BuilderConfig::default();
        assert!(config.sandbox_enabled);
        assert_eq!(config.heap_size_bytes, 8_388_608);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.output.max_bytes, 10_000);
        assert_eq!(config.sandbox_permits(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BuilderConfig::default();
        config
            .apply_env(lookup(&[
                ("JUDGEKIT_SANDBOX_ENABLED", "false"),
                ("JUDGEKIT_TEST_TIMEOUT_MS", "2000"),
                ("JUDGEKIT_TOTAL_TIMEOUT_MS", "0"),
                ("JUDGEKIT_POOL_SIZE", "8"),
                ("JUDGEKIT_TMPDIR", "/var/tmp/judge"),
                ("JUDGEKIT_CC", "clang"),
            ]))
            .unwrap();

        assert!(!config.sandbox_enabled);
        assert_eq!(config.test_timeout_ms, 2000);
        assert_eq!(config.total_timeout_ms, None);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.temp_dir, PathBuf::from("/var/tmp/judge"));
        assert_eq!(config.toolchain.cc, "clang");
    }

    #[test]
    fn test_invalid_env_value_is_rejected() {
        let mut config = BuilderConfig::default();
        let err = config
            .apply_env(lookup(&[("JUDGEKIT_POOL_SIZE", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: "JUDGEKIT_POOL_SIZE", .. }));
    }

    #[test]
    fn test_zero_pool_size_fails_validation() {
        let config = BuilderConfig {
            pool_size: 0,
            ..BuilderConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("judgekit.json");
        fs::write(&path, r#"{"pool_size": 3, "output": {"max_lines": 10}}"#).unwrap();

        let config = BuilderConfig::load(&path).unwrap();

        assert_eq!(config.pool_size, 3);
        assert_eq!(config.output.max_lines, 10);
        assert_eq!(config.output.max_bytes, 10_000);
        assert!(config.sandbox_enabled);
    }
}
