// Per-process resource limits, applied in the child between fork and exec.

use super::SandboxProfile;
use judgekit_common::config::BuilderConfig;
use nix::sys::resource::{setrlimit, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_secs: u64,
    pub address_space_bytes: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub stack_bytes: Option<u64>,
    pub open_files: Option<u64>,
}

impl ResourceLimits {
    pub fn for_profile(config: &BuilderConfig, profile: SandboxProfile) -> Self {
        match profile {
            SandboxProfile::Toolchain => Self {
                cpu_secs: config.compile_timeout_ms.div_ceil(1000).max(1),
                address_space_bytes: None,
                file_size_bytes: None,
                stack_bytes: None,
                open_files: None,
            },
            SandboxProfile::Native | SandboxProfile::Interpreter => Self {
                cpu_secs: config.cpu_time_secs,
                address_space_bytes: Some(config.memory_limit_bytes),
                file_size_bytes: Some(config.file_size_bytes),
                stack_bytes: Some(config.stack_bytes),
                open_files: Some(config.max_open_files),
            },
            // The JVM reserves far more address space than it uses.
            SandboxProfile::Jvm => Self {
                cpu_secs: config.cpu_time_secs,
                address_space_bytes: None,
                file_size_bytes: Some(config.file_size_bytes),
                stack_bytes: Some(config.stack_bytes),
                open_files: None,
            },
        }
    }

    /// Install the limits on the calling process.
    ///
    /// The CPU hard limit sits one second above the soft one, so the process
    /// first receives `SIGXCPU` and is then killed outright.
    pub fn apply(&self) -> nix::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(bytes) = self.address_space_bytes {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(bytes) = self.file_size_bytes {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(bytes) = self.stack_bytes {
            setrlimit(Resource::RLIMIT_STACK, bytes, bytes)?;
        }
        if let Some(files) = self.open_files {
            setrlimit(Resource::RLIMIT_NOFILE, files, files)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_limits_follow_config() {
        let config = BuilderConfig {
            cpu_time_secs: 3,
            memory_limit_bytes: 64 * 1024 * 1024,
            ..BuilderConfig::default()
        };

        let limits = ResourceLimits::for_profile(&config, SandboxProfile::Native);

        assert_eq!(limits.cpu_secs, 3);
        assert_eq!(limits.address_space_bytes, Some(64 * 1024 * 1024));
        assert_eq!(limits.file_size_bytes, Some(0));
    }

    #[test]
    fn test_jvm_has_no_address_space_limit() {
        let limits = ResourceLimits::for_profile(&BuilderConfig::default(), SandboxProfile::Jvm);
        assert_eq!(limits.address_space_bytes, None);
        assert_eq!(limits.file_size_bytes, Some(0));
    }

    #[test]
    fn test_toolchain_cpu_covers_compile_timeout() {
        let config = BuilderConfig {
            compile_timeout_ms: 2_500,
            ..BuilderConfig::default()
        };
        let limits = ResourceLimits::for_profile(&config, SandboxProfile::Toolchain);
        assert_eq!(limits.cpu_secs, 3);
        assert_eq!(limits.file_size_bytes, None);
    }
}
