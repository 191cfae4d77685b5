//! Binary resolution for external language servers.
//!
//! Resolution order: explicit configured path → PATH lookup → versioned
//! binary cache. [`ServerLocator::install`] can populate the cache from a
//! release download URL. The support matrix is checked before any lookup.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::types::ServerConfig;

/// Operating systems the bridge knows how to resolve binaries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Mac,
    Windows,
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Linux => "linux",
            Self::Mac => "macos",
            Self::Windows => "windows",
        })
    }
}

/// CPU architectures the bridge knows how to resolve binaries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        })
    }
}

/// An (OS, architecture) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
}

impl Platform {
    #[must_use]
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// The platform this bridge was compiled for.
    #[must_use]
    pub fn current() -> Self {
        let os = if cfg!(target_os = "macos") {
            Os::Mac
        } else if cfg!(windows) {
            Os::Windows
        } else {
            Os::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        };
        Self { os, arch }
    }

    /// Declared support matrix: Linux (x86_64, aarch64), macOS (x86_64,
    /// aarch64), Windows (x86_64 only).
    #[must_use]
    pub fn is_supported(self) -> bool {
        self.target_triple().is_some()
    }

    /// Rust-style target triple, used for cache keys and download URLs.
    /// `None` for pairs outside the support matrix.
    #[must_use]
    pub fn target_triple(self) -> Option<&'static str> {
        match (self.os, self.arch) {
            (Os::Linux, Arch::X86_64) => Some("x86_64-unknown-linux-gnu"),
            (Os::Linux, Arch::Aarch64) => Some("aarch64-unknown-linux-gnu"),
            (Os::Mac, Arch::X86_64) => Some("x86_64-apple-darwin"),
            (Os::Mac, Arch::Aarch64) => Some("aarch64-apple-darwin"),
            (Os::Windows, Arch::X86_64) => Some("x86_64-pc-windows-msvc"),
            (Os::Windows, Arch::Aarch64) => None,
        }
    }

    fn unsupported(self) -> BridgeError {
        BridgeError::UnsupportedPlatform {
            os: self.os,
            arch: self.arch,
        }
    }

    fn exe_suffix(self) -> &'static str {
        match self.os {
            Os::Windows => ".exe",
            Os::Linux | Os::Mac => "",
        }
    }
}

/// A fully resolved server launch description. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    name: String,
    path: PathBuf,
    args: Vec<String>,
    version: Option<String>,
}

impl ServerDescriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute path to the executable.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Default per-user cache directory for downloaded server binaries.
#[must_use]
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("lsp-bridge"))
}

/// Resolves external server executables.
///
/// Read-only apart from [`install`](Self::install), which downloads into the
/// locator's cache directory.
#[derive(Debug, Clone)]
pub struct ServerLocator {
    cache_dir: PathBuf,
}

impl ServerLocator {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolve the executable for `config` on `platform`.
    ///
    /// Fails with [`BridgeError::UnsupportedPlatform`] for pairs outside the
    /// support matrix and [`BridgeError::BinaryNotFound`] when no candidate
    /// exists. Never touches the network.
    pub fn resolve(&self, config: &ServerConfig, platform: Platform) -> Result<ServerDescriptor> {
        if !platform.is_supported() {
            return Err(platform.unsupported());
        }

        if let Some(path) = &config.path {
            if path.is_file() {
                return Ok(self.descriptor(config, path.clone()));
            }
            tracing::warn!(
                path = %path.display(),
                "configured server path does not exist, falling back to lookup"
            );
        }

        if let Ok(path) = which::which(&config.name) {
            return Ok(self.descriptor(config, path));
        }

        let cached = self.cached_path(config, platform)?;
        if cached.is_file() {
            return Ok(self.descriptor(config, cached));
        }

        Err(BridgeError::BinaryNotFound {
            name: config.name.clone(),
        })
    }

    /// Where a cached binary for `config` on `platform` lives, whether or
    /// not it exists: `<cache>/<name>-<version>/<triple>/<name>[.exe]`.
    /// Fails for platforms outside the support matrix, which have no triple.
    pub fn cached_path(&self, config: &ServerConfig, platform: Platform) -> Result<PathBuf> {
        let triple = platform.target_triple().ok_or_else(|| platform.unsupported())?;
        Ok(self
            .cache_dir
            .join(format!("{}-{}", config.name, cache_version(config)))
            .join(triple)
            .join(format!("{}{}", config.name, platform.exe_suffix())))
    }

    /// Download the server binary into the cache and resolve to it.
    ///
    /// The download URL comes from `config.download_url` with `{version}` and
    /// `{triple}` substituted. The binary is written via a temp file and
    /// persisted atomically, so a failed download leaves nothing behind.
    /// Other cached versions of the same server are swept afterwards.
    pub async fn install(
        &self,
        config: &ServerConfig,
        platform: Platform,
    ) -> Result<ServerDescriptor> {
        let triple = platform.target_triple().ok_or_else(|| platform.unsupported())?;

        let Some(template) = &config.download_url else {
            return Err(BridgeError::BinaryNotFound {
                name: config.name.clone(),
            });
        };

        let url = template
            .replace("{version}", cache_version(config))
            .replace("{triple}", triple);
        tracing::info!(server = %config.name, %url, "downloading server binary");

        let response = reqwest::get(&url).await?.error_for_status()?;
        let bytes = response.bytes().await?;

        let target = self.cached_path(config, platform)?;
        let parent = target
            .parent()
            .ok_or_else(|| std::io::Error::other("cache path has no parent"))?;
        std::fs::create_dir_all(parent)?;

        // Atomic install: temp file in the final directory, then a
        // same-filesystem rename.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            tmp.as_file().set_permissions(perms)?;
        }
        tmp.persist(&target).map_err(|e| e.error)?;

        self.sweep_stale_versions(config);

        tracing::info!(server = %config.name, path = %target.display(), "server binary installed");
        Ok(self.descriptor(config, target))
    }

    /// Remove cached versions of this server other than the configured one.
    fn sweep_stale_versions(&self, config: &ServerConfig) {
        let keep = format!("{}-{}", config.name, cache_version(config));
        let prefix = format!("{}-", config.name);
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(dir_name) = entry.file_name().into_string() else {
                continue;
            };
            if dir_name.starts_with(&prefix) && dir_name != keep {
                tracing::debug!(dir = %dir_name, "removing stale cached server version");
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    fn descriptor(&self, config: &ServerConfig, path: PathBuf) -> ServerDescriptor {
        ServerDescriptor {
            name: config.name.clone(),
            path,
            args: config.args.clone(),
            version: config.version.clone(),
        }
    }
}

fn cache_version(config: &ServerConfig) -> &str {
    config.version.as_deref().unwrap_or("latest")
}
