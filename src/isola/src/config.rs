//! Context- and sandbox-level configuration.
//!
//! Patches follow the merge convention of the host API: a field left unset
//! inherits the current value, while an explicit `None`-flavored setter
//! ("unlimited", "no timeout") clears the limit for this holder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IsolaError, Result};

/// Permissions granted to the guest on a mounted directory or its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountPerms {
    /// Read-only access.
    Read,
    /// Write-only access.
    Write,
    /// Full access.
    ReadWrite,
}

/// A host-path/guest-path pair with permissions granted to the guest
/// filesystem view. Immutable once attached to a Context or Sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Directory on the host filesystem.
    pub host_path: PathBuf,
    /// Where the directory appears inside the guest.
    pub guest_path: String,
    /// Permissions on the directory itself.
    pub dir_perms: MountPerms,
    /// Permissions on files under the directory.
    pub file_perms: MountPerms,
}

impl MountConfig {
    /// A read-only mount.
    pub fn read_only(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            dir_perms: MountPerms::Read,
            file_perms: MountPerms::Read,
        }
    }

    /// A read-write mount.
    pub fn read_write(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            dir_perms: MountPerms::ReadWrite,
            file_perms: MountPerms::ReadWrite,
        }
    }

    /// Validate one entry and produce its wire form.
    ///
    /// # Errors
    ///
    /// [`IsolaError::InvalidArgument`] for empty paths or a host path that
    /// is not valid UTF-8 (the wire form is JSON).
    pub(crate) fn to_wire(&self) -> Result<MountWire> {
        let host = self
            .host_path
            .to_str()
            .ok_or_else(|| IsolaError::invalid("mount host path must be valid UTF-8"))?;
        if host.is_empty() {
            return Err(IsolaError::invalid("mount host path must not be empty"));
        }
        if self.guest_path.is_empty() {
            return Err(IsolaError::invalid("mount guest path must not be empty"));
        }
        Ok(MountWire {
            host: host.to_string(),
            guest: self.guest_path.clone(),
            dir_perms: self.dir_perms,
            file_perms: self.file_perms,
        })
    }
}

/// Wire form of a mount entry: `{host, guest, dir_perms, file_perms}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MountWire {
    pub(crate) host: String,
    pub(crate) guest: String,
    pub(crate) dir_perms: MountPerms,
    pub(crate) file_perms: MountPerms,
}

/// Canonicalize a user-supplied timeout in seconds to whole milliseconds.
///
/// # Errors
///
/// [`IsolaError::InvalidArgument`] for non-finite, non-positive, or
/// overflowing values. Any accepted value stores `ceil(seconds * 1000)`,
/// which is always at least 1.
pub(crate) fn canonical_timeout_ms(seconds: f64) -> Result<u64> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(IsolaError::invalid(format!(
            "timeout must be a finite positive number of seconds, got {seconds}"
        )));
    }
    let ms = (seconds * 1000.0).ceil();
    if ms < 1.0 {
        return Err(IsolaError::invalid(format!(
            "timeout of {seconds}s rounds to zero milliseconds"
        )));
    }
    if ms > u64::MAX as f64 {
        return Err(IsolaError::invalid(format!(
            "timeout of {seconds}s overflows the millisecond range"
        )));
    }
    Ok(ms as u64)
}

/// A partial Context configuration; see [`Context::configure`].
///
/// [`Context::configure`]: crate::Context::configure
#[derive(Debug, Default, Clone)]
pub struct ContextPatch {
    pub(crate) cache_dir: Option<Option<PathBuf>>,
    pub(crate) max_memory: Option<Option<u64>>,
    pub(crate) prelude: Option<Option<String>>,
    pub(crate) runtime_lib_dir: Option<Option<PathBuf>>,
    pub(crate) mounts: Option<Vec<MountConfig>>,
    pub(crate) env: Option<BTreeMap<String, String>>,
}

impl ContextPatch {
    /// Directory for cached compilation artifacts.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(Some(dir.into()));
        self
    }

    /// Disable the compilation cache.
    pub fn no_cache_dir(mut self) -> Self {
        self.cache_dir = Some(None);
        self
    }

    /// Default memory ceiling, in bytes, for sandboxes minted from this
    /// context.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(Some(bytes));
        self
    }

    /// Remove the default memory ceiling.
    pub fn unlimited_memory(mut self) -> Self {
        self.max_memory = Some(None);
        self
    }

    /// Source snippet prepended to every loaded script.
    pub fn prelude(mut self, source: impl Into<String>) -> Self {
        self.prelude = Some(Some(source.into()));
        self
    }

    /// Remove the prelude.
    pub fn no_prelude(mut self) -> Self {
        self.prelude = Some(None);
        self
    }

    /// Directory holding the guest interpreter's standard library.
    pub fn runtime_lib_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_lib_dir = Some(Some(dir.into()));
        self
    }

    /// Default mounts for sandboxes minted from this context.
    pub fn mounts(mut self, mounts: Vec<MountConfig>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    /// Default environment for sandboxes minted from this context.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Whether this patch touches fields baked into the template.
    pub(crate) fn touches_template(&self) -> bool {
        self.cache_dir.is_some() || self.prelude.is_some() || self.runtime_lib_dir.is_some()
    }
}

/// A partial Sandbox configuration; see [`Sandbox::configure`].
///
/// [`Sandbox::configure`]: crate::Sandbox::configure
#[derive(Debug, Default, Clone)]
pub struct SandboxPatch {
    pub(crate) max_memory: Option<Option<u64>>,
    pub(crate) timeout_secs: Option<Option<f64>>,
    pub(crate) mounts: Option<Vec<MountConfig>>,
    pub(crate) env: Option<BTreeMap<String, String>>,
}

impl SandboxPatch {
    /// Memory ceiling, in bytes, for this sandbox.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = Some(Some(bytes));
        self
    }

    /// Remove the memory ceiling for this sandbox.
    pub fn unlimited_memory(mut self) -> Self {
        self.max_memory = Some(None);
        self
    }

    /// Per-call timeout in seconds; canonicalized to whole milliseconds at
    /// configure time.
    pub fn timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout_secs = Some(Some(seconds));
        self
    }

    /// Remove the timeout for this sandbox.
    pub fn no_timeout(mut self) -> Self {
        self.timeout_secs = Some(None);
        self
    }

    /// Mounts for this sandbox, replacing any inherited list.
    pub fn mounts(mut self, mounts: Vec<MountConfig>) -> Self {
        self.mounts = Some(mounts);
        self
    }

    /// Environment for this sandbox, replacing any inherited map.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }
}

/// Resolved context configuration.
#[derive(Debug, Default, Clone)]
pub(crate) struct ContextConfig {
    pub(crate) cache_dir: Option<PathBuf>,
    pub(crate) max_memory: Option<u64>,
    pub(crate) prelude: Option<String>,
    pub(crate) runtime_lib_dir: Option<PathBuf>,
    pub(crate) mounts: Vec<MountConfig>,
    pub(crate) env: BTreeMap<String, String>,
}

impl ContextConfig {
    /// Merge a validated patch into the current configuration.
    pub(crate) fn apply(&mut self, patch: ContextPatch) -> Result<()> {
        if let Some(mounts) = &patch.mounts {
            for mount in mounts {
                mount.to_wire()?;
            }
        }
        if let Some(dir) = patch.cache_dir {
            self.cache_dir = dir;
        }
        if let Some(limit) = patch.max_memory {
            self.max_memory = limit;
        }
        if let Some(prelude) = patch.prelude {
            self.prelude = prelude;
        }
        if let Some(dir) = patch.runtime_lib_dir {
            self.runtime_lib_dir = dir;
        }
        if let Some(mounts) = patch.mounts {
            self.mounts = mounts;
        }
        if let Some(env) = patch.env {
            self.env = env;
        }
        Ok(())
    }
}

/// Resolved per-sandbox limits, seeded from the context defaults.
#[derive(Debug, Default, Clone)]
pub(crate) struct SandboxLimits {
    pub(crate) max_memory: Option<u64>,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) mounts: Vec<MountConfig>,
    pub(crate) env: BTreeMap<String, String>,
}

impl SandboxLimits {
    pub(crate) fn from_context(config: &ContextConfig) -> Self {
        Self {
            max_memory: config.max_memory,
            timeout_ms: None,
            mounts: config.mounts.clone(),
            env: config.env.clone(),
        }
    }

    /// Merge a patch, canonicalizing the timeout.
    pub(crate) fn apply(&mut self, patch: SandboxPatch) -> Result<()> {
        // Validate everything before mutating so a bad patch is a no-op.
        let timeout_ms = match patch.timeout_secs {
            Some(Some(seconds)) => Some(Some(canonical_timeout_ms(seconds)?)),
            Some(None) => Some(None),
            None => None,
        };
        if let Some(mounts) = &patch.mounts {
            for mount in mounts {
                mount.to_wire()?;
            }
        }
        if let Some(limit) = patch.max_memory {
            self.max_memory = limit;
        }
        if let Some(timeout) = timeout_ms {
            self.timeout_ms = timeout;
        }
        if let Some(mounts) = patch.mounts {
            self.mounts = mounts;
        }
        if let Some(env) = patch.env {
            self.env = env;
        }
        Ok(())
    }

    pub(crate) fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Compact JSON wire form handed to the guest runtime at startup.
    pub(crate) fn to_wire_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Wire<'a> {
            max_memory: Option<u64>,
            timeout_ms: Option<u64>,
            mounts: Vec<MountWire>,
            env: &'a BTreeMap<String, String>,
        }
        let mounts = self
            .mounts
            .iter()
            .map(MountConfig::to_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_string(&Wire {
            max_memory: self.max_memory,
            timeout_ms: self.timeout_ms,
            mounts,
            env: &self.env,
        })?)
    }
}

/// Resolve the guest interpreter image inside a runtime directory.
///
/// Accepts `python3.wasm` either at the root or under `bin/`.
pub(crate) fn resolve_runtime_wasm(runtime_path: &Path) -> Result<PathBuf> {
    if !runtime_path.is_dir() {
        return Err(IsolaError::invalid(format!(
            "runtime directory '{}' does not exist",
            runtime_path.display()
        )));
    }
    for candidate in [
        runtime_path.join("python3.wasm"),
        runtime_path.join("bin").join("python3.wasm"),
    ] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(IsolaError::invalid(format!(
        "runtime directory '{}' does not contain python3.wasm",
        runtime_path.display()
    )))
}
