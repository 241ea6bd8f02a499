//! The process-wide factory: template preparation and sandbox minting.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{Level, instrument};

use crate::config::{ContextConfig, ContextPatch, SandboxLimits, resolve_runtime_wasm};
use crate::error::{IsolaError, Result};
use crate::guest::Template;
use crate::metrics::SandboxMetricsGuard;
use crate::sandbox::Sandbox;

struct ContextState {
    config: ContextConfig,
    template: Option<Arc<Template>>,
    closed: bool,
}

/// Process-wide handle holding the immutable guest template and shared
/// sandbox defaults.
///
/// Created once by the host, configured before the template is
/// initialized, then used to mint [`Sandbox`] instances cheaply — the
/// template is referenced, never copied.
pub struct Context {
    state: Mutex<ContextState>,
    // metric drop guard to manage context gauge
    _metric_guard: SandboxMetricsGuard<Context>,
}

impl Context {
    /// Allocate a fresh template holder with empty defaults.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState {
                config: ContextConfig::default(),
                template: None,
                closed: false,
            }),
            _metric_guard: SandboxMetricsGuard::new(),
        }
    }

    /// Merge a partial configuration.
    ///
    /// May be repeated freely before [`initialize_template`]; afterwards
    /// only non-template fields (memory ceiling, env, mounts) may change.
    ///
    /// [`initialize_template`]: Self::initialize_template
    ///
    /// # Errors
    ///
    /// [`IsolaError::InvalidArgument`] for invalid mounts or a
    /// template-affecting change after initialization;
    /// [`IsolaError::Internal`] after [`close`](Self::close).
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub fn configure(&self, patch: ContextPatch) -> Result<()> {
        let mut state = self.state.lock().expect("context state poisoned");
        if state.closed {
            return Err(IsolaError::internal("context is closed"));
        }
        if state.template.is_some() && patch.touches_template() {
            return Err(IsolaError::invalid(
                "cache_dir, prelude and runtime_lib_dir are fixed once the template is initialized",
            ));
        }
        state.config.apply(patch)
    }

    /// Load and prepare the guest interpreter image from `runtime_path`.
    ///
    /// Blocking and potentially expensive; the compilation runs on a
    /// worker. Must be called exactly once before any
    /// [`instantiate`](Self::instantiate).
    ///
    /// # Errors
    ///
    /// [`IsolaError::InvalidArgument`] when the runtime directory (or its
    /// `python3.wasm`) is missing; [`IsolaError::Internal`] for an
    /// irrecoverable loader failure or a repeated call.
    #[instrument(err(Debug), skip(self), level = Level::INFO, fields(version = env!("CARGO_PKG_VERSION")))]
    pub async fn initialize_template(&self, runtime_path: impl Into<PathBuf> + std::fmt::Debug) -> Result<()> {
        let runtime_path = runtime_path.into();
        let cache_dir = {
            let state = self.state.lock().expect("context state poisoned");
            if state.closed {
                return Err(IsolaError::internal("context is closed"));
            }
            if state.template.is_some() {
                return Err(IsolaError::internal("template is already initialized"));
            }
            state.config.cache_dir.clone()
        };
        // Surface the missing-directory case before paying for a worker.
        resolve_runtime_wasm(&runtime_path)?;

        let template = tokio::task::spawn_blocking(move || {
            Template::load(&runtime_path, cache_dir.as_deref())
        })
        .await
        .map_err(|e| IsolaError::internal(format!("template loader failed: {e}")))??;

        let mut state = self.state.lock().expect("context state poisoned");
        if state.closed {
            return Err(IsolaError::internal("context is closed"));
        }
        if state.template.is_some() {
            return Err(IsolaError::internal("template is already initialized"));
        }
        state.template = Some(template);
        Ok(())
    }

    /// Derive a new [`Sandbox`] from the template with the context's
    /// current defaults. Cheap; template state is referenced, not copied.
    ///
    /// # Errors
    ///
    /// [`IsolaError::Internal`] before [`initialize_template`] or after
    /// [`close`](Self::close).
    ///
    /// [`initialize_template`]: Self::initialize_template
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub async fn instantiate(&self) -> Result<Sandbox> {
        let (template, limits, runtime_lib_dir, prelude) = {
            let state = self.state.lock().expect("context state poisoned");
            if state.closed {
                return Err(IsolaError::internal("context is closed"));
            }
            let template = state
                .template
                .clone()
                .ok_or_else(|| IsolaError::internal("template is not initialized"))?;
            (
                template,
                SandboxLimits::from_context(&state.config),
                state.config.runtime_lib_dir.clone(),
                state.config.prelude.clone(),
            )
        };
        Sandbox::new(template, limits, runtime_lib_dir, prelude, Handle::current())
    }

    /// Release the template and mark the context unusable.
    ///
    /// Sandboxes already minted keep the template alive until they close;
    /// no new ones can be created.
    #[instrument(skip_all, level = Level::INFO)]
    pub async fn close(&self) {
        let template = {
            let mut state = self.state.lock().expect("context state poisoned");
            state.closed = true;
            state.template.take()
        };
        if let Some(template) = template {
            // Dropping the last reference joins the epoch ticker; keep
            // that off the scheduler.
            let _ = tokio::task::spawn_blocking(move || drop(template)).await;
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("context state poisoned");
        f.debug_struct("Context")
            .field("initialized", &state.template.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn configure_before_template_is_repeatable() {
        let context = Context::new();
        context
            .configure(ContextPatch::default().max_memory(1024))
            .unwrap();
        context
            .configure(ContextPatch::default().prelude("import sandbox"))
            .unwrap();
        context
            .configure(
                ContextPatch::default().env(BTreeMap::from([("A".into(), "1".into())])),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn initialize_template_rejects_missing_directory() {
        let context = Context::new();
        let err = context
            .initialize_template("/definitely/not/a/runtime")
            .await
            .unwrap_err();
        assert!(matches!(err, IsolaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn initialize_template_requires_the_interpreter_image() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::new();
        let err = context
            .initialize_template(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, IsolaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn instantiate_without_template_is_internal() {
        let context = Context::new();
        let err = context.instantiate().await.unwrap_err();
        assert!(matches!(err, IsolaError::Internal(_)));
    }

    #[tokio::test]
    async fn instantiate_after_close_is_internal() {
        let context = Context::new();
        context.close().await;
        let err = context.instantiate().await.unwrap_err();
        assert!(matches!(err, IsolaError::Internal(_)));
        assert!(context.configure(ContextPatch::default()).is_err());
    }
}
