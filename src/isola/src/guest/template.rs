//! The prepared, immutable guest interpreter image.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{Level, instrument};
use wasmtime::{Config, Engine, Module};

use crate::config::resolve_runtime_wasm;
use crate::error::{IsolaError, Result};

/// How often the ticker advances the engine epoch. Bounds how late a
/// timeout or kill can be observed by compute-bound guest code.
const EPOCH_TICK: Duration = Duration::from_millis(5);

/// A compiled guest interpreter image shared read-only across sandboxes.
///
/// Instantiation references the module; nothing is copied per sandbox.
pub(crate) struct Template {
    engine: Engine,
    module: Module,
    _ticker: EpochTicker,
}

impl Template {
    /// Load and prepare the interpreter image from a runtime directory.
    ///
    /// Blocking and potentially expensive; run it on a worker.
    #[instrument(err(Debug), skip(cache_dir), level = Level::INFO)]
    pub(crate) fn load(runtime_path: &Path, cache_dir: Option<&Path>) -> Result<Arc<Self>> {
        let wasm_path = resolve_runtime_wasm(runtime_path)?;

        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| IsolaError::internal(format!("failed to create engine: {e:#}")))?;

        let module = load_module(&engine, &wasm_path, cache_dir)?;
        let ticker = EpochTicker::start(engine.clone());

        Ok(Arc::new(Self {
            engine,
            module,
            _ticker: ticker,
        }))
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template").finish()
    }
}

/// Compile the interpreter module, going through the compilation cache when
/// a cache directory is configured.
fn load_module(engine: &Engine, wasm_path: &Path, cache_dir: Option<&Path>) -> Result<Module> {
    let Some(cache_dir) = cache_dir else {
        return Module::from_file(engine, wasm_path)
            .map_err(|e| IsolaError::internal(format!("failed to load runtime module: {e:#}")));
    };

    let cached = cache_key(wasm_path).map(|key| cache_dir.join(key));
    if let Some(path) = cached.as_deref()
        && path.is_file()
    {
        // SAFETY: the artifact was produced below by `Module::serialize` on
        // this host with a same-version engine; the key ties it to the
        // source image's length and mtime.
        match unsafe { Module::deserialize_file(engine, path) } {
            Ok(module) => return Ok(module),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding stale module cache");
            }
        }
    }

    let module = Module::from_file(engine, wasm_path)
        .map_err(|e| IsolaError::internal(format!("failed to load runtime module: {e:#}")))?;

    if let Some(path) = cached {
        let write = module
            .serialize()
            .map_err(|e| IsolaError::internal(format!("failed to serialize module: {e:#}")))
            .and_then(|bytes| {
                std::fs::create_dir_all(cache_dir).map_err(|e| {
                    IsolaError::internal(format!("failed to create cache directory: {e}"))
                })?;
                std::fs::write(&path, bytes)
                    .map_err(|e| IsolaError::internal(format!("failed to write module cache: {e}")))
            });
        if let Err(e) = write {
            // A cold cache is not a failure.
            tracing::warn!(path = %path.display(), error = %e, "failed to populate module cache");
        }
    }
    Ok(module)
}

fn cache_key(wasm_path: &Path) -> Option<String> {
    let meta = std::fs::metadata(wasm_path).ok()?;
    let mtime = meta
        .modified()
        .ok()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .ok()?;
    Some(format!(
        "python3-{:x}-{:x}.cwasm",
        meta.len(),
        mtime.as_secs()
    ))
}

/// Background thread advancing the engine epoch until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("isola-epoch".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .expect("failed to spawn epoch ticker thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
