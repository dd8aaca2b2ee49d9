//! Session-wide and per-run configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One execution provider requested for a session, in preference order,
/// with provider-specific option strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub options: Vec<(String, String)>,
}

/// Session-wide configuration, fixed before the session is created.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Graph optimization level requested from the external optimizer.
    pub graph_optimization_level: u32,
    pub enable_cpu_mem_arena: bool,
    pub enable_mem_pattern: bool,
    /// 0 = sequential, 1 = parallel node scheduling.
    pub execution_mode: u32,
    pub enable_profiling: bool,
    pub log_id: String,
    pub log_severity_level: u32,
    pub log_verbosity_level: u32,
    /// Where the optimizer should write the optimized model, if anywhere.
    pub optimized_model_path: Option<String>,
    /// Execution providers in preference order. The CPU provider is always
    /// available as the final fallback whether listed or not.
    pub providers: Vec<ProviderConfig>,
    /// Concrete values for named symbolic dimensions.
    pub free_dimension_overrides: HashMap<String, usize>,
    /// Free-form configuration entries.
    pub config_entries: HashMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            graph_optimization_level: 99,
            enable_cpu_mem_arena: true,
            enable_mem_pattern: true,
            execution_mode: 0,
            enable_profiling: false,
            log_id: String::new(),
            log_severity_level: 2,
            log_verbosity_level: 0,
            optimized_model_path: None,
            providers: Vec::new(),
            free_dimension_overrides: HashMap::new(),
            config_entries: HashMap::new(),
        }
    }
}

impl SessionOptions {
    /// Append an execution provider to the preference list.
    pub fn append_provider(
        &mut self,
        name: impl Into<String>,
        options: Vec<(String, String)>,
    ) {
        self.providers.push(ProviderConfig {
            name: name.into(),
            options,
        });
    }

    /// Pin a named symbolic dimension to a concrete value.
    pub fn add_free_dimension_override(&mut self, name: impl Into<String>, value: usize) {
        self.free_dimension_overrides.insert(name.into(), value);
    }

    /// Add a free-form configuration entry.
    pub fn add_config_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config_entries.insert(key.into(), value.into());
    }
}

/// Per-execution overrides, distinct from session-wide configuration.
///
/// The termination flag may be set by a concurrently-running request to
/// cooperatively cancel a long-running execution; the run loop observes it
/// between node invocations.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub log_severity_level: u32,
    pub log_verbosity_level: u32,
    pub tag: String,
    pub config_entries: HashMap<String, String>,
    terminate: Arc<AtomicBool>,
}

impl RunOptions {
    pub fn new(
        log_severity_level: u32,
        log_verbosity_level: u32,
        terminate: bool,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            log_severity_level,
            log_verbosity_level,
            tag: tag.into(),
            config_entries: HashMap::new(),
            terminate: Arc::new(AtomicBool::new(terminate)),
        }
    }

    /// Request cooperative termination of any run using these options (or
    /// withdraw the request).
    pub fn set_terminate(&self, terminate: bool) {
        self.terminate.store(terminate, Ordering::Relaxed);
    }

    /// Whether termination has been requested.
    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Add a free-form configuration entry.
    pub fn add_config_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config_entries.insert(key.into(), value.into());
    }
}
