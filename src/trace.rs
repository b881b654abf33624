//! Debug and trace instrumentation configuration.
//!
//! Instrumentation is interleaved at expression boundaries by the lowerers
//! and never changes the effective stack depth.

#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    /// Emit debugfile/debugline at statement boundaries.
    pub debug: bool,
    /// Trace function entry plus every statement.
    pub trace: bool,
    /// Trace function entry only.
    pub trace_funcs: bool,
    /// When non-empty, only these functions are instrumented.
    pub trace_only: Vec<String>,
    /// Functions never instrumented.
    pub trace_exclude: Vec<String>,
    /// Source file name reported by debugfile.
    pub source_file: Option<String>,
}

impl TraceConfig {
    fn selected(&self, name: &str) -> bool {
        if !self.trace_only.is_empty() && !self.trace_only.iter().any(|f| f == name) {
            return false;
        }
        !self.trace_exclude.iter().any(|f| f == name)
    }

    /// Trace at function entry?
    pub fn traces_function(&self, name: &str) -> bool {
        (self.trace || self.trace_funcs) && self.selected(name)
    }

    /// Trace at every statement boundary?
    pub fn traces_statements(&self, name: &str) -> bool {
        self.trace && self.selected(name)
    }

    pub fn source_name(&self) -> &str {
        self.source_file.as_deref().unwrap_or("module.wasm")
    }
}
