use thiserror::Error;

/// Fatal compilation errors. There is no local recovery: the first error
/// aborts the whole run.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An expression kind or operator the lowering engine cannot express in
    /// AVM2. Seeing one of these normally means the module skipped the
    /// upstream normalization passes.
    #[error("unsupported construct in {func}: {construct}")]
    Unsupported { func: String, construct: String },

    /// Structurally invalid input: a label reference without an enclosing
    /// binding, a branch carrying a value, a non-constant global initializer,
    /// and similar.
    #[error("malformed module in {func}: {message}")]
    Malformed { func: String, message: String },

    /// Emitter invariant violation: operand-stack underflow, a label bound
    /// twice, a trait name collision.
    #[error("internal error in {func}: {message}")]
    Internal { func: String, message: String },

    #[error("invalid wasm module: {0}")]
    Parse(String),
}

impl CompileError {
    pub fn unsupported(func: &str, construct: impl Into<String>) -> Self {
        CompileError::Unsupported {
            func: func.to_string(),
            construct: construct.into(),
        }
    }

    pub fn malformed(func: &str, message: impl Into<String>) -> Self {
        CompileError::Malformed {
            func: func.to_string(),
            message: message.into(),
        }
    }

    pub fn internal(func: &str, message: impl Into<String>) -> Self {
        CompileError::Internal {
            func: func.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
