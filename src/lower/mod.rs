//! Wasm-to-AVM2 lowering: the per-expression translator and the function
//! wrapper that attaches emitted bodies to the instance class.

mod expr;
mod func;

pub(crate) use func::{lower_function, lower_import};
