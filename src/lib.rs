//! flashback: compile WebAssembly modules to AVM2 bytecode in a loadable
//! SWF movie.
//!
//! The input binary is expected to have been normalized upstream (binaryen's
//! legalize-js-interface, remove-non-js-ops, flatten, i64-to-i32 lowering and
//! friends); this crate reads the surviving MVP-ish subset, re-expresses every
//! construct in AVM2 semantics, and wraps the resulting ABC class in a minimal
//! movie. Linear memory maps onto the application domain's backing ByteArray
//! so loads and stores compile to the single-operand li*/si* intrinsics.

pub mod abc;
pub mod assemble;
pub mod error;
mod lower;
pub mod output;
pub mod trace;
pub mod wasm;

pub use error::{CompileError, Result};
pub use trace::TraceConfig;

/// Compile a wasm binary to a raw ABC blob.
pub fn compile_to_abc(bytes: &[u8], cfg: &TraceConfig, sprite: bool) -> Result<Vec<u8>> {
    let module = wasm::read::parse_module(bytes)?;
    let abc = assemble::assemble(&module, cfg, sprite)?;
    output::write_abc(abc)
}

/// Compile a wasm binary to a SWF movie. With `sprite`, a `Wrapper` Sprite
/// subclass is registered as the SymbolClass for loader compatibility;
/// otherwise the instance class itself is.
pub fn compile_to_swf(bytes: &[u8], cfg: &TraceConfig, sprite: bool) -> Result<Vec<u8>> {
    let module = wasm::read::parse_module(bytes)?;
    let abc = assemble::assemble(&module, cfg, sprite)?;
    let abc_bytes = output::write_abc(abc)?;
    output::wrap_swf(&abc_bytes, if sprite { "Wrapper" } else { "Instance" })
}
