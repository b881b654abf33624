//! Input side: the wasm expression IR and the binary reader.

pub mod ir;
pub mod read;
