//! Structured wasm expression IR.
//!
//! The reader rebuilds this tree from the flat operator stream of a wasm
//! binary. Only the post-normalization subset survives to lowering: i64 has
//! been split into i32 pairs upstream, control flow carries no values, and
//! the exotic numeric ops (rotates, popcount, copysign, float rounding) have
//! been legalized away. The tree still *represents* some of those operators
//! so the lowerer can reject them with a precise error.

/// A wasm value type after i64 lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValTy {
    I32,
    F32,
    F64,
}

impl ValTy {
    pub fn is_float(self) -> bool {
        !matches!(self, ValTy::I32)
    }
}

/// The type of an expression: `None` means it leaves nothing on the stack.
pub type ExprTy = Option<ValTy>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    I32(i32),
    F32(f32),
    F64(f64),
}

impl Literal {
    pub fn ty(self) -> ValTy {
        match self {
            Literal::I32(_) => ValTy::I32,
            Literal::F32(_) => ValTy::F32,
            Literal::F64(_) => ValTy::F64,
        }
    }
}

/// Binary operators. f32 and f64 collapse onto one float family: both lower
/// to the AVM2 Number type and the distinction is carried by load/store
/// widths, not by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // i32 arithmetic
    AddI32,
    SubI32,
    MulI32,
    DivSI32,
    DivUI32,
    RemSI32,
    RemUI32,
    AndI32,
    OrI32,
    XorI32,
    ShlI32,
    ShrSI32,
    ShrUI32,
    RotlI32,
    RotrI32,
    // i32 comparisons
    EqI32,
    NeI32,
    LtSI32,
    LtUI32,
    LeSI32,
    LeUI32,
    GtSI32,
    GtUI32,
    GeSI32,
    GeUI32,
    // float arithmetic
    AddF,
    SubF,
    MulF,
    DivF,
    MinF,
    MaxF,
    CopySignF,
    // float comparisons
    EqF,
    NeF,
    LtF,
    LeF,
    GtF,
    GeF,
}

impl BinOp {
    /// Result type on the wasm stack.
    pub fn result_ty(self) -> ValTy {
        use BinOp::*;
        match self {
            AddF | SubF | MulF | DivF | MinF | MaxF | CopySignF => ValTy::F64,
            _ => ValTy::I32,
        }
    }

    /// Comparison operators produce an i32 boolean from two operands.
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(
            self,
            EqI32
                | NeI32
                | LtSI32
                | LtUI32
                | LeSI32
                | LeUI32
                | GtSI32
                | GtUI32
                | GeSI32
                | GeUI32
                | EqF
                | NeF
                | LtF
                | LeF
                | GtF
                | GeF
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    // i32
    ClzI32,
    CtzI32,
    PopcntI32,
    EqzI32,
    Extend8S,
    Extend16S,
    // float
    NegF,
    AbsF,
    CeilF,
    FloorF,
    TruncF,
    NearestF,
    SqrtF,
    // conversions
    TruncSFToI32,
    TruncUFToI32,
    ConvertSI32ToF,
    ConvertUI32ToF,
    PromoteF32,
    DemoteF64,
    ReinterpretF32,
    ReinterpretI32,
}

impl UnOp {
    pub fn result_ty(self) -> ValTy {
        use UnOp::*;
        match self {
            ClzI32 | CtzI32 | PopcntI32 | EqzI32 | Extend8S | Extend16S | TruncSFToI32
            | TruncUFToI32 | ReinterpretF32 => ValTy::I32,
            DemoteF64 | ReinterpretI32 => ValTy::F32,
            _ => ValTy::F64,
        }
    }
}

/// A wasm expression node.
#[derive(Debug, Clone)]
pub enum Expr {
    Block {
        name: Option<String>,
        children: Vec<Expr>,
        ty: ExprTy,
    },
    Loop {
        name: Option<String>,
        body: Box<Expr>,
        ty: ExprTy,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
        ty: ExprTy,
    },
    Break {
        name: String,
        cond: Option<Box<Expr>>,
        value: Option<Box<Expr>>,
    },
    Switch {
        cond: Box<Expr>,
        names: Vec<String>,
        default: String,
    },
    Call {
        target: String,
        operands: Vec<Expr>,
        ty: ExprTy,
    },
    CallIndirect {
        target: Box<Expr>,
        operands: Vec<Expr>,
        ty: ExprTy,
    },
    LocalGet {
        index: u32,
        ty: ValTy,
    },
    LocalSet {
        index: u32,
        value: Box<Expr>,
        tee: bool,
    },
    GlobalGet {
        name: String,
        ty: ValTy,
    },
    GlobalSet {
        name: String,
        value: Box<Expr>,
    },
    Load {
        ptr: Box<Expr>,
        offset: u32,
        bytes: u8,
        signed: bool,
        ty: ValTy,
    },
    Store {
        ptr: Box<Expr>,
        value: Box<Expr>,
        offset: u32,
        bytes: u8,
        ty: ValTy,
    },
    Const(Literal),
    Unary {
        op: UnOp,
        value: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Select {
        if_true: Box<Expr>,
        if_false: Box<Expr>,
        cond: Box<Expr>,
    },
    Drop {
        value: Box<Expr>,
    },
    Return {
        value: Option<Box<Expr>>,
    },
    MemorySize,
    MemoryGrow {
        pages: Box<Expr>,
    },
    Nop,
    Unreachable,
}

impl Expr {
    /// The number and type of values this expression leaves on the stack.
    pub fn ty(&self) -> ExprTy {
        match self {
            Expr::Block { ty, .. } | Expr::Loop { ty, .. } | Expr::If { ty, .. } => *ty,
            Expr::Break { .. } | Expr::Switch { .. } => None,
            Expr::Call { ty, .. } | Expr::CallIndirect { ty, .. } => *ty,
            Expr::LocalGet { ty, .. } | Expr::GlobalGet { ty, .. } | Expr::Load { ty, .. } => {
                Some(*ty)
            }
            Expr::LocalSet { value, tee, .. } => {
                if *tee {
                    value.ty()
                } else {
                    None
                }
            }
            Expr::GlobalSet { .. } | Expr::Store { .. } | Expr::Drop { .. } => None,
            Expr::Const(lit) => Some(lit.ty()),
            Expr::Unary { op, .. } => Some(op.result_ty()),
            Expr::Binary { op, .. } => Some(op.result_ty()),
            Expr::Select { if_true, .. } => if_true.ty(),
            Expr::Return { .. } | Expr::Nop | Expr::Unreachable => None,
            Expr::MemorySize | Expr::MemoryGrow { .. } => Some(ValTy::I32),
        }
    }

    /// The side-effect predicate used to justify operand reordering for
    /// stores and indirect calls. Loads are treated as composite: the
    /// pointer operand must itself be effect-free.
    pub fn effect_free(&self) -> bool {
        match self {
            Expr::Const(_) | Expr::LocalGet { .. } | Expr::GlobalGet { .. } | Expr::Nop => true,
            Expr::Load { ptr, .. } => ptr.effect_free(),
            Expr::Unary { value, .. } => value.effect_free(),
            Expr::Binary { lhs, rhs, .. } => lhs.effect_free() && rhs.effect_free(),
            Expr::Select {
                if_true,
                if_false,
                cond,
            } => if_true.effect_free() && if_false.effect_free() && cond.effect_free(),
            _ => false,
        }
    }
}

/// A function, imported or defined.
#[derive(Debug, Clone)]
pub struct WasmFunction {
    pub name: String,
    /// `Some((module, base))` for imported functions; they have no body and
    /// are lowered as forwarding thunks.
    pub import: Option<(String, String)>,
    pub params: Vec<ValTy>,
    pub result: ExprTy,
    /// Declared locals, appended after the parameters.
    pub locals: Vec<ValTy>,
    pub body: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct WasmGlobal {
    pub name: String,
    pub ty: ValTy,
    pub mutable: bool,
    pub init: Literal,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TableSegment {
    pub offset: u32,
    /// Function names in table order.
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Global,
    Memory,
    Table,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    /// Internal name of the exported item; empty for memory and table.
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub struct WasmModule {
    pub functions: Vec<WasmFunction>,
    pub globals: Vec<WasmGlobal>,
    pub data_segments: Vec<DataSegment>,
    pub table_segments: Vec<TableSegment>,
    pub exports: Vec<Export>,
    /// Start function name, invoked at the end of instance construction.
    pub start: Option<String>,
}

impl WasmModule {
    pub fn global(&self, name: &str) -> Option<&WasmGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }
}
