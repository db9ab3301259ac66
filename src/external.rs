//! External interfaces (C16, §6): narrow, read-only/callback contracts with
//! the disassembler, loader, type database, and pretty-printer. This crate
//! implements neither side — only the contracts the core drives or is
//! driven through.

use crate::address::{Address, SeqNum};
use crate::opcode::OpCode;
use crate::valuecell::ValueId;

/// Opaque handle into the (externally owned) type database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaType {
    Unknown,
    Int,
    UInt,
    Bool,
    Float,
    Pointer,
    Code,
    Struct,
    Union,
    Array,
}

/// One resolvable field of a composite type, as reported by the type
/// database's shape query — enough for the propagation/union-resolution
/// logic of C9 without this crate owning the composite's full layout.
#[derive(Debug, Clone)]
pub struct CompositeField {
    pub field_number: u32,
    pub byte_offset: u64,
    pub size: u32,
    pub field_type: TypeId,
}

/// The shape of a type, as far as C9's propagation rules need to know it.
#[derive(Debug, Clone)]
pub enum TypeShape {
    Scalar { size: u32, meta: MetaType },
    Pointer { element: TypeId, size: u32 },
    Composite { fields: Vec<CompositeField>, is_union: bool, size: u32 },
    Code,
}

/// Read-only queries into the externally owned type database (§6).
pub trait TypeDatabase {
    fn get_base(&self, size: u32, metatype: MetaType) -> TypeId;
    fn get_pointer(&self, size: u32, element: TypeId, word_size: u32) -> TypeId;
    fn get_typedef_immediate(&self, ty: TypeId) -> Option<TypeId>;
    fn get_exact_piece(&self, composite: TypeId, byte_offset: u64, size: u32) -> Option<TypeId>;
    fn shape(&self, ty: TypeId) -> TypeShape;
    fn size_of(&self, ty: TypeId) -> u32 {
        match self.shape(ty) {
            TypeShape::Scalar { size, .. } | TypeShape::Pointer { size, .. } | TypeShape::Composite { size, .. } => size,
            TypeShape::Code => 0,
        }
    }
}

/// Result of a loader byte fetch (§6).
pub enum LoadResult<'a> {
    Ok(&'a [u8]),
    Unavailable,
}

/// Read-only byte provider backing constant folds (§6, §7 "Data
/// unavailable").
pub trait Loader {
    fn load_fill(&self, buffer: &mut [u8], address: Address) -> LoadResult<'_>;
}

/// Callback shape the disassembler drives the engine through while emitting
/// p-code in instruction order (§6).
pub trait PcodeSink {
    fn emit(&mut self, seq: SeqNum, opcode: OpCode, output: Option<ValueId>, inputs: &[ValueId], starts_block: bool);
}

/// Visitor the pretty-printer drives over the finished structured tree
/// (§6). Expressions are pushed in reverse evaluation order to drive a
/// shunting-yard token emitter on the other side; this crate only defines
/// the seam.
pub trait PrettyPrinterVisitor {
    fn push_atom(&mut self, text: &str);
    fn push_op(&mut self, opcode: OpCode);
    fn push_scope(&mut self);
    fn pop_scope(&mut self);
}

/// Opaque persisted-state codec seam (§6). This crate defines the trait
/// boundary only; the wire format (XML/binary) is out of scope (§1).
pub trait Encoder {
    fn open_element(&mut self, tag: &str);
    fn close_element(&mut self, tag: &str);
    fn attribute(&mut self, name: &str, value: &str);
}

pub trait Decoder {
    fn expect_element(&mut self, tag: &str) -> anyhow::Result<()>;
    fn attribute(&mut self, name: &str) -> Option<String>;
}
