//! Data model types.
//!
//! Plain records parsed out of a symbol file. The owning [`Module`]
//! (crate root) creates these once at load time; they are immutable
//! afterwards, and lookups hand out borrows tied to the module.
//!
//! [`Module`]: crate::Module

use crate::range_map::RangeMap;

/// A mapping from a run of machine code to a source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLine {
    /// Start address relative to the module's load address.
    pub address: u64,
    /// Size of this range of instructions in bytes.
    pub size: u64,
    /// Source file that produced this code, as an id into the module's
    /// file table.
    pub file_id: u32,
    /// Line number within `file_id`. 0 marks code with no meaningful
    /// line, such as compiler-generated helpers.
    pub line: u32,
}

/// One step of a DWARF location expression, as dumped in a FUNC
/// record's parameter suffix.
///
/// The dumper pre-extracts each opcode's operands into up to two plain
/// values, so there is no inline byte stream to decode here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgLocInfo {
    /// Raw DWARF opcode byte.
    pub op: u8,
    pub loc_value1: u64,
    pub loc_value2: u64,
}

/// A formal parameter of a function, carrying the location expression
/// that finds its storage in a live frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncParam {
    pub type_name: String,
    /// Size of the parameter's type in bytes. 0 when the dumper could
    /// not size the type; such parameters are listed but never read.
    pub type_size: u64,
    pub name: String,
    /// Location expression program.
    pub locs: Vec<ArgLocInfo>,
}

/// A source-language function with a sized extent and line records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    /// Start address relative to the module's load address.
    pub address: u64,
    /// Size in bytes. Non-zero for every stored function.
    pub size: u64,
    /// Bytes of stack consumed by the function's parameters.
    pub parameter_size: u32,
    pub name: String,
    /// Line records covering this function. Lines within one function
    /// never overlap.
    pub lines: RangeMap<SourceLine>,
    /// Recoverable parameters, in declaration order.
    pub params: Vec<FuncParam>,
}

/// A linker symbol without size or line information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicSymbol {
    /// Address relative to the module's load address. Never 0 for a
    /// stored symbol.
    pub address: u64,
    /// Bytes of stack consumed by the function's parameters.
    pub parameter_size: u32,
    pub name: String,
}

/// Which fields of a [`WindowsFrameInfo`] carry data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowsFrameInfoValidity {
    /// The record came from a STACK WIN line; every field is set.
    All,
    /// Synthesized from a FUNC record; only `parameter_size` is set.
    ParameterSize,
}

/// The trailing field of a STACK WIN record, whose meaning depends on
/// the `has_program` flag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinStackProgram {
    /// A postfix program for the stack walker to evaluate.
    ProgramString(String),
    /// Whether the frame allocates its base pointer (FPO-style data).
    AllocatesBasePointer(bool),
}

/// MSVC frame information from a STACK WIN record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowsFrameInfo {
    pub valid: WindowsFrameInfoValidity,
    /// Code RVA this record covers.
    pub address: u64,
    /// Size of the covered code in bytes.
    pub size: u64,
    pub prologue_size: u32,
    pub epilogue_size: u32,
    /// Bytes of stack consumed by the function's parameters.
    pub parameter_size: u32,
    /// Bytes of stack used for callee-saved registers.
    pub saved_register_size: u32,
    /// Bytes of stack used for locals.
    pub local_size: u32,
    /// Maximum bytes this frame pushes onto the stack.
    pub max_stack_size: u32,
    pub program_string_or_base_pointer: WinStackProgram,
}

impl WindowsFrameInfo {
    /// Builds the reduced record handed out when only a FUNC's
    /// parameter size is known.
    pub fn from_parameter_size(parameter_size: u32) -> Self {
        Self {
            valid: WindowsFrameInfoValidity::ParameterSize,
            address: 0,
            size: 0,
            prologue_size: 0,
            epilogue_size: 0,
            parameter_size,
            saved_register_size: 0,
            local_size: 0,
            max_stack_size: 0,
            program_string_or_base_pointer: WinStackProgram::AllocatesBasePointer(false),
        }
    }
}

/// A STACK WIN record classified by its type tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WinFrameType {
    /// Type 0: frame-pointer-omission data.
    Fpo(WindowsFrameInfo),
    /// Type 4: frame data carrying its own program string.
    FrameData(WindowsFrameInfo),
    /// Types 1 through 3: valid in the format, unused for unwinding.
    Unhandled,
}
