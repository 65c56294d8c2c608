//! The stack-frame contract between the resolver and a stack walker.
//!
//! The walker owns the frames; it hands each one to the resolver with
//! the instruction address, module load base, and register state
//! filled in, and gets the symbolic fields written back.

/// A recovered function parameter, ready for display.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParamInfo {
    pub type_name: String,
    /// Size of the parameter's type in bytes.
    pub type_size: u64,
    pub name: String,
    /// Human-readable rendering of the parameter's bytes. Empty when
    /// the value could not be recovered.
    pub value: String,
}

/// One frame of a stack walk, as seen by the resolver.
pub trait StackFrame {
    /// Absolute address of the instruction this frame is executing.
    fn instruction(&self) -> u64;

    /// Load address of the module containing the instruction.
    fn module_base(&self) -> u64;

    /// Value of the DWARF-numbered register `index` in this frame.
    /// Registers the walker does not track read as 0.
    fn reg_value(&self, index: u64) -> u64;

    /// The frame base for this frame, or 0 when the walker could not
    /// establish one.
    fn frame_base(&self) -> u64;

    /// Records the resolved function name and its absolute start.
    fn set_function(&mut self, name: &str, base: u64);

    /// Records the resolved source position. `file` is `None` when the
    /// line record referenced a file id missing from the symbol file.
    fn set_source_line(&mut self, file: Option<&str>, line: u32, base: u64);

    /// Replaces the recovered parameter values.
    fn set_params(&mut self, params: Vec<ParamInfo>);
}

/// A [`StackFrame`] backed by plain fields, for tests and consumers
/// that do not carry their own frame representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimpleFrame {
    pub instruction: u64,
    pub module_base: u64,
    /// Register file, indexed by DWARF register number.
    pub registers: Vec<u64>,
    pub frame_base: u64,

    pub function_name: Option<String>,
    pub function_base: u64,
    pub source_file_name: Option<String>,
    pub source_line: u32,
    pub source_line_base: u64,
    pub params: Vec<ParamInfo>,
}

impl StackFrame for SimpleFrame {
    fn instruction(&self) -> u64 {
        self.instruction
    }

    fn module_base(&self) -> u64 {
        self.module_base
    }

    fn reg_value(&self, index: u64) -> u64 {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.registers.get(i).copied())
            .unwrap_or(0)
    }

    fn frame_base(&self) -> u64 {
        self.frame_base
    }

    fn set_function(&mut self, name: &str, base: u64) {
        self.function_name = Some(name.to_string());
        self.function_base = base;
    }

    fn set_source_line(&mut self, file: Option<&str>, line: u32, base: u64) {
        self.source_file_name = file.map(str::to_string);
        self.source_line = line;
        self.source_line_base = base;
    }

    fn set_params(&mut self, params: Vec<ParamInfo>) {
        self.params = params;
    }
}
