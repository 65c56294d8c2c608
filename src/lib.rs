//! Resolves instruction addresses inside a crashed program back to
//! symbolic stack frames: function name, source position, live
//! parameter values, and the frame information needed to unwind to the
//! caller.
//!
//! Symbols arrive as the line-oriented text format produced by a
//! debug-info dumper (`MODULE`/`FILE`/`FUNC`/`PUBLIC`/`STACK` records).
//! [`Module::load_from_memory`] parses one binary's worth of that text
//! into address-keyed indices; a post-mortem stack walker then drives
//! [`Module::lookup_address`], [`Module::find_cfi_frame_info`], and
//! [`Module::find_windows_frame_info`] with the crash's memory image
//! and register state.
//!
//! A module is single-writer at construction and many-reader after:
//! once loaded it is immutable, and every lookup is a pure read, safe
//! to share across walker threads without synchronization. Malformed
//! symbol data is tolerated record by record; [`Module::is_corrupt`]
//! reports whether anything was dropped.

pub mod cfi;
pub mod dwarf_expr;
pub mod frame;
pub mod memory;
pub mod model;
pub mod range_map;

mod params;
mod sym_parser;

pub use self::cfi::CfiFrameInfo;
pub use self::frame::{ParamInfo, SimpleFrame, StackFrame};
pub use self::memory::{ImageMemory, MemoryRegion};
pub use self::model::*;
pub use self::range_map::RangeMap;
pub use self::sym_parser::ParseError;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::{debug, error};

use crate::sym_parser::StackRecord;

/// Parse errors reported in full before the rest are only counted.
const MAX_ERRORS_LOGGED: u32 = 5;
/// Error count past which the rest of the file is abandoned.
const MAX_ERRORS_BEFORE_BAILING: u32 = 100;

/// One binary's symbols and unwind information.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    files: BTreeMap<u32, String>,
    functions: RangeMap<Function>,
    public_symbols: BTreeMap<u64, PublicSymbol>,
    win_frame_data_info: RangeMap<WindowsFrameInfo>,
    win_fpo_info: RangeMap<WindowsFrameInfo>,
    cfi_initial_rules: RangeMap<String>,
    cfi_delta_rules: BTreeMap<u64, String>,
    is_corrupt: bool,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when at least one record was rejected during load. The
    /// module stays usable with whatever did parse.
    pub fn is_corrupt(&self) -> bool {
        self.is_corrupt
    }

    /// Path recorded for file id `id` by a FILE record.
    pub fn file_name(&self, id: u32) -> Option<&str> {
        self.files.get(&id).map(String::as_str)
    }

    /// Parses a dumped symbol file into this module.
    ///
    /// The buffer is consumed destructively: stray NUL bytes are
    /// rewritten for tokenization and the final byte is forced to a
    /// terminator. Malformed records are logged, counted, and dropped
    /// rather than failing the load; past a hundred of them the rest
    /// of the buffer is abandoned.
    ///
    /// Returns true whenever the buffer itself was readable, which for
    /// an in-memory slice is always; [`Module::is_corrupt`] carries
    /// the quality signal.
    pub fn load_from_memory(&mut self, buffer: &mut [u8]) -> bool {
        // A zero-length symbol file is a legitimate empty module.
        if buffer.is_empty() {
            return true;
        }

        let mut num_errors: u32 = 0;

        // The last byte must terminate the final record.
        let last = buffer.len() - 1;
        if buffer[last] != 0 {
            buffer[last] = 0;
        }
        let mut end = last;
        while end > 0 && buffer[end - 1] == 0 {
            end -= 1;
        }

        // NULs anywhere else would end tokenization early; neuter them.
        let mut had_nul = false;
        for byte in &mut buffer[..end] {
            if *byte == 0 {
                *byte = b'_';
                had_nul = true;
            }
        }
        if had_nul {
            log_parse_error(&ParseError::EmbeddedNul, 0, &mut num_errors);
        }

        let mut cur_func: Option<Function> = None;
        let mut line_number: u32 = 0;

        for record in buffer[..end].split(|&b| b == b'\r' || b == b'\n') {
            if record.is_empty() {
                continue;
            }
            line_number += 1;

            match std::str::from_utf8(record) {
                Ok(text) => self.parse_record(text, &mut cur_func, line_number, &mut num_errors),
                Err(_) => log_parse_error(&ParseError::NotUtf8, line_number, &mut num_errors),
            }

            if num_errors > MAX_ERRORS_BEFORE_BAILING {
                error!("too many errors in symbol data, abandoning the rest");
                break;
            }
        }
        self.commit_function(cur_func.take());

        if num_errors > 0 {
            error!("symbol data produced {num_errors} parse errors");
        }
        self.is_corrupt = num_errors > 0;
        true
    }

    fn parse_record(
        &mut self,
        line: &str,
        cur_func: &mut Option<Function>,
        line_number: u32,
        num_errors: &mut u32,
    ) {
        if let Some(rest) = line.strip_prefix("FILE ") {
            match sym_parser::parse_file_record(rest) {
                Ok((id, name)) => {
                    self.files.insert(id, name);
                }
                Err(err) => log_parse_error(&err, line_number, num_errors),
            }
        } else if let Some(rest) = line.strip_prefix("STACK ") {
            match sym_parser::parse_stack_record(rest) {
                Ok(record) => self.store_stack_record(record),
                Err(err) => log_parse_error(&err, line_number, num_errors),
            }
        } else if let Some(rest) = line.strip_prefix("FUNC ") {
            // A new function closes out the previous one's line list.
            self.commit_function(cur_func.take());
            match sym_parser::parse_function(rest) {
                Ok(func) => *cur_func = Some(func),
                Err(err) => log_parse_error(&err, line_number, num_errors),
            }
        } else if let Some(rest) = line.strip_prefix("PUBLIC ") {
            // Public symbols carry no line records; close the open
            // function so stray lines below get flagged.
            self.commit_function(cur_func.take());
            match sym_parser::parse_public_symbol(rest) {
                Ok(symbol) => {
                    if !self.store_public_symbol(symbol) {
                        log_parse_error(&ParseError::DuplicatePublic, line_number, num_errors);
                    }
                }
                Err(err) => log_parse_error(&err, line_number, num_errors),
            }
        } else if line.starts_with("MODULE ") || line.starts_with("INFO ") {
            // Housekeeping records for symbol storage; nothing to index.
        } else {
            match cur_func.as_mut() {
                Some(func) => match sym_parser::parse_source_line(line) {
                    Ok(source_line) => {
                        // Overlapping lines lose to the first writer.
                        func.lines
                            .store_range(source_line.address, source_line.size, source_line);
                    }
                    Err(err) => log_parse_error(&err, line_number, num_errors),
                },
                None => log_parse_error(&ParseError::OrphanLine, line_number, num_errors),
            }
        }
    }

    /// Hands a finished function to the range index. A conflicting
    /// range discards the function, taking its lines with it.
    fn commit_function(&mut self, func: Option<Function>) {
        if let Some(func) = func {
            let (address, size) = (func.address, func.size);
            if !self.functions.store_range(address, size, func) {
                debug!("discarding function with unstorable range {address:#x}+{size:#x}");
            }
        }
    }

    /// Returns false for a conflicting address; the first symbol at an
    /// address wins.
    fn store_public_symbol(&mut self, symbol: PublicSymbol) -> bool {
        // Some dumpers emit public symbols at address 0 (seen in
        // ntdll's _CIlog and friends). The address is meaningless, so
        // accept the record without indexing it.
        if symbol.address == 0 {
            return true;
        }
        match self.public_symbols.entry(symbol.address) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(symbol);
                true
            }
        }
    }

    fn store_stack_record(&mut self, record: StackRecord) {
        match record {
            // MSVC emits WIN entries whose nominal ranges conflict
            // until prolog sizes are taken into account; conflicting
            // stores are dropped here rather than failing the record.
            StackRecord::Win(WinFrameType::FrameData(info)) => {
                let (address, size) = (info.address, info.size);
                self.win_frame_data_info.store_range(address, size, info);
            }
            StackRecord::Win(WinFrameType::Fpo(info)) => {
                let (address, size) = (info.address, info.size);
                self.win_fpo_info.store_range(address, size, info);
            }
            StackRecord::Win(WinFrameType::Unhandled) => {}
            StackRecord::CfiInit {
                address,
                size,
                rules,
            } => {
                self.cfi_initial_rules.store_range(address, size, rules);
            }
            StackRecord::CfiDelta { address, rules } => {
                self.cfi_delta_rules.insert(address, rules);
            }
        }
    }

    /// Resolves the frame's instruction address against this module,
    /// filling in the function, source position, and, when `memory` is
    /// supplied, recovered parameter values.
    ///
    /// Addresses covered by no FUNC or PUBLIC record leave the frame
    /// exactly as the caller passed it.
    pub fn lookup_address(&self, memory: Option<&dyn MemoryRegion>, frame: &mut dyn StackFrame) {
        let address = frame.instruction().wrapping_sub(frame.module_base());

        // The nearest-range probe keeps the closest function below the
        // address even on a miss, so it can bound the extent of any
        // PUBLIC symbol considered next. Containment is re-checked
        // here, overflow-safe.
        let nearest = self.functions.retrieve_nearest_range(address);
        if let Some((func, base, size)) = nearest {
            if address >= base && address - base < size {
                frame.set_function(&func.name, frame.module_base().wrapping_add(base));

                if let Some(memory) = memory {
                    params::read_func_params(frame, memory, func);
                }

                if let Some((line, line_base, _)) = func.lines.retrieve_range(address) {
                    let file = self.files.get(&line.file_id).map(String::as_str);
                    frame.set_source_line(
                        file,
                        line.line,
                        frame.module_base().wrapping_add(line_base),
                    );
                }
                return;
            }
        }

        // No function contains the address; fall back to the public
        // symbol at or below it, unless that symbol sits at or before
        // the nearest function's start.
        if let Some((&public_address, symbol)) = self.public_symbols.range(..=address).next_back() {
            if nearest.map_or(true, |(_, base, _)| public_address > base) {
                frame.set_function(&symbol.name, frame.module_base().wrapping_add(public_address));
            }
        }
    }

    /// Finds MSVC frame information covering the frame's instruction.
    ///
    /// Frame-data records are preferred over FPO records, since they
    /// carry their own program string. Without either, a covering
    /// FUNC's parameter size is returned as a reduced record flagged
    /// [`WindowsFrameInfoValidity::ParameterSize`].
    pub fn find_windows_frame_info(&self, frame: &dyn StackFrame) -> Option<WindowsFrameInfo> {
        let address = frame.instruction().wrapping_sub(frame.module_base());

        if let Some((info, _, _)) = self
            .win_frame_data_info
            .retrieve_range(address)
            .or_else(|| self.win_fpo_info.retrieve_range(address))
        {
            return Some(info.clone());
        }

        // Many functions without a STACK WIN record still know how
        // much stack their parameters consume. Same nearest-probe
        // dance as lookup_address so the function can bound the PUBLIC
        // fallback below.
        let nearest = self.functions.retrieve_nearest_range(address);
        if let Some((func, base, size)) = nearest {
            if address >= base && address - base < size {
                return Some(WindowsFrameInfo::from_parameter_size(func.parameter_size));
            }
        }

        // PUBLIC symbols carry a parameter size too, but this tail has
        // never produced frame info and walkers rely on the miss.
        // Pinned by a regression test; audit the walkers before
        // changing it.
        if let Some((&public_address, symbol)) = self.public_symbols.range(..=address).next_back() {
            if nearest.map_or(true, |(_, base, _)| public_address > base) {
                let _ = WindowsFrameInfo::from_parameter_size(symbol.parameter_size);
            }
        }

        None
    }

    /// Builds the CFI register-recovery rules in effect at the frame's
    /// instruction: the covering `STACK CFI INIT` rule set overlaid
    /// with every delta record from the start of that range up to and
    /// including the instruction address.
    pub fn find_cfi_frame_info(&self, frame: &dyn StackFrame) -> Option<CfiFrameInfo> {
        let address = frame.instruction().wrapping_sub(frame.module_base());

        let (initial_rules, initial_base, _) = self.cfi_initial_rules.retrieve_range(address)?;

        let mut rules = CfiFrameInfo::default();
        if !rules.parse_rule_set(initial_rules) {
            return None;
        }

        // Deltas before the initial range belong to an earlier INIT;
        // deltas past the instruction have not taken effect yet. A
        // malformed delta leaves the earlier bindings in place.
        for (&delta_address, delta_rules) in self.cfi_delta_rules.range(initial_base..) {
            if delta_address > address {
                break;
            }
            rules.parse_rule_set(delta_rules);
        }

        Some(rules)
    }
}

/// Counts a rejected record, logging the first few in full.
fn log_parse_error(err: &ParseError, line_number: u32, num_errors: &mut u32) {
    *num_errors += 1;
    if *num_errors <= MAX_ERRORS_LOGGED {
        if line_number > 0 {
            error!("symbol data line {line_number}: {err}");
        } else {
            error!("symbol data: {err}");
        }
    }
}
