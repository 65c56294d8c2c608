//! Record grammars for dumped symbol files.
//!
//! Each function here parses the body of one record type, prefix
//! already stripped by the driver in the crate root. Failures are
//! per-record: the driver counts and logs them and moves on to the
//! next line.

use log::debug;
use thiserror::Error;

use crate::model::{
    ArgLocInfo, FuncParam, Function, PublicSymbol, SourceLine, WinFrameType, WinStackProgram,
    WindowsFrameInfo, WindowsFrameInfoValidity,
};
use crate::range_map::RangeMap;

/// Why a record was rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("record is not valid UTF-8")]
    NotUtf8,
    #[error("record is truncated")]
    Truncated,
    #[error("expected a hex field, got {0:?}")]
    BadHex(String),
    #[error("expected a non-negative decimal field, got {0:?}")]
    BadDecimal(String),
    #[error("source line record outside any function")]
    OrphanLine,
    #[error("unrecognized STACK record platform {0:?}")]
    UnknownStackRecord(String),
    #[error("STACK WIN type tag {0:#x} out of range")]
    BadFrameInfoType(u64),
    #[error("PUBLIC record duplicates an already-mapped address")]
    DuplicatePublic,
    #[error("symbol data contains embedded NUL bytes")]
    EmbeddedNul,
}

/// A parsed `STACK …` record, ready for the module to index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StackRecord {
    Win(WinFrameType),
    CfiInit {
        address: u64,
        size: u64,
        rules: String,
    },
    CfiDelta {
        address: u64,
        rules: String,
    },
}

/// Splits off the next space-separated token. Runs of spaces count as
/// one separator.
fn next_token(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start_matches(' ');
    if line.is_empty() {
        return None;
    }
    match line.find(' ') {
        Some(pos) => Some((&line[..pos], &line[pos + 1..])),
        None => Some((line, "")),
    }
}

fn hex_u64(token: &str) -> Result<u64, ParseError> {
    u64::from_str_radix(token, 16).map_err(|_| ParseError::BadHex(token.to_string()))
}

fn hex_u32(token: &str) -> Result<u32, ParseError> {
    u32::from_str_radix(token, 16).map_err(|_| ParseError::BadHex(token.to_string()))
}

fn dec_u32(token: &str) -> Result<u32, ParseError> {
    token
        .parse::<i64>()
        .ok()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| ParseError::BadDecimal(token.to_string()))
}

/// Parses the body of `FILE <id> <filename>`. The filename is the rest
/// of the line and may contain spaces.
pub(crate) fn parse_file_record(line: &str) -> Result<(u32, String), ParseError> {
    let (id_tok, rest) = next_token(line).ok_or(ParseError::Truncated)?;
    let id = dec_u32(id_tok)?;
    let name = rest.trim_matches(' ');
    if name.is_empty() {
        return Err(ParseError::Truncated);
    }
    Ok((id, name.to_string()))
}

/// Parses the body of `FUNC <addr> <size> <param_size> <name>`,
/// including the optional `#<count>#<param>#<param>…` suffix.
///
/// A malformed suffix drops the parameter list but keeps the function;
/// the dumper's parameter extension is best-effort on top of an
/// otherwise complete record.
pub(crate) fn parse_function(line: &str) -> Result<Function, ParseError> {
    let mut segments = line.splitn(3, '#');
    let main = segments.next().unwrap_or("");
    let count_segment = segments.next();
    let list_segment = segments.next();

    let (addr_tok, rest) = next_token(main).ok_or(ParseError::Truncated)?;
    let (size_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
    let (psize_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
    let name = rest.trim_matches(' ');
    if name.is_empty() {
        return Err(ParseError::Truncated);
    }

    let mut func = Function {
        address: hex_u64(addr_tok)?,
        size: hex_u64(size_tok)?,
        parameter_size: hex_u32(psize_tok)?,
        name: name.to_string(),
        lines: RangeMap::new(),
        params: Vec::new(),
    };

    if let (Some(count_tok), Some(list)) = (count_segment, list_segment) {
        if let Ok(count) = usize::from_str_radix(count_tok, 16) {
            if count > 0 {
                match parse_func_params(count, list) {
                    Ok(params) => func.params = params,
                    Err(err) => debug!("dropping parameter list of {}: {err}", func.name),
                }
            }
        }
    }

    Ok(func)
}

/// Parses the `#`-separated parameter descriptors of a FUNC record.
/// Any malformed descriptor abandons the whole list.
fn parse_func_params(count: usize, list: &str) -> Result<Vec<FuncParam>, ParseError> {
    let descriptors: Vec<&str> = list.splitn(count, '#').collect();
    if descriptors.len() != count {
        return Err(ParseError::Truncated);
    }

    let mut params = Vec::with_capacity(count);
    for descriptor in descriptors {
        let mut fields = descriptor.splitn(4, '@');
        let type_name = fields.next().unwrap_or("");
        let (Some(size_tok), Some(name), Some(loc_expr)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(ParseError::Truncated);
        };

        // An unparseable size reads as 0; the parameter stays listed
        // but its value is never decoded.
        let type_size = u64::from_str_radix(size_tok, 16).unwrap_or(0);

        let mut locs = Vec::new();
        for op_fields in loc_expr.split('$') {
            let mut pieces = op_fields.split(':');
            let op_tok = pieces.next().unwrap_or("");
            let op = u8::from_str_radix(op_tok, 16)
                .map_err(|_| ParseError::BadHex(op_tok.to_string()))?;
            // Unparseable operands default to 0 without failing the
            // opcode.
            let loc_value1 = pieces
                .next()
                .and_then(|tok| u64::from_str_radix(tok, 16).ok())
                .unwrap_or(0);
            let loc_value2 = pieces
                .next()
                .and_then(|tok| u64::from_str_radix(tok, 16).ok())
                .unwrap_or(0);
            locs.push(ArgLocInfo {
                op,
                loc_value1,
                loc_value2,
            });
        }

        params.push(FuncParam {
            type_name: type_name.to_string(),
            type_size,
            name: name.to_string(),
            locs,
        });
    }

    Ok(params)
}

/// Parses a bare source-line record: `<addr> <size> <line> <file_id>`.
/// Anything after the file id is ignored.
pub(crate) fn parse_source_line(line: &str) -> Result<SourceLine, ParseError> {
    let (addr_tok, rest) = next_token(line).ok_or(ParseError::Truncated)?;
    let (size_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
    let (line_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
    let (file_tok, _trailing) = next_token(rest).ok_or(ParseError::Truncated)?;

    Ok(SourceLine {
        address: hex_u64(addr_tok)?,
        size: hex_u64(size_tok)?,
        // 0 is a legal line number (code with no source attribution);
        // negative is not.
        line: dec_u32(line_tok)?,
        file_id: dec_u32(file_tok)?,
    })
}

/// Parses the body of `PUBLIC <addr> <param_size> <name>`. The name is
/// the rest of the line and may contain spaces.
pub(crate) fn parse_public_symbol(line: &str) -> Result<PublicSymbol, ParseError> {
    let (addr_tok, rest) = next_token(line).ok_or(ParseError::Truncated)?;
    let (psize_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
    let name = rest.trim_matches(' ');
    if name.is_empty() {
        return Err(ParseError::Truncated);
    }
    Ok(PublicSymbol {
        address: hex_u64(addr_tok)?,
        parameter_size: hex_u32(psize_tok)?,
        name: name.to_string(),
    })
}

/// Parses the body of a `STACK …` record (WIN or CFI).
pub(crate) fn parse_stack_record(line: &str) -> Result<StackRecord, ParseError> {
    let (platform, rest) = next_token(line).ok_or(ParseError::Truncated)?;
    match platform {
        "WIN" => parse_stack_win(rest).map(StackRecord::Win),
        "CFI" => parse_stack_cfi(rest),
        other => Err(ParseError::UnknownStackRecord(other.to_string())),
    }
}

/// `STACK WIN <type> <rva> <code_size> <prolog> <epilog> <params>
/// <saved> <locals> <max_stack> <has_prog> <program|allocates_bp>`
fn parse_stack_win(line: &str) -> Result<WinFrameType, ParseError> {
    let mut fields = [""; 10];
    let mut rest = line;
    for field in &mut fields {
        let (token, after) = next_token(rest).ok_or(ParseError::Truncated)?;
        *field = token;
        rest = after;
    }
    let last = rest.trim_matches(' ');
    if last.is_empty() {
        return Err(ParseError::Truncated);
    }

    let type_tag = hex_u64(fields[0])?;
    let has_program = hex_u32(fields[9])? != 0;
    let program_string_or_base_pointer = if has_program {
        WinStackProgram::ProgramString(last.to_string())
    } else {
        WinStackProgram::AllocatesBasePointer(hex_u32(last)? != 0)
    };

    let info = WindowsFrameInfo {
        valid: WindowsFrameInfoValidity::All,
        address: hex_u64(fields[1])?,
        size: hex_u64(fields[2])?,
        prologue_size: hex_u32(fields[3])?,
        epilogue_size: hex_u32(fields[4])?,
        parameter_size: hex_u32(fields[5])?,
        saved_register_size: hex_u32(fields[6])?,
        local_size: hex_u32(fields[7])?,
        max_stack_size: hex_u32(fields[8])?,
        program_string_or_base_pointer,
    };

    match type_tag {
        0 => Ok(WinFrameType::Fpo(info)),
        4 => Ok(WinFrameType::FrameData(info)),
        1..=3 => Ok(WinFrameType::Unhandled),
        _ => Err(ParseError::BadFrameInfoType(type_tag)),
    }
}

/// `STACK CFI INIT <addr> <size> <rules…>` or
/// `STACK CFI <addr> <rules…>`
fn parse_stack_cfi(line: &str) -> Result<StackRecord, ParseError> {
    let (first, rest) = next_token(line).ok_or(ParseError::Truncated)?;
    if first == "INIT" {
        let (addr_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
        let (size_tok, rest) = next_token(rest).ok_or(ParseError::Truncated)?;
        let rules = rest.trim_matches(' ');
        if rules.is_empty() {
            return Err(ParseError::Truncated);
        }
        Ok(StackRecord::CfiInit {
            address: hex_u64(addr_tok)?,
            size: hex_u64(size_tok)?,
            rules: rules.to_string(),
        })
    } else {
        let rules = rest.trim_matches(' ');
        if rules.is_empty() {
            return Err(ParseError::Truncated);
        }
        Ok(StackRecord::CfiDelta {
            address: hex_u64(first)?,
            rules: rules.to_string(),
        })
    }
}
