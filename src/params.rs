//! Recovery and display of live parameter values from crash memory.
//!
//! For each parameter of a resolved function, the location expression
//! is evaluated to find its storage, the bytes are read out of the
//! crash image, and a display string is built: a simple typed rendering
//! where the type allows one, always followed by a raw byte dump.

use log::warn;

use crate::dwarf_expr::evaluate_dwarf_expression;
use crate::frame::{ParamInfo, StackFrame};
use crate::memory::MemoryRegion;
use crate::model::{FuncParam, Function};

/// Recovers the values of `func`'s parameters from crash memory and
/// records them on the frame.
///
/// A failed read of a located value ends the pass early, keeping the
/// parameters recovered so far; a partial read means the frame itself
/// is suspect.
pub(crate) fn read_func_params(
    frame: &mut dyn StackFrame,
    memory: &dyn MemoryRegion,
    func: &Function,
) {
    if func.params.is_empty() {
        return;
    }

    let mut info = Vec::with_capacity(func.params.len());
    for param in &func.params {
        if param.type_size == 0 {
            // Unsized parameters are listed without a value.
            info.push(ParamInfo {
                type_name: param.type_name.clone(),
                type_size: param.type_size,
                name: param.name.clone(),
                value: String::new(),
            });
            continue;
        }

        let addr = evaluate_dwarf_expression(frame, memory, &param.locs);
        if addr == 0 {
            warn!(
                "unusable location expression for func {}, param {} ({})",
                func.name, param.name, param.type_name
            );
            continue;
        }

        let Some(value) = memory.read_u64(addr) else {
            break;
        };

        info.push(ParamInfo {
            type_name: param.type_name.clone(),
            type_size: param.type_size,
            name: param.name.clone(),
            value: format_param_value(param, value, addr, memory),
        });
    }

    frame.set_params(info);
}

/// Builds the display string for a recovered value.
fn format_param_value(
    param: &FuncParam,
    value: u64,
    addr: u64,
    memory: &dyn MemoryRegion,
) -> String {
    let mut out = String::new();

    if param.type_size % 2 == 0 && param.type_size <= 8 {
        if param.type_name.contains('*') || param.type_name.contains('&') {
            out = format!("{value:#x}");
        } else if param.type_name.contains("float") {
            out = format!("{}", f32::from_bits(value as u32));
        } else if param.type_name.contains("double") {
            out = format!("{}", f64::from_bits(value));
        } else {
            let mask = u64::MAX >> ((8 - param.type_size) * 8);
            out = format!("{:#x}", value & mask);
        }
    }

    // Byte-by-byte dump of the parameter's storage, one read per byte
    // so a hole in the image truncates the dump instead of killing it.
    let mut dump = String::new();
    for i in 0..param.type_size {
        match memory.read_u8(addr.wrapping_add(i)) {
            Some(byte) => {
                dump.push(' ');
                dump.push_str(&format!("{byte:02x}"));
            }
            None => break,
        }
    }
    if !dump.is_empty() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str("hex:");
        out.push_str(&dump);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SimpleFrame;
    use crate::memory::ImageMemory;
    use crate::model::ArgLocInfo;
    use crate::range_map::RangeMap;

    const DW_OP_REG0: u8 = 0x50;

    fn param(type_name: &str, type_size: u64, name: &str, locs: Vec<ArgLocInfo>) -> FuncParam {
        FuncParam {
            type_name: type_name.to_string(),
            type_size,
            name: name.to_string(),
            locs,
        }
    }

    fn reg0_loc() -> Vec<ArgLocInfo> {
        vec![ArgLocInfo {
            op: DW_OP_REG0,
            loc_value1: 0,
            loc_value2: 0,
        }]
    }

    fn func_with(params: Vec<FuncParam>) -> Function {
        Function {
            address: 0x100,
            size: 0x10,
            parameter_size: 0,
            name: "f".to_string(),
            lines: RangeMap::new(),
            params,
        }
    }

    fn frame_with_reg0(value: u64) -> SimpleFrame {
        SimpleFrame {
            registers: vec![value],
            frame_base: 0x1000,
            ..SimpleFrame::default()
        }
    }

    #[test]
    fn formats_small_integers_masked() {
        let mut img = vec![0u8; 32];
        img[8..16].copy_from_slice(&0xdead_beef_0000_002au64.to_ne_bytes());
        let memory = ImageMemory::new(0, img);
        let mut frame = frame_with_reg0(8);

        let func = func_with(vec![param("int", 4, "n", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);

        assert_eq!(frame.params.len(), 1);
        assert_eq!(frame.params[0].name, "n");
        assert_eq!(frame.params[0].value, "0x2a, hex: 2a 00 00 00");
    }

    #[test]
    fn formats_pointers_floats_and_doubles() {
        let mut img = vec![0u8; 64];
        img[8..16].copy_from_slice(&0x7fff_1234u64.to_ne_bytes());
        img[16..24].copy_from_slice(&u64::from(3.5f32.to_bits()).to_ne_bytes());
        img[24..32].copy_from_slice(&2.25f64.to_bits().to_ne_bytes());
        let memory = ImageMemory::new(0, img);

        let mut frame = frame_with_reg0(8);
        let func = func_with(vec![param("char const*", 8, "p", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        assert!(frame.params[0].value.starts_with("0x7fff1234, hex:"));

        let mut frame = frame_with_reg0(16);
        let func = func_with(vec![param("float", 4, "x", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        assert!(frame.params[0].value.starts_with("3.5, hex:"));

        let mut frame = frame_with_reg0(24);
        let func = func_with(vec![param("double", 8, "y", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        assert!(frame.params[0].value.starts_with("2.25, hex:"));
    }

    #[test]
    fn odd_sizes_get_only_the_dump() {
        let mut img = vec![0u8; 32];
        img[8] = 0xab;
        img[9] = 0xcd;
        img[10] = 0xef;
        let memory = ImageMemory::new(0, img);
        let mut frame = frame_with_reg0(8);

        let func = func_with(vec![param("struct odd", 3, "s", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        assert_eq!(frame.params[0].value, "hex: ab cd ef");
    }

    #[test]
    fn unsized_params_are_listed_empty() {
        let memory = ImageMemory::new(0, vec![0u8; 8]);
        let mut frame = frame_with_reg0(0);

        let func = func_with(vec![param("void", 0, "v", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        assert_eq!(frame.params.len(), 1);
        assert_eq!(frame.params[0].value, "");
    }

    #[test]
    fn unlocatable_params_are_skipped() {
        let memory = ImageMemory::new(0, vec![0u8; 8]);
        // Register 0 reads 0, so the expression yields the sentinel.
        let mut frame = frame_with_reg0(0);

        let func = func_with(vec![
            param("int", 4, "skipped", reg0_loc()),
            param("void", 0, "kept", reg0_loc()),
        ]);
        read_func_params(&mut frame, &memory, &func);
        assert_eq!(frame.params.len(), 1);
        assert_eq!(frame.params[0].name, "kept");
    }

    #[test]
    fn read_failure_aborts_keeping_earlier_params() {
        let mut img = vec![0u8; 16];
        img[8..16].copy_from_slice(&5u64.to_ne_bytes());
        let memory = ImageMemory::new(0, img);
        let mut frame = frame_with_reg0(8);

        let out_of_image = vec![ArgLocInfo {
            // DW_OP_addr pointing past the image.
            op: 0x03,
            loc_value1: 0x4000,
            loc_value2: 0,
        }];
        let func = func_with(vec![
            param("int", 4, "first", reg0_loc()),
            param("int", 4, "second", out_of_image),
            param("int", 4, "third", reg0_loc()),
        ]);
        read_func_params(&mut frame, &memory, &func);

        let names: Vec<_> = frame.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["first"]);
    }

    #[test]
    fn dump_truncates_at_an_image_hole() {
        let mut img = vec![0u8; 14];
        img[6..14].copy_from_slice(&0x0102_0304_0506_0708u64.to_ne_bytes());
        let memory = ImageMemory::new(0, img);
        let mut frame = frame_with_reg0(6);

        // 12 bytes requested, only 8 present.
        let func = func_with(vec![param("struct big", 12, "s", reg0_loc())]);
        read_func_params(&mut frame, &memory, &func);
        let value = &frame.params[0].value;
        assert!(value.starts_with("hex: "));
        assert_eq!(value.matches(' ').count(), 8, "dump was {value:?}");
    }
}
