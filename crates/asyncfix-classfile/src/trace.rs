//! Human-readable class dumps
//!
//! The output lists the header, the constant pool, and every member, with
//! method bodies disassembled one instruction per line. Pool references are
//! annotated with what they resolve to. Bodies that fail to decode are
//! reported inline rather than aborting the dump.

use std::fmt::Write;

use crate::code::{decode_instructions, Instruction};
use crate::constants::{Constant, ConstantPool};
use crate::module::{access, ClassFile, Member};
use crate::opcode::{Opcode, Operands};

/// Render a class as text
pub fn render_trace(class: &ClassFile) -> String {
    let mut out = String::new();
    let pool = &class.constants;

    let _ = writeln!(
        out,
        "// class version {}.{}",
        class.major_version, class.minor_version
    );
    let _ = writeln!(out, "// access flags {:#x}", class.access_flags);

    let mut header = access::keywords(class.access_flags & !access::ABSTRACT);
    header.push(if class.is_interface() {
        "interface"
    } else if class.access_flags & access::ABSTRACT != 0 {
        "abstract class"
    } else {
        "class"
    });
    let _ = write!(out, "{} {}", header.join(" "), class.name().unwrap_or("?"));
    if let Some(super_name) = class.super_name() {
        let _ = write!(out, " extends {super_name}");
    }
    let interfaces = class.interface_names();
    if !interfaces.is_empty() {
        let _ = write!(out, " implements {}", interfaces.join(", "));
    }
    out.push_str(" {\n");

    let _ = writeln!(out, "\n  // constant pool ({} slots)", pool.count());
    for (index, constant) in pool.iter() {
        let _ = writeln!(out, "  {}", describe_constant(pool, index, constant));
    }

    for field in &class.fields {
        out.push('\n');
        render_member(&mut out, class, field, " ");
    }

    for method in &class.methods {
        out.push('\n');
        render_member(&mut out, class, method, "");
        render_body(&mut out, pool, method);
    }

    out.push_str("}\n");
    out
}

fn render_member(out: &mut String, class: &ClassFile, member: &Member, separator: &str) {
    let _ = writeln!(out, "  // access flags {:#x}", member.access_flags);
    let mut words = access::keywords(member.access_flags);
    words.push(class.member_name(member).unwrap_or("?"));
    let _ = writeln!(
        out,
        "  {}{separator}{}",
        words.join(" "),
        class.member_descriptor(member).unwrap_or("?")
    );
}

fn render_body(out: &mut String, pool: &ConstantPool, method: &Member) {
    let code = match method.code(pool) {
        Ok(Some(code)) => code,
        Ok(None) => return,
        Err(err) => {
            let _ = writeln!(out, "    // malformed Code attribute: {err}");
            return;
        }
    };

    match decode_instructions(&code.code) {
        Ok(instructions) => {
            for instr in &instructions {
                let _ = writeln!(out, "    {}", describe_instruction(pool, instr));
            }
        }
        Err(err) => {
            let _ = writeln!(out, "    // undecodable code: {err}");
        }
    }
    for handler in &code.exception_table {
        let catch = match handler.catch_type {
            0 => "any",
            index => pool.class_name(index).unwrap_or("?"),
        };
        let _ = writeln!(
            out,
            "    TRYCATCHBLOCK {} {} {} {}",
            handler.start_pc, handler.end_pc, handler.handler_pc, catch
        );
    }
    let _ = writeln!(out, "    MAXSTACK = {}", code.max_stack);
    let _ = writeln!(out, "    MAXLOCALS = {}", code.max_locals);
}

fn describe_constant(pool: &ConstantPool, index: u16, constant: &Constant) -> String {
    let kind = constant.kind_name();
    let detail = match constant {
        Constant::Utf8(text) => format!("{text:?}"),
        Constant::Integer(v) => v.to_string(),
        Constant::Float(v) => format!("{v}f"),
        Constant::Long(v) => format!("{v}L"),
        Constant::Double(v) => format!("{v}d"),
        Constant::Class { name_index }
        | Constant::Module { name_index }
        | Constant::Package { name_index } => {
            format!("#{name_index} // {}", pool.get_utf8(*name_index).unwrap_or("?"))
        }
        Constant::String { string_index } => {
            format!("#{string_index} // {:?}", pool.get_utf8(*string_index).unwrap_or("?"))
        }
        Constant::MethodType { descriptor_index } => format!(
            "#{descriptor_index} // {}",
            pool.get_utf8(*descriptor_index).unwrap_or("?")
        ),
        Constant::FieldRef {
            class_index,
            name_and_type_index,
        }
        | Constant::MethodRef {
            class_index,
            name_and_type_index,
        }
        | Constant::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        } => format!(
            "#{class_index}.#{name_and_type_index} // {}",
            member_text(pool, index)
        ),
        Constant::NameAndType {
            name_index,
            descriptor_index,
        } => format!(
            "#{name_index}:#{descriptor_index} // {}:{}",
            pool.get_utf8(*name_index).unwrap_or("?"),
            pool.get_utf8(*descriptor_index).unwrap_or("?")
        ),
        Constant::MethodHandle {
            reference_kind,
            reference_index,
        } => format!(
            "{reference_kind}:#{reference_index} // {}",
            member_text(pool, *reference_index)
        ),
        Constant::Dynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        }
        | Constant::InvokeDynamic {
            bootstrap_method_attr_index,
            name_and_type_index,
        } => {
            let (name, descriptor) = pool
                .name_and_type_at(*name_and_type_index)
                .unwrap_or(("?", "?"));
            format!("#{bootstrap_method_attr_index}:#{name_and_type_index} // {name}:{descriptor}")
        }
    };
    format!("#{index} = {kind} {detail}")
}

fn member_text(pool: &ConstantPool, index: u16) -> String {
    match pool.member_ref(index) {
        Some((owner, name, descriptor)) => format!("{owner}.{name}{descriptor}"),
        None => "?".to_string(),
    }
}

fn describe_instruction(pool: &ConstantPool, instr: &Instruction) -> String {
    let mut line = format!("{}: {}", instr.offset, instr.opcode.mnemonic());

    if let Some(index) = instr.pool_index() {
        let _ = write!(line, " #{index}");
        match pool.get(index) {
            Some(Constant::Class { .. }) => {
                let _ = write!(line, " // {}", pool.class_name(index).unwrap_or("?"));
            }
            Some(Constant::String { string_index }) => {
                let _ = write!(line, " // {:?}", pool.get_utf8(*string_index).unwrap_or("?"));
            }
            Some(Constant::Integer(v)) => {
                let _ = write!(line, " // {v}");
            }
            Some(Constant::InvokeDynamic {
                name_and_type_index,
                ..
            }) => {
                if let Some((name, descriptor)) = pool.name_and_type_at(*name_and_type_index) {
                    let _ = write!(line, " // {name}{descriptor}");
                }
            }
            Some(_) => {
                if let Some((owner, name, descriptor)) = pool.member_ref(index) {
                    let _ = write!(line, " // {owner}.{name}{descriptor}");
                }
            }
            None => line.push_str(" // <invalid>"),
        }
        return line;
    }

    if let Some(index) = instr.local_index() {
        let _ = write!(line, " {index}");
    }
    if let Some(value) = instr.immediate() {
        let _ = write!(line, " {value}");
    }
    if let Some(target) = instr.branch_target() {
        let _ = write!(line, " {target}");
    }
    if matches!(instr.opcode, Opcode::Tableswitch | Opcode::Lookupswitch) {
        let targets: Vec<String> = instr.switch_targets().iter().map(usize::to_string).collect();
        let _ = write!(line, " [{}]", targets.join(", "));
    }
    if instr.opcode.operands() == Operands::Wide {
        if let Some(target) = instr.operands.first().and_then(|&b| Opcode::from_u8(b)) {
            let _ = write!(line, " {}", target.mnemonic());
        }
    }
    line
}
