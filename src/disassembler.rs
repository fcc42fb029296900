use crate::context::HandlerDef;
use crate::error::DecodeError;
use crate::instruction::{Instruction, Opcode, Operand};
use std::collections::BTreeSet;

/// Disassembles the code of one handler
pub struct Disassembler<'a> {
    code: &'a [u32],
}

impl<'a> Disassembler<'a> {
    pub fn new(code: &'a [u32]) -> Self {
        Disassembler { code }
    }

    /// Offset listing with raw words, starting at `start_pc`. Stops at the
    /// first decode error, which is reported inline.
    pub fn listing(&self, start_pc: usize, count: Option<usize>) -> String {
        let mut output = String::new();
        let mut pc = start_pc;
        let mut decoded = 0;

        loop {
            if let Some(max) = count {
                if decoded >= max {
                    break;
                }
            }
            if pc >= self.code.len() {
                break;
            }
            match Instruction::decode(self.code, pc) {
                Ok(inst) => {
                    output.push_str(&self.format_instruction(&inst));
                    output.push('\n');
                    pc += inst.size;
                    decoded += 1;
                }
                Err(e) => {
                    output.push_str(&format!("[{:04}] <decode error: {}>\n", pc, e));
                    break;
                }
            }
        }
        output.push_str(&format!(
            "; {} instructions ({} words)\n",
            decoded,
            pc - start_pc
        ));
        output
    }

    fn format_instruction(&self, inst: &Instruction) -> String {
        let words = &self.code[inst.offset..inst.offset + inst.size];
        let mut hex = words
            .iter()
            .take(3)
            .map(|w| format!("{:08x}", w))
            .collect::<Vec<_>>()
            .join(" ");
        if words.len() > 3 {
            hex.push_str(" ..");
        }
        let marker = match inst.opcode {
            Opcode::Unknown(_) => "  ; unknown opcode",
            Opcode::Known(_) => "",
        };
        format!("[{:04}] {:<30} {}{}", inst.offset, hex, inst, marker)
    }

    /// Source text the assembler accepts, with jump targets turned into
    /// labels
    pub fn source_lines(&self) -> Result<Vec<String>, DecodeError> {
        let insts = Instruction::decode_all(self.code)?;
        let boundaries: BTreeSet<usize> = insts
            .iter()
            .map(|i| i.offset)
            .chain(std::iter::once(self.code.len()))
            .collect();
        let targets: BTreeSet<usize> = insts
            .iter()
            .flat_map(|i| i.operands.iter())
            .filter_map(|o| match o {
                Operand::Offset(t) if boundaries.contains(t) => Some(*t),
                _ => None,
            })
            .collect();

        let mut lines = Vec::with_capacity(insts.len() + targets.len());
        for inst in &insts {
            if targets.contains(&inst.offset) {
                lines.push(label_for(inst.offset) + ":");
            }
            let mut line = inst.mnemonic();
            for (i, operand) in inst.operands.iter().enumerate() {
                line.push(' ');
                match operand {
                    Operand::Offset(t) if targets.contains(t) => line.push_str(&label_for(*t)),
                    _ => line.push_str(&inst.format_operand(i)),
                }
            }
            lines.push(format!("  {}", line));
        }
        if targets.contains(&self.code.len()) {
            lines.push(label_for(self.code.len()) + ":");
        }
        Ok(lines)
    }
}

fn label_for(offset: usize) -> String {
    format!("L{:04}", offset)
}

/// Disassemble a single handler as an `on ... end` block
pub fn disassemble_handler(def: &HandlerDef) -> Result<String, DecodeError> {
    let mut out = String::new();
    out.push_str("on ");
    out.push_str(&def.name);
    if !def.arg_names.is_empty() {
        out.push(' ');
        out.push_str(&def.arg_names.join(", "));
    }
    out.push('\n');
    if !def.local_names.is_empty() {
        out.push_str(&format!("  local {}\n", def.local_names.join(", ")));
    }
    for line in Disassembler::new(&def.code).source_lines()? {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str("end\n");
    Ok(out)
}

/// Disassemble every handler of a unit. The result assembles back to the
/// same handlers.
pub fn disassemble_unit(defs: &[HandlerDef]) -> Result<String, DecodeError> {
    let mut blocks = Vec::with_capacity(defs.len());
    for def in defs {
        blocks.push(disassemble_handler(def)?);
    }
    Ok(blocks.join("\n"))
}

/// Listing of every handler of a unit
pub fn list_unit(defs: &[HandlerDef]) -> String {
    let mut out = String::new();
    for def in defs {
        out.push_str(&format!(
            "; handler {} ({}) locals [{}]\n",
            def.name,
            def.arg_names.join(", "),
            def.local_names.join(", ")
        ));
        out.push_str(&Disassembler::new(&def.code).listing(0, None));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::context::ScriptType;

    const SOURCE: &str = r#"
on countdown n
  local i
  eval n
  assign i
L0006:
  eval i
  pushint 0
  gt
  jumpifnot L0029
  eval i
  print
  eval i
  pushint 1
  sub
  assign i
  jump L0006
L0029:
  pushstr "liftoff"
  print
  return
end
"#;

    #[test]
    fn test_source_reassembles_identically() {
        let defs = assemble(SOURCE, ScriptType::Movie).unwrap();
        let text = disassemble_unit(&defs).unwrap();
        let again = assemble(&text, ScriptType::Movie).unwrap();
        assert_eq!(defs, again);
        assert_eq!(text, disassemble_unit(&again).unwrap());
    }

    #[test]
    fn test_labels_only_on_targets() {
        let defs = assemble(SOURCE, ScriptType::Movie).unwrap();
        let text = disassemble_handler(&defs[0]).unwrap();
        let labels: Vec<&str> = text.lines().filter(|l| l.ends_with(':')).collect();
        assert_eq!(labels.len(), 2);
        assert!(text.contains("  local i\n"));
        assert!(text.starts_with("on countdown n\n"));
    }

    #[test]
    fn test_jump_to_end_gets_label() {
        let defs = assemble("on f\n  jump out\nout:\nend", ScriptType::Movie).unwrap();
        let text = disassemble_handler(&defs[0]).unwrap();
        assert_eq!(text, "on f\n  jump L0002\nL0002:\nend\n");
    }

    #[test]
    fn test_unknown_opcode_survives() {
        let defs = assemble("raw 0x0099 1 4294967295\nstop", ScriptType::Sprite).unwrap();
        let text = disassemble_unit(&defs).unwrap();
        assert!(text.contains("raw 0x0099 1 4294967295"));
        assert_eq!(assemble(&text, ScriptType::Sprite).unwrap(), defs);
    }

    #[test]
    fn test_listing() {
        let code = vec![0x0001_0003, 7, 0x0000_0071, 0x0000_0052];
        let listing = Disassembler::new(&code).listing(0, None);
        let lines: Vec<&str> = listing.lines().collect();
        assert!(lines[0].starts_with("[0000] 00010003 00000007"));
        assert!(lines[0].ends_with("pushint 7"));
        assert!(lines[1].ends_with("print"));
        assert_eq!(lines[3], "; 3 instructions (4 words)");

        let listing = Disassembler::new(&code).listing(2, Some(1));
        assert!(listing.starts_with("[0002]"));
        assert!(listing.contains("; 1 instructions (1 words)"));
    }

    #[test]
    fn test_listing_reports_decode_error() {
        let code = vec![0x0003_0050, 1];
        let listing = Disassembler::new(&code).listing(0, None);
        assert!(listing.contains("<decode error"));
        assert!(Disassembler::new(&code).source_lines().is_err());
    }
}
