//! Disassembler and pseudo-source decompiler
//!
//! Both are read-only views over a module stream and succeed for any
//! bytecode that passes verification; corrupt or foreign-format input is
//! rejected earlier by [`crate::bytecode::ModuleStream::deserialize`] as an
//! `UndumpError`.
//!
//! The decompiler emits flat but syntactically valid source: every
//! register becomes a `v<depth>_<slot>` variable, control flow becomes
//! labels and gotos, closures render inline as anonymous functions, and
//! iterator loops are re-recognized from the compiler's fixed shape. The
//! output of decompiling compiler-produced bytecode compiles again without
//! errors.

use crate::bytecode::{
    ArithOp, CompareOp, Constant, Instruction, ModuleStream, Prototype, UnaryOp,
};
use std::fmt::Write;

/// Textual instruction listing in definition order
pub fn disassemble(stream: &ModuleStream) -> String {
    let mut out = String::new();
    if !stream.api_names.is_empty() {
        let _ = writeln!(out, "; apis: {}", stream.api_names.join(", "));
    }
    if !stream.offline_api_names.is_empty() {
        let _ = writeln!(out, "; offline apis: {}", stream.offline_api_names.join(", "));
    }
    if !stream.event_names.is_empty() {
        let _ = writeln!(out, "; events: {}", stream.event_names.join(", "));
    }
    disassemble_proto(&mut out, &stream.bytecode, "main");
    out
}

fn disassemble_proto(out: &mut String, proto: &Prototype, path: &str) {
    let _ = writeln!(
        out,
        "function {} <line {}> ({} params, {} registers, {} instructions)",
        path,
        proto.line_defined,
        proto.param_count,
        proto.max_registers,
        proto.instructions.len()
    );
    for (pc, instruction) in proto.instructions.iter().enumerate() {
        let line = proto.line_info.get(pc).copied().unwrap_or(0);
        let _ = writeln!(out, "  [{:>4}] line {:>4}  {}", pc, line, render(instruction, proto));
    }
    if !proto.constants.is_empty() {
        let _ = writeln!(out, "  constants ({}):", proto.constants.len());
        for (index, constant) in proto.constants.iter().enumerate() {
            let _ = writeln!(out, "    k{} = {}", index, render_constant(constant));
        }
    }
    if !proto.upvalues.is_empty() {
        let _ = writeln!(out, "  upvalues ({}):", proto.upvalues.len());
        for (index, upvalue) in proto.upvalues.iter().enumerate() {
            let source = if upvalue.from_parent_stack {
                format!("parent r{}", upvalue.index)
            } else {
                format!("parent upvalue {}", upvalue.index)
            };
            let _ = writeln!(out, "    u{} = {} ({})", index, upvalue.name, source);
        }
    }
    for (index, child) in proto.protos.iter().enumerate() {
        let child_path = if child.name.is_empty() {
            format!("{}.p{}", path, index)
        } else {
            format!("{}.{}", path, child.name)
        };
        disassemble_proto(out, child, &child_path);
    }
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::Nil => "nil".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::Int(i) => i.to_string(),
        Constant::Number(n) => {
            if n.fract() == 0.0 && n.is_finite() {
                format!("{:.1}", n)
            } else {
                n.to_string()
            }
        }
        Constant::Str(s) => format!("{:?}", s),
    }
}

fn arith_symbol(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::IDiv => "//",
        ArithOp::Mod => "%",
        ArithOp::Pow => "^",
    }
}

fn compare_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "~=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
    }
}

fn unary_symbol(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "-",
        UnaryOp::Not => "not ",
        UnaryOp::Len => "#",
    }
}

fn constant_text(proto: &Prototype, index: u32) -> String {
    proto
        .constants
        .get(index as usize)
        .map(render_constant)
        .unwrap_or_else(|| format!("k{}?", index))
}

fn render(instruction: &Instruction, proto: &Prototype) -> String {
    match instruction {
        Instruction::Move { dst, src } => format!("MOVE      r{} := r{}", dst, src),
        Instruction::LoadConst { dst, k } => {
            format!("LOADK     r{} := {}", dst, constant_text(proto, *k))
        }
        Instruction::LoadBool { dst, value } => format!("LOADBOOL  r{} := {}", dst, value),
        Instruction::LoadNil { dst, count } => {
            format!("LOADNIL   r{}..r{}", dst, dst + count.saturating_sub(1))
        }
        Instruction::GetGlobal { dst, name_k } => {
            format!("GETGLOBAL r{} := {}", dst, constant_text(proto, *name_k))
        }
        Instruction::GetUpvalue { dst, index } => format!("GETUPVAL  r{} := u{}", dst, index),
        Instruction::SetUpvalue { src, index } => format!("SETUPVAL  u{} := r{}", index, src),
        Instruction::NewTable { dst } => format!("NEWTABLE  r{}", dst),
        Instruction::GetField { dst, obj, key_k } => {
            format!("GETFIELD  r{} := r{}[{}]", dst, obj, constant_text(proto, *key_k))
        }
        Instruction::SetField { obj, key_k, src } => {
            format!("SETFIELD  r{}[{}] := r{}", obj, constant_text(proto, *key_k), src)
        }
        Instruction::GetIndex { dst, obj, idx } => {
            format!("GETINDEX  r{} := r{}[r{}]", dst, obj, idx)
        }
        Instruction::SetIndex { obj, idx, src } => {
            format!("SETINDEX  r{}[r{}] := r{}", obj, idx, src)
        }
        Instruction::GetMethod { dst, obj, key_k } => {
            format!("GETMETHOD r{} := r{}:{}", dst, obj, constant_text(proto, *key_k))
        }
        Instruction::AppendList { obj, start, count } => {
            format!("APPEND    r{} += r{}..r{}", obj, start, start + count.saturating_sub(1))
        }
        Instruction::Arith { op, dst, lhs, rhs } => {
            format!("ARITH     r{} := r{} {} r{}", dst, lhs, arith_symbol(*op), rhs)
        }
        Instruction::Unary { op, dst, src } => {
            format!("UNARY     r{} := {}r{}", dst, unary_symbol(*op), src)
        }
        Instruction::Compare { op, dst, lhs, rhs } => {
            format!("COMPARE   r{} := r{} {} r{}", dst, lhs, compare_symbol(*op), rhs)
        }
        Instruction::Concat { dst, start, count } => {
            format!("CONCAT    r{} := r{}..r{}", dst, start, start + count.saturating_sub(1))
        }
        Instruction::Jump { offset } => format!("JUMP      {:+}", offset),
        Instruction::TestJump {
            reg,
            jump_if,
            offset,
        } => format!("TEST      if r{} is {} jump {:+}", reg, jump_if, offset),
        Instruction::Call { base, args } => format!("CALL      r{} ({} args)", base, args),
        Instruction::Closure { dst, proto: index } => {
            format!("CLOSURE   r{} := proto {}", dst, index)
        }
        Instruction::Return { src, has_value } => {
            if *has_value {
                format!("RETURN    r{}", src)
            } else {
                "RETURN".to_string()
            }
        }
        Instruction::ForPrep { base, offset } => format!("FORPREP   r{} {:+}", base, offset),
        Instruction::ForLoop { base, offset } => format!("FORLOOP   r{} {:+}", base, offset),
        Instruction::IterPrep { base } => format!("ITERPREP  r{}", base),
        Instruction::IterNext { base, offset } => format!("ITERNEXT  r{} {:+}", base, offset),
    }
}

/// Reconstructed pseudo-source that parses and checks cleanly
pub fn decompile(stream: &ModuleStream) -> String {
    let mut out = String::new();
    let mut writer = Decompiler { out: &mut out };
    writer.body(&stream.bytecode, 0, &[], 0, true);
    out
}

/// An iterator loop re-recognized from the compiler's emission shape
struct IterShape {
    body_start: usize,
    next_pc: usize,
}

struct Decompiler<'a> {
    out: &'a mut String,
}

impl<'a> Decompiler<'a> {
    fn line(&mut self, indent: usize, text: &str) {
        for _ in 0..indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Register name: unique per function nesting depth
    fn reg(depth: usize, register: u8) -> String {
        format!("v{}_{}", depth, register)
    }

    /// Resolve an upvalue to the ancestor register variable it aliases
    fn upvalue(ancestors: &[&Prototype], proto: &Prototype, index: u8) -> String {
        match proto.upvalues.get(index as usize) {
            Some(descriptor) if descriptor.from_parent_stack => {
                Self::reg(ancestors.len().saturating_sub(1), descriptor.index)
            }
            Some(descriptor) => match ancestors.split_last() {
                Some((parent, rest)) => Self::upvalue(rest, parent, descriptor.index),
                None => format!("u{}", index),
            },
            None => format!("u{}", index),
        }
    }

    /// Recognize the iterator-loop emission shape starting at an IterPrep
    fn iter_shape(proto: &Prototype, pc: usize) -> Option<IterShape> {
        let base = match proto.instructions.get(pc) {
            Some(Instruction::IterPrep { base }) => *base,
            _ => return None,
        };
        let next_pc = match proto.instructions.get(pc + 1) {
            Some(Instruction::Jump { offset }) => {
                let target = pc as i64 + 2 + *offset as i64;
                if target < 0 {
                    return None;
                }
                target as usize
            }
            _ => return None,
        };
        match proto.instructions.get(next_pc) {
            Some(Instruction::IterNext {
                base: next_base,
                offset,
            }) if *next_base == base => {
                let back = next_pc as i64 + 1 + *offset as i64;
                if back == pc as i64 + 2 {
                    Some(IterShape {
                        body_start: pc + 2,
                        next_pc,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Emit one function body; `top_level` skips the `function(...)` frame
    fn body(
        &mut self,
        proto: &Prototype,
        depth: usize,
        ancestors: &[&Prototype],
        indent: usize,
        top_level: bool,
    ) {
        let params: Vec<String> = (0..proto.param_count)
            .map(|i| Self::reg(depth, i))
            .collect();
        let body_indent = if top_level {
            indent
        } else {
            self.line(indent, &format!("function({})", params.join(", ")));
            indent + 1
        };

        let max_registers = (proto.max_registers as usize)
            .max(proto.param_count as usize)
            .max(1);
        if max_registers > proto.param_count as usize {
            let names: Vec<String> = (proto.param_count as usize..max_registers)
                .map(|i| Self::reg(depth, i as u8))
                .collect();
            self.line(body_indent, &format!("var {}", names.join(", ")));
        }

        // iterator loops are re-structured; their bridging jumps vanish
        let mut consumed_jumps: Vec<usize> = Vec::new();
        for pc in 0..proto.instructions.len() {
            if let Some(shape) = Self::iter_shape(proto, pc) {
                consumed_jumps.push(pc + 1);
                consumed_jumps.push(shape.next_pc);
            }
        }
        let mut targets: Vec<usize> = Vec::new();
        for (pc, instruction) in proto.instructions.iter().enumerate() {
            if consumed_jumps.contains(&pc) {
                continue;
            }
            if let Instruction::Jump { offset }
            | Instruction::TestJump { offset, .. }
            | Instruction::ForPrep { offset, .. }
            | Instruction::ForLoop { offset, .. }
            | Instruction::IterNext { offset, .. } = instruction
            {
                let target = (pc as i64 + 1 + *offset as i64).max(0) as usize;
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }

        self.range(
            proto,
            depth,
            ancestors,
            body_indent,
            0,
            proto.instructions.len(),
            &targets,
        );
        if targets.contains(&proto.instructions.len()) {
            self.line(body_indent, &format!("::L{}::", proto.instructions.len()));
        }
        if !top_level {
            self.line(indent, "end");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn range(
        &mut self,
        proto: &Prototype,
        depth: usize,
        ancestors: &[&Prototype],
        indent: usize,
        start: usize,
        end: usize,
        targets: &[usize],
    ) {
        let mut pc = start;
        while pc < end {
            if targets.contains(&pc) {
                self.line(indent, &format!("::L{}::", pc));
            }
            if let Some(shape) = Self::iter_shape(proto, pc) {
                if shape.next_pc < end {
                    let base = match proto.instructions[pc] {
                        Instruction::IterPrep { base } => base,
                        _ => unreachable!("iter_shape checked the opcode"),
                    };
                    self.line(
                        indent,
                        &format!(
                            "for {}, {} in {} do",
                            Self::reg(depth, base + 1),
                            Self::reg(depth, base + 2),
                            Self::reg(depth, base)
                        ),
                    );
                    self.range(
                        proto,
                        depth,
                        ancestors,
                        indent + 1,
                        shape.body_start,
                        shape.next_pc,
                        targets,
                    );
                    self.line(indent, "end");
                    pc = shape.next_pc + 1;
                    continue;
                }
            }
            self.instruction(proto, depth, ancestors, indent, pc);
            pc += 1;
        }
    }

    fn instruction(
        &mut self,
        proto: &Prototype,
        depth: usize,
        ancestors: &[&Prototype],
        indent: usize,
        pc: usize,
    ) {
        let r = |register: u8| Self::reg(depth, register);
        let target = |offset: i32| (pc as i64 + 1 + offset as i64).max(0);
        match &proto.instructions[pc] {
            Instruction::Move { dst, src } => self.line(indent, &format!("{} = {}", r(*dst), r(*src))),
            Instruction::LoadConst { dst, k } => {
                self.line(indent, &format!("{} = {}", r(*dst), constant_text(proto, *k)))
            }
            Instruction::LoadBool { dst, value } => {
                self.line(indent, &format!("{} = {}", r(*dst), value))
            }
            Instruction::LoadNil { dst, count } => {
                for i in 0..*count {
                    self.line(indent, &format!("{} = nil", r(dst + i)));
                }
            }
            Instruction::GetGlobal { dst, name_k } => {
                self.line(indent, &format!("{} = {}", r(*dst), unquoted(proto, *name_k)))
            }
            Instruction::GetUpvalue { dst, index } => self.line(
                indent,
                &format!("{} = {}", r(*dst), Self::upvalue(ancestors, proto, *index)),
            ),
            Instruction::SetUpvalue { src, index } => self.line(
                indent,
                &format!("{} = {}", Self::upvalue(ancestors, proto, *index), r(*src)),
            ),
            Instruction::NewTable { dst } => self.line(indent, &format!("{} = {{}}", r(*dst))),
            Instruction::GetField { dst, obj, key_k } => self.line(
                indent,
                &format!("{} = {}.{}", r(*dst), r(*obj), unquoted(proto, *key_k)),
            ),
            Instruction::SetField { obj, key_k, src } => self.line(
                indent,
                &format!("{}.{} = {}", r(*obj), unquoted(proto, *key_k), r(*src)),
            ),
            Instruction::GetIndex { dst, obj, idx } => self.line(
                indent,
                &format!("{} = {}[{}]", r(*dst), r(*obj), r(*idx)),
            ),
            Instruction::SetIndex { obj, idx, src } => self.line(
                indent,
                &format!("{}[{}] = {}", r(*obj), r(*idx), r(*src)),
            ),
            Instruction::GetMethod { dst, obj, key_k } => {
                // receiver binding first, then the method fetch
                self.line(indent, &format!("{} = {}", r(dst + 1), r(*obj)));
                self.line(
                    indent,
                    &format!("{} = {}.{}", r(*dst), r(*obj), unquoted(proto, *key_k)),
                );
            }
            Instruction::AppendList { obj, start, count } => {
                for i in 0..*count {
                    self.line(
                        indent,
                        &format!("{}[#{} + 1] = {}", r(*obj), r(*obj), r(start + i)),
                    );
                }
            }
            Instruction::Arith { op, dst, lhs, rhs } => self.line(
                indent,
                &format!("{} = {} {} {}", r(*dst), r(*lhs), arith_symbol(*op), r(*rhs)),
            ),
            Instruction::Unary { op, dst, src } => self.line(
                indent,
                &format!("{} = {}{}", r(*dst), unary_symbol(*op), r(*src)),
            ),
            Instruction::Compare { op, dst, lhs, rhs } => self.line(
                indent,
                &format!("{} = {} {} {}", r(*dst), r(*lhs), compare_symbol(*op), r(*rhs)),
            ),
            Instruction::Concat { dst, start, count } => {
                let pieces: Vec<String> = (0..*count).map(|i| r(start + i)).collect();
                self.line(indent, &format!("{} = {}", r(*dst), pieces.join(" .. ")));
            }
            Instruction::Jump { offset } => {
                self.line(indent, &format!("goto L{}", target(*offset)))
            }
            Instruction::TestJump {
                reg,
                jump_if,
                offset,
            } => {
                let condition = if *jump_if {
                    r(*reg)
                } else {
                    format!("not {}", r(*reg))
                };
                self.line(
                    indent,
                    &format!("if {} then goto L{} end", condition, target(*offset)),
                );
            }
            Instruction::Call { base, args } => {
                let rendered: Vec<String> = (0..*args).map(|i| r(base + 1 + i)).collect();
                self.line(
                    indent,
                    &format!("{} = {}({})", r(*base), r(*base), rendered.join(", ")),
                );
            }
            Instruction::Closure { dst, proto: index } => {
                match proto.protos.get(*index as usize) {
                    Some(child) => {
                        // inline the child as an anonymous function literal
                        let mut text = String::new();
                        {
                            let mut inner = Decompiler { out: &mut text };
                            let mut chain: Vec<&Prototype> = ancestors.to_vec();
                            chain.push(proto);
                            inner.body(child, depth + 1, &chain, indent, false);
                        }
                        let mut lines = text.lines();
                        if let Some(first) = lines.next() {
                            self.line(indent, &format!("{} = {}", r(*dst), first.trim_start()));
                        }
                        for rest in lines {
                            self.out.push_str(rest);
                            self.out.push('\n');
                        }
                    }
                    None => self.line(indent, &format!("{} = nil", r(*dst))),
                }
            }
            Instruction::Return { src, has_value } => {
                if *has_value {
                    self.line(indent, &format!("return {}", r(*src)));
                } else {
                    self.line(indent, "return");
                }
            }
            Instruction::ForPrep { base, offset } => {
                self.line(
                    indent,
                    &format!("{} = {} - {}", r(*base), r(*base), r(base + 2)),
                );
                self.line(indent, &format!("goto L{}", target(*offset)));
            }
            Instruction::ForLoop { base, offset } => {
                let control = r(*base);
                let stop = r(base + 1);
                let step = r(base + 2);
                self.line(indent, &format!("{} = {} + {}", control, control, step));
                self.line(
                    indent,
                    &format!(
                        "if (({} > 0) and ({} <= {})) or (({} <= 0) and ({} >= {})) then",
                        step, control, stop, step, control, stop
                    ),
                );
                self.line(indent + 1, &format!("{} = {}", r(base + 3), control));
                self.line(indent + 1, &format!("goto L{}", target(*offset)));
                self.line(indent, "end");
            }
            Instruction::IterPrep { base } => {
                // only reached when the loop shape was not recognized
                self.line(indent, &format!("{} = pairs({})", r(*base), r(*base)));
            }
            Instruction::IterNext { base, offset } => {
                self.line(
                    indent,
                    &format!(
                        "for {}, {} in {} do goto L{} end",
                        r(base + 1),
                        r(base + 2),
                        r(*base),
                        target(*offset)
                    ),
                );
            }
        }
    }
}

fn unquoted(proto: &Prototype, index: u32) -> String {
    match proto.constants.get(index as usize) {
        Some(Constant::Str(s)) => s.clone(),
        other => other.map(render_constant).unwrap_or_else(|| format!("k{}?", index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_module;
    use crate::typecheck::{CheckMode, EmptyRegistry};

    fn compiled(source: &str) -> ModuleStream {
        compile_module(source, CheckMode::Plain, &EmptyRegistry)
            .unwrap()
            .0
    }

    #[test]
    fn test_disassemble_lists_every_instruction() {
        let stream = compiled("let x = 1\nlet y = x + 2\nreturn y");
        let listing = disassemble(&stream);
        for pc in 0..stream.bytecode.instructions.len() {
            assert!(listing.contains(&format!("[{:>4}]", pc)));
        }
        assert!(listing.contains("LOADK"));
        assert!(listing.contains("ARITH"));
    }

    #[test]
    fn test_disassemble_stable_across_compilations() {
        let source = "function f(a: int): int\nreturn a * 2\nend\nreturn f";
        let a = disassemble(&compiled(source));
        let b = disassemble(&compiled(source));
        assert_eq!(a, b);
    }

    #[test]
    fn test_decompiled_simple_chunk_recompiles() {
        let stream = compiled("let total = 1\nlet result = total + 2\nreturn result");
        let source = decompile(&stream);
        compile_module(&source, CheckMode::Plain, &EmptyRegistry)
            .unwrap_or_else(|e| panic!("decompiled source failed to recompile: {}\n{}", e, source));
    }

    #[test]
    fn test_decompiled_control_flow_recompiles() {
        let stream = compiled(
            "var total = 0\n\
             for i = 1, 10 do\n\
             if i % 2 == 0 then\n\
             total = total + i\n\
             end\n\
             end\n\
             while total > 10 do\n\
             total = total - 10\n\
             end\n\
             return total",
        );
        let source = decompile(&stream);
        compile_module(&source, CheckMode::Plain, &EmptyRegistry)
            .unwrap_or_else(|e| panic!("decompiled source failed to recompile: {}\n{}", e, source));
    }

    #[test]
    fn test_decompiled_iterator_loop_recompiles() {
        let stream = compiled(
            "let t = { 1, 2, 3 }\n\
             var sum = 0\n\
             for k, v in pairs(t) do\n\
             sum = sum + v\n\
             end\n\
             return sum",
        );
        let source = decompile(&stream);
        assert!(source.contains(" in "));
        compile_module(&source, CheckMode::Plain, &EmptyRegistry)
            .unwrap_or_else(|e| panic!("decompiled source failed to recompile: {}\n{}", e, source));
    }

    #[test]
    fn test_decompiled_closures_recompile() {
        let stream = compiled(
            "function make()\n\
             var count = 0\n\
             function bump()\n\
             count = count + 1\n\
             return count\n\
             end\n\
             return bump\n\
             end\n\
             return make",
        );
        let source = decompile(&stream);
        compile_module(&source, CheckMode::Plain, &EmptyRegistry)
            .unwrap_or_else(|e| panic!("decompiled source failed to recompile: {}\n{}", e, source));
    }

    #[test]
    fn test_decompile_emits_labels_for_gotos() {
        let stream = compiled("var i = 0\n::top::\ni = i + 1\nif i < 3 then\ngoto top\nend");
        let source = decompile(&stream);
        assert!(source.contains("::L"));
        assert!(source.contains("goto L"));
    }
}
