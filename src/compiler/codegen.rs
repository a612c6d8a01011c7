//! AST to register-bytecode lowering
//!
//! Each function compiles into a [`Prototype`]: locals get fixed register
//! slots (bounded by [`MAX_LOCALS`]), temporaries are stack-allocated above
//! the live locals and released per statement, constants are deduplicated
//! per function, and every emitted instruction records its source line.
//! Upvalue capture builds the explicit descriptor list the sandbox verifier
//! later scans; a name that resolves to neither a local, an upvalue, nor a
//! whitelisted global read is a compile error, never a silent global.

use super::CompileError;
use crate::bytecode::{
    ArithOp, CompareOp, Constant, Instruction, LocalVar, Prototype, UnaryOp, UpvalDesc,
    MAX_LOCALS, MAX_REGISTERS,
};
use crate::parser::ast::{
    BinOp, Block, Chunk, Expr, FunctionBody, FunctionTarget, Statement, TableKeyExpr, UnOp,
};
use crate::typecheck::is_whitelisted_global;
use std::collections::HashMap;

/// Compile a chunk into its root prototype
pub fn compile_chunk(chunk: &Chunk) -> Result<Prototype, CompileError> {
    let mut compiler = Compiler::new();
    compiler.funcs.push(FuncState::new("", 0, false));
    compiler.compile_block(&chunk.block)?;
    // implicit `return nil` at the end of the chunk
    compiler.emit(
        Instruction::Return {
            src: 0,
            has_value: false,
        },
        chunk
            .block
            .statements
            .last()
            .map(super::statement_line)
            .unwrap_or(1),
    );
    compiler.finish_function()
}

#[derive(Debug, Clone, Copy)]
enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global,
}

#[derive(Debug)]
struct LocalSlot {
    name: String,
    register: u8,
    start_pc: u32,
}

#[derive(Debug, Default)]
struct LoopCtx {
    break_jumps: Vec<usize>,
}

struct FuncState {
    proto: Prototype,
    /// Active locals, innermost last; scope_marks delimit block scopes
    locals: Vec<LocalSlot>,
    scope_marks: Vec<usize>,
    free_reg: u8,
    constants: HashMap<ConstKey, u32>,
    loops: Vec<LoopCtx>,
    labels: HashMap<String, usize>,
    pending_gotos: Vec<(String, usize, usize)>,
}

/// Hashable key for constant deduplication; floats key by bit pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Number(u64),
    Str(String),
}

impl FuncState {
    fn new(name: &str, line_defined: usize, is_method: bool) -> Self {
        let mut proto = Prototype::new(name, line_defined);
        proto.is_method = is_method;
        Self {
            proto,
            locals: Vec::new(),
            scope_marks: Vec::new(),
            free_reg: 0,
            constants: HashMap::new(),
            loops: Vec::new(),
            labels: HashMap::new(),
            pending_gotos: Vec::new(),
        }
    }
}

struct Compiler {
    funcs: Vec<FuncState>,
}

impl Compiler {
    fn new() -> Self {
        Self { funcs: Vec::new() }
    }

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("active function")
    }

    fn pc(&mut self) -> usize {
        self.func().proto.instructions.len()
    }

    fn emit(&mut self, instruction: Instruction, line: usize) -> usize {
        let func = self.func();
        func.proto.instructions.push(instruction);
        func.proto.line_info.push(line as u32);
        func.proto.instructions.len() - 1
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        let offset = target as i32 - (at as i32 + 1);
        let func = self.func();
        match &mut func.proto.instructions[at] {
            Instruction::Jump { offset: o }
            | Instruction::TestJump { offset: o, .. }
            | Instruction::ForPrep { offset: o, .. }
            | Instruction::ForLoop { offset: o, .. }
            | Instruction::IterNext { offset: o, .. } => *o = offset,
            other => unreachable!("patching non-jump instruction {:?}", other),
        }
    }

    fn patch_jump_here(&mut self, at: usize) {
        let here = self.pc();
        self.patch_jump(at, here);
    }

    // ----- registers, locals, constants -----

    fn alloc_reg(&mut self, line: usize) -> Result<u8, CompileError> {
        let func = self.func();
        if func.free_reg as usize >= MAX_REGISTERS {
            return Err(CompileError::TooManyRegisters { line });
        }
        let reg = func.free_reg;
        func.free_reg += 1;
        if func.free_reg > func.proto.max_registers {
            func.proto.max_registers = func.free_reg;
        }
        Ok(reg)
    }

    /// Registers above the live locals are statement-scoped temporaries
    fn temp_mark(&mut self) -> u8 {
        self.func().free_reg
    }

    /// Release temporaries down to `mark`, never below the live locals
    /// (a declaration may have claimed registers at or above the mark)
    fn release_temps(&mut self, mark: u8) {
        let func = self.func();
        let floor = func
            .locals
            .last()
            .map(|slot| slot.register + 1)
            .unwrap_or(0);
        func.free_reg = mark.max(floor);
    }

    fn declare_local(&mut self, name: &str, line: usize) -> Result<u8, CompileError> {
        if self.func().locals.len() >= MAX_LOCALS {
            return Err(CompileError::TooManyLocals {
                name: name.to_string(),
                line,
            });
        }
        let register = self.alloc_reg(line)?;
        let start_pc = self.pc() as u32;
        self.func().locals.push(LocalSlot {
            name: name.to_string(),
            register,
            start_pc,
        });
        Ok(register)
    }

    fn enter_scope(&mut self) {
        let mark = self.func().locals.len();
        self.func().scope_marks.push(mark);
    }

    fn leave_scope(&mut self) {
        let mark = self.func().scope_marks.pop().unwrap_or(0);
        let end_pc = self.pc() as u32;
        let func = self.func();
        while func.locals.len() > mark {
            let slot = func.locals.pop().expect("scoped local");
            func.proto.locals.push(LocalVar {
                name: slot.name,
                register: slot.register,
                start_pc: slot.start_pc,
                end_pc,
            });
            func.free_reg = slot.register;
        }
    }

    fn constant(&mut self, value: Constant, line: usize) -> Result<u32, CompileError> {
        let key = match &value {
            Constant::Nil => ConstKey::Nil,
            Constant::Bool(b) => ConstKey::Bool(*b),
            Constant::Int(i) => ConstKey::Int(*i),
            Constant::Number(n) => ConstKey::Number(n.to_bits()),
            Constant::Str(s) => ConstKey::Str(s.clone()),
        };
        let func = self.func();
        if let Some(&index) = func.constants.get(&key) {
            return Ok(index);
        }
        let index = func.proto.constants.len() as u32;
        if index == u32::MAX {
            return Err(CompileError::TooManyConstants { line });
        }
        func.proto.constants.push(value);
        func.constants.insert(key, index);
        Ok(index)
    }

    fn string_constant(&mut self, value: &str, line: usize) -> Result<u32, CompileError> {
        self.constant(Constant::Str(value.to_string()), line)
    }

    // ----- name resolution -----

    fn resolve(&mut self, name: &str, line: usize) -> Result<Resolved, CompileError> {
        let depth = self.funcs.len() - 1;
        if let Some(register) = self.find_local(depth, name) {
            return Ok(Resolved::Local(register));
        }
        if let Some(index) = self.find_upvalue(depth, name)? {
            return Ok(Resolved::Upvalue(index));
        }
        if is_whitelisted_global(name) {
            return Ok(Resolved::Global);
        }
        Err(CompileError::UnresolvedName {
            name: name.to_string(),
            line,
        })
    }

    fn find_local(&self, func_index: usize, name: &str) -> Option<u8> {
        self.funcs[func_index]
            .locals
            .iter()
            .rev()
            .find(|slot| slot.name == name)
            .map(|slot| slot.register)
    }

    /// Resolve a name as an upvalue of `func_index`, creating capture
    /// descriptors down the chain as needed
    fn find_upvalue(&mut self, func_index: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if func_index == 0 {
            return Ok(None);
        }
        if let Some(existing) = self.funcs[func_index]
            .proto
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Ok(Some(existing as u8));
        }
        let parent = func_index - 1;
        let descriptor = if let Some(register) = self.find_local(parent, name) {
            UpvalDesc {
                name: name.to_string(),
                from_parent_stack: true,
                index: register,
            }
        } else if let Some(parent_index) = self.find_upvalue(parent, name)? {
            UpvalDesc {
                name: name.to_string(),
                from_parent_stack: false,
                index: parent_index,
            }
        } else {
            return Ok(None);
        };
        let upvalues = &mut self.funcs[func_index].proto.upvalues;
        if upvalues.len() >= u8::MAX as usize {
            return Err(CompileError::TooManyUpvalues {
                name: name.to_string(),
            });
        }
        upvalues.push(descriptor);
        Ok(Some((upvalues.len() - 1) as u8))
    }

    // ----- statements -----

    fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for statement in &block.statements {
            let mark = self.temp_mark();
            self.compile_statement(statement)?;
            self.release_temps(mark);
        }
        Ok(())
    }

    fn compile_scoped_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.enter_scope();
        self.compile_block(block)?;
        self.leave_scope();
        Ok(())
    }

    fn compile_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Declare {
                names, exprs, line, ..
            } => {
                // value expressions evaluate before the names become visible
                let mark = self.temp_mark();
                let mut value_regs = Vec::new();
                for expr in exprs {
                    let reg = self.alloc_reg(*line)?;
                    self.compile_expr_to(expr, reg)?;
                    value_regs.push(reg);
                }
                for (i, name) in names.iter().enumerate() {
                    let register = self.declare_local(name, *line)?;
                    match value_regs.get(i) {
                        Some(&src) => {
                            self.emit(Instruction::Move { dst: register, src }, *line);
                        }
                        None => {
                            self.emit(Instruction::LoadNil { dst: register, count: 1 }, *line);
                        }
                    }
                }
                // lift the declared locals below the released temporaries
                self.compact_after_declare(mark, names.len());
                Ok(())
            }
            Statement::Assign { targets, exprs, line } => self.compile_assign(targets, exprs, *line),
            Statement::ExprStat { expr, line } => {
                let reg = self.alloc_reg(*line)?;
                self.compile_expr_to(expr, reg)?;
                Ok(())
            }
            Statement::If { arms, else_block, .. } => self.compile_if(arms, else_block.as_ref()),
            Statement::While { condition, body, line } => {
                let top = self.pc();
                let mark = self.temp_mark();
                let cond = self.alloc_reg(*line)?;
                self.compile_expr_to(condition, cond)?;
                let exit = self.emit(
                    Instruction::TestJump {
                        reg: cond,
                        jump_if: false,
                        offset: 0,
                    },
                    *line,
                );
                self.release_temps(mark);
                self.func().loops.push(LoopCtx::default());
                self.compile_scoped_block(body)?;
                let back = self.pc();
                self.emit(
                    Instruction::Jump {
                        offset: top as i32 - (back as i32 + 1),
                    },
                    *line,
                );
                self.patch_jump_here(exit);
                let ctx = self.func().loops.pop().expect("loop context");
                for jump in ctx.break_jumps {
                    self.patch_jump_here(jump);
                }
                Ok(())
            }
            Statement::NumericFor {
                var,
                start,
                stop,
                step,
                body,
                line,
            } => self.compile_numeric_for(var, start, stop, step.as_ref(), body, *line),
            Statement::IterFor {
                names, iter, body, line,
            } => self.compile_iter_for(names, iter, body, *line),
            Statement::Do { body, .. } => self.compile_scoped_block(body),
            Statement::FunctionDecl { target, body, line } => {
                self.compile_function_decl(target, body, *line)
            }
            Statement::LocalFunction { name, body, line } => {
                let register = self.declare_local(name, *line)?;
                let proto_index = self.compile_function(body, name, false)?;
                self.emit(
                    Instruction::Closure {
                        dst: register,
                        proto: proto_index,
                    },
                    *line,
                );
                Ok(())
            }
            Statement::Return { expr, line } => {
                match expr {
                    Some(expr) => {
                        let reg = self.alloc_reg(*line)?;
                        self.compile_expr_to(expr, reg)?;
                        self.emit(
                            Instruction::Return {
                                src: reg,
                                has_value: true,
                            },
                            *line,
                        );
                    }
                    None => {
                        self.emit(
                            Instruction::Return {
                                src: 0,
                                has_value: false,
                            },
                            *line,
                        );
                    }
                }
                Ok(())
            }
            Statement::Break { line } => {
                let jump = self.emit(Instruction::Jump { offset: 0 }, *line);
                match self.func().loops.last_mut() {
                    Some(ctx) => {
                        ctx.break_jumps.push(jump);
                        Ok(())
                    }
                    None => Err(CompileError::BreakOutsideLoop { line: *line }),
                }
            }
            Statement::Goto { label, line } => {
                let jump = self.emit(Instruction::Jump { offset: 0 }, *line);
                self.func()
                    .pending_gotos
                    .push((label.clone(), jump, *line));
                Ok(())
            }
            Statement::Label { name, line } => {
                let here = self.pc();
                let func = self.func();
                if func.labels.insert(name.clone(), here).is_some() {
                    return Err(CompileError::DuplicateLabel {
                        label: name.clone(),
                        line: *line,
                    });
                }
                Ok(())
            }
            Statement::TypeDecl { .. } => Ok(()),
        }
    }

    /// Move freshly declared locals down over the temporaries that held
    /// their initial values, keeping register usage dense
    fn compact_after_declare(&mut self, mark: u8, count: usize) {
        let func = self.func();
        let local_count = func.locals.len();
        // rewrite the registers assigned to the new locals
        for (i, slot) in func.locals[local_count - count..].iter_mut().enumerate() {
            slot.register = mark + i as u8;
        }
        func.free_reg = mark + count as u8;
        if func.free_reg > func.proto.max_registers {
            func.proto.max_registers = func.free_reg;
        }
        // fix the Move/LoadNil targets emitted for the declarations
        let instr_len = func.proto.instructions.len();
        let mut fixed = 0usize;
        for i in (0..instr_len).rev() {
            if fixed == count {
                break;
            }
            match &mut func.proto.instructions[i] {
                Instruction::Move { dst, .. } | Instruction::LoadNil { dst, .. } => {
                    *dst = mark + (count - 1 - fixed) as u8;
                    fixed += 1;
                }
                _ => break,
            }
        }
    }

    fn compile_assign(
        &mut self,
        targets: &[Expr],
        exprs: &[Expr],
        line: usize,
    ) -> Result<(), CompileError> {
        // evaluate all values first, then store left to right
        let mut value_regs = Vec::new();
        for expr in exprs {
            let reg = self.alloc_reg(line)?;
            self.compile_expr_to(expr, reg)?;
            value_regs.push(reg);
        }
        for (i, target) in targets.iter().enumerate() {
            let value = match value_regs.get(i) {
                Some(&reg) => reg,
                None => {
                    let reg = self.alloc_reg(line)?;
                    self.emit(Instruction::LoadNil { dst: reg, count: 1 }, line);
                    reg
                }
            };
            match target {
                Expr::Name { name, line } => match self.resolve(name, *line)? {
                    Resolved::Local(register) => {
                        self.emit(
                            Instruction::Move {
                                dst: register,
                                src: value,
                            },
                            *line,
                        );
                    }
                    Resolved::Upvalue(index) => {
                        self.emit(Instruction::SetUpvalue { src: value, index }, *line);
                    }
                    Resolved::Global => {
                        return Err(CompileError::GlobalWrite {
                            name: name.clone(),
                            line: *line,
                        });
                    }
                },
                Expr::Member { object, name, line } => {
                    let obj = self.alloc_reg(*line)?;
                    self.compile_expr_to(object, obj)?;
                    let key_k = self.string_constant(name, *line)?;
                    self.emit(
                        Instruction::SetField {
                            obj,
                            key_k,
                            src: value,
                        },
                        *line,
                    );
                }
                Expr::Index { object, index, line } => {
                    let obj = self.alloc_reg(*line)?;
                    self.compile_expr_to(object, obj)?;
                    let idx = self.alloc_reg(*line)?;
                    self.compile_expr_to(index, idx)?;
                    self.emit(Instruction::SetIndex { obj, idx, src: value }, *line);
                }
                other => {
                    return Err(CompileError::InvalidAssignment {
                        line: other.line(),
                    })
                }
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        arms: &[(Expr, Block)],
        else_block: Option<&Block>,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        for (condition, body) in arms {
            let line = condition.line();
            let mark = self.temp_mark();
            let cond = self.alloc_reg(line)?;
            self.compile_expr_to(condition, cond)?;
            let skip = self.emit(
                Instruction::TestJump {
                    reg: cond,
                    jump_if: false,
                    offset: 0,
                },
                line,
            );
            self.release_temps(mark);
            self.compile_scoped_block(body)?;
            end_jumps.push(self.emit(Instruction::Jump { offset: 0 }, line));
            self.patch_jump_here(skip);
        }
        if let Some(body) = else_block {
            self.compile_scoped_block(body)?;
        }
        for jump in end_jumps {
            self.patch_jump_here(jump);
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        stop: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: usize,
    ) -> Result<(), CompileError> {
        self.enter_scope();
        // control block: start, stop, step, then the user variable
        let base = self.alloc_reg(line)?;
        let stop_reg = self.alloc_reg(line)?;
        let step_reg = self.alloc_reg(line)?;
        self.compile_expr_to(start, base)?;
        self.compile_expr_to(stop, stop_reg)?;
        match step {
            Some(step) => self.compile_expr_to(step, step_reg)?,
            None => {
                let one = self.constant(Constant::Int(1), line)?;
                self.emit(Instruction::LoadConst { dst: step_reg, k: one }, line);
            }
        }
        // reserve the loop variable as a real local at base + 3
        let var_reg = self.declare_local(var, line)?;
        debug_assert_eq!(var_reg, base + 3);

        let prep = self.emit(Instruction::ForPrep { base, offset: 0 }, line);
        let body_start = self.pc();
        self.func().loops.push(LoopCtx::default());
        self.compile_scoped_block(body)?;
        let loop_pc = self.pc();
        self.patch_jump(prep, loop_pc);
        let back = self.emit(Instruction::ForLoop { base, offset: 0 }, line);
        self.patch_jump(back, body_start);
        let ctx = self.func().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_jump_here(jump);
        }
        self.leave_scope();
        Ok(())
    }

    fn compile_iter_for(
        &mut self,
        names: &[String],
        iter: &Expr,
        body: &Block,
        line: usize,
    ) -> Result<(), CompileError> {
        self.enter_scope();
        let base = self.alloc_reg(line)?;
        self.compile_expr_to(iter, base)?;
        self.emit(Instruction::IterPrep { base }, line);
        // key and value land in the two registers above the state
        let key_reg = self.declare_local(names.first().map(String::as_str).unwrap_or("_k"), line)?;
        debug_assert_eq!(key_reg, base + 1);
        let value_name = names.get(1).map(String::as_str).unwrap_or("_v");
        let value_reg = self.declare_local(value_name, line)?;
        debug_assert_eq!(value_reg, base + 2);
        for extra in names.iter().skip(2) {
            let reg = self.declare_local(extra, line)?;
            self.emit(Instruction::LoadNil { dst: reg, count: 1 }, line);
        }

        let entry = self.emit(Instruction::Jump { offset: 0 }, line);
        let body_start = self.pc();
        self.func().loops.push(LoopCtx::default());
        self.compile_scoped_block(body)?;
        self.patch_jump_here(entry);
        let next = self.emit(Instruction::IterNext { base, offset: 0 }, line);
        self.patch_jump(next, body_start);
        let ctx = self.func().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_jump_here(jump);
        }
        self.leave_scope();
        Ok(())
    }

    fn compile_function_decl(
        &mut self,
        target: &FunctionTarget,
        body: &FunctionBody,
        line: usize,
    ) -> Result<(), CompileError> {
        match target {
            FunctionTarget::Name(name) => {
                // declare first so the body can recurse through the binding
                let register = match self.find_local(self.funcs.len() - 1, name) {
                    Some(register) => register,
                    None => self.declare_local(name, line)?,
                };
                let proto_index = self.compile_function(body, name, false)?;
                self.emit(
                    Instruction::Closure {
                        dst: register,
                        proto: proto_index,
                    },
                    line,
                );
                Ok(())
            }
            FunctionTarget::Member { table, name } | FunctionTarget::Method { table, name } => {
                let is_method = matches!(target, FunctionTarget::Method { .. });
                let temp = self.alloc_reg(line)?;
                let proto_index = self.compile_function(body, name, is_method)?;
                self.emit(
                    Instruction::Closure {
                        dst: temp,
                        proto: proto_index,
                    },
                    line,
                );
                let obj = self.alloc_reg(line)?;
                self.compile_name_read(table, obj, line)?;
                let key_k = self.string_constant(name, line)?;
                self.emit(
                    Instruction::SetField {
                        obj,
                        key_k,
                        src: temp,
                    },
                    line,
                );
                Ok(())
            }
        }
    }

    /// Compile a nested function body; returns its index in the parent's
    /// prototype list
    fn compile_function(
        &mut self,
        body: &FunctionBody,
        name: &str,
        is_method: bool,
    ) -> Result<u32, CompileError> {
        self.funcs.push(FuncState::new(name, body.line, is_method));
        if is_method {
            self.declare_local("self", body.line)?;
        }
        for param in &body.params {
            self.declare_local(&param.name, body.line)?;
        }
        let declared = body.params.len() + usize::from(is_method);
        self.func().proto.param_count = declared as u8;
        self.compile_block(&body.block)?;
        self.emit(
            Instruction::Return {
                src: 0,
                has_value: false,
            },
            body.line,
        );
        let proto = self.finish_function()?;
        let parent = self.func();
        parent.proto.protos.push(proto);
        Ok((parent.proto.protos.len() - 1) as u32)
    }

    fn finish_function(&mut self) -> Result<Prototype, CompileError> {
        // resolve pending gotos against the function's labels
        let func = self.funcs.last().expect("active function");
        let unresolved: Vec<(String, usize, usize)> = func
            .pending_gotos
            .iter()
            .filter(|(label, _, _)| !func.labels.contains_key(label))
            .cloned()
            .collect();
        if let Some((label, _, line)) = unresolved.into_iter().next() {
            return Err(CompileError::UnresolvedLabel { label, line });
        }
        let gotos: Vec<(String, usize)> = func
            .pending_gotos
            .iter()
            .map(|(label, at, _)| (label.clone(), *at))
            .collect();
        for (label, at) in gotos {
            let target = self.funcs.last().expect("active function").labels[&label];
            self.patch_jump(at, target);
        }
        let mut func = self.funcs.pop().expect("active function");
        // record any still-live locals (chunk and function scope)
        let end_pc = func.proto.instructions.len() as u32;
        while let Some(slot) = func.locals.pop() {
            func.proto.locals.push(LocalVar {
                name: slot.name,
                register: slot.register,
                start_pc: slot.start_pc,
                end_pc,
            });
        }
        Ok(func.proto)
    }

    // ----- expressions -----

    fn compile_name_read(&mut self, name: &str, dst: u8, line: usize) -> Result<(), CompileError> {
        match self.resolve(name, line)? {
            Resolved::Local(register) => {
                self.emit(Instruction::Move { dst, src: register }, line);
            }
            Resolved::Upvalue(index) => {
                self.emit(Instruction::GetUpvalue { dst, index }, line);
            }
            Resolved::Global => {
                let name_k = self.string_constant(name, line)?;
                self.emit(Instruction::GetGlobal { dst, name_k }, line);
            }
        }
        Ok(())
    }

    fn compile_expr_to(&mut self, expr: &Expr, dst: u8) -> Result<(), CompileError> {
        match expr {
            Expr::Nil { line } => {
                self.emit(Instruction::LoadNil { dst, count: 1 }, *line);
            }
            Expr::True { line } => {
                self.emit(Instruction::LoadBool { dst, value: true }, *line);
            }
            Expr::False { line } => {
                self.emit(Instruction::LoadBool { dst, value: false }, *line);
            }
            Expr::Int { value, line } => {
                let k = self.constant(Constant::Int(*value), *line)?;
                self.emit(Instruction::LoadConst { dst, k }, *line);
            }
            Expr::Number { value, line } => {
                let k = self.constant(Constant::Number(*value), *line)?;
                self.emit(Instruction::LoadConst { dst, k }, *line);
            }
            Expr::Str { value, line } => {
                let k = self.constant(Constant::Str(value.clone()), *line)?;
                self.emit(Instruction::LoadConst { dst, k }, *line);
            }
            Expr::Name { name, line } => {
                self.compile_name_read(name, dst, *line)?;
            }
            Expr::Function { body, line } => {
                let proto_index = self.compile_function(body, "", false)?;
                self.emit(
                    Instruction::Closure {
                        dst,
                        proto: proto_index,
                    },
                    *line,
                );
            }
            Expr::Table {
                array_items,
                map_items,
                line,
            } => {
                self.emit(Instruction::NewTable { dst }, *line);
                if !array_items.is_empty() {
                    let mark = self.temp_mark();
                    let start = self.func().free_reg;
                    for item in array_items {
                        let reg = self.alloc_reg(*line)?;
                        self.compile_expr_to(item, reg)?;
                    }
                    self.emit(
                        Instruction::AppendList {
                            obj: dst,
                            start,
                            count: array_items.len() as u8,
                        },
                        *line,
                    );
                    self.release_temps(mark);
                }
                for (key, value) in map_items {
                    let mark = self.temp_mark();
                    match key {
                        TableKeyExpr::Name(name) => {
                            let value_reg = self.alloc_reg(*line)?;
                            self.compile_expr_to(value, value_reg)?;
                            let key_k = self.string_constant(name, *line)?;
                            self.emit(
                                Instruction::SetField {
                                    obj: dst,
                                    key_k,
                                    src: value_reg,
                                },
                                *line,
                            );
                        }
                        TableKeyExpr::Expr(key) => {
                            let key_reg = self.alloc_reg(*line)?;
                            self.compile_expr_to(key, key_reg)?;
                            let value_reg = self.alloc_reg(*line)?;
                            self.compile_expr_to(value, value_reg)?;
                            self.emit(
                                Instruction::SetIndex {
                                    obj: dst,
                                    idx: key_reg,
                                    src: value_reg,
                                },
                                *line,
                            );
                        }
                    }
                    self.release_temps(mark);
                }
            }
            Expr::Member { object, name, line } => {
                let mark = self.temp_mark();
                let obj = self.alloc_reg(*line)?;
                self.compile_expr_to(object, obj)?;
                let key_k = self.string_constant(name, *line)?;
                self.emit(Instruction::GetField { dst, obj, key_k }, *line);
                self.release_temps(mark);
            }
            Expr::Index { object, index, line } => {
                let mark = self.temp_mark();
                let obj = self.alloc_reg(*line)?;
                self.compile_expr_to(object, obj)?;
                let idx = self.alloc_reg(*line)?;
                self.compile_expr_to(index, idx)?;
                self.emit(Instruction::GetIndex { dst, obj, idx }, *line);
                self.release_temps(mark);
            }
            Expr::Call { function, args, line } => {
                let mark = self.temp_mark();
                let base = self.alloc_reg(*line)?;
                self.compile_expr_to(function, base)?;
                for arg in args {
                    let reg = self.alloc_reg(*line)?;
                    self.compile_expr_to(arg, reg)?;
                }
                self.emit(
                    Instruction::Call {
                        base,
                        args: args.len() as u8,
                    },
                    *line,
                );
                if base != dst {
                    self.emit(Instruction::Move { dst, src: base }, *line);
                }
                self.release_temps(mark);
            }
            Expr::MethodCall {
                object,
                method,
                args,
                line,
            } => {
                let mark = self.temp_mark();
                let base = self.alloc_reg(*line)?;
                let self_reg = self.alloc_reg(*line)?;
                let obj = self.alloc_reg(*line)?;
                self.compile_expr_to(object, obj)?;
                let key_k = self.string_constant(method, *line)?;
                self.emit(Instruction::GetMethod { dst: base, obj, key_k }, *line);
                debug_assert_eq!(self_reg, base + 1);
                for arg in args {
                    let reg = self.alloc_reg(*line)?;
                    self.compile_expr_to(arg, reg)?;
                }
                self.emit(
                    Instruction::Call {
                        base,
                        args: args.len() as u8 + 1,
                    },
                    *line,
                );
                if base != dst {
                    self.emit(Instruction::Move { dst, src: base }, *line);
                }
                self.release_temps(mark);
            }
            Expr::BinOp { op, lhs, rhs, line } => {
                self.compile_binop(*op, lhs, rhs, dst, *line)?;
            }
            Expr::UnOp { op, operand, line } => {
                let mark = self.temp_mark();
                let src = self.alloc_reg(*line)?;
                self.compile_expr_to(operand, src)?;
                let op = match op {
                    UnOp::Neg => UnaryOp::Neg,
                    UnOp::Not => UnaryOp::Not,
                    UnOp::Len => UnaryOp::Len,
                };
                self.emit(Instruction::Unary { op, dst, src }, *line);
                self.release_temps(mark);
            }
        }
        Ok(())
    }

    fn compile_binop(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
        line: usize,
    ) -> Result<(), CompileError> {
        // and/or short-circuit through the destination register
        if matches!(op, BinOp::And | BinOp::Or) {
            self.compile_expr_to(lhs, dst)?;
            let skip = self.emit(
                Instruction::TestJump {
                    reg: dst,
                    jump_if: matches!(op, BinOp::Or),
                    offset: 0,
                },
                line,
            );
            self.compile_expr_to(rhs, dst)?;
            self.patch_jump_here(skip);
            return Ok(());
        }

        let mark = self.temp_mark();
        let lhs_reg = self.alloc_reg(line)?;
        self.compile_expr_to(lhs, lhs_reg)?;
        let rhs_reg = self.alloc_reg(line)?;
        self.compile_expr_to(rhs, rhs_reg)?;

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod
            | BinOp::Pow => {
                let op = match op {
                    BinOp::Add => ArithOp::Add,
                    BinOp::Sub => ArithOp::Sub,
                    BinOp::Mul => ArithOp::Mul,
                    BinOp::Div => ArithOp::Div,
                    BinOp::IDiv => ArithOp::IDiv,
                    BinOp::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                self.emit(
                    Instruction::Arith {
                        op,
                        dst,
                        lhs: lhs_reg,
                        rhs: rhs_reg,
                    },
                    line,
                );
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let op = match op {
                    BinOp::Eq => CompareOp::Eq,
                    BinOp::Ne => CompareOp::Ne,
                    BinOp::Lt => CompareOp::Lt,
                    BinOp::Le => CompareOp::Le,
                    BinOp::Gt => CompareOp::Gt,
                    _ => CompareOp::Ge,
                };
                self.emit(
                    Instruction::Compare {
                        op,
                        dst,
                        lhs: lhs_reg,
                        rhs: rhs_reg,
                    },
                    line,
                );
            }
            BinOp::Concat => {
                self.emit(
                    Instruction::Concat {
                        dst,
                        start: lhs_reg,
                        count: 2,
                    },
                    line,
                );
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuit handled above"),
        }
        self.release_temps(mark);
        Ok(())
    }
}
