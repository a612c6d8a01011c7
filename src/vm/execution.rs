//! The interpreter loop
//!
//! One frame per activation; registers are shared cells so closure capture
//! aliases the enclosing slot exactly like an open upvalue. The stop flag
//! and the instruction budget are checked at every instruction boundary,
//! which is the only suspension point a session has.

use super::errors::VmError;
use super::session::{ContractFrame, MAX_CALL_DEPTH};
use super::value::{BuiltinFn, Closure, TableIter, TableKey, Value};
use super::{Signal, StopReason, VmSession};
use crate::bytecode::{ArithOp, CompareOp, Constant, Instruction, Prototype, UnaryOp};
use std::cell::RefCell;
use std::rc::Rc;

struct Frame {
    closure: Rc<Closure>,
    registers: Vec<Rc<RefCell<Value>>>,
    pc: usize,
}

impl Frame {
    fn new(closure: Rc<Closure>, args: &[Value]) -> Frame {
        let proto = &closure.proto;
        let count = (proto.max_registers as usize)
            .max(proto.param_count as usize)
            .max(1);
        let registers: Vec<Rc<RefCell<Value>>> = (0..count)
            .map(|i| {
                let initial = args.get(i).cloned().unwrap_or(Value::Nil);
                Rc::new(RefCell::new(if i < proto.param_count as usize {
                    initial
                } else {
                    Value::Nil
                }))
            })
            .collect();
        Frame {
            closure,
            registers,
            pc: 0,
        }
    }

    fn get(&self, reg: u8) -> Result<Value, VmError> {
        self.get_off(reg, 0)
    }

    fn set(&self, reg: u8, value: Value) -> Result<(), VmError> {
        self.set_off(reg, 0, value)
    }

    /// Offset addressing for multi-register operands; the index is widened
    /// before the add so malformed operands error instead of wrapping
    fn get_off(&self, base: u8, offset: usize) -> Result<Value, VmError> {
        let index = base as usize + offset;
        self.registers
            .get(index)
            .map(|cell| cell.borrow().clone())
            .ok_or_else(|| VmError::MalformedBytecode {
                details: format!("register {} out of range", index),
            })
    }

    fn set_off(&self, base: u8, offset: usize, value: Value) -> Result<(), VmError> {
        let index = base as usize + offset;
        match self.registers.get(index) {
            Some(cell) => {
                *cell.borrow_mut() = value;
                Ok(())
            }
            None => Err(VmError::MalformedBytecode {
                details: format!("register {} out of range", index),
            }),
        }
    }

    fn cell(&self, reg: u8) -> Result<Rc<RefCell<Value>>, VmError> {
        self.registers
            .get(reg as usize)
            .cloned()
            .ok_or_else(|| VmError::MalformedBytecode {
                details: format!("register {} out of range", reg),
            })
    }

    fn constant(&self, index: u32) -> Result<&Constant, VmError> {
        self.closure
            .proto
            .constants
            .get(index as usize)
            .ok_or_else(|| VmError::MalformedBytecode {
                details: format!("constant {} out of range", index),
            })
    }

    fn string_constant(&self, index: u32) -> Result<String, VmError> {
        match self.constant(index)? {
            Constant::Str(s) => Ok(s.clone()),
            other => Err(VmError::MalformedBytecode {
                details: format!("expected string constant, got {}", other.type_name()),
            }),
        }
    }

    fn line(&self) -> usize {
        let pc = self.pc.saturating_sub(1);
        self.closure
            .proto
            .line_info
            .get(pc)
            .map(|l| *l as usize)
            .unwrap_or(0)
    }
}

impl VmSession {
    pub(crate) fn call_closure(
        &mut self,
        closure: &Rc<Closure>,
        args: &[Value],
    ) -> Result<Signal, VmError> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow {
                depth: self.call_depth,
            });
        }
        self.call_depth += 1;
        let result = self.run_frame(Frame::new(Rc::clone(closure), args));
        self.call_depth -= 1;
        result
    }

    /// Dispatch any callable value; contract proxies push and pop the
    /// current-contract stack around the call
    pub(crate) fn call_any(
        &mut self,
        callee: Value,
        mut args: Vec<Value>,
        line: usize,
    ) -> Result<Signal, VmError> {
        match callee {
            Value::Closure(closure) => self.call_closure(&closure, &args),
            Value::Builtin(builtin) => self.call_builtin(builtin, &args, line),
            Value::ContractFn(proxy) => {
                let has_self = args.first().map_or(false, |a| *a == proxy.module);
                if !has_self {
                    args.insert(0, proxy.module.clone());
                }
                self.ctx.contract_stack.push(ContractFrame {
                    address: proxy.address.clone(),
                    name: proxy.contract_name.clone(),
                    module: proxy.module.clone(),
                });
                let result = self.call_closure(&proxy.closure, &args);
                self.ctx.contract_stack.pop();
                result
            }
            other => Err(VmError::NotCallable {
                type_name: other.type_name().to_string(),
                line,
            }),
        }
    }

    fn run_frame(&mut self, mut frame: Frame) -> Result<Signal, VmError> {
        loop {
            if self.ctx.stop_requested() {
                return Ok(Signal::Stopped(StopReason::HostRequest));
            }
            if let Some(limit) = self.ctx.instruction_limit {
                if self.ctx.instruction_counter >= limit {
                    return Ok(Signal::Stopped(StopReason::BudgetExhausted));
                }
            }
            let instruction = match frame.closure.proto.instructions.get(frame.pc) {
                Some(instruction) => instruction.clone(),
                None => {
                    return Err(VmError::MalformedBytecode {
                        details: format!("pc {} out of range", frame.pc),
                    })
                }
            };
            self.ctx.instruction_counter += 1;
            frame.pc += 1;

            match instruction {
                Instruction::Move { dst, src } => {
                    let value = frame.get(src)?;
                    frame.set(dst, value)?;
                }
                Instruction::LoadConst { dst, k } => {
                    let value = match frame.constant(k)? {
                        Constant::Nil => Value::Nil,
                        Constant::Bool(b) => Value::Bool(*b),
                        Constant::Int(i) => Value::Int(*i),
                        Constant::Number(n) => Value::Number(*n),
                        Constant::Str(s) => Value::from_str(s),
                    };
                    frame.set(dst, value)?;
                }
                Instruction::LoadBool { dst, value } => {
                    frame.set(dst, Value::Bool(value))?;
                }
                Instruction::LoadNil { dst, count } => {
                    for i in 0..count {
                        frame.set_off(dst, i as usize, Value::Nil)?;
                    }
                }
                Instruction::GetGlobal { dst, name_k } => {
                    let name = frame.string_constant(name_k)?;
                    let value = self.read_global(&name, frame.line())?;
                    frame.set(dst, value)?;
                }
                Instruction::GetUpvalue { dst, index } => {
                    let cell = frame.closure.upvalues.get(index as usize).cloned().ok_or_else(
                        || VmError::MalformedBytecode {
                            details: format!("upvalue {} out of range", index),
                        },
                    )?;
                    let value = cell.borrow().clone();
                    frame.set(dst, value)?;
                }
                Instruction::SetUpvalue { src, index } => {
                    let value = frame.get(src)?;
                    let cell = frame.closure.upvalues.get(index as usize).cloned().ok_or_else(
                        || VmError::MalformedBytecode {
                            details: format!("upvalue {} out of range", index),
                        },
                    )?;
                    *cell.borrow_mut() = value;
                }
                Instruction::NewTable { dst } => {
                    frame.set(dst, Value::new_table())?;
                }
                Instruction::GetField { dst, obj, key_k } => {
                    let object = frame.get(obj)?;
                    let key = frame.string_constant(key_k)?;
                    let value = self.get_field(&object, &key, frame.line())?;
                    frame.set(dst, value)?;
                }
                Instruction::SetField { obj, key_k, src } => {
                    let object = frame.get(obj)?;
                    let key = frame.string_constant(key_k)?;
                    let value = frame.get(src)?;
                    self.set_field(&object, &key, value, frame.line())?;
                }
                Instruction::GetIndex { dst, obj, idx } => {
                    let object = frame.get(obj)?;
                    let index = frame.get(idx)?;
                    let value = self.get_index(&object, &index, frame.line())?;
                    frame.set(dst, value)?;
                }
                Instruction::SetIndex { obj, idx, src } => {
                    let object = frame.get(obj)?;
                    let index = frame.get(idx)?;
                    let value = frame.get(src)?;
                    self.set_index(&object, &index, value, frame.line())?;
                }
                Instruction::GetMethod { dst, obj, key_k } => {
                    let object = frame.get(obj)?;
                    let key = frame.string_constant(key_k)?;
                    let method = self.get_field(&object, &key, frame.line())?;
                    // bind the receiver: contract proxies substitute their
                    // own module table as self
                    let receiver = match &method {
                        Value::ContractFn(proxy) => proxy.module.clone(),
                        _ => object,
                    };
                    frame.set(dst, method)?;
                    frame.set_off(dst, 1, receiver)?;
                }
                Instruction::AppendList { obj, start, count } => {
                    let object = frame.get(obj)?;
                    match object {
                        Value::Table(table) => {
                            let mut table = table.borrow_mut();
                            for i in 0..count {
                                table.array.push(frame.get_off(start, i as usize)?);
                            }
                        }
                        other => {
                            return Err(VmError::NotIndexable {
                                type_name: other.type_name().to_string(),
                                line: frame.line(),
                            })
                        }
                    }
                }
                Instruction::Arith { op, dst, lhs, rhs } => {
                    let a = frame.get(lhs)?;
                    let b = frame.get(rhs)?;
                    let value = arith(op, &a, &b, frame.line())?;
                    frame.set(dst, value)?;
                }
                Instruction::Unary { op, dst, src } => {
                    let value = frame.get(src)?;
                    let result = unary(op, &value, frame.line())?;
                    frame.set(dst, result)?;
                }
                Instruction::Compare { op, dst, lhs, rhs } => {
                    let a = frame.get(lhs)?;
                    let b = frame.get(rhs)?;
                    let result = compare(op, &a, &b, frame.line())?;
                    frame.set(dst, Value::Bool(result))?;
                }
                Instruction::Concat { dst, start, count } => {
                    let mut out = String::new();
                    for i in 0..count {
                        let piece = frame.get_off(start, i as usize)?;
                        match &piece {
                            Value::Str(s) => out.push_str(s),
                            Value::Int(_) | Value::Number(_) => out.push_str(&piece.display()),
                            other => {
                                return Err(VmError::TypeFault {
                                    line: frame.line(),
                                    message: format!(
                                        "attempt to concatenate a {} value",
                                        other.type_name()
                                    ),
                                })
                            }
                        }
                    }
                    frame.set(dst, Value::from_str(out))?;
                }
                Instruction::Jump { offset } => {
                    jump(&mut frame, offset)?;
                }
                Instruction::TestJump {
                    reg,
                    jump_if,
                    offset,
                } => {
                    if frame.get(reg)?.truthy() == jump_if {
                        jump(&mut frame, offset)?;
                    }
                }
                Instruction::Call { base, args } => {
                    let callee = frame.get(base)?;
                    let mut arg_values = Vec::with_capacity(args as usize);
                    for i in 0..args {
                        arg_values.push(frame.get_off(base, 1 + i as usize)?);
                    }
                    match self.call_any(callee, arg_values, frame.line())? {
                        Signal::Value(value) => frame.set(base, value)?,
                        stopped @ Signal::Stopped(_) => return Ok(stopped),
                    }
                }
                Instruction::Closure { dst, proto } => {
                    let child = frame
                        .closure
                        .proto
                        .protos
                        .get(proto as usize)
                        .cloned()
                        .ok_or_else(|| VmError::MalformedBytecode {
                            details: format!("prototype {} out of range", proto),
                        })?;
                    let closure = self.instantiate(&frame, child)?;
                    frame.set(dst, closure)?;
                }
                Instruction::Return { src, has_value } => {
                    let value = if has_value { frame.get(src)? } else { Value::Nil };
                    return Ok(Signal::Value(value));
                }
                Instruction::ForPrep { base, offset } => {
                    let start = numeric(&frame.get(base)?, frame.line())?;
                    let stop = numeric(&frame.get_off(base, 1)?, frame.line())?;
                    let step = numeric(&frame.get_off(base, 2)?, frame.line())?;
                    // rewind once so the first ForLoop step lands on start
                    let rewound = num_sub(start, step);
                    frame.set(base, rewound.into_value())?;
                    frame.set_off(base, 1, stop.into_value())?;
                    frame.set_off(base, 2, step.into_value())?;
                    jump(&mut frame, offset)?;
                }
                Instruction::ForLoop { base, offset } => {
                    let current = numeric(&frame.get(base)?, frame.line())?;
                    let stop = numeric(&frame.get_off(base, 1)?, frame.line())?;
                    let step = numeric(&frame.get_off(base, 2)?, frame.line())?;
                    let next = num_add(current, step);
                    let keep_going = if step.as_f64() > 0.0 {
                        next.as_f64() <= stop.as_f64()
                    } else {
                        next.as_f64() >= stop.as_f64()
                    };
                    frame.set(base, next.into_value())?;
                    if keep_going {
                        frame.set_off(base, 3, next.into_value())?;
                        jump(&mut frame, offset)?;
                    }
                }
                Instruction::IterPrep { base } => {
                    let value = frame.get(base)?;
                    match value {
                        Value::Table(table) => {
                            let keys = table.borrow().iteration_keys();
                            frame.set(
                                base,
                                Value::Iterator(Rc::new(RefCell::new(TableIter {
                                    table,
                                    keys,
                                    pos: 0,
                                }))),
                            )?;
                        }
                        Value::Iterator(_) => {}
                        other => {
                            return Err(VmError::TypeFault {
                                line: frame.line(),
                                message: format!(
                                    "attempt to iterate a {} value",
                                    other.type_name()
                                ),
                            })
                        }
                    }
                }
                Instruction::IterNext { base, offset } => {
                    let iterator = match frame.get(base)? {
                        Value::Iterator(it) => it,
                        other => {
                            return Err(VmError::MalformedBytecode {
                                details: format!(
                                    "IterNext over a {} value",
                                    other.type_name()
                                ),
                            })
                        }
                    };
                    let mut advanced = None;
                    {
                        let mut it = iterator.borrow_mut();
                        while it.pos < it.keys.len() {
                            let key = it.keys[it.pos].clone();
                            it.pos += 1;
                            let value = it.table.borrow().get(&key);
                            if value != Value::Nil {
                                advanced = Some((key, value));
                                break;
                            }
                        }
                    }
                    if let Some((key, value)) = advanced {
                        let key_value = match key {
                            TableKey::Int(i) => Value::Int(i),
                            TableKey::Str(s) => Value::from_str(s),
                            TableKey::Bool(b) => Value::Bool(b),
                        };
                        frame.set_off(base, 1, key_value)?;
                        frame.set_off(base, 2, value)?;
                        jump(&mut frame, offset)?;
                    }
                }
            }
        }
    }

    /// Build a closure, capturing parent registers or re-capturing parent
    /// upvalues per the prototype's descriptor list
    fn instantiate(&mut self, frame: &Frame, proto: Prototype) -> Result<Value, VmError> {
        let mut upvalues = Vec::with_capacity(proto.upvalues.len());
        for descriptor in &proto.upvalues {
            let cell = if descriptor.from_parent_stack {
                frame.cell(descriptor.index)?
            } else {
                frame
                    .closure
                    .upvalues
                    .get(descriptor.index as usize)
                    .cloned()
                    .ok_or_else(|| VmError::MalformedBytecode {
                        details: format!("upvalue {} out of range", descriptor.index),
                    })?
            };
            upvalues.push(cell);
        }
        Ok(Value::Closure(Rc::new(Closure {
            proto: Rc::new(proto),
            upvalues,
        })))
    }

    fn read_global(&mut self, name: &str, line: usize) -> Result<Value, VmError> {
        match name {
            "self" => Ok(self
                .ctx
                .current_contract()
                .map(|f| f.module.clone())
                .unwrap_or(Value::Nil)),
            "caller" => Ok(Value::from_str(&self.ctx.caller)),
            "caller_address" => Ok(Value::from_str(&self.ctx.caller_address)),
            _ => match self.globals.get(name) {
                Some(value) => Ok(value.clone()),
                None => Err(VmError::ForbiddenGlobal {
                    name: name.to_string(),
                    line,
                }),
            },
        }
    }

    pub(crate) fn get_field(
        &mut self,
        object: &Value,
        key: &str,
        line: usize,
    ) -> Result<Value, VmError> {
        match object {
            Value::Table(table) => Ok(table.borrow().get(&TableKey::Str(key.to_string()))),
            Value::Resolver(resolver) => {
                let resolver = Rc::clone(resolver);
                resolver.get_field(&mut self.ctx, self.chain.as_ref(), key)
            }
            Value::Stream(handle) => Ok(stream_method(*handle, key)),
            other => Err(VmError::NotIndexable {
                type_name: other.type_name().to_string(),
                line,
            }),
        }
    }

    fn set_field(
        &mut self,
        object: &Value,
        key: &str,
        value: Value,
        line: usize,
    ) -> Result<(), VmError> {
        match object {
            Value::Table(table) => {
                table
                    .borrow_mut()
                    .set(TableKey::Str(key.to_string()), value);
                Ok(())
            }
            Value::Resolver(resolver) => {
                let resolver = Rc::clone(resolver);
                resolver.set_field(&mut self.ctx, self.chain.as_ref(), key, value)
            }
            other => Err(VmError::NotIndexable {
                type_name: other.type_name().to_string(),
                line,
            }),
        }
    }

    fn get_index(&mut self, object: &Value, index: &Value, line: usize) -> Result<Value, VmError> {
        match object {
            Value::Table(table) => {
                let key = table_key(index, line)?;
                Ok(table.borrow().get(&key))
            }
            Value::Resolver(resolver) => match index {
                Value::Str(s) => {
                    let resolver = Rc::clone(resolver);
                    resolver.get_field(&mut self.ctx, self.chain.as_ref(), s)
                }
                other => Err(VmError::TypeFault {
                    line,
                    message: format!("{} keys must be strings, got {}", resolver_tag(object), other.type_name()),
                }),
            },
            other => Err(VmError::NotIndexable {
                type_name: other.type_name().to_string(),
                line,
            }),
        }
    }

    fn set_index(
        &mut self,
        object: &Value,
        index: &Value,
        value: Value,
        line: usize,
    ) -> Result<(), VmError> {
        match object {
            Value::Table(table) => {
                let key = table_key(index, line)?;
                table.borrow_mut().set(key, value);
                Ok(())
            }
            Value::Resolver(resolver) => match index {
                Value::Str(s) => {
                    let resolver = Rc::clone(resolver);
                    resolver.set_field(&mut self.ctx, self.chain.as_ref(), s, value)
                }
                other => Err(VmError::TypeFault {
                    line,
                    message: format!("{} keys must be strings, got {}", resolver_tag(object), other.type_name()),
                }),
            },
            other => Err(VmError::NotIndexable {
                type_name: other.type_name().to_string(),
                line,
            }),
        }
    }
}

fn resolver_tag(value: &Value) -> &'static str {
    match value {
        Value::Resolver(resolver) => resolver.describe(),
        _ => "table",
    }
}

/// Builtin methods available on stream values; the receiver arrives as the
/// first call argument via GetMethod
fn stream_method(_handle: u32, key: &str) -> Value {
    match key {
        "append" => Value::Builtin(BuiltinFn::StreamAppend),
        "size" => Value::Builtin(BuiltinFn::StreamSize),
        "dump" => Value::Builtin(BuiltinFn::StreamDump),
        _ => Value::Nil,
    }
}

fn jump(frame: &mut Frame, offset: i32) -> Result<(), VmError> {
    let target = frame.pc as i64 + offset as i64;
    if target < 0 || target as usize > frame.closure.proto.instructions.len() {
        return Err(VmError::MalformedBytecode {
            details: format!("jump target {} out of range", target),
        });
    }
    frame.pc = target as usize;
    Ok(())
}

/// Numeric scratch value for the for-loop control block
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Num::Int(i) => Value::Int(i),
            Num::Float(f) => Value::Number(f),
        }
    }
}

fn numeric(value: &Value, line: usize) -> Result<Num, VmError> {
    match value {
        Value::Int(i) => Ok(Num::Int(*i)),
        Value::Number(n) => Ok(Num::Float(*n)),
        other => Err(VmError::TypeFault {
            line,
            message: format!("'for' bound must be a number, got {}", other.type_name()),
        }),
    }
}

fn num_add(a: Num, b: Num) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(x.wrapping_add(y)),
        _ => Num::Float(a.as_f64() + b.as_f64()),
    }
}

fn num_sub(a: Num, b: Num) -> Num {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => Num::Int(x.wrapping_sub(y)),
        _ => Num::Float(a.as_f64() - b.as_f64()),
    }
}

fn table_key(value: &Value, line: usize) -> Result<TableKey, VmError> {
    match value {
        Value::Int(i) => Ok(TableKey::Int(*i)),
        Value::Str(s) => Ok(TableKey::Str(s.to_string())),
        Value::Bool(b) => Ok(TableKey::Bool(*b)),
        Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Ok(TableKey::Int(*n as i64)),
        other => Err(VmError::TypeFault {
            line,
            message: format!("invalid table key of type {}", other.type_name()),
        }),
    }
}

fn arith(op: ArithOp, a: &Value, b: &Value, line: usize) -> Result<Value, VmError> {
    let fault = || VmError::TypeFault {
        line,
        message: format!(
            "attempt to perform arithmetic on {} and {}",
            a.type_name(),
            b.type_name()
        ),
    };

    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        let (x, y) = (*x, *y);
        return Ok(match op {
            ArithOp::Add => Value::Int(x.wrapping_add(y)),
            ArithOp::Sub => Value::Int(x.wrapping_sub(y)),
            ArithOp::Mul => Value::Int(x.wrapping_mul(y)),
            ArithOp::Div => {
                if y == 0 {
                    return Err(VmError::DivisionByZero { line });
                }
                Value::Number(x as f64 / y as f64)
            }
            ArithOp::IDiv => {
                if y == 0 {
                    return Err(VmError::DivisionByZero { line });
                }
                Value::Int(x.div_euclid(y))
            }
            ArithOp::Mod => {
                if y == 0 {
                    return Err(VmError::DivisionByZero { line });
                }
                Value::Int(x.rem_euclid(y))
            }
            ArithOp::Pow => {
                if y >= 0 && y <= u32::MAX as i64 {
                    match x.checked_pow(y as u32) {
                        Some(result) => Value::Int(result),
                        None => Value::Number((x as f64).powf(y as f64)),
                    }
                } else {
                    Value::Number((x as f64).powf(y as f64))
                }
            }
        });
    }

    let x = a.as_number().ok_or_else(|| fault())?;
    let y = b.as_number().ok_or_else(|| fault())?;
    Ok(match op {
        ArithOp::Add => Value::Number(x + y),
        ArithOp::Sub => Value::Number(x - y),
        ArithOp::Mul => Value::Number(x * y),
        ArithOp::Div => Value::Number(x / y),
        ArithOp::IDiv => Value::Int((x / y).floor() as i64),
        ArithOp::Mod => Value::Number(x - (x / y).floor() * y),
        ArithOp::Pow => Value::Number(x.powf(y)),
    })
}

fn unary(op: UnaryOp, value: &Value, line: usize) -> Result<Value, VmError> {
    match op {
        UnaryOp::Neg => match value {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(VmError::TypeFault {
                line,
                message: format!("attempt to negate a {} value", other.type_name()),
            }),
        },
        UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
        UnaryOp::Len => match value {
            Value::Str(s) => Ok(Value::Int(s.len() as i64)),
            Value::Table(t) => Ok(Value::Int(t.borrow().len())),
            other => Err(VmError::TypeFault {
                line,
                message: format!("attempt to get length of a {} value", other.type_name()),
            }),
        },
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value, line: usize) -> Result<bool, VmError> {
    match op {
        CompareOp::Eq => return Ok(a == b),
        CompareOp::Ne => return Ok(a != b),
        _ => {}
    }
    let ordering = match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => {
            let x = a.as_number();
            let y = b.as_number();
            match (x, y) {
                (Some(x), Some(y)) => x.partial_cmp(&y).ok_or(VmError::TypeFault {
                    line,
                    message: "comparison with NaN".to_string(),
                })?,
                _ => {
                    return Err(VmError::TypeFault {
                        line,
                        message: format!(
                            "attempt to compare {} with {}",
                            a.type_name(),
                            b.type_name()
                        ),
                    })
                }
            }
        }
    };
    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq | CompareOp::Ne => unreachable!(),
    })
}
