//! Builtin global environment and native function dispatch
//!
//! Everything a script can reach as a global lives in the map built here;
//! the names mirror the checker's typed whitelist, so a checked program
//! can never fault on `ForbiddenGlobal`. Builtins are deterministic: host
//! state only enters through the chain API oracles.

use super::errors::VmError;
use super::value::{BuiltinFn, Table, TableKey, Value};
use super::{Signal, VmSession};
use crate::loader;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

fn lib_table(entries: &[(&str, BuiltinFn)]) -> Value {
    let mut table = Table::new();
    for (name, builtin) in entries {
        table
            .map
            .insert(TableKey::Str(name.to_string()), Value::Builtin(*builtin));
    }
    Value::Table(Rc::new(RefCell::new(table)))
}

/// The whitelisted global environment shared by every session
pub(crate) fn builtin_globals() -> BTreeMap<&'static str, Value> {
    use BuiltinFn::*;
    let mut globals: BTreeMap<&'static str, Value> = BTreeMap::new();

    globals.insert("print", Value::Builtin(Print));
    globals.insert("pprint", Value::Builtin(Pprint));
    globals.insert("tostring", Value::Builtin(Tostring));
    globals.insert("tojsonstring", Value::Builtin(Tojsonstring));
    globals.insert("tonumber", Value::Builtin(Tonumber));
    globals.insert("tointeger", Value::Builtin(Tointeger));
    globals.insert("type", Value::Builtin(TypeOf));
    globals.insert("pairs", Value::Builtin(Pairs));
    globals.insert("ipairs", Value::Builtin(Ipairs));
    globals.insert("error", Value::Builtin(ErrorFn));
    globals.insert("select", Value::Builtin(Select));
    globals.insert("exit", Value::Builtin(Exit));
    globals.insert("emit", Value::Builtin(Emit));
    globals.insert("import_contract", Value::Builtin(ImportContract));
    globals.insert(
        "import_contract_from_address",
        Value::Builtin(ImportContractFromAddress),
    );
    globals.insert(
        "transfer_from_contract_to_address",
        Value::Builtin(TransferToAddress),
    );
    globals.insert(
        "transfer_from_contract_to_public_account",
        Value::Builtin(TransferToAccount),
    );
    globals.insert(
        "get_contract_balance_amount",
        Value::Builtin(GetContractBalance),
    );
    globals.insert("get_chain_now", Value::Builtin(GetChainNow));
    globals.insert("get_chain_random", Value::Builtin(GetChainRandom));
    globals.insert("get_transaction_id", Value::Builtin(GetTransactionId));
    globals.insert("get_transaction_fee", Value::Builtin(GetTransactionFee));
    globals.insert("get_header_block_num", Value::Builtin(GetHeaderBlockNum));
    globals.insert(
        "get_current_contract_address",
        Value::Builtin(GetCurrentContractAddress),
    );
    globals.insert("Stream", Value::Builtin(StreamNew));

    globals.insert(
        "table",
        lib_table(&[
            ("insert", TableInsert),
            ("append", TableAppend),
            ("remove", TableRemove),
            ("length", TableLength),
            ("concat", TableConcat),
            ("sort", TableSort),
        ]),
    );
    globals.insert(
        "string",
        lib_table(&[
            ("len", StrLen),
            ("sub", StrSub),
            ("upper", StrUpper),
            ("lower", StrLower),
            ("rep", StrRep),
            ("byte", StrByte),
        ]),
    );
    globals.insert(
        "math",
        lib_table(&[
            ("floor", MathFloor),
            ("ceil", MathCeil),
            ("abs", MathAbs),
            ("max", MathMax),
            ("min", MathMin),
        ]),
    );
    globals.insert(
        "json",
        lib_table(&[("dumps", JsonDumps), ("loads", JsonLoads)]),
    );

    globals
}

fn type_fault(line: usize, message: impl Into<String>) -> VmError {
    VmError::TypeFault {
        line,
        message: message.into(),
    }
}

fn arg_str(args: &[Value], index: usize, line: usize, what: &str) -> Result<String, VmError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        other => Err(type_fault(
            line,
            format!(
                "{} expects a string argument, got {}",
                what,
                other.map(|v| v.type_name()).unwrap_or("nil")
            ),
        )),
    }
}

fn arg_int(args: &[Value], index: usize, line: usize, what: &str) -> Result<i64, VmError> {
    match args.get(index) {
        Some(Value::Int(i)) => Ok(*i),
        Some(Value::Number(n)) if n.fract() == 0.0 => Ok(*n as i64),
        other => Err(type_fault(
            line,
            format!(
                "{} expects an integer argument, got {}",
                what,
                other.map(|v| v.type_name()).unwrap_or("nil")
            ),
        )),
    }
}

fn arg_table(
    args: &[Value],
    index: usize,
    line: usize,
    what: &str,
) -> Result<Rc<RefCell<Table>>, VmError> {
    match args.get(index) {
        Some(Value::Table(t)) => Ok(Rc::clone(t)),
        other => Err(type_fault(
            line,
            format!(
                "{} expects a table argument, got {}",
                what,
                other.map(|v| v.type_name()).unwrap_or("nil")
            ),
        )),
    }
}

fn arg_stream(args: &[Value], index: usize, line: usize, what: &str) -> Result<u32, VmError> {
    match args.get(index) {
        Some(Value::Stream(handle)) => Ok(*handle),
        other => Err(type_fault(
            line,
            format!(
                "{} expects a stream argument, got {}",
                what,
                other.map(|v| v.type_name()).unwrap_or("nil")
            ),
        )),
    }
}

impl VmSession {
    pub(crate) fn call_builtin(
        &mut self,
        builtin: BuiltinFn,
        args: &[Value],
        line: usize,
    ) -> Result<Signal, VmError> {
        use BuiltinFn::*;
        let value = match builtin {
            Print => {
                let rendered: Vec<String> = args.iter().map(|a| a.display()).collect();
                self.ctx.output.push_str(&rendered.join("\t"));
                self.ctx.output.push('\n');
                Value::Nil
            }
            Pprint => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| match a.to_json() {
                        Ok(json) => {
                            serde_json::to_string_pretty(&json).unwrap_or_else(|_| a.display())
                        }
                        Err(_) => a.display(),
                    })
                    .collect();
                self.ctx.output.push_str(&rendered.join("\t"));
                self.ctx.output.push('\n');
                Value::Nil
            }
            Tostring => args
                .first()
                .map(|a| Value::from_str(a.display()))
                .unwrap_or(Value::from_str("nil")),
            Tojsonstring | JsonDumps => {
                let target = args.first().cloned().unwrap_or(Value::Nil);
                Value::from_str(target.to_json()?.to_string())
            }
            Tonumber => match args.first() {
                Some(Value::Int(i)) => Value::Number(*i as f64),
                Some(Value::Number(n)) => Value::Number(*n),
                Some(Value::Str(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            Tointeger => match args.first() {
                Some(Value::Int(i)) => Value::Int(*i),
                Some(Value::Number(n)) if n.fract() == 0.0 && n.is_finite() => {
                    Value::Int(*n as i64)
                }
                Some(Value::Str(s)) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            TypeOf => Value::from_str(
                args.first().map(|a| a.type_name()).unwrap_or("nil"),
            ),
            Pairs | Ipairs => match args.first() {
                Some(value @ Value::Table(_)) => value.clone(),
                other => {
                    return Err(type_fault(
                        line,
                        format!(
                            "pairs expects a table, got {}",
                            other.map(|v| v.type_name()).unwrap_or("nil")
                        ),
                    ))
                }
            },
            ErrorFn => {
                let message = args.first().map(|a| a.display()).unwrap_or_default();
                return Err(VmError::ScriptError { message });
            }
            Select => match args.first() {
                Some(Value::Str(s)) if &**s == "#" => Value::Int(args.len() as i64 - 1),
                Some(Value::Int(i)) => args.get(*i as usize).cloned().unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            Exit => return Err(VmError::ExplicitExit),

            TableInsert => {
                let table = arg_table(args, 0, line, "table.insert")?;
                match args.len() {
                    2 => table.borrow_mut().array.push(args[1].clone()),
                    3 => {
                        let pos = arg_int(args, 1, line, "table.insert")?;
                        let mut table = table.borrow_mut();
                        if pos < 1 || pos as usize > table.array.len() + 1 {
                            return Err(type_fault(line, "table.insert position out of bounds"));
                        }
                        table.array.insert(pos as usize - 1, args[2].clone());
                    }
                    _ => return Err(type_fault(line, "wrong number of arguments to table.insert")),
                }
                Value::Nil
            }
            TableAppend => {
                let table = arg_table(args, 0, line, "table.append")?;
                table
                    .borrow_mut()
                    .array
                    .push(args.get(1).cloned().unwrap_or(Value::Nil));
                Value::Nil
            }
            TableRemove => {
                let table = arg_table(args, 0, line, "table.remove")?;
                let mut table = table.borrow_mut();
                if args.len() >= 2 {
                    let pos = arg_int(args, 1, line, "table.remove")?;
                    if pos < 1 || pos as usize > table.array.len() {
                        return Err(type_fault(line, "table.remove position out of bounds"));
                    }
                    table.array.remove(pos as usize - 1)
                } else {
                    table.array.pop().unwrap_or(Value::Nil)
                }
            }
            TableLength => {
                let table = arg_table(args, 0, line, "table.length")?;
                let len = table.borrow().len();
                Value::Int(len)
            }
            TableConcat => {
                let table = arg_table(args, 0, line, "table.concat")?;
                let separator = match args.get(1) {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => String::new(),
                };
                let rendered: Vec<String> =
                    table.borrow().array.iter().map(|v| v.display()).collect();
                Value::from_str(rendered.join(&separator))
            }
            TableSort => {
                let table = arg_table(args, 0, line, "table.sort")?;
                let mut table = table.borrow_mut();
                let all_numbers = table.array.iter().all(|v| v.as_number().is_some());
                let all_strings = table
                    .array
                    .iter()
                    .all(|v| matches!(v, Value::Str(_)));
                if all_numbers {
                    table.array.sort_by(|a, b| {
                        a.as_number()
                            .partial_cmp(&b.as_number())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                } else if all_strings {
                    table.array.sort_by(|a, b| match (a, b) {
                        (Value::Str(x), Value::Str(y)) => x.cmp(y),
                        _ => std::cmp::Ordering::Equal,
                    });
                } else {
                    return Err(type_fault(
                        line,
                        "table.sort requires all numbers or all strings",
                    ));
                }
                Value::Nil
            }

            StrLen => Value::Int(arg_str(args, 0, line, "string.len")?.len() as i64),
            StrSub => {
                let s = arg_str(args, 0, line, "string.sub")?;
                let len = s.len() as i64;
                let normalize = |i: i64| -> i64 {
                    if i < 0 {
                        (len + i + 1).max(1)
                    } else if i == 0 {
                        1
                    } else {
                        i
                    }
                };
                let start = normalize(arg_int(args, 1, line, "string.sub")?);
                let stop = match args.get(2) {
                    Some(_) => normalize(arg_int(args, 2, line, "string.sub")?).min(len),
                    None => len,
                };
                if start > stop {
                    Value::from_str("")
                } else {
                    let bytes = &s.as_bytes()[start as usize - 1..stop as usize];
                    Value::from_str(String::from_utf8_lossy(bytes).to_string())
                }
            }
            StrUpper => Value::from_str(arg_str(args, 0, line, "string.upper")?.to_uppercase()),
            StrLower => Value::from_str(arg_str(args, 0, line, "string.lower")?.to_lowercase()),
            StrRep => {
                let s = arg_str(args, 0, line, "string.rep")?;
                let n = arg_int(args, 1, line, "string.rep")?.max(0) as usize;
                Value::from_str(s.repeat(n))
            }
            StrByte => {
                let s = arg_str(args, 0, line, "string.byte")?;
                let i = match args.get(1) {
                    Some(_) => arg_int(args, 1, line, "string.byte")?,
                    None => 1,
                };
                s.as_bytes()
                    .get(i as usize - 1)
                    .map(|b| Value::Int(*b as i64))
                    .unwrap_or(Value::Nil)
            }

            MathFloor => {
                let n = args
                    .first()
                    .and_then(|a| a.as_number())
                    .ok_or_else(|| type_fault(line, "math.floor expects a number"))?;
                Value::Int(n.floor() as i64)
            }
            MathCeil => {
                let n = args
                    .first()
                    .and_then(|a| a.as_number())
                    .ok_or_else(|| type_fault(line, "math.ceil expects a number"))?;
                Value::Int(n.ceil() as i64)
            }
            MathAbs => match args.first() {
                Some(Value::Int(i)) => Value::Int(i.wrapping_abs()),
                Some(Value::Number(n)) => Value::Number(n.abs()),
                other => {
                    return Err(type_fault(
                        line,
                        format!(
                            "math.abs expects a number, got {}",
                            other.map(|v| v.type_name()).unwrap_or("nil")
                        ),
                    ))
                }
            },
            MathMax | MathMin => {
                let pick_max = builtin == MathMax;
                match (args.first(), args.get(1)) {
                    (Some(Value::Int(a)), Some(Value::Int(b))) => {
                        Value::Int(if pick_max { *a.max(b) } else { *a.min(b) })
                    }
                    (Some(x), Some(y)) => {
                        let (a, b) = (x.as_number(), y.as_number());
                        match (a, b) {
                            (Some(a), Some(b)) => Value::Number(if pick_max {
                                a.max(b)
                            } else {
                                a.min(b)
                            }),
                            _ => return Err(type_fault(line, "math.max/min expect numbers")),
                        }
                    }
                    _ => return Err(type_fault(line, "math.max/min expect two numbers")),
                }
            }

            JsonLoads => {
                let text = arg_str(args, 0, line, "json.loads")?;
                let parsed: serde_json::Value =
                    serde_json::from_str(&text).map_err(|e| VmError::ScriptError {
                        message: format!("invalid json: {}", e),
                    })?;
                Value::from_json(&parsed)
            }

            Emit => {
                let name = arg_str(args, 0, line, "emit")?;
                let payload = arg_str(args, 1, line, "emit")?;
                let contract = self
                    .ctx
                    .current_contract()
                    .map(|f| f.address.clone())
                    .unwrap_or_default();
                self.ctx.record_event(&contract, &name, &payload);
                Value::Nil
            }

            ImportContract => {
                let name = arg_str(args, 0, line, "import_contract")?;
                return loader::import_contract(self, &name);
            }
            ImportContractFromAddress => {
                let address = arg_str(args, 0, line, "import_contract_from_address")?;
                return loader::import_contract_by_address(self, &address);
            }

            TransferToAddress => {
                let from = self.ctx.current_contract_address()?.to_string();
                let to = arg_str(args, 0, line, "transfer_from_contract_to_address")?;
                let asset = arg_str(args, 1, line, "transfer_from_contract_to_address")?;
                let amount = arg_int(args, 2, line, "transfer_from_contract_to_address")?;
                let code = self
                    .chain
                    .transfer_from_contract_to_address(&from, &to, &asset, amount)?;
                Value::Int(code)
            }
            TransferToAccount => {
                let from = self.ctx.current_contract_address()?.to_string();
                let to = arg_str(args, 0, line, "transfer_from_contract_to_public_account")?;
                let asset = arg_str(args, 1, line, "transfer_from_contract_to_public_account")?;
                let amount = arg_int(args, 2, line, "transfer_from_contract_to_public_account")?;
                let code = self
                    .chain
                    .transfer_from_contract_to_public_account(&from, &to, &asset, amount)?;
                Value::Int(code)
            }
            GetContractBalance => {
                let address = arg_str(args, 0, line, "get_contract_balance_amount")?;
                let asset = arg_str(args, 1, line, "get_contract_balance_amount")?;
                Value::Int(self.chain.get_contract_balance_amount(&address, &asset))
            }

            GetChainNow => Value::Int(self.chain.get_chain_now()),
            GetChainRandom => Value::Number(self.chain.get_chain_random()),
            GetTransactionId => Value::from_str(self.chain.get_transaction_id()),
            GetTransactionFee => Value::Int(self.chain.get_transaction_fee()),
            GetHeaderBlockNum => Value::Int(self.chain.get_header_block_num()),
            GetCurrentContractAddress => {
                Value::from_str(self.ctx.current_contract_address()?.to_string())
            }

            StreamNew => Value::Stream(self.ctx.streams.alloc(Vec::new())),
            StreamAppend => {
                let handle = arg_stream(args, 0, line, "stream:append")?;
                let text = arg_str(args, 1, line, "stream:append")?;
                self.ctx
                    .streams
                    .get_mut(handle)
                    .ok_or(VmError::InvalidStreamHandle { handle })?
                    .extend_from_slice(text.as_bytes());
                Value::Nil
            }
            StreamSize => {
                let handle = arg_stream(args, 0, line, "stream:size")?;
                let len = self
                    .ctx
                    .streams
                    .get(handle)
                    .ok_or(VmError::InvalidStreamHandle { handle })?
                    .len();
                Value::Int(len as i64)
            }
            StreamDump => {
                let handle = arg_stream(args, 0, line, "stream:dump")?;
                let bytes = self
                    .ctx
                    .streams
                    .get(handle)
                    .ok_or(VmError::InvalidStreamHandle { handle })?;
                Value::from_str(String::from_utf8_lossy(bytes).to_string())
            }
        };
        Ok(Signal::Value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typecheck::GLOBAL_WHITELIST;

    #[test]
    fn test_runtime_covers_checker_whitelist() {
        let globals = builtin_globals();
        for name in GLOBAL_WHITELIST.iter() {
            let dynamic = matches!(*name, "self" | "caller" | "caller_address");
            assert!(
                dynamic || globals.contains_key(name),
                "whitelisted global '{}' has no runtime binding",
                name
            );
        }
    }

    #[test]
    fn test_runtime_globals_are_whitelisted() {
        let globals = builtin_globals();
        for name in globals.keys() {
            assert!(
                crate::typecheck::is_whitelisted_global(name),
                "runtime global '{}' is missing from the checker whitelist",
                name
            );
        }
    }
}
