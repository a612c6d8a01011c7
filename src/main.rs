use chainscript::bytecode::ModuleStream;
use chainscript::chain::InMemoryChain;
use chainscript::engine::ScriptEngine;
use chainscript::errors::EngineError;
use chainscript::loader::ContractRef;
use chainscript::typecheck::CheckMode;
use chainscript::vm::ExecutionOutcome;
use chainscript::{SourceError, UndumpError};
use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use std::fs;
use std::process;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("bytecode error: {0}")]
    Undump(#[from] UndumpError),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

fn main() {
    env_logger::init();

    let matches = Command::new("chainscript")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Deterministic contract scripting engine")
        .subcommand_required(true)
        .subcommand(
            Command::new("compile")
                .about("Compile a source file to a module stream")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(
                    Arg::new("contract")
                        .long("contract")
                        .help("Enforce contract-mode rules")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("FILE")
                        .help("Output path (defaults to <file>.csbc)"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Type-check a source file and print the binding dump")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(
                    Arg::new("contract")
                        .long("contract")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("bindings")
                        .long("bindings")
                        .help("Print the resolved binding types as JSON")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a source file or compiled module")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .help("Instruction budget"),
                ),
        )
        .subcommand(
            Command::new("call")
                .about("Compile a contract, register it in-memory, and invoke one api")
                .arg(Arg::new("file").required(true).value_name("FILE"))
                .arg(Arg::new("api").required(true).value_name("API"))
                .arg(
                    Arg::new("arg")
                        .long("arg")
                        .value_name("STRING")
                        .default_value(""),
                )
                .arg(
                    Arg::new("query")
                        .long("query")
                        .help("Read-only invocation; never commits storage")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_name("N")
                        .help("Instruction budget"),
                ),
        )
        .subcommand(
            Command::new("disasm")
                .about("Print the instruction listing of a compiled module")
                .arg(Arg::new("file").required(true).value_name("FILE")),
        )
        .subcommand(
            Command::new("decompile")
                .about("Reconstruct pseudo-source from a compiled module")
                .arg(Arg::new("file").required(true).value_name("FILE")),
        )
        .get_matches();

    if let Err(error) = dispatch(&matches) {
        match &error {
            AppError::Source(source) => {
                for diagnostic in source.diagnostics() {
                    eprintln!("{} {}", "error:".red().bold(), diagnostic);
                }
            }
            other => eprintln!("{} {}", "error:".red().bold(), other),
        }
        process::exit(1);
    }
}

fn engine() -> ScriptEngine {
    ScriptEngine::new(Arc::new(InMemoryChain::new()))
}

fn parse_limit(matches: &clap::ArgMatches) -> Result<Option<u64>, AppError> {
    match matches.get_one::<String>("limit") {
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| AppError::Other(format!("invalid instruction limit '{}'", raw))),
        None => Ok(None),
    }
}

fn load_stream(path: &str) -> Result<ModuleStream, AppError> {
    let bytes = fs::read(path)?;
    Ok(ModuleStream::deserialize(&bytes)?)
}

fn dispatch(matches: &clap::ArgMatches) -> Result<(), AppError> {
    match matches.subcommand() {
        Some(("compile", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            let source = fs::read_to_string(path)?;
            let engine = engine();
            let stream = if sub.get_flag("contract") {
                engine.compile_contract(&source)?
            } else {
                engine.compile(&source)?
            };
            let output = match sub.get_one::<String>("output") {
                Some(output) => output.clone(),
                None => format!("{}.csbc", path),
            };
            fs::write(&output, stream.serialize())?;
            println!(
                "{} {} ({} apis, address {})",
                "compiled".green(),
                output,
                stream.api_names.len(),
                stream.derive_address()
            );
            Ok(())
        }
        Some(("check", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            let source = fs::read_to_string(path)?;
            let mode = if sub.get_flag("contract") {
                CheckMode::Contract
            } else {
                CheckMode::Plain
            };
            let program = engine().check(&source, mode)?;
            println!("{} {}", "ok".green(), path);
            if !program.event_names.is_empty() {
                println!("events: {}", program.event_names.join(", "));
            }
            if !program.api_names.is_empty() {
                println!("apis: {}", program.api_names.join(", "));
            }
            if sub.get_flag("bindings") {
                println!("{}", program.binding_dump_json());
            }
            Ok(())
        }
        Some(("run", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            let limit = parse_limit(sub)?;
            let engine = engine();
            let stream = if path.ends_with(".csbc") {
                load_stream(path)?
            } else {
                engine.compile(&fs::read_to_string(path)?)?
            };
            let receipt = engine.execute(&stream, limit)?;
            print!("{}", receipt.output);
            match &receipt.outcome {
                ExecutionOutcome::Completed(_) => {
                    if let Some(json) = &receipt.result_json {
                        println!("{} {}", "result:".green(), json);
                    }
                    println!("instructions: {}", receipt.instructions);
                }
                ExecutionOutcome::Stopped(reason) => {
                    println!(
                        "{} {:?} after {} instructions",
                        "stopped:".yellow(),
                        reason,
                        receipt.instructions
                    );
                }
            }
            Ok(())
        }
        Some(("call", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            let api = sub.get_one::<String>("api").expect("required arg");
            let arg = sub.get_one::<String>("arg").expect("defaulted arg");
            let query = sub.get_flag("query");
            let limit = parse_limit(sub)?;

            let chain = Arc::new(InMemoryChain::new());
            let engine = ScriptEngine::new(Arc::clone(&chain) as Arc<dyn chainscript::ChainApi>);
            let stream = engine.compile_contract(&fs::read_to_string(path)?)?;
            let address = chain.register_contract(None, stream);
            let receipt = engine.execute_contract_api(
                ContractRef::ByAddress(address.clone()),
                api,
                arg,
                query,
                limit,
            )?;
            print!("{}", receipt.output);
            if let Some(json) = &receipt.result_json {
                println!("{} {}", "result:".green(), json);
            }
            for event in &receipt.events {
                println!("event {}: {}", event.name, event.payload);
            }
            println!(
                "[{}] contract {} | instructions {} | committed {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                address,
                receipt.instructions,
                receipt.committed
            );
            Ok(())
        }
        Some(("disasm", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            print!("{}", engine().disassemble(&load_stream(path)?));
            Ok(())
        }
        Some(("decompile", sub)) => {
            let path = sub.get_one::<String>("file").expect("required arg");
            print!("{}", engine().decompile(&load_stream(path)?));
            Ok(())
        }
        _ => Err(AppError::Other("unknown subcommand".to_string())),
    }
}
