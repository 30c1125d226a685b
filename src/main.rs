//! Script runner CLI.
//!
//! Loads a compiled script image and executes it tick by tick.
//!
//! # Usage
//! ```text
//! scmvm <script.scm> [OPTIONS]
//! ```
//!
//! # Options
//! - `--opcodes <file>`: Opcode catalogue (INI); built-in opcodes only when omitted
//! - `--symbols <file>`: Symbol header naming catalogue opcodes
//! - `--game <vc|sa>`: Script format family (defaults to `vc`)
//! - `--ticks <n>`: Number of ticks to run (defaults to 1000)
//! - `--step`: Run one tick per line read from stdin
//! - `--trace`: Log every executed instruction
//! - `--dump`: Print a memory dump around the current PC when done
//!
//! # Examples
//! ```text
//! scmvm main.scm --opcodes VICESCM.ini --ticks 50000
//! scmvm main.scm --opcodes SASCM.ini --symbols opcodes.h --game sa --step --trace
//! ```

use scmvm::utils::log::set_trace;
use scmvm::virtual_machine::definitions::load_registry;
use scmvm::virtual_machine::errors::VMError;
use scmvm::virtual_machine::inspect::dump_memory;
use scmvm::virtual_machine::registry::OpcodeRegistry;
use scmvm::virtual_machine::structure::GameVariant;
use scmvm::virtual_machine::vm::{VM, VmConfig};
use scmvm::{error, info};
use std::env;
use std::fs;
use std::io::{self, BufRead};
use std::path::Path;
use std::process;
use termcolor::{ColorChoice, StandardStream};

const DUMP_RADIUS: usize = 64;

const USAGE: &str = "\
Script Runner

USAGE:
    {program} <script.scm> [OPTIONS]

ARGS:
    <script.scm>    Compiled script image to run

OPTIONS:
    --opcodes <file>    Opcode catalogue (built-in opcodes only when omitted)
    --symbols <file>    Symbol header naming catalogue opcodes
    --game <vc|sa>      Script format family (defaults to vc)
    --ticks <n>         Number of ticks to run (defaults to 1000)
    --step              Run one tick per line read from stdin (q quits)
    --trace             Log every executed instruction
    --dump              Dump memory around the current PC when done
    -h, --help          Print this help message

EXAMPLES:
    # Run the first 50000 ticks
    {program} main.scm --opcodes VICESCM.ini --ticks 50000

    # Step through a San Andreas script with named opcodes
    {program} main.scm --opcodes SASCM.ini --symbols opcodes.h --game sa --step --trace
";

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let script_path = &args[1];
    let mut opcodes: Option<String> = None;
    let mut symbols: Option<String> = None;
    let mut variant = GameVariant::default();
    let mut ticks = 1000u64;
    let mut step = false;
    let mut dump = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--opcodes" | "--symbols" | "--game" | "--ticks") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                let value = args[i].clone();
                match k {
                    "--opcodes" => opcodes = Some(value),
                    "--symbols" => symbols = Some(value),
                    "--game" => {
                        variant = value.parse().unwrap_or_else(|e| {
                            error!("{e}");
                            process::exit(1);
                        })
                    }
                    _ => {
                        ticks = value.parse::<u64>().unwrap_or_else(|_| {
                            error!("Invalid tick count: '{}' is not a valid number", value);
                            process::exit(1);
                        })
                    }
                }
                i += 1;
            }
            "--step" => {
                step = true;
                i += 1;
            }
            "--trace" => {
                set_trace(true);
                i += 1;
            }
            "--dump" => {
                dump = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let registry = match &opcodes {
        Some(path) => load_registry(Path::new(path), symbols.as_deref().map(Path::new)),
        None => OpcodeRegistry::builtin(),
    }
    .unwrap_or_else(|e| {
        error!("Failed to load opcodes: {e}");
        process::exit(1)
    });

    let blob = fs::read(script_path).unwrap_or_else(|e| {
        error!("Failed to read script {}: {}", script_path, e);
        process::exit(1)
    });

    let config = VmConfig {
        variant,
        ..VmConfig::default()
    };
    let mut vm = VM::load(blob, registry, config).unwrap_or_else(|e| {
        error!("Failed to load script: {e}");
        process::exit(1)
    });

    let result = if step {
        run_stepped(&mut vm)
    } else {
        vm.run(ticks).map(|_| ())
    };

    match result {
        Ok(()) => {}
        Err(VMError::AllThreadsTerminated) => info!("All threads terminated"),
        Err(e) => {
            error!("Tick {} failed: {}", vm.ticks(), e);
            dump_around_pc(&vm);
            process::exit(1);
        }
    }

    let snapshot = vm.snapshot();
    info!(
        "Ran {} ticks, {} threads, memory digest {}",
        snapshot.tick,
        snapshot.threads.len(),
        snapshot.memory_digest
    );
    if dump {
        dump_around_pc(&vm);
    }
}

/// One tick per stdin line until EOF or `q`.
fn run_stepped(vm: &mut VM) -> Result<(), VMError> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim() == "q" {
            break;
        }
        let record = vm.tick()?;
        let rendered = vm
            .decode_at(record.address)
            .ok()
            .zip(vm.registry().definition(record.opcode))
            .map(|(decoded, definition)| decoded.render(definition))
            .unwrap_or_default();
        println!(
            "[{}] thread {} @ {:08}: {}",
            record.tick, record.thread, record.address, rendered
        );
    }
    Ok(())
}

fn dump_around_pc(vm: &VM) {
    let Some(pc) = vm.current_thread().map(|t| t.pc) else {
        return;
    };
    let highlight = vm.decode_at(pc).ok().map(|d| d.instruction);
    let window = pc.saturating_sub(DUMP_RADIUS)..pc + DUMP_RADIUS;
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    if let Err(e) = dump_memory(vm.memory(), window, highlight.as_ref(), &mut stdout) {
        error!("Failed to write memory dump: {e}");
    }
}

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
