//! Script disassembler CLI.
//!
//! Prints the region map of a compiled script image followed by a listing of
//! every instruction in main and mission code.
//!
//! # Usage
//! ```text
//! disassembler <script.scm> [OPTIONS]
//! ```

use scmvm::virtual_machine::definitions::load_registry;
use scmvm::virtual_machine::inspect::listing;
use scmvm::virtual_machine::registry::OpcodeRegistry;
use scmvm::virtual_machine::structure::GameVariant;
use scmvm::virtual_machine::vm::{VM, VmConfig};
use scmvm::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

const USAGE: &str = "\
Script Disassembler

USAGE:
    {program} <script.scm> [OPTIONS]

ARGS:
    <script.scm>    Compiled script image to list

OPTIONS:
    --opcodes <file>    Opcode catalogue (built-in opcodes only when omitted)
    --symbols <file>    Symbol header naming catalogue opcodes
    --game <vc|sa>      Script format family (defaults to vc)
    -h, --help          Print this help message

EXAMPLES:
    {program} main.scm --opcodes VICESCM.ini > main.txt
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

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--opcodes" | "--symbols" | "--game") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                let value = args[i].clone();
                match k {
                    "--opcodes" => opcodes = Some(value),
                    "--symbols" => symbols = Some(value),
                    _ => {
                        variant = value.parse().unwrap_or_else(|e| {
                            error!("{e}");
                            process::exit(1);
                        })
                    }
                }
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
    let vm = VM::load(blob, registry, config).unwrap_or_else(|e| {
        error!("Failed to load script: {e}");
        process::exit(1)
    });

    match listing(&vm) {
        Ok(text) => print!("{}", text),
        Err(e) => {
            error!("Disassembly failed: {e}");
            process::exit(1);
        }
    }
}

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
