//! Command-line front end: read a script, write its obfuscated form.

use std::fs;
use std::process::ExitCode;

use colored::Colorize;

use luaveil::{obfuscate, ObfuscationOptions};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USAGE: &str = "\
Usage: luaveil <input.lua> [options]

Options:
  -o <file>          Write output to <file> (default: stdout)
  --options <file>   JSON options document
                     {\"vmEncryption\":true,\"stringEncryption\":true,
                      \"controlFlowFlattening\":true,\"memes\":false}
  --check            Parse and compile only; produce no output
  --disasm           Print bytecode disassembly instead of obfuscating";

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        eprintln!("{}", USAGE);
        return ExitCode::FAILURE;
    }

    let mut input: Option<String> = None;
    let mut output: Option<String> = None;
    let mut options_path: Option<String> = None;
    let mut check_only = false;
    let mut disasm = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-o" => {
                i += 1;
                match args.get(i) {
                    Some(path) => output = Some(path.clone()),
                    None => return fail("missing argument to -o"),
                }
            }
            "--options" => {
                i += 1;
                match args.get(i) {
                    Some(path) => options_path = Some(path.clone()),
                    None => return fail("missing argument to --options"),
                }
            }
            "--check" => check_only = true,
            "--disasm" => disasm = true,
            arg if arg.starts_with('-') => {
                return fail(&format!("unknown option '{}'", arg));
            }
            arg => {
                if input.is_some() {
                    return fail("more than one input file");
                }
                input = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let Some(input) = input else {
        return fail("no input file");
    };

    let source = match fs::read_to_string(&input) {
        Ok(source) => source,
        Err(err) => return fail(&format!("cannot read '{}': {}", input, err)),
    };

    let options = match options_path {
        Some(path) => match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<ObfuscationOptions>(&text) {
                Ok(options) => options,
                Err(err) => return fail(&format!("bad options file '{}': {}", path, err)),
            },
            Err(err) => return fail(&format!("cannot read '{}': {}", path, err)),
        },
        None => ObfuscationOptions::default(),
    };

    if check_only || disasm {
        return match luaveil::compile(&source) {
            Ok(proto) => {
                if disasm {
                    print!("{}", luaveil::disassemble(&proto));
                } else {
                    eprintln!("{} {}", "ok:".green().bold(), input);
                }
                ExitCode::SUCCESS
            }
            Err(err) => report(&err),
        };
    }

    match obfuscate(&source, &options) {
        Ok(script) => match output {
            Some(path) => match fs::write(&path, script) {
                Ok(()) => {
                    eprintln!("{} {} -> {}", "ok:".green().bold(), input, path);
                    ExitCode::SUCCESS
                }
                Err(err) => fail(&format!("cannot write '{}': {}", path, err)),
            },
            None => {
                print!("{}", script);
                ExitCode::SUCCESS
            }
        },
        Err(err) => report(&err),
    }
}

fn fail(message: &str) -> ExitCode {
    eprintln!("{} {}", "error:".red().bold(), message);
    ExitCode::FAILURE
}

fn report(err: &luaveil::ObfuscateError) -> ExitCode {
    eprintln!(
        "{} [{}] {}",
        "error:".red().bold(),
        err.stage(),
        err.public_message()
    );
    ExitCode::FAILURE
}
