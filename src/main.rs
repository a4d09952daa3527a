use clap::error::ErrorKind;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

use opal::{InterpretError, RuntimeConfig, VM};

// sysexits-style exit codes.
const EX_USAGE: i32 = 64;
const EX_DATAERR: i32 = 65;
const EX_SOFTWARE: i32 = 70;
const EX_IOERR: i32 = 74;

#[derive(Parser)]
#[command(name = "opal")]
#[command(about = "A compact bytecode VM for the Opal scripting language", long_about = None)]
struct Cli {
    /// Script to run; starts a REPL when omitted
    file: Option<PathBuf>,

    /// Trace execution: print the stack and each instruction as it runs
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Run a garbage collection before every allocation
    #[arg(long)]
    gc_stress: bool,

    /// Print GC statistics when the program finishes
    #[arg(long)]
    gc_stats: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            exit(code);
        }
    };

    let config = RuntimeConfig {
        trace_execution: cli.debug,
        gc_stress: cli.gc_stress,
        gc_stats: cli.gc_stats,
    };

    match cli.file {
        Some(path) => run_file(&path, config),
        None => repl(config),
    }
}

fn run_file(path: &Path, config: RuntimeConfig) -> ! {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", path.display());
            exit(EX_IOERR);
        }
    };
    let source = String::from_utf8_lossy(&bytes);
    // Binary-safe up to a trailing NUL, like a C string buffer.
    let source = match source.find('\0') {
        Some(end) => &source[..end],
        None => &source[..],
    };

    let gc_stats = config.gc_stats;
    let mut vm = VM::new(config);
    let result = vm.interpret(source);

    if gc_stats {
        let stats = vm.gc_stats();
        eprintln!(
            "[GC] Collections: {}, Total pause: {}us, Max pause: {}us",
            stats.cycles, stats.total_pause_us, stats.max_pause_us
        );
    }

    match result {
        Ok(()) => exit(0),
        Err(InterpretError::Compile) => exit(EX_DATAERR),
        Err(InterpretError::Runtime) => exit(EX_SOFTWARE),
    }
}

fn repl(config: RuntimeConfig) {
    let mut vm = VM::new(config);
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                // Errors were already reported; the REPL keeps going.
                let _ = vm.interpret(&line);
            }
            Err(_) => break,
        }
    }
}
