/// Axiom VM CLI (axiom)
///
/// Operates on already-compiled bytecode files — compilation itself is a
/// collaborator's concern, out of scope for this crate. `run` loads and
/// executes a `.bu.bc` file to completion (ticking the scheduler until
/// every process is dead); `disasm` renders a file's functions in
/// `name OPERAND` form; `conf` reads/writes `~/.axiom/conf.txt`.

use axiom::conf::{cmd_conf_describe, cmd_conf_get, cmd_conf_list, cmd_conf_reset, cmd_conf_set};
use axiom::diagnostics::DiagnosticEngine;
use axiom::interpreter::Interpreter;
use axiom::native::NativeRegistry;
use clap::{Parser as ClapParser, Subcommand};
use miette::Result;
use std::path::PathBuf;

// 64 MB stack — deeply-recursive scripts shouldn't blow the native stack
// before they hit the VM's own configured frame limit.
const STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "axiom",
    version = "0.1.0",
    about = "The Axiom VM toolchain",
    long_about = "axiom — run and inspect compiled Axiom (.bu.bc) bytecode files."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a compiled bytecode file (.bu.bc)
    Run {
        path: PathBuf,
        /// Fixed per-tick delta time in seconds
        #[arg(long, default_value_t = 1.0 / 60.0)]
        dt: f64,
        /// Hard cap on scheduler ticks, as a safety net against scripts
        /// that never finish spawning/yielding
        #[arg(long, default_value_t = 100_000)]
        max_ticks: u64,
    },
    /// Disassemble every function in a bytecode file
    Disasm { path: PathBuf },
    /// Manage Axiom runtime configuration (~/.axiom/conf.txt)
    Conf {
        #[command(subcommand)]
        cmd: ConfCommands,
    },
}

#[derive(Subcommand)]
enum ConfCommands {
    /// Set a property: axiom conf set property=value
    Set { spec: String },
    /// Get a property: axiom conf get property
    Get { key: String },
    /// List all properties with current values
    List,
    /// Reset all properties to their defaults
    Reset,
    /// Show detailed documentation for a property
    Describe { key: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = std::thread::Builder::new()
        .name("axiom-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli))))
        .expect("failed to spawn axiom worker thread")
        .join();

    match result {
        Ok(Ok(inner)) => inner,
        Ok(Err(panic_payload)) | Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                format!("internal error (panic): {}", s)
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                format!("internal error (panic): {}", s)
            } else {
                "internal error: unexpected panic in axiom runtime".to_string()
            };
            eprintln!("axiom crashed: {}", msg);
            Err(miette::miette!("{}", msg))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { path, dt, max_ticks } => {
            let engine = DiagnosticEngine::new(path.display().to_string(), "");
            let mut vm = Interpreter::new(NativeRegistry::new());

            vm.load_from_file(&path).map_err(|e| {
                engine.emit_load(&e);
                miette::miette!("{}", e)
            })?;

            for def_index in 0..vm.process_defs.len() as u32 {
                vm.spawn(def_index, &[]).map_err(|e| miette::miette!("{}", e))?;
            }

            let mut tick = 0u64;
            while !vm.processes.is_empty() && tick < max_ticks {
                vm.update(dt);
                tick += 1;
            }
        }

        Commands::Disasm { path } => {
            let engine = DiagnosticEngine::new(path.display().to_string(), "");
            let mut vm = Interpreter::new(NativeRegistry::new());
            vm.load_from_file(&path).map_err(|e| {
                engine.emit_load(&e);
                miette::miette!("{}", e)
            })?;

            for (i, f) in vm.functions.iter().enumerate() {
                println!("== function {} ({}) ==", i, f.name.as_str());
                print!("{}", axiom::code::disassemble(f));
                println!();
            }
        }

        Commands::Conf { cmd } => match cmd {
            ConfCommands::Set { spec } => {
                cmd_conf_set(&spec).map_err(|e| miette::miette!("{}", e))?;
            }
            ConfCommands::Get { key } => {
                cmd_conf_get(&key).map_err(|e| miette::miette!("{}", e))?;
            }
            ConfCommands::List => cmd_conf_list(),
            ConfCommands::Reset => {
                cmd_conf_reset().map_err(|e| miette::miette!("{}", e))?;
            }
            ConfCommands::Describe { key } => cmd_conf_describe(&key),
        },
    }

    Ok(())
}
