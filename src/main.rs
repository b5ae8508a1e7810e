use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use r5vm::{load_image, Halt};

/// RV32I virtual machine: runs a `.r5m` image through the interpreter
/// and, on supported hosts, through the x86-64 translator, then checks
/// that both engines produced identical state.
#[derive(Parser)]
#[command(name = "r5vm", version)]
struct Args {
    /// Path to the .r5m image
    image: PathBuf,

    /// Memory size override, decimal or 0x-hex with optional k/m suffix
    #[arg(long, value_parser = parse_mem_size)]
    mem: Option<usize>,
}

fn parse_mem_size(arg: &str) -> Result<usize, String> {
    let arg = arg.trim();
    let (num, mult) = match arg.chars().last() {
        Some('k') | Some('K') => (&arg[..arg.len() - 1], 1024),
        Some('m') | Some('M') => (&arg[..arg.len() - 1], 1024 * 1024),
        _ => (arg, 1),
    };
    let value = match num.strip_prefix("0x").or_else(|| num.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => num.parse(),
    }
    .map_err(|err| format!("invalid memory size {arg:?}: {err}"))?;
    Ok(value * mult)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let image = fs::read(&args.image)
        .with_context(|| format!("cannot open image {}", args.image.display()))?;
    let override_size = args.mem.unwrap_or(0);

    // Interpreter pass.
    let mut vm = load_image(&image, override_size).context("failed to load image")?;
    let start = Instant::now();
    let halt = match vm.run(0) {
        Ok(halt) => halt,
        Err(err) => {
            eprintln!("r5vm: {err}");
            eprintln!("{vm}");
            return Err(err.into());
        }
    };
    println!(
        "dt: {:.3} ms (interpreter)",
        start.elapsed().as_secs_f64() * 1e3
    );
    if let Halt::Exit(status) = halt {
        info!(status, "guest exited");
    }

    // Translator pass on a second, identically loaded VM.
    #[cfg(all(unix, target_arch = "x86_64"))]
    {
        let mut vmjit = load_image(&image, override_size).context("failed to load image")?;
        let start = Instant::now();
        if let Err(err) = r5vm::jit::run(&mut vmjit) {
            eprintln!("r5vm: {err}");
            eprintln!("{vmjit}");
            return Err(err.into());
        }
        println!("dt: {:.3} us (jit)", start.elapsed().as_secs_f64() * 1e6);

        if vm.regs != vmjit.regs {
            eprintln!("register mismatch between interpreter and JIT");
            eprintln!("{vm}");
            eprintln!("{vmjit}");
            anyhow::bail!("engine register state diverges");
        }
        if vm.memory() != vmjit.memory() {
            anyhow::bail!("engine memory state diverges");
        }
    }

    Ok(())
}
