use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kodiak::{DEFAULT_MEMORY_SIZE, Image, Vm};

/// Bytecode virtual machine: loads a binary image into a flat memory
/// and runs it until the program halts.
#[derive(Parser, Debug)]
#[command(about, version, long_about = None)]
struct Args {
    /// Image file to load and run
    image: PathBuf,

    /// Arguments made visible to the program on its stack
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Memory size in bytes, decimal or 0x-hex, with an optional
    /// `_KiB`, `_MiB` or `_GiB` suffix
    #[arg(short, long, value_parser = parse_memory_size, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory: u64,

    /// Dump the parsed image metadata before running
    #[arg(long, default_value_t = false)]
    dump_image: bool,

    /// Trace loader progress and executed opcodes on stderr
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn parse_memory_size(arg: &str) -> Result<u64, String> {
    let (digits, shift) = if let Some(digits) = arg.strip_suffix("_KiB") {
        (digits, 10)
    } else if let Some(digits) = arg.strip_suffix("_MiB") {
        (digits, 20)
    } else if let Some(digits) = arg.strip_suffix("_GiB") {
        (digits, 30)
    } else {
        (arg, 0)
    };

    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    }
    .map_err(|err| format!("invalid memory size `{}`: {}", arg, err))?;

    if value == 0 {
        return Err("memory size must be non-zero".into());
    }
    value
        .checked_shl(shift)
        .filter(|scaled| scaled >> shift == value)
        .ok_or_else(|| format!("memory size `{}` does not fit in 64 bits", arg))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match std::fs::read(&args.image) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: Cannot open `{}`: {}.", args.image.display(), err);
            return ExitCode::FAILURE;
        }
    };

    let image = match Image::parse(source) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("Error: `{}`: {}.", args.image.display(), err);
            return ExitCode::FAILURE;
        }
    };

    if args.dump_image {
        println!("{}", image);
    }

    let mut vm = Vm::new(args.memory);
    vm.set_verbose(args.verbose);

    if args.verbose {
        eprintln!("Loading `{}`...", args.image.display());
    }
    if let Err(err) = vm.load_image(&image) {
        eprintln!("Error: `{}`: {}.", args.image.display(), err);
        return ExitCode::FAILURE;
    }

    if args.verbose {
        eprintln!("Loading {} arguments...", args.args.len());
    }
    if let Err(err) = vm.seed_args(&args.args) {
        eprintln!("Error: {}.", err);
        return ExitCode::FAILURE;
    }

    if args.verbose {
        eprintln!("Running `{}` at {:#014X}...", args.image.display(), vm.ip());
    }
    vm.run();

    ExitCode::SUCCESS
}
