//! CLI front end over [`slotstat::reader`]: argument parsing, exit codes,
//! and the `[tid] name: value` line format.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

/// Dumps per-thread counter values from a slotstat file.
#[derive(Parser)]
#[command(name = "reader", version, about, long_about = None)]
struct Args {
    /// Path to the stats file to read.
    path: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let dumps = match slotstat::reader::snapshot(&args.path) {
        Ok(dumps) => dumps,
        Err(err) => {
            eprintln!("reader: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut out = String::new();
    for dump in &dumps {
        for counter in &dump.counters {
            out.push_str(&format!("[{}] {}: {}\n", dump.tid, counter.name, counter.value));
        }
    }
    print!("{out}");

    ExitCode::SUCCESS
}
