mod compiler;
mod lexer;
mod nambly;
mod vm;

use std::io;
use std::path::PathBuf;

use clap::Parser;

/// The Katalyn programming language.
#[derive(Parser)]
#[command(name = "katalyn", version)]
struct Cli {
    /// Source file to run (a Nambly listing with --bytecode)
    file: PathBuf,
    /// Compile only and print the Nambly listing
    #[arg(long)]
    emit_nambly: bool,
    /// Treat the input file as a Nambly listing and execute it directly
    #[arg(long)]
    bytecode: bool,
}

fn main() {
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", cli.file.display(), e);
            std::process::exit(1);
        }
    };

    let listing_text = if cli.bytecode {
        source
    } else {
        match compiler::compile_source(&source, &cli.file.display().to_string()) {
            Ok(nambly) => nambly,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    };

    if cli.emit_nambly {
        print!("{}", listing_text);
        return;
    }

    let listing = match nambly::parse(&listing_text) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut machine = vm::Vm::new(stdin.lock(), stdout.lock());
    match machine.run(&listing) {
        Ok(vm::Outcome::Finished) => {}
        Ok(vm::Outcome::Exit(code)) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
