use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = governance_cli::Cli::parse();
    match governance_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", governance_cli::error_json(&err));
            ExitCode::FAILURE
        }
    }
}
