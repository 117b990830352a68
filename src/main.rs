use std::process::ExitCode;

use bulkmail_lib::{logging, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.json, cli.verbose) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match bulkmail_lib::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[main] {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
