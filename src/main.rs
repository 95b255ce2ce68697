use std::process::ExitCode;

use audiosr_worker::{logger, run_worker, WorkerArgs};
use clap::Parser;
use log::error;

fn main() -> ExitCode {
    let args = WorkerArgs::parse();

    let logging = match logger::setup_logging(args.log_level()) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            false
        }
    };

    match run_worker(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if logging => {
            error!("Worker terminated: {err:?}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("Worker terminated: {err:?}");
            ExitCode::FAILURE
        }
    }
}
