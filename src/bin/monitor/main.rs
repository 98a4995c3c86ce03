//! Live view of every tracker's particle cloud. Press `q` to quit.

use clap::Parser;
use planescope::{
    args::ScopeArgs,
    gui::engage_monitor,
    pipeline::{Pipeline, RunOptions},
};
use std::{error::Error, process::ExitCode};

fn main() -> ExitCode {
    env_logger::init();
    let args = ScopeArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("monitor: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ScopeArgs) -> Result<(), Box<dyn Error>> {
    let config = args.load_config()?;
    let source = args.open_source(&config)?;
    let options = RunOptions {
        paced: !args.fast,
        record: args.record.clone(),
    };
    let (pipeline, reports) = Pipeline::start(&config, source, options)?;

    let shown = engage_monitor(reports, pipeline.context().clone(), args.frames);
    // shut the pipeline down even when the terminal failed
    let summary = pipeline.shutdown()?;
    let shown = shown?;
    println!(
        "showed {} windows, captured {} frames ({} dropped)",
        shown, summary.capture.frames_written, summary.capture.frames_dropped
    );
    Ok(())
}
