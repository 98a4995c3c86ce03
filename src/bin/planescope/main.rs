//! Headless tracker: logs one line per processing window.

use clap::Parser;
use log::{error, info};
use planescope::{
    args::ScopeArgs,
    pipeline::{spawn_quit_watcher, Pipeline, PipelineError, RunOptions},
};
use std::{
    io::{self, BufReader, IsTerminal},
    process::ExitCode,
};

// Example:
// cargo run --bin planescope --
//                            --frames   200
//                            --outliers 0 0.2 0.999
//                            synthetic
//                            --sweep    1.5
//                            --duty     0.6

fn main() -> ExitCode {
    env_logger::init();
    let args = ScopeArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("planescope : {}", e);
            eprintln!("planescope: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ScopeArgs) -> Result<(), PipelineError> {
    let config = args.load_config()?;
    let source = args.open_source(&config)?;
    let options = RunOptions {
        paced: !args.fast,
        record: args.record.clone(),
    };
    let (pipeline, reports) = Pipeline::start(&config, source, options)?;

    // piped stdin would close at once and stop the run
    if io::stdin().is_terminal() {
        println!("Type q and press enter to stop.");
        spawn_quit_watcher(BufReader::new(io::stdin()), pipeline.context().clone());
    }

    let mut seen = 0;
    for report in reports.iter() {
        match report {
            Ok(report) => println!("{}", report),
            Err(e) => error!("tracking : {}", e),
        }
        seen += 1;
        if args.frames.map_or(false, |limit| seen >= limit) {
            break;
        }
    }

    let summary = pipeline.shutdown()?;
    info!("planescope : {} windows reported.", seen);
    println!(
        "captured {} frames in {} blocks ({} dropped), played {} blocks ({} silent), \
         recorded {} frames",
        summary.capture.frames_written,
        summary.capture.blocks,
        summary.capture.frames_dropped,
        summary.drain.blocks,
        summary.drain.silent_blocks,
        summary.recorded_frames
    );
    Ok(())
}
