//! Command-line entry point: `image-extractor <IMAGESPEC>`

use clap::Parser;
use image_extractor::cli::{Args, Runner};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let runner = match Runner::new(args) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    match runner.run().await {
        Ok(dir) => {
            println!("Image extracted to {}", dir.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            println!("Error loading image: {}", err);
            ExitCode::FAILURE
        }
    }
}
