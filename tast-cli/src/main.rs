// Copyright (c) The tast Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use tast_cli::TastApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let app = TastApp::parse();
    match app.exec() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("tast: {error:#}");
            std::process::exit(1)
        }
    }
}
