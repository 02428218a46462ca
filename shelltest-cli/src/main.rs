// Copyright (c) The shelltest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use shelltest_cli::ShelltestApp;

fn main() -> Result<()> {
    color_eyre::install()?;
    let _ = enable_ansi_support::enable_ansi_support();

    let app = ShelltestApp::parse();
    match app.exec() {
        Ok(code) => std::process::exit(code),
        Err(error) => Err(error),
    }
}
