//! Annotate CLI: submit texts to the annotation pipeline, follow their
//! builds and administer the build store.
//!
//! Usage:
//!   annotate submit --text "Hej världen" --progress
//!   annotate submit --file a.txt --file b.xml --settings settings.json
//!   annotate join <fingerprint>
//!   annotate status --secret <key>
//!   annotate config init

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    commands::init_tracing(&cli);

    commands::run(cli).await
}
