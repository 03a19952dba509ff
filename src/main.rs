//! Entry point for the rapld linker back end.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Collect the requested inputs and any `-l` library archives into
//!    the file cache.
//! 3. Load the exported symbols of every discovered object.
//! 4. Emit the requested product: a RAP image, a script listing, or a
//!    flat archive.
//!
//! Error handling is done via `anyhow`.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rapld::config::{Config, Format};
use rapld::files;
use rapld::outputter;
use rapld::rap;
use rapld::symbols;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cache = files::Cache::new();
    for input in &config.inputs {
        cache.add(input)?;
    }
    cache.open()?;

    let libraries = files::find_libraries(&config.libraries, &config.library_paths)?;
    cache.add_libraries(&libraries)?;

    info!(
        "archives: {}, objects: {}",
        cache.archive_count(),
        cache.object_count()
    );

    let mut globals = symbols::Table::new();
    cache.load_symbols(&mut globals, false)?;
    info!("exported symbols: {}", globals.len());

    match config.format {
        Format::Rap => {
            let output = config.output.display().to_string();
            let mut app = files::Image::from_path(&output, false);
            rap::write(&mut app, &config.init, &config.fini, &mut cache)?;
            println!("wrote {output}");
        }
        Format::Script => outputter::script(&config.output, &cache)?,
        Format::Archive => outputter::archive(&config.output, &mut cache)?,
    }

    Ok(())
}
