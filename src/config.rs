//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the linker using `clap`.
//! It handles parsing arguments like input files, library search paths and the
//! output product to emit.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// The output products the back end can emit.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Compressed relocatable application image.
    Rap,
    /// Text listing of the linked objects and their unresolved symbols.
    Script,
    /// Flat `ar` archive holding the linked objects.
    Archive,
}

/// A static linker back end producing compact relocatable application
/// (RAP) images for an embedded loader.
///
/// Inputs are ELF relocatable objects, given directly or found inside
/// `ar` archives pulled in with `-l`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input object files
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Output file
    #[arg(short, long, default_value = "a.rap", help = "Path of the output file")]
    pub output: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "rap")]
    pub format: Format,

    /// Directories searched for libraries
    #[arg(short = 'L', long = "library-path")]
    pub library_paths: Vec<PathBuf>,

    /// Libraries to pull in, searched as lib<name>.a
    #[arg(short = 'l', long = "library")]
    pub libraries: Vec<String>,

    /// Name of the initialization entry recorded in the image
    #[arg(long, default_value = "_init")]
    pub init: String,

    /// Name of the finalization entry recorded in the image
    #[arg(long, default_value = "_fini")]
    pub fini: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,
}
