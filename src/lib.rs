//! RAP Linker Library.
//!
//! This library provides the core components for the `rapld` linker
//! back end. It is organized into several modules:
//! - `config`: CLI configuration.
//! - `files`: input file lifecycle (images, archives, objects, cache).
//! - `elf`: session-bracketed ELF access.
//! - `symbols`: symbol records and tables.
//! - `compress`: the block-compressing output writer.
//! - `rap`: RAP image layout and serialization.
//! - `outputter`: script and archive output modes.

pub mod compress;
pub mod config;
pub mod elf;
pub mod files;
pub mod outputter;
pub mod rap;
pub mod symbols;
pub mod utils;
