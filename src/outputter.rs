//! Alternate output modes.
//!
//! Besides the RAP image the linker can list the objects it would
//! link as a text script, or copy them into a flat `ar` archive.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::files::{Archive, Cache};

/// Render the ordered object list: one `o:` line per object followed
/// by numbered `u:` lines for its unresolved symbols.
pub fn script_text(cache: &Cache) -> String {
    let mut out = String::new();
    for path in cache.object_paths() {
        let object = cache.object(&path);
        out.push_str(&format!("o:{}\n", object.name().basename()));
        for (count, name) in object.unresolved_symbols().keys().enumerate() {
            out.push_str(&format!(" u:{}:{}\n", count + 1, name));
        }
    }
    out
}

/// Write the object listing as a `!# rls` tagged script file.
pub fn script(output: &Path, cache: &Cache) -> Result<()> {
    info!("script: {}", output.display());
    let mut text = String::from("!# rls\n");
    text.push_str(&script_text(cache));
    std::fs::write(output, text).with_context(|| format!("writing {}", output.display()))
}

/// Copy the ordered objects into a freshly created flat archive.
pub fn archive(output: &Path, cache: &mut Cache) -> Result<()> {
    info!("archive: {}", output.display());
    let paths = cache.object_paths();
    let mut archive = Archive::new(&output.display().to_string())?;
    archive.create(cache, &paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write;
    use object::{
        Architecture, BinaryFormat, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    };
    use tempfile::tempdir;

    fn write_object_with_undefined(dir: &Path, name: &str) -> String {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            object::Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 4);
        obj.add_symbol(write::Symbol {
            name: format!("{name}_entry").into_bytes(),
            value: 0,
            size: 1,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b"needs_me".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        let path = dir.join(format!("{name}.o"));
        std::fs::write(&path, obj.write().unwrap()).unwrap();
        path.display().to_string()
    }

    #[test]
    fn script_lists_objects_and_unresolved_symbols() {
        let dir = tempdir().unwrap();
        let input = write_object_with_undefined(dir.path(), "main");

        let mut cache = Cache::new();
        cache.add(&input).unwrap();
        cache.open().unwrap();
        let mut globals = crate::symbols::Table::new();
        cache.load_symbols(&mut globals, false).unwrap();

        let out = dir.path().join("link.rls");
        script(&out, &cache).unwrap();
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with("!# rls\n"));
        assert!(text.contains("o:main.o\n"));
        assert!(text.contains(" u:1:needs_me\n"));
    }

    #[test]
    fn archive_mode_produces_a_loadable_container() {
        let dir = tempdir().unwrap();
        let input = write_object_with_undefined(dir.path(), "main");

        let mut cache = Cache::new();
        cache.add(&input).unwrap();
        cache.open().unwrap();

        let out = dir.path().join("linked.a");
        archive(&out, &mut cache).unwrap();
        drop(cache);

        let mut cache = Cache::new();
        cache.open().unwrap();
        cache
            .add_libraries(&[out])
            .expect("the produced archive parses back");
        assert_eq!(cache.archive_count(), 1);
        assert_eq!(cache.object_count(), 1);
    }
}
