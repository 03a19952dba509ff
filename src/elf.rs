//! ELF access behind the session boundary.
//!
//! `Session` brackets all ELF reads for one relocatable file: it is
//! created from the file's bytes by `Object::begin` and dropped by
//! `Object::end`. Parsing is delegated to the `object` crate; this
//! module reduces what the rest of the linker sees to a cached header
//! identity, a table of section records, and symbol extraction.

use anyhow::{anyhow, bail, Context, Result};
use object::elf;
use object::read::elf::{FileHeader, SectionHeader, Sym};
use object::Endianness;

use crate::symbols;

/// Identity fields cached from the ELF file header.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    /// Target machine (`e_machine`).
    pub machine: u16,
    /// File class (`ELFCLASS32`/`ELFCLASS64`).
    pub class: u8,
    /// Data encoding (`ELFDATA2LSB`/`ELFDATA2MSB`).
    pub encoding: u8,
    /// Section header count (`e_shnum`).
    pub shnum: u16,
    /// Section name string table index (`e_shstrndx`).
    pub shstrndx: u16,
}

/// One section header record.
#[derive(Clone, Debug)]
pub struct Section {
    /// Index in the section header table.
    pub index: usize,
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    /// Section size in bytes.
    pub size: u64,
    /// File offset of the section contents, relative to the start of
    /// the object (an archive member's base is added at I/O time).
    pub offset: u64,
    pub alignment: u64,
}

/// A parsed view of one relocatable file, valid between `begin` and `end`.
pub struct Session {
    header: Header,
    sections: Vec<Section>,
    data: Vec<u8>,
}

impl Session {
    pub fn new(data: Vec<u8>, whence: &str) -> Result<Session> {
        let kind = object::FileKind::parse(data.as_slice())
            .map_err(|e| anyhow!("{e}: {whence}"))?;
        let (header, sections) = match kind {
            object::FileKind::Elf32 => parse::<elf::FileHeader32<Endianness>>(&data, whence)?,
            object::FileKind::Elf64 => parse::<elf::FileHeader64<Endianness>>(&data, whence)?,
            other => bail!("not an ELF object ({other:?}): {whence}"),
        };
        Ok(Session {
            header,
            sections,
            data,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Sections of the given `sh_type`.
    pub fn sections_by_type(&self, sh_type: u32) -> Vec<Section> {
        self.sections
            .iter()
            .filter(|s| s.sh_type == sh_type)
            .cloned()
            .collect()
    }

    /// Sections with the given exact name.
    pub fn sections_by_name(&self, name: &str) -> Vec<Section> {
        self.sections
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Walk every `SHT_SYMTAB` section, splitting entries into the
    /// unresolved table (untyped and undefined) and the exported list
    /// (typed NOTYPE/OBJECT/FUNC with an accepted binding). Weak and
    /// global bindings are always accepted, local ones only when
    /// `local` is set.
    pub fn load_symbols(
        &self,
        whence: &str,
        local: bool,
    ) -> Result<(symbols::Table, symbols::List)> {
        match self.header.class {
            elf::ELFCLASS32 => {
                read_symbols::<elf::FileHeader32<Endianness>>(&self.data, whence, local)
            }
            elf::ELFCLASS64 => {
                read_symbols::<elf::FileHeader64<Endianness>>(&self.data, whence, local)
            }
            class => bail!("unknown ELF class {class}: {whence}"),
        }
    }
}

fn parse<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
    whence: &str,
) -> Result<(Header, Vec<Section>)> {
    let header = Elf::parse(data).map_err(|e| anyhow!("{e}: {whence}"))?;
    let endian = header.endian().map_err(|e| anyhow!("{e}: {whence}"))?;

    if header.e_type(endian) != elf::ET_REL {
        bail!("not a relocatable object: {whence}");
    }

    let ident = header.e_ident();
    let table = header
        .sections(endian, data)
        .map_err(|e| anyhow!("{e}: {whence}"))?;

    let mut sections = Vec::new();
    for (index, section) in table.enumerate() {
        let name = table
            .section_name(endian, section)
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        sections.push(Section {
            index: index.0,
            name,
            sh_type: section.sh_type(endian),
            flags: section.sh_flags(endian).into(),
            size: section.sh_size(endian).into(),
            offset: section.sh_offset(endian).into(),
            alignment: section.sh_addralign(endian).into(),
        });
    }

    Ok((
        Header {
            machine: header.e_machine(endian),
            class: ident.class,
            encoding: ident.data,
            shnum: header.e_shnum(endian),
            shstrndx: header.e_shstrndx(endian),
        },
        sections,
    ))
}

fn read_symbols<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
    whence: &str,
    local: bool,
) -> Result<(symbols::Table, symbols::List)> {
    let header = Elf::parse(data).map_err(|e| anyhow!("{e}: {whence}"))?;
    let endian = header.endian().map_err(|e| anyhow!("{e}: {whence}"))?;
    let table = header
        .sections(endian, data)
        .map_err(|e| anyhow!("{e}: {whence}"))?;

    let mut unresolved = symbols::Table::new();
    let mut exported = symbols::List::new();

    for (index, section) in table.enumerate() {
        if section.sh_type(endian) != elf::SHT_SYMTAB {
            continue;
        }
        let symtab =
            object::read::elf::SymbolTable::parse(endian, data, &table, index, section)
                .map_err(|e| anyhow!("{e}: {whence}"))?;
        for sym in symtab.iter() {
            let name = symtab
                .symbol_name(endian, sym)
                .with_context(|| format!("reading symbol name: {whence}"))?;
            if name.is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(name).into_owned();
            let st_type = sym.st_type();
            let st_bind = sym.st_bind();
            let shndx = sym.st_shndx(endian);
            let record = symbols::Symbol::new(
                name.clone(),
                sym.st_value(endian).into(),
                sym.st_size(endian).into(),
                sym.st_info(),
                shndx,
            );
            if st_type == elf::STT_NOTYPE && shndx == elf::SHN_UNDEF {
                unresolved.insert(name, record);
            } else if matches!(st_type, elf::STT_NOTYPE | elf::STT_OBJECT | elf::STT_FUNC)
                && (st_bind == elf::STB_WEAK
                    || st_bind == elf::STB_GLOBAL
                    || (local && st_bind == elf::STB_LOCAL))
            {
                exported.push(record);
            }
        }
    }

    Ok((unresolved, exported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write;
    use object::{
        Architecture, BinaryFormat, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    };

    fn sample_object() -> Vec<u8> {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            object::Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0x90, 0x90, 0xc3], 4);
        obj.add_symbol(write::Symbol {
            name: b"run".to_vec(),
            value: 0,
            size: 3,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b"missing".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        obj.add_symbol(write::Symbol {
            name: b"hidden_helper".to_vec(),
            value: 1,
            size: 1,
            kind: SymbolKind::Text,
            scope: SymbolScope::Compilation,
            weak: false,
            section: write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
        obj.write().expect("emit object")
    }

    #[test]
    fn session_caches_header_identity() {
        let session = Session::new(sample_object(), "sample.o").unwrap();
        let header = session.header();
        assert_eq!(header.machine, elf::EM_X86_64);
        assert_eq!(header.class, elf::ELFCLASS64);
        assert_eq!(header.encoding, elf::ELFDATA2LSB);
        assert!(header.shnum > 0);
        assert!((header.shstrndx as usize) < session.sections().len());
    }

    #[test]
    fn session_records_section_table() {
        let session = Session::new(sample_object(), "sample.o").unwrap();
        let text = &session.sections_by_name(".text")[0];
        assert_eq!(text.sh_type, elf::SHT_PROGBITS);
        assert_eq!(
            text.flags & u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR)
        );
        assert_eq!(text.size, 3);
        assert_eq!(text.alignment, 4);
        assert_eq!(session.sections_by_type(elf::SHT_SYMTAB).len(), 1);
    }

    #[test]
    fn load_symbols_splits_exported_and_unresolved() {
        let session = Session::new(sample_object(), "sample.o").unwrap();
        let (unresolved, exported) = session.load_symbols("sample.o", false).unwrap();
        assert!(unresolved.contains_key("missing"));
        let names: Vec<&str> = exported.iter().map(|s| s.name()).collect();
        assert!(names.contains(&"run"));
        assert!(!names.contains(&"hidden_helper"), "locals need local=true");

        let (_, with_locals) = session.load_symbols("sample.o", true).unwrap();
        let names: Vec<&str> = with_locals.iter().map(|s| s.name()).collect();
        assert!(names.contains(&"hidden_helper"));
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(Session::new(b"!<arch>\nnot elf".to_vec(), "bad").is_err());
        assert!(Session::new(Vec::new(), "empty").is_err());
    }
}
