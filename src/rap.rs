//! RAP image building.
//!
//! A RAP file is a compact relocatable application image for an
//! embedded loader: the sections of every linked object coalesced
//! into six logical groups, one merged exported-symbol table, and a
//! concatenated string table, all streamed through the compressing
//! writer in a fixed field order.

use anyhow::{bail, Result};
use object::elf;
use tracing::{debug, info};

use crate::compress::Compressor;
use crate::elf::{Header as ElfHeader, Section as ElfSection};
use crate::files::{Cache, Image};
use crate::symbols;
use crate::utils::align_up;

/// Compressor block size used for RAP output.
const BLOCK_SIZE: usize = 2 * 1024;

/// Bytes one exported symbol occupies in the image: three 32-bit words.
const EXTERNAL_SIZE: u32 = 12;

/// The logical section groups of a RAP image, in serialization order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupKind {
    Text = 0,
    Const = 1,
    Ctor = 2,
    Dtor = 3,
    Data = 4,
    Bss = 5,
}

impl GroupKind {
    pub const ALL: [GroupKind; 6] = [
        GroupKind::Text,
        GroupKind::Const,
        GroupKind::Ctor,
        GroupKind::Dtor,
        GroupKind::Data,
        GroupKind::Bss,
    ];

    /// The groups that carry file bytes; bss is uninitialized.
    pub const LOADED: [GroupKind; 5] = [
        GroupKind::Text,
        GroupKind::Const,
        GroupKind::Ctor,
        GroupKind::Dtor,
        GroupKind::Data,
    ];

    pub fn name(self) -> &'static str {
        match self {
            GroupKind::Text => ".text",
            GroupKind::Const => ".const",
            GroupKind::Ctor => ".ctor",
            GroupKind::Dtor => ".dtor",
            GroupKind::Data => ".data",
            GroupKind::Bss => ".bss",
        }
    }
}

/// Classify an ELF section into at most one logical group. Sections
/// matching no predicate (debug info, notes, ...) stay out of the
/// image entirely.
fn classify(section: &ElfSection) -> Option<GroupKind> {
    let has = |want: u32| section.flags & u64::from(want) == u64::from(want);
    let none = |unwanted: u32| section.flags & u64::from(unwanted) == 0;

    if section.name == ".ctors" {
        return Some(GroupKind::Ctor);
    }
    if section.name == ".dtors" {
        return Some(GroupKind::Dtor);
    }
    match section.sh_type {
        elf::SHT_PROGBITS => {
            if has(elf::SHF_ALLOC | elf::SHF_EXECINSTR) {
                Some(GroupKind::Text)
            } else if has(elf::SHF_ALLOC | elf::SHF_MERGE)
                && none(elf::SHF_WRITE | elf::SHF_EXECINSTR)
            {
                Some(GroupKind::Const)
            } else if has(elf::SHF_ALLOC | elf::SHF_WRITE) {
                Some(GroupKind::Data)
            } else {
                None
            }
        }
        elf::SHT_NOBITS if has(elf::SHF_ALLOC | elf::SHF_WRITE) => Some(GroupKind::Bss),
        _ => None,
    }
}

/// One accumulated section group: total size, the aligned offset of
/// the most recently merged input, and the common alignment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Group {
    pub size: u32,
    pub offset: u32,
    pub align: u32,
}

impl Group {
    /// Fold `other` into the accumulator. Zero-size inputs are
    /// skipped; the first non-zero input donates its alignment and a
    /// later input with a different one is a format error.
    pub fn merge(&mut self, kind: GroupKind, other: &Group, whence: &str) -> Result<()> {
        if other.size == 0 {
            return Ok(());
        }
        if self.align == 0 {
            self.align = other.align;
        } else if other.align != 0 && other.align != self.align {
            bail!(
                "alignments do not match for '{}' ({} vs {}): {whence}",
                kind.name(),
                self.align,
                other.align
            );
        }
        if self.size != 0 && self.align == 0 {
            bail!("invalid alignment for '{}': {whence}", kind.name());
        }
        self.offset = align_up(u64::from(self.size), u64::from(self.align)) as u32;
        self.size += other.size;
        Ok(())
    }
}

/// An exported symbol in the image's symbol table.
#[derive(Clone, Debug, PartialEq, Eq)]
struct External {
    /// Byte offset of the name in the string table.
    name: u32,
    group: GroupKind,
    /// Offset from the section group base.
    value: u32,
    /// The ELF `st_info` byte.
    info: u8,
}

/// Per-object layout data: the object's sections sorted into groups,
/// the group totals, and the table byte ranges.
struct Unit {
    key: String,
    name: String,
    groups: [Group; 6],
    sections: [Vec<ElfSection>; 6],
    relocs_size: u32,
    symtab_size: u32,
    strtab_size: u32,
    externals: symbols::List,
    header: ElfHeader,
}

impl Unit {
    /// Extract the layout data from an object with a live ELF session.
    fn new(key: &str, object: &crate::files::Object) -> Result<Unit> {
        let session = object.session()?;
        let name = object.name().full();

        let mut sections: [Vec<ElfSection>; 6] = Default::default();
        for section in session.sections() {
            if let Some(kind) = classify(section) {
                sections[kind as usize].push(section.clone());
            }
        }

        // Only the text sections' relocation records count, in both
        // REL and RELA forms.
        let mut relocs_size: u32 = 0;
        for text in &sections[GroupKind::Text as usize] {
            for form in ["rel", "rela"] {
                for sec in session.sections_by_name(&format!(".{form}{}", text.name)) {
                    relocs_size += sec.size as u32;
                }
            }
        }

        let symtab_size: u32 = session
            .sections_by_type(elf::SHT_SYMTAB)
            .iter()
            .map(|s| s.size as u32)
            .sum();
        let strtab_size: u32 = session
            .sections_by_name(".strtab")
            .iter()
            .map(|s| s.size as u32)
            .sum();

        let mut groups: [Group; 6] = Default::default();
        for kind in GroupKind::ALL {
            let members = &sections[kind as usize];
            groups[kind as usize].size = members.iter().map(|s| s.size as u32).sum();
            if let Some(first) = members.first() {
                groups[kind as usize].align = first.alignment as u32;
            }
        }

        debug!(
            "rap object {name}: text:{} const:{} ctor:{} dtor:{} data:{} bss:{} \
             relocs:{relocs_size} symtab:{symtab_size} strtab:{strtab_size}",
            groups[GroupKind::Text as usize].size,
            groups[GroupKind::Const as usize].size,
            groups[GroupKind::Ctor as usize].size,
            groups[GroupKind::Dtor as usize].size,
            groups[GroupKind::Data as usize].size,
            groups[GroupKind::Bss as usize].size,
        );

        Ok(Unit {
            key: key.to_string(),
            name,
            groups,
            sections,
            relocs_size,
            symtab_size,
            strtab_size,
            externals: object.external_symbols().clone(),
            header: *session.header(),
        })
    }

    /// Map a symbol's defining section index to its logical group.
    fn find(&self, shndx: u16) -> Result<GroupKind> {
        for kind in GroupKind::ALL {
            if self.sections[kind as usize]
                .iter()
                .any(|s| s.index == usize::from(shndx))
            {
                return Ok(kind);
            }
        }
        bail!("section not found for symbol index {shndx}: {}", self.name);
    }
}

/// The assembled RAP image. Built once by `layout`, serialized once
/// by `write`.
pub struct RapImage {
    units: Vec<Unit>,
    groups: [Group; 6],
    externals: Vec<External>,
    strtab: Vec<u8>,
    symtab_size: u32,
    relocs_size: u32,
    machine: u16,
    encoding: u8,
    class: u8,
}

impl RapImage {
    pub fn new() -> RapImage {
        RapImage {
            units: Vec::new(),
            groups: Default::default(),
            externals: Vec::new(),
            strtab: Vec::new(),
            symtab_size: 0,
            relocs_size: 0,
            machine: 0,
            encoding: 0,
            class: 0,
        }
    }

    /// Fold the ordered object list into one layout: merge the six
    /// section groups, collect qualifying exported symbols in
    /// object-then-symbol order, and total the relocation bytes.
    pub fn layout(&mut self, cache: &mut Cache, paths: &[String]) -> Result<()> {
        for path in paths {
            let object = cache.object_mut(path);
            if !object.is_valid() {
                bail!("not valid: {}", object.name().full());
            }
            object.open()?;
            let unit = (|| {
                object.begin()?;
                Unit::new(path, object)
            })();
            object.end();
            object.close();
            self.units.push(unit?);
        }

        for unit in &self.units {
            if self.class == 0 {
                self.machine = unit.header.machine;
                self.encoding = unit.header.encoding;
                self.class = unit.header.class;
            } else if unit.header.machine != self.machine
                || unit.header.encoding != self.encoding
                || unit.header.class != self.class
            {
                bail!("machine type mismatch: {}", unit.name);
            }
        }

        for unit in &self.units {
            for kind in GroupKind::ALL {
                self.groups[kind as usize].merge(kind, &unit.groups[kind as usize], &unit.name)?;
            }

            for sym in &unit.externals {
                if !matches!(sym.st_type(), elf::STT_OBJECT | elf::STT_FUNC) {
                    continue;
                }
                if !matches!(sym.st_bind(), elf::STB_GLOBAL | elf::STB_WEAK) {
                    continue;
                }
                let group = unit.find(sym.st_shndx())?;
                if group == GroupKind::Bss && sym.st_type() == elf::STT_FUNC {
                    bail!(
                        "function symbol '{}' defined in bss: {}",
                        sym.name(),
                        unit.name
                    );
                }
                self.externals.push(External {
                    name: self.strtab.len() as u32,
                    group,
                    value: sym.value() as u32,
                    info: sym.st_info(),
                });
                self.symtab_size += EXTERNAL_SIZE;
                self.strtab.extend_from_slice(sym.name().as_bytes());
                self.strtab.push(0);
            }

            self.relocs_size += unit.relocs_size;
        }

        info!(
            "rap layout: text:{} const:{} ctor:{} dtor:{} data:{} bss:{} symbols:{} ({}) strings:{} relocs:{}",
            self.groups[GroupKind::Text as usize].size,
            self.groups[GroupKind::Const as usize].size,
            self.groups[GroupKind::Ctor as usize].size,
            self.groups[GroupKind::Dtor as usize].size,
            self.groups[GroupKind::Data as usize].size,
            self.groups[GroupKind::Bss as usize].size,
            self.symtab_size,
            self.externals.len(),
            self.strtab.len(),
            self.relocs_size,
        );
        Ok(())
    }

    /// Serialize the image. Field order: machine identity; init and
    /// fini name offsets; symbol table and string table sizes; a
    /// reserved word; the six group triples; the section payloads
    /// grouped by logical type across all objects; the string table;
    /// the symbol table.
    pub fn write(
        &mut self,
        comp: &mut Compressor,
        cache: &mut Cache,
        init: &str,
        fini: &str,
    ) -> Result<()> {
        comp.write_u32(u32::from(self.machine))?;
        comp.write_u32(u32::from(self.encoding))?;
        comp.write_u32(u32::from(self.class))?;

        comp.write_u32(self.strtab.len() as u32)?;
        self.strtab.extend_from_slice(init.as_bytes());
        self.strtab.push(0);

        comp.write_u32(self.strtab.len() as u32)?;
        self.strtab.extend_from_slice(fini.as_bytes());
        self.strtab.push(0);

        comp.write_u32(self.symtab_size)?;
        comp.write_u32(self.strtab.len() as u32)?;
        comp.write_u32(0)?;

        for kind in GroupKind::ALL {
            let group = &self.groups[kind as usize];
            comp.write_u32(group.size)?;
            comp.write_u32(group.align)?;
            comp.write_u32(group.offset)?;
        }

        for kind in GroupKind::LOADED {
            for unit in &self.units {
                let object = cache.object_mut(&unit.key);
                object.open()?;
                let result = (|| {
                    object.begin()?;
                    for section in &unit.sections[kind as usize] {
                        comp.write_object(object, section.offset, section.size)?;
                    }
                    Ok(())
                })();
                object.end();
                object.close();
                result?;
            }
        }

        comp.write(&self.strtab)?;

        for ext in &self.externals {
            comp.write_u32(((ext.group as u32) << 16) | u32::from(ext.info))?;
            comp.write_u32(ext.name)?;
            comp.write_u32(ext.value)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn group(&self, kind: GroupKind) -> &Group {
        &self.groups[kind as usize]
    }
}

impl Default for RapImage {
    fn default() -> Self {
        RapImage::new()
    }
}

/// Build and emit a RAP image for the cache's ordered objects, then
/// flush the compressor and report the achieved ratio.
pub fn write(output: &mut Image, init: &str, fini: &str, cache: &mut Cache) -> Result<()> {
    let paths = cache.object_paths();
    let mut image = RapImage::new();
    image.layout(cache, &paths)?;

    output.open(true)?;
    let result = (|| {
        let mut comp = Compressor::new(output, BLOCK_SIZE);
        image.write(&mut comp, cache, init, fini)?;
        comp.flush()?;
        let ratio = if comp.transferred() > 0 {
            comp.compressed() as f64 * 100.0 / comp.transferred() as f64
        } else {
            0.0
        };
        info!(
            "rap: objects: {}, size: {}, compression: {ratio:.1}%",
            paths.len(),
            comp.compressed()
        );
        Ok(())
    })();
    output.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::Cache;
    use crate::symbols::Table;
    use object::write;
    use object::{
        Architecture, BinaryFormat, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    };
    use std::path::Path;
    use tempfile::tempdir;

    fn section(name: &str, sh_type: u32, flags: u32, size: u64, align: u64) -> ElfSection {
        ElfSection {
            index: 1,
            name: name.to_string(),
            sh_type,
            flags: u64::from(flags),
            size,
            offset: 0,
            alignment: align,
        }
    }

    #[test]
    fn classification_is_exclusive() {
        let text = section(
            ".text",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_EXECINSTR,
            8,
            4,
        );
        assert_eq!(classify(&text), Some(GroupKind::Text));

        let rodata = section(
            ".rodata.str1.1",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_STRINGS,
            8,
            1,
        );
        assert_eq!(classify(&rodata), Some(GroupKind::Const));

        // Writable mergeable data is not const.
        let wmerge = section(
            ".data.merge",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_MERGE | elf::SHF_WRITE,
            8,
            4,
        );
        assert_eq!(classify(&wmerge), Some(GroupKind::Data));

        let ctors = section(
            ".ctors",
            elf::SHT_PROGBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            8,
            8,
        );
        assert_eq!(classify(&ctors), Some(GroupKind::Ctor));

        let bss = section(
            ".bss",
            elf::SHT_NOBITS,
            elf::SHF_ALLOC | elf::SHF_WRITE,
            8,
            4,
        );
        assert_eq!(classify(&bss), Some(GroupKind::Bss));

        let debug = section(".debug_info", elf::SHT_PROGBITS, 0, 8, 1);
        assert_eq!(classify(&debug), None);
    }

    #[test]
    fn merge_skips_zero_size_inputs() {
        let mut acc = Group {
            size: 16,
            offset: 16,
            align: 4,
        };
        let before = acc.clone();
        for _ in 0..3 {
            acc.merge(GroupKind::Text, &Group::default(), "t").unwrap();
        }
        assert_eq!(acc, before);
    }

    #[test]
    fn merge_follows_the_alignment_rule() {
        let mut acc = Group::default();
        acc.merge(
            GroupKind::Text,
            &Group {
                size: 16,
                offset: 0,
                align: 4,
            },
            "a.o",
        )
        .unwrap();
        acc.merge(
            GroupKind::Text,
            &Group {
                size: 10,
                offset: 0,
                align: 4,
            },
            "b.o",
        )
        .unwrap();
        assert_eq!(
            acc,
            Group {
                size: 26,
                offset: 16,
                align: 4,
            }
        );
    }

    #[test]
    fn merge_rejects_mixed_alignment() {
        let mut acc = Group::default();
        acc.merge(
            GroupKind::Data,
            &Group {
                size: 8,
                offset: 0,
                align: 4,
            },
            "a.o",
        )
        .unwrap();
        let err = acc
            .merge(
                GroupKind::Data,
                &Group {
                    size: 8,
                    offset: 0,
                    align: 8,
                },
                "b.o",
            )
            .unwrap_err();
        assert!(err.to_string().contains("alignments do not match"));
    }

    struct Fixture {
        text: Vec<u8>,
        data: Vec<u8>,
        text_align: u64,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Fixture {
                text: Vec::new(),
                data: Vec::new(),
                text_align: 4,
            }
        }
    }

    fn write_fixture(dir: &Path, name: &str, fixture: &Fixture, symbols: &[(&str, bool)]) -> String {
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            object::Endianness::Little,
        );
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &fixture.text, fixture.text_align);
        if !fixture.data.is_empty() {
            let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
            obj.append_section_data(data, &fixture.data, 4);
            obj.add_symbol(write::Symbol {
                name: format!("{name}_data").into_bytes(),
                value: 0,
                size: fixture.data.len() as u64,
                kind: SymbolKind::Data,
                scope: SymbolScope::Dynamic,
                weak: false,
                section: write::SymbolSection::Section(data),
                flags: SymbolFlags::None,
            });
        }
        for (symbol, weak) in symbols {
            obj.add_symbol(write::Symbol {
                name: symbol.as_bytes().to_vec(),
                value: 0,
                size: fixture.text.len() as u64,
                kind: SymbolKind::Text,
                scope: SymbolScope::Dynamic,
                weak: *weak,
                section: write::SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }
        let path = dir.join(format!("{name}.o"));
        std::fs::write(&path, obj.write().unwrap()).unwrap();
        path.display().to_string()
    }

    fn loaded_cache(paths: &[String]) -> Cache {
        let mut cache = Cache::new();
        for path in paths {
            cache.add(path).unwrap();
        }
        cache.open().unwrap();
        let mut globals = Table::new();
        cache.load_symbols(&mut globals, false).unwrap();
        cache
    }

    #[test]
    fn layout_merges_groups_and_exports_symbols() {
        let dir = tempdir().unwrap();
        let a = write_fixture(
            dir.path(),
            "alpha",
            &Fixture {
                text: vec![0xc3; 16],
                data: vec![1, 2, 3, 4],
                ..Fixture::default()
            },
            &[("alpha_entry", false)],
        );
        let b = write_fixture(
            dir.path(),
            "beta",
            &Fixture {
                text: vec![0x90; 10],
                ..Fixture::default()
            },
            &[("beta_entry", false), ("beta_backup", true)],
        );

        let mut cache = loaded_cache(&[a, b]);
        let paths = cache.object_paths();
        let mut image = RapImage::new();
        image.layout(&mut cache, &paths).unwrap();

        assert_eq!(
            image.group(GroupKind::Text),
            &Group {
                size: 26,
                offset: 16,
                align: 4,
            }
        );
        assert_eq!(image.group(GroupKind::Data).size, 4);
        assert_eq!(image.group(GroupKind::Const).size, 0);

        // Exports appear in object-then-symbol order, names packed
        // back to back with NUL terminators.
        let names: Vec<u32> = image.externals.iter().map(|e| e.name).collect();
        let mut expected = Vec::new();
        let mut offset = 0;
        for name in ["alpha_data", "alpha_entry", "beta_entry", "beta_backup"] {
            expected.push(offset);
            offset += name.len() as u32 + 1;
        }
        assert_eq!(names, expected);
        assert_eq!(image.symtab_size, 4 * EXTERNAL_SIZE);
        assert_eq!(image.machine, elf::EM_X86_64);

        // The same inputs lay out the same way again.
        let mut again = RapImage::new();
        again.layout(&mut cache, &paths).unwrap();
        assert_eq!(again.groups, image.groups);
        assert_eq!(again.strtab, image.strtab);
        assert_eq!(again.externals, image.externals);
    }

    #[test]
    fn layout_rejects_mixed_text_alignment() {
        let dir = tempdir().unwrap();
        let a = write_fixture(
            dir.path(),
            "four",
            &Fixture {
                text: vec![0xc3; 8],
                ..Fixture::default()
            },
            &[("four_entry", false)],
        );
        let b = write_fixture(
            dir.path(),
            "eight",
            &Fixture {
                text: vec![0xc3; 8],
                text_align: 8,
                ..Fixture::default()
            },
            &[("eight_entry", false)],
        );

        let mut cache = loaded_cache(&[a, b]);
        let paths = cache.object_paths();
        let err = RapImage::new().layout(&mut cache, &paths).unwrap_err();
        assert!(err.to_string().contains("alignments do not match"));
    }

    #[test]
    fn layout_rejects_function_symbols_in_bss() {
        let dir = tempdir().unwrap();
        let mut obj = write::Object::new(
            BinaryFormat::Elf,
            Architecture::X86_64,
            object::Endianness::Little,
        );
        let bss = obj.add_section(
            Vec::new(),
            b".bss".to_vec(),
            SectionKind::UninitializedData,
        );
        obj.append_section_bss(bss, 16, 4);
        obj.add_symbol(write::Symbol {
            name: b"phantom".to_vec(),
            value: 0,
            size: 16,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: write::SymbolSection::Section(bss),
            flags: SymbolFlags::None,
        });
        let path = dir.path().join("phantom.o");
        std::fs::write(&path, obj.write().unwrap()).unwrap();

        let mut cache = loaded_cache(&[path.display().to_string()]);
        let paths = cache.object_paths();
        let err = RapImage::new().layout(&mut cache, &paths).unwrap_err();
        assert!(err.to_string().contains("defined in bss"));
    }

    fn take_u32(bytes: &[u8], cursor: &mut usize) -> u32 {
        let value = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
        *cursor += 4;
        value
    }

    #[test]
    fn write_emits_the_fixed_field_sequence() {
        let dir = tempdir().unwrap();
        let a = write_fixture(
            dir.path(),
            "alpha",
            &Fixture {
                text: (0..16).collect(),
                data: vec![9, 9, 9, 9],
                ..Fixture::default()
            },
            &[("alpha_entry", false)],
        );
        let b = write_fixture(
            dir.path(),
            "beta",
            &Fixture {
                text: (100..110).collect(),
                ..Fixture::default()
            },
            &[("beta_entry", false)],
        );

        let mut cache = loaded_cache(&[a, b]);
        let paths = cache.object_paths();
        let mut image = RapImage::new();
        image.layout(&mut cache, &paths).unwrap();
        let strtab_before = image.strtab.len() as u32;

        let out = dir.path().join("app.rap").display().to_string();
        let mut app = Image::from_path(&out, false);
        app.open(true).unwrap();
        {
            let mut comp = Compressor::plain(&mut app, BLOCK_SIZE);
            image.write(&mut comp, &mut cache, "boot", "halt").unwrap();
            comp.flush().unwrap();
        }
        app.close();

        let bytes = std::fs::read(&out).unwrap();
        let mut cursor = 0;
        assert_eq!(take_u32(&bytes, &mut cursor), u32::from(elf::EM_X86_64));
        assert_eq!(take_u32(&bytes, &mut cursor), u32::from(elf::ELFDATA2LSB));
        assert_eq!(take_u32(&bytes, &mut cursor), u32::from(elf::ELFCLASS64));
        // init goes into the string table first, then fini.
        assert_eq!(take_u32(&bytes, &mut cursor), strtab_before);
        assert_eq!(take_u32(&bytes, &mut cursor), strtab_before + 5);
        assert_eq!(take_u32(&bytes, &mut cursor), 3 * EXTERNAL_SIZE);
        let strtab_size = take_u32(&bytes, &mut cursor);
        assert_eq!(strtab_size, strtab_before + 10);
        assert_eq!(take_u32(&bytes, &mut cursor), 0);

        let mut groups = Vec::new();
        for _ in 0..6 {
            let size = take_u32(&bytes, &mut cursor);
            let align = take_u32(&bytes, &mut cursor);
            let offset = take_u32(&bytes, &mut cursor);
            groups.push((size, align, offset));
        }
        assert_eq!(groups[0], (26, 4, 16));
        assert_eq!(groups[4], (4, 4, 0));

        // Payloads: both text sections then the data section.
        let text: Vec<u8> = (0..16).chain(100..110).collect();
        assert_eq!(&bytes[cursor..cursor + 26], text.as_slice());
        cursor += 26;
        assert_eq!(&bytes[cursor..cursor + 4], &[9, 9, 9, 9]);
        cursor += 4;

        let strtab = &bytes[cursor..cursor + strtab_size as usize];
        assert_eq!(strtab, b"alpha_data\0alpha_entry\0beta_entry\0boot\0halt\0");
        cursor += strtab_size as usize;

        // Three externals, three words each: packed group and st_info,
        // name offset, value.
        let func = u32::from((elf::STB_GLOBAL << 4) | elf::STT_FUNC);
        let object = u32::from((elf::STB_GLOBAL << 4) | elf::STT_OBJECT);
        assert_eq!(
            take_u32(&bytes, &mut cursor),
            ((GroupKind::Data as u32) << 16) | object
        );
        assert_eq!(take_u32(&bytes, &mut cursor), 0);
        assert_eq!(take_u32(&bytes, &mut cursor), 0);
        assert_eq!(
            take_u32(&bytes, &mut cursor),
            ((GroupKind::Text as u32) << 16) | func
        );
        assert_eq!(take_u32(&bytes, &mut cursor), 11);
        assert_eq!(take_u32(&bytes, &mut cursor), 0);
        assert_eq!(
            take_u32(&bytes, &mut cursor),
            ((GroupKind::Text as u32) << 16) | func
        );
        assert_eq!(take_u32(&bytes, &mut cursor), 23);
        assert_eq!(take_u32(&bytes, &mut cursor), 0);
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn compressed_output_decodes_to_the_plain_stream() {
        let dir = tempdir().unwrap();
        let a = write_fixture(
            dir.path(),
            "alpha",
            &Fixture {
                text: vec![0xc3; 16],
                ..Fixture::default()
            },
            &[("alpha_entry", false)],
        );

        let mut cache = loaded_cache(&[a]);
        let paths = cache.object_paths();

        let plain_path = dir.path().join("plain.rap").display().to_string();
        let mut plain = Image::from_path(&plain_path, false);
        plain.open(true).unwrap();
        {
            let mut comp = Compressor::plain(&mut plain, BLOCK_SIZE);
            let mut image = RapImage::new();
            image.layout(&mut cache, &paths).unwrap();
            image.write(&mut comp, &mut cache, "boot", "halt").unwrap();
            comp.flush().unwrap();
        }
        plain.close();

        let out = dir.path().join("app.rap").display().to_string();
        let mut app = Image::from_path(&out, false);
        write(&mut app, "boot", "halt", &mut cache).unwrap();

        let compressed = std::fs::read(&out).unwrap();
        let mut decoded = Vec::new();
        use std::io::Read;
        flate2::read::ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, std::fs::read(&plain_path).unwrap());
    }
}
