//! Input file lifecycle.
//!
//! This module owns every file the linker touches: reference-counted
//! `Image` handles over OS files, `Archive` containers in Unix `ar`
//! format, `Object` relocatable files (standalone or archive members
//! that share their archive's descriptor), and the `Cache` that
//! discovers, opens and tears them all down.

use anyhow::{anyhow, bail, Context, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

use crate::elf;
use crate::symbols;

/// Buffer size used when streaming bytes between images.
const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// `ar` container layout: global magic, then 60-byte member headers.
const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const AR_HEADER_SIZE: u64 = 60;
const AR_NAME_SIZE: usize = 16;
const AR_MTIME: usize = 16;
const AR_UID: usize = 28;
const AR_GID: usize = 34;
const AR_MODE: usize = 40;
const AR_SIZE: usize = 48;
const AR_SIZE_END: usize = 58;
const AR_MAX_NAME: usize = 1024;

pub fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

pub fn check_file(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

pub fn check_directory(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Split an environment-style `:` separated path list, keeping only
/// entries that are existing directories.
pub fn path_split(list: &str) -> Vec<PathBuf> {
    list.split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .filter(|p| check_directory(p))
        .collect()
}

/// Find `name` in the ordered search path list.
pub fn find_file(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    search_paths
        .iter()
        .map(|dir| dir.join(name))
        .find(|p| check_file(p))
}

/// Resolve each `-l` name to `lib<name>.a` on the search path.
pub fn find_libraries(libs: &[String], libpaths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut libraries = Vec::new();
    for lib in libs {
        let file = format!("lib{lib}.a");
        debug!("searching: {file}");
        let path = find_file(&file, libpaths)
            .ok_or_else(|| anyhow!("library not found: {file}"))?;
        debug!("found: {}", path.display());
        libraries.push(path);
    }
    Ok(libraries)
}

fn scan_decimal(field: &[u8]) -> u64 {
    let mut value = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            break;
        }
        value = value * 10 + u64::from(b - b'0');
    }
    value
}

fn put_number(value: u64, field: &mut [u8], octal: bool) {
    let text = if octal {
        format!("{value:o}")
    } else {
        value.to_string()
    };
    let bytes = text.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Names an input file, optionally qualified as `<archive>:<member>`.
/// At least one of the two names is set; the size is cached from the
/// filesystem (or the member header) at construction.
#[derive(Clone, Debug, Default)]
pub struct FileRef {
    aname: String,
    oname: String,
    offset: u64,
    size: u64,
}

impl FileRef {
    /// A member object inside an archive.
    pub fn member(aname: &str, oname: &str, offset: u64, size: u64) -> FileRef {
        FileRef {
            aname: aname.to_string(),
            oname: oname.to_string(),
            offset,
            size,
        }
    }

    /// Parse a path. Object paths may carry an `<archive>:<member>`
    /// qualifier; plain paths have their size read from the filesystem.
    pub fn from_path(path: &str, is_object: bool) -> FileRef {
        let mut name = FileRef::default();
        if path.is_empty() {
            return name;
        }
        if is_object {
            if let Some(colon) = path.rfind(':') {
                name.aname = path[..colon].to_string();
                name.oname = path[colon + 1..].to_string();
                return name;
            }
            name.oname = path.to_string();
        } else {
            name.aname = path.to_string();
        }
        if let Ok(meta) = std::fs::metadata(path) {
            name.size = meta.len();
        }
        name
    }

    pub fn is_archive(&self) -> bool {
        !self.aname.is_empty() && self.oname.is_empty()
    }

    pub fn is_object(&self) -> bool {
        !self.oname.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        !self.aname.is_empty() || !self.oname.is_empty()
    }

    pub fn exists(&self) -> bool {
        !self.path().is_empty() && check_file(self.path())
    }

    /// The path opened for I/O: the archive when set, else the object.
    pub fn path(&self) -> &str {
        if !self.aname.is_empty() {
            &self.aname
        } else {
            &self.oname
        }
    }

    /// The fully qualified display name, `<archive>:<member>@<offset>`
    /// for archive members.
    pub fn full(&self) -> String {
        let mut full = String::new();
        if !self.aname.is_empty() {
            full.push_str(&self.aname);
            if !self.oname.is_empty() {
                full.push(':');
            }
        }
        if !self.oname.is_empty() {
            full.push_str(&self.oname);
        }
        if !self.aname.is_empty() && !self.oname.is_empty() {
            full.push('@');
            full.push_str(&self.offset.to_string());
        }
        full
    }

    pub fn basename(&self) -> String {
        basename(&self.full()).to_string()
    }

    pub fn aname(&self) -> &str {
        &self.aname
    }

    pub fn oname(&self) -> &str {
        &self.oname
    }

    /// Base offset of the content within the opened file; nonzero only
    /// for archive members.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A reference-counted open file.
///
/// The OS handle is held exactly while `references > 0`: the 0→1
/// open transition acquires it and the 1→0 close transition releases
/// it, however the opens and closes interleave. Dropping an image
/// that is still referenced is a programming fault.
pub struct Image {
    name: FileRef,
    file: Option<File>,
    references: u32,
}

impl Image {
    pub fn new(name: FileRef) -> Image {
        Image {
            name,
            file: None,
            references: 0,
        }
    }

    pub fn from_path(path: &str, is_object: bool) -> Image {
        Image::new(FileRef::from_path(path, is_object))
    }

    pub fn open(&mut self, writable: bool) -> Result<()> {
        let path = self.name.path().to_string();
        if path.is_empty() {
            bail!("no file name to open");
        }
        trace!("image open: {} refs:{}", self.name.full(), self.references + 1);
        if self.file.is_none() {
            let file = if writable {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
            } else {
                File::open(&path)
            }
            .with_context(|| format!("open: {path}"))?;
            self.file = Some(file);
        }
        self.references += 1;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.references > 0 {
            trace!("image close: {} refs:{}", self.name.full(), self.references);
            self.references -= 1;
            if self.references == 0 {
                self.file = None;
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.references > 0
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn name(&self) -> &FileRef {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.name.size()
    }

    /// Position the file at the image's base plus `offset`.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let position = self.name.offset() + offset;
        let whence = self.name.full();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file is not open: {whence}"))?;
        file.seek(SeekFrom::Start(position))
            .with_context(|| format!("seek: {whence}"))?;
        Ok(())
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let whence = self.name.full();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file is not open: {whence}"))?;
        file.read(buffer).with_context(|| format!("read: {whence}"))
    }

    pub fn write(&mut self, buffer: &[u8]) -> Result<usize> {
        let whence = self.name.full();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file is not open: {whence}"))?;
        file.write(buffer)
            .with_context(|| format!("write: {whence}"))
    }

    pub fn write_all(&mut self, buffer: &[u8]) -> Result<()> {
        let whence = self.name.full();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file is not open: {whence}"))?;
        file.write_all(buffer)
            .with_context(|| format!("write: {whence}"))
    }

    /// Read at `offset`, reporting whether the buffer was filled
    /// completely. Hitting end of file early is not an error.
    pub fn seek_read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<bool> {
        self.seek(offset)?;
        let mut filled = 0;
        while filled < buffer.len() {
            let count = self.read(&mut buffer[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled == buffer.len())
    }

    /// Write the whole buffer at `offset`.
    pub fn seek_write(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.seek(offset)?;
        self.write_all(buffer)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.references > 0 && !std::thread::panicking() {
            panic!(
                "image dropped with {} live references: {}",
                self.references,
                self.name.full()
            );
        }
    }
}

/// Stream `size` bytes from `input` (at its current position) to
/// `output` through a bounded buffer. Exhausting the input early or
/// writing fewer bytes than requested aborts the copy.
pub fn copy_file(input: &mut Object, output: &mut Image, size: u64) -> Result<()> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let count = input.read(&mut buffer[..want])?;
        if count == 0 {
            bail!(
                "input too short reading {} ({remaining} bytes left)",
                input.name().full()
            );
        }
        let wrote = output.write(&buffer[..count])?;
        if wrote != count {
            bail!("output truncated writing {}", output.name().full());
        }
        remaining -= count as u64;
    }
    Ok(())
}

/// An image specialized to the `ar` container format, with the GNU
/// extended-filename extension for member names over 16 bytes.
pub struct Archive {
    image: Image,
    extended_names: u64,
}

impl Archive {
    pub fn new(path: &str) -> Result<Archive> {
        let name = FileRef::from_path(path, false);
        if !name.is_valid() {
            bail!("archive name is empty");
        }
        if !name.is_archive() {
            bail!("not an archive name: {}", name.oname());
        }
        Ok(Archive {
            image: Image::new(name),
            extended_names: 0,
        })
    }

    pub fn path(&self) -> &str {
        self.image.name().path()
    }

    pub fn name(&self) -> &FileRef {
        self.image.name()
    }

    pub fn open(&mut self, writable: bool) -> Result<()> {
        self.image.open(writable)
    }

    pub fn close(&mut self) {
        self.image.close();
    }

    pub fn is_open(&self) -> bool {
        self.image.is_open()
    }

    pub fn references(&self) -> u32 {
        self.image.references()
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.image.seek(offset)
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.image.read(buffer)
    }

    /// Check the global `ar` magic. Opens and closes the file.
    pub fn is_valid(&mut self) -> Result<bool> {
        self.image.open(false)?;
        let mut magic = [0u8; 8];
        let result = self.image.seek_read(0, &mut magic);
        self.image.close();
        Ok(result? && &magic == AR_MAGIC)
    }

    fn read_header(&mut self, offset: u64, header: &mut [u8; 60]) -> Result<bool> {
        if !self.image.seek_read(offset, header)? {
            return Ok(false);
        }
        if header[AR_SIZE_END] != 0x60 || header[AR_SIZE_END + 1] != 0x0a {
            bail!(
                "invalid archive member header at offset {offset}: {}",
                self.path()
            );
        }
        Ok(true)
    }

    /// Scan the fixed 60-byte member headers sequentially, resolving
    /// GNU extended names, and return a `FileRef` per member object.
    /// The archive must be open.
    pub fn load_members(&mut self) -> Result<Vec<FileRef>> {
        let mut members = Vec::new();
        let mut offset = AR_MAGIC.len() as u64;
        let mut header = [0u8; 60];
        loop {
            if !self.read_header(offset, &mut header)? {
                break;
            }
            // Member contents are aligned to an even address.
            let size = scan_decimal(&header[AR_SIZE..AR_SIZE_END]);
            let padded = (size + 1) & !1;

            if header[0] == b'/' {
                match header[1] {
                    // The symbol index member carries no object.
                    b' ' => {}
                    // The extended file name table. Remember where it is.
                    b'/' => self.extended_names = offset + AR_HEADER_SIZE,
                    b'0'..=b'9' => {
                        let index = scan_decimal(&header[1..AR_NAME_SIZE]);
                        if self.extended_names == 0 {
                            self.find_extended_names(offset, &header)?;
                        }
                        let name = self.read_extended_name(index)?;
                        trace!("archive member: {name}");
                        members.push(FileRef::member(
                            self.path(),
                            &name,
                            offset + AR_HEADER_SIZE,
                            size,
                        ));
                    }
                    // Unknown pseudo member; skip it.
                    _ => {}
                }
            } else {
                let name = inline_name(&header[..AR_NAME_SIZE]);
                if !name.is_empty() {
                    trace!("archive member: {name}");
                    members.push(FileRef::member(
                        self.path(),
                        &name,
                        offset + AR_HEADER_SIZE,
                        size,
                    ));
                }
            }

            offset += AR_HEADER_SIZE + padded;
        }
        Ok(members)
    }

    /// A member referenced the extended name table before it was seen:
    /// skip forward, header by header, until the `//` member appears.
    fn find_extended_names(&mut self, from: u64, current: &[u8; 60]) -> Result<()> {
        let mut header = *current;
        let mut offset = from;
        loop {
            let size = (scan_decimal(&header[AR_SIZE..AR_SIZE_END]) + 1) & !1;
            offset += size + AR_HEADER_SIZE;
            if !self.read_header(offset, &mut header)? {
                bail!("no GNU extended file name table: {}", self.path());
            }
            if header[0] == b'/' && header[1] == b'/' {
                self.extended_names = offset + AR_HEADER_SIZE;
                return Ok(());
            }
        }
    }

    fn read_extended_name(&mut self, index: u64) -> Result<String> {
        let mut buffer = vec![0u8; AR_MAX_NAME];
        self.image.seek(self.extended_names + index)?;
        let mut filled = 0;
        while filled < buffer.len() {
            let count = self.image.read(&mut buffer[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        let slice = &buffer[..filled];
        let end = slice
            .iter()
            .position(|&b| b == 0 || b == b'\n')
            .ok_or_else(|| {
                anyhow!(
                    "unterminated extended name at index {index}: {}",
                    self.path()
                )
            })?;
        let mut name = &slice[..end];
        // GNU table entries carry a trailing '/' before the newline.
        if name.ends_with(b"/") {
            name = &name[..name.len() - 1];
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }

    fn write_header(
        &mut self,
        name: &str,
        mtime: u64,
        uid: u64,
        gid: u64,
        mode: u64,
        size: u64,
    ) -> Result<()> {
        let mut header = [b' '; 60];
        let bytes = name.as_bytes();
        let len = bytes.len().min(AR_NAME_SIZE);
        header[..len].copy_from_slice(&bytes[..len]);
        put_number(mtime, &mut header[AR_MTIME..AR_UID], false);
        put_number(uid, &mut header[AR_UID..AR_GID], false);
        put_number(gid, &mut header[AR_GID..AR_MODE], false);
        put_number(mode, &mut header[AR_MODE..AR_SIZE], true);
        put_number(size, &mut header[AR_SIZE..AR_SIZE_END], false);
        header[AR_SIZE_END] = 0x60;
        header[AR_SIZE_END + 1] = 0x0a;
        self.image.write_all(&header)
    }

    /// Write the given cached objects into this archive in a single
    /// pass, routing member basenames longer than the inline name
    /// field through a GNU extended-name table.
    pub fn create(&mut self, cache: &mut Cache, paths: &[String]) -> Result<()> {
        self.image.open(true)?;
        let result = self.create_members(cache, paths);
        self.image.close();
        result
    }

    fn create_members(&mut self, cache: &mut Cache, paths: &[String]) -> Result<()> {
        self.image.seek(0)?;
        self.image.write_all(AR_MAGIC)?;

        let mut table = String::new();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for path in paths {
            let oname = basename(cache.object(path).name().oname()).to_string();
            if oname.len() > AR_NAME_SIZE && !positions.contains_key(&oname) {
                positions.insert(oname.clone(), table.len());
                table.push_str(&oname);
                table.push('\n');
            }
        }
        if !table.is_empty() {
            self.write_header("//", 0, 0, 0, 0, table.len() as u64)?;
            self.image.write_all(table.as_bytes())?;
            if table.len() % 2 == 1 {
                self.image.write_all(b"\n")?;
            }
        }

        for path in paths {
            let obj = cache.object_mut(path);
            let size = obj.name().size();
            let oname = basename(obj.name().oname()).to_string();
            let header_name = if oname.len() > AR_NAME_SIZE {
                let position = positions
                    .get(&oname)
                    .expect("overlong member name in the extended table");
                format!("/{position}")
            } else {
                oname
            };

            obj.open()?;
            let result = (|| {
                self.write_header(&header_name, 0, 0, 0, 0o666, size)?;
                obj.seek(0)?;
                copy_file(obj, &mut self.image, size)?;
                if size % 2 == 1 {
                    self.image.write_all(b"\n")?;
                }
                Ok(())
            })();
            obj.close();
            result?;
        }
        Ok(())
    }
}

/// Take an inline member name from the fixed 16-byte header field.
/// GNU terminates names with '/', traditional `ar` pads with spaces.
fn inline_name(field: &[u8]) -> String {
    let end = field
        .iter()
        .position(|&b| b == 0 || b == b'/')
        .unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end])
        .trim_end()
        .to_string()
}

/// One relocatable input, standalone or an archive member. A member
/// has no file handle of its own: open/close, positioning and reads
/// all forward to the owning archive, with the member's base offset
/// applied. The archive handle is non-owning; the cache keeps the
/// archive alive for as long as its members exist.
pub struct Object {
    image: Image,
    archive: Option<Weak<RefCell<Archive>>>,
    header: Option<elf::Header>,
    session: Option<elf::Session>,
    unresolved: symbols::Table,
    externals: symbols::List,
}

impl Object {
    pub fn standalone(path: &str) -> Result<Object> {
        let name = FileRef::from_path(path, true);
        if !name.is_valid() {
            bail!("object name is empty");
        }
        Ok(Object {
            image: Image::new(name),
            archive: None,
            header: None,
            session: None,
            unresolved: symbols::Table::new(),
            externals: symbols::List::new(),
        })
    }

    pub fn member(archive: &Rc<RefCell<Archive>>, name: FileRef) -> Result<Object> {
        if !name.is_valid() {
            bail!("object name is empty");
        }
        Ok(Object {
            image: Image::new(name),
            archive: Some(Rc::downgrade(archive)),
            header: None,
            session: None,
            unresolved: symbols::Table::new(),
            externals: symbols::List::new(),
        })
    }

    /// An archive member outliving its archive is a programming fault.
    fn owning_archive(&self) -> Option<Rc<RefCell<Archive>>> {
        self.archive.as_ref().map(|archive| {
            archive
                .upgrade()
                .expect("archive dropped before its member object")
        })
    }

    pub fn name(&self) -> &FileRef {
        self.image.name()
    }

    pub fn open(&mut self) -> Result<()> {
        trace!("object open: {}", self.name().full());
        match self.owning_archive() {
            Some(archive) => archive.borrow_mut().open(false),
            None => self.image.open(false),
        }
    }

    pub fn close(&mut self) {
        trace!("object close: {}", self.name().full());
        match self.owning_archive() {
            Some(archive) => archive.borrow_mut().close(),
            None => self.image.close(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self.owning_archive() {
            Some(archive) => archive.borrow().is_open(),
            None => self.image.is_open(),
        }
    }

    pub fn references(&self) -> u32 {
        match self.owning_archive() {
            Some(archive) => archive.borrow().references(),
            None => self.image.references(),
        }
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        match self.owning_archive() {
            Some(archive) => archive
                .borrow_mut()
                .seek(self.image.name().offset() + offset),
            None => self.image.seek(offset),
        }
    }

    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.owning_archive() {
            Some(archive) => archive.borrow_mut().read(buffer),
            None => self.image.read(buffer),
        }
    }

    pub fn seek_read(&mut self, offset: u64, buffer: &mut [u8]) -> Result<bool> {
        self.seek(offset)?;
        let mut filled = 0;
        while filled < buffer.len() {
            let count = self.read(&mut buffer[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled == buffer.len())
    }

    /// Begin an ELF session: read the object's bytes and cache the
    /// header. The object must already be open; a second begin while
    /// a session is live is a no-op.
    pub fn begin(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        if !self.is_open() {
            bail!("object is not open: {}", self.name().full());
        }
        let size = self.name().size() as usize;
        let mut data = vec![0u8; size];
        if !self.seek_read(0, &mut data)? {
            bail!("short read loading {}", self.name().full());
        }
        let session = elf::Session::new(data, &self.name().full())?;
        self.header = Some(*session.header());
        self.session = Some(session);
        Ok(())
    }

    /// End the ELF session. The cached header survives.
    pub fn end(&mut self) {
        self.session = None;
    }

    /// The object is valid once an ELF session has been established.
    pub fn is_valid(&self) -> bool {
        self.header.is_some()
    }

    pub fn session(&self) -> Result<&elf::Session> {
        self.session
            .as_ref()
            .ok_or_else(|| anyhow!("no ELF session: {}", self.name().full()))
    }

    pub fn header(&self) -> Option<&elf::Header> {
        self.header.as_ref()
    }

    /// Cached `e_shnum`.
    pub fn sections(&self) -> u16 {
        self.header.map(|h| h.shnum).unwrap_or(0)
    }

    /// Cached `e_shstrndx`.
    pub fn section_strings(&self) -> u16 {
        self.header.map(|h| h.shstrndx).unwrap_or(0)
    }

    /// Load this object's symbols, merging exports into `globals` and
    /// keeping the unresolved table and external list on the object.
    pub fn load_symbols(&mut self, globals: &mut symbols::Table, local: bool) -> Result<()> {
        debug!("loading symbols: {}", self.name().full());
        let whence = self.name().full();
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("no ELF session: {whence}"))?;
        let (unresolved, externals) = session.load_symbols(&whence, local)?;
        for sym in &externals {
            globals.insert(sym.name().to_string(), sym.clone());
        }
        self.unresolved = unresolved;
        self.externals = externals;
        Ok(())
    }

    pub fn unresolved_symbols(&self) -> &symbols::Table {
        &self.unresolved
    }

    pub fn external_symbols(&self) -> &symbols::List {
        &self.externals
    }
}

/// Owns every discovered archive and object, keyed by path.
///
/// `open` classifies each requested path as an archive or a standalone
/// object, eagerly indexing archive members; `close` drops objects
/// before archives since members borrow their archive's descriptor.
#[derive(Default)]
pub struct Cache {
    paths: Vec<String>,
    archives: BTreeMap<String, Rc<RefCell<Archive>>>,
    objects: BTreeMap<String, Object>,
    opened: bool,
}

impl Cache {
    pub fn new() -> Cache {
        Cache::default()
    }

    /// Add a requested link input. It joins the ordered object list.
    pub fn add(&mut self, path: &str) -> Result<()> {
        self.paths.push(path.to_string());
        self.input(path)
    }

    pub fn add_files(&mut self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.add(path)?;
        }
        Ok(())
    }

    /// Register library archives found on the search path. They take
    /// part in symbol loading but are not directly linked.
    pub fn add_libraries(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let path = path.display().to_string();
            self.input(&path)?;
        }
        Ok(())
    }

    fn input(&mut self, path: &str) -> Result<()> {
        if self.opened {
            self.collect(path)?;
            self.archive_begin(path)?;
        }
        Ok(())
    }

    /// One-time bulk open of everything added so far.
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        let paths = self.paths.clone();
        for path in &paths {
            self.collect(path)?;
        }
        self.archives_begin()?;
        self.opened = true;
        Ok(())
    }

    pub fn close(&mut self) {
        // Objects may hold references into archives, so they go first.
        self.objects.clear();
        self.archives.clear();
        self.opened = false;
    }

    fn collect(&mut self, path: &str) -> Result<()> {
        if self.archives.contains_key(path) || self.objects.contains_key(path) {
            return Ok(());
        }
        if !check_file(path) {
            bail!("'{path}': not found or not a regular file");
        }

        let mut archive = Archive::new(path)?;
        if archive.is_valid()? {
            archive.open(false)?;
            let members = archive.load_members();
            archive.close();
            let archive = Rc::new(RefCell::new(archive));
            for member in members? {
                let object = Object::member(&archive, member)?;
                self.objects.insert(object.name().full(), object);
            }
            self.archives.insert(path.to_string(), archive);
        } else {
            let mut object = Object::standalone(path)?;
            object.open()?;
            let valid = object.begin();
            object.end();
            object.close();
            valid?;
            self.objects.insert(path.to_string(), object);
        }
        Ok(())
    }

    /// Transiently open one archive and prime its members' ELF headers,
    /// releasing the descriptor before returning.
    fn archive_begin(&mut self, path: &str) -> Result<()> {
        let Some(archive) = self.archives.get(path).cloned() else {
            return Ok(());
        };
        trace!("archive begin: {path}");
        archive.borrow_mut().open(false)?;
        let result = (|| {
            for object in self
                .objects
                .values_mut()
                .filter(|o| o.name().aname() == path)
            {
                object.open()?;
                let valid = object.begin();
                object.end();
                object.close();
                valid?;
            }
            Ok(())
        })();
        archive.borrow_mut().close();
        result
    }

    fn archives_begin(&mut self) -> Result<()> {
        let paths: Vec<String> = self.archives.keys().cloned().collect();
        for path in &paths {
            self.archive_begin(path)?;
        }
        Ok(())
    }

    /// Load symbols from every discovered object, archive members
    /// included, opening and closing each exactly once.
    pub fn load_symbols(&mut self, globals: &mut symbols::Table, local: bool) -> Result<()> {
        for object in self.objects.values_mut() {
            object.open()?;
            let result = (|| {
                object.begin()?;
                object.load_symbols(globals, local)
            })();
            object.end();
            object.close();
            result?;
        }
        Ok(())
    }

    /// The ordered list of requested link objects. A requested path
    /// that never produced an object entry is a programming fault.
    pub fn object_paths(&self) -> Vec<String> {
        self.paths
            .iter()
            .map(|path| {
                if !self.objects.contains_key(path) {
                    panic!("requested input missing from the object map: {path}");
                }
                path.clone()
            })
            .collect()
    }

    pub fn object(&self, path: &str) -> &Object {
        self.objects
            .get(path)
            .unwrap_or_else(|| panic!("object not in cache: {path}"))
    }

    pub fn object_mut(&mut self, path: &str) -> &mut Object {
        self.objects
            .get_mut(path)
            .unwrap_or_else(|| panic!("object not in cache: {path}"))
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn archive_count(&self) -> usize {
        self.archives.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.close();
    }
}
