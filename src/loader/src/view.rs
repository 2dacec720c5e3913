use std::path::{Path, PathBuf};

use bitflags::bitflags;
use goblin::elf::{header, program_header, Elf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse ELF: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("unsupported ELF class, need 64-bit little-endian")]
    BadClass,
    #[error("unsupported machine type {0:#x}")]
    BadMachine(u16),
    #[error("unsupported ELF type {0:#x}, need EXEC or DYN")]
    BadType(u16),
    #[error("no loadable segments")]
    NoLoadSegments,
    #[error("segment at offset {0:#x} extends past end of file")]
    TruncatedSegment(u64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElfType {
    Exec,
    Dyn,
}

bitflags! {
    /// Segment permission bits, matching `p_flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

/// Program header table location, passed to the guest through auxv.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhInfo {
    pub offset: u64,
    pub entsize: u64,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub p_type: u32,
    pub flags: SegmentFlags,
    pub file_offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesize: u64,
    pub memsize: u64,
    pub align: u64,
}

impl Segment {
    pub fn is_load(&self) -> bool {
        self.p_type == program_header::PT_LOAD
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub is_func: bool,
}

/// Parse-once view of one ELF file.
///
/// All virtual addresses in the view are absolute. `set_base` is the only
/// mutation: it shifts every absolute address by the delta to the new base,
/// which is how ET_DYN binaries get relocated in a single call. ET_EXEC
/// images are only ever "rebased" to 0, a no-op.
pub struct ElfView {
    data: Vec<u8>,
    base: u64,
    entry: u64,
    load_addr: u64,
    initial_brk: u64,
    etype: ElfType,
    phinfo: PhInfo,
    interpreter: Option<String>,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    // indices into `symbols`, sorted by value; rebasing shifts all values by
    // the same delta so the order never changes
    by_value: Vec<u32>,
}

impl ElfView {
    pub fn open(path: &Path) -> Result<ElfView, Error> {
        let data = std::fs::read(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        ElfView::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<ElfView, Error> {
        let elf = Elf::parse(&data)?;

        if !elf.is_64 || !elf.little_endian {
            return Err(Error::BadClass);
        }
        if elf.header.e_machine != header::EM_X86_64 {
            return Err(Error::BadMachine(elf.header.e_machine));
        }
        let etype = match elf.header.e_type {
            header::ET_EXEC => ElfType::Exec,
            header::ET_DYN => ElfType::Dyn,
            other => return Err(Error::BadType(other)),
        };

        let phinfo = PhInfo {
            offset: elf.header.e_phoff,
            entsize: elf.header.e_phentsize as u64,
            count: elf.header.e_phnum as u64,
        };

        let mut segments = Vec::with_capacity(elf.program_headers.len());
        let mut load_addr = None;
        let mut load_end = 0u64;
        for ph in &elf.program_headers {
            let seg = Segment {
                p_type: ph.p_type,
                flags: SegmentFlags::from_bits_truncate(ph.p_flags),
                file_offset: ph.p_offset,
                vaddr: ph.p_vaddr,
                paddr: ph.p_paddr,
                filesize: ph.p_filesz,
                memsize: ph.p_memsz,
                align: ph.p_align,
            };
            if seg.is_load() {
                if ph
                    .p_offset
                    .checked_add(ph.p_filesz)
                    .is_none_or(|end| end > data.len() as u64)
                {
                    return Err(Error::TruncatedSegment(ph.p_offset));
                }
                load_addr = Some(load_addr.unwrap_or(u64::MAX).min(ph.p_vaddr));
                load_end = load_end.max(ph.p_vaddr.saturating_add(ph.p_memsz));
            }
            segments.push(seg);
        }
        let load_addr = load_addr.ok_or(Error::NoLoadSegments)?;
        let initial_brk = (load_end + 0xfff) & !0xfff;

        let sections = elf
            .section_headers
            .iter()
            .map(|sh| Section {
                name: elf
                    .shdr_strtab
                    .get_at(sh.sh_name)
                    .unwrap_or_default()
                    .to_string(),
                sh_type: sh.sh_type,
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
                link: sh.sh_link,
            })
            .collect::<Vec<_>>();

        // goblin already resolved each symbol table against the string table
        // its section links to
        let mut symbols = Vec::with_capacity(elf.syms.len() + elf.dynsyms.len());
        for sym in elf.syms.iter() {
            symbols.push(Symbol {
                name: elf.strtab.get_at(sym.st_name).unwrap_or_default().to_string(),
                value: sym.st_value,
                size: sym.st_size,
                is_func: sym.is_function(),
            });
        }
        for sym in elf.dynsyms.iter() {
            symbols.push(Symbol {
                name: elf
                    .dynstrtab
                    .get_at(sym.st_name)
                    .unwrap_or_default()
                    .to_string(),
                value: sym.st_value,
                size: sym.st_size,
                is_func: sym.is_function(),
            });
        }

        let mut by_value: Vec<u32> = (0..symbols.len() as u32)
            .filter(|&i| {
                let sym = &symbols[i as usize];
                sym.value != 0 && !sym.name.is_empty()
            })
            .collect();
        by_value.sort_by_key(|&i| symbols[i as usize].value);

        let interpreter = elf.interpreter.map(str::to_string);
        let entry = elf.header.e_entry;

        debug!(
            "parsed ELF: type={:?} entry={:#x} load_addr={:#x} brk={:#x} segments={} symbols={}",
            etype,
            entry,
            load_addr,
            initial_brk,
            segments.len(),
            symbols.len(),
        );

        Ok(ElfView {
            data,
            base: 0,
            entry,
            load_addr,
            initial_brk,
            etype,
            phinfo,
            interpreter,
            segments,
            sections,
            symbols,
            by_value,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn load_addr(&self) -> u64 {
        self.load_addr
    }

    pub fn initial_brk(&self) -> u64 {
        self.initial_brk
    }

    pub fn elf_type(&self) -> ElfType {
        self.etype
    }

    pub fn phinfo(&self) -> PhInfo {
        self.phinfo
    }

    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// File bytes backing a segment. The tail up to `memsize` has no file
    /// backing and must be zero-filled by the consumer.
    pub fn segment_data(&self, seg: &Segment) -> &[u8] {
        &self.data[seg.file_offset as usize..(seg.file_offset + seg.filesize) as usize]
    }

    /// Relocate every absolute address in the view to the new base.
    pub fn set_base(&mut self, base: u64) {
        let delta = base.wrapping_sub(self.base);
        self.base = base;
        self.entry = self.entry.wrapping_add(delta);
        self.load_addr = self.load_addr.wrapping_add(delta);
        self.initial_brk = self.initial_brk.wrapping_add(delta);
        for seg in &mut self.segments {
            seg.vaddr = seg.vaddr.wrapping_add(delta);
            seg.paddr = seg.paddr.wrapping_add(delta);
        }
        for sec in &mut self.sections {
            sec.addr = sec.addr.wrapping_add(delta);
        }
        for sym in &mut self.symbols {
            sym.value = sym.value.wrapping_add(delta);
        }
    }

    /// Resolve a guest address to the closest preceding symbol.
    pub fn symbol_for_vaddr(&self, vaddr: u64) -> Option<(&str, u64)> {
        // pre-sorted, so we can use binary search
        let partition_idx = self
            .by_value
            .partition_point(|&i| self.symbols[i as usize].value <= vaddr);
        let candidates = &self.by_value[..partition_idx];
        candidates.last().map(|&i| {
            let sym = &self.symbols[i as usize];
            (sym.name.as_str(), vaddr - sym.value)
        })
    }
}
