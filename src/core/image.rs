//! Executable images and their debug info.
//!
//! `ImageCache` is the process-wide cache batch mode relies on: images are
//! keyed by path+mtime and parsed once.
//! Each `Image` carries its symbol table, an addr2line context for source
//! coordinates, the raw `.eh_frame` bytes for the unwinder and the DWARF
//! sections needed for global-variable discovery.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;

use gimli::Reader as _;

use anyhow::{anyhow, Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use log::{debug, info};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};

type Reader = EndianRcSlice<RunTimeEndian>;

#[derive(Clone)]
struct SymbolEntry {
    name: String,
    address: u64,
    size: u64,
}

pub struct Image {
    pub path: PathBuf,
    /// Position-independent images get relocated by the mapping base; ET_EXEC
    /// images use their linked addresses directly.
    pub is_pic: bool,
    symbols: Vec<SymbolEntry>,
    ctx: Option<addr2line::Context<Reader>>,
    dwarf: Option<gimli::Dwarf<Reader>>,
    pub eh_frame: Rc<[u8]>,
    pub eh_frame_addr: u64,
    pub eh_frame_hdr_addr: Option<u64>,
    pub text_addr: u64,
}

impl Image {
    fn open(path: &Path, debug_dirs: &[PathBuf]) -> Result<Image> {
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let obj = object::File::parse(&*data)
            .with_context(|| format!("parse {} as ELF", path.display()))?;

        let mut symbols = load_symbols(&obj);

        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let (eh_frame, eh_frame_addr): (Rc<[u8]>, u64) = match obj.section_by_name(".eh_frame") {
            Some(sec) => {
                let data = sec.uncompressed_data().unwrap_or(Cow::Borrowed(&[]));
                (Rc::from(data.as_ref()), sec.address())
            }
            None => (Rc::from(&[][..]), 0),
        };
        let eh_frame_hdr_addr = obj.section_by_name(".eh_frame_hdr").map(|s| s.address());
        let text_addr = obj.section_by_name(".text").map(|s| s.address()).unwrap_or(0);

        // Prefer debug info in the image itself; otherwise hunt for a
        // separate debug file by build-id or basename.
        let mut sections = dwarf_section_map(&obj);
        if sections.is_none() {
            if let Some(debug_path) = find_debug_file(path, &obj, debug_dirs) {
                info!(
                    "using debug file {} for {}",
                    debug_path.display(),
                    path.display()
                );
                if let Ok(debug_data) = fs::read(&debug_path) {
                    if let Ok(debug_obj) = object::File::parse(&*debug_data) {
                        sections = dwarf_section_map(&debug_obj);
                        // Stripped binaries keep their full symtab in the
                        // debug file; merge it in.
                        let extra = load_symbols(&debug_obj);
                        symbols.extend(extra);
                    }
                }
            }
        }
        symbols.sort_by_key(|s| s.address);
        symbols.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        let (ctx, dwarf) = match sections {
            Some(sections) => {
                let load = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
                    let data = sections
                        .get(id.name())
                        .cloned()
                        .unwrap_or_else(|| Rc::from(&[][..]));
                    Ok(EndianRcSlice::new(data, endian))
                };
                let dwarf = gimli::Dwarf::load(&load)?;
                let ctx_dwarf = gimli::Dwarf::load(&load)?;
                let ctx = addr2line::Context::from_dwarf(ctx_dwarf).ok();
                (ctx, Some(dwarf))
            }
            None => {
                debug!("no debug info for {}", path.display());
                (None, None)
            }
        };

        Ok(Image {
            path: path.to_path_buf(),
            is_pic: obj.kind() != ObjectKind::Executable,
            symbols,
            ctx,
            dwarf,
            eh_frame,
            eh_frame_addr,
            eh_frame_hdr_addr,
            text_addr,
        })
    }

    /// Symbol covering an (unrelocated) image address, with the offset in.
    pub fn symbol_for(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = match self.symbols.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let sym = &self.symbols[idx];
        let within = if sym.size > 0 {
            addr < sym.address + sym.size
        } else {
            // Unsized symbols extend to the next one.
            self.symbols
                .get(idx + 1)
                .map_or(true, |next| addr < next.address)
        };
        within.then(|| (sym.name.as_str(), addr - sym.address))
    }

    /// Address of a named symbol (unrelocated).
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address)
    }

    /// Source coordinate for an (unrelocated) image address.
    pub fn source_for(&self, addr: u64) -> Option<(String, u32)> {
        let ctx = self.ctx.as_ref()?;
        let loc = ctx.find_location(addr).ok()??;
        Some((loc.file?.to_string(), loc.line?))
    }

    /// Find a compilation-unit-scope variable by name and evaluate its
    /// location expression against a zero frame base and the given load
    /// bias. This is how the interpreter inspector locates `interp_head`.
    pub fn global_variable_address(&self, name: &str, bias: u64) -> Option<u64> {
        let dwarf = self.dwarf.as_ref()?;
        let mut units = dwarf.units();
        while let Ok(Some(header)) = units.next() {
            let unit = match dwarf.unit(header) {
                Ok(unit) => unit,
                Err(_) => continue,
            };
            let mut entries = unit.entries();
            let mut depth = 0isize;
            while let Ok(Some((delta, entry))) = entries.next_dfs() {
                depth += delta;
                if depth > 1 {
                    continue;
                }
                if depth == 1 && entry.tag() == gimli::DW_TAG_variable {
                    let entry_name = entry
                        .attr_value(gimli::DW_AT_name)
                        .ok()
                        .flatten()
                        .and_then(|v| dwarf.attr_string(&unit, v).ok());
                    let matches = entry_name
                        .as_ref()
                        .and_then(|n| n.to_string().ok().map(|s| s.as_ref() == name))
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    if let Ok(Some(gimli::AttributeValue::Exprloc(expr))) =
                        entry.attr_value(gimli::DW_AT_location)
                    {
                        if let Some(addr) = eval_static_location(expr, unit.encoding(), bias) {
                            return Some(addr);
                        }
                    }
                }
            }
        }
        None
    }
}

/// Evaluate a location expression with no registers and no frame base; only
/// statically-addressable results count.
fn eval_static_location(
    expr: gimli::Expression<Reader>,
    encoding: gimli::Encoding,
    bias: u64,
) -> Option<u64> {
    let mut eval = expr.evaluation(encoding);
    let mut result = eval.evaluate().ok()?;
    loop {
        match result {
            gimli::EvaluationResult::Complete => break,
            gimli::EvaluationResult::RequiresRelocatedAddress(addr) => {
                result = eval.resume_with_relocated_address(addr.wrapping_add(bias)).ok()?;
            }
            _ => return None,
        }
    }
    let pieces = eval.result();
    match pieces.first()?.location {
        gimli::Location::Address { address } => Some(address),
        _ => None,
    }
}

fn load_symbols(obj: &object::File) -> Vec<SymbolEntry> {
    let mut symbols = Vec::new();
    for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
        if symbol.kind() != SymbolKind::Text && symbol.kind() != SymbolKind::Data {
            continue;
        }
        if let Ok(name) = symbol.name() {
            if !name.is_empty() {
                symbols.push(SymbolEntry {
                    name: name.to_string(),
                    address: symbol.address(),
                    size: symbol.size(),
                });
            }
        }
    }
    symbols
}

fn dwarf_section_map(obj: &object::File) -> Option<HashMap<&'static str, Rc<[u8]>>> {
    obj.section_by_name(".debug_info")?;
    let mut map = HashMap::new();
    for id in [
        gimli::SectionId::DebugAbbrev,
        gimli::SectionId::DebugAddr,
        gimli::SectionId::DebugInfo,
        gimli::SectionId::DebugLine,
        gimli::SectionId::DebugLineStr,
        gimli::SectionId::DebugRanges,
        gimli::SectionId::DebugRngLists,
        gimli::SectionId::DebugStr,
        gimli::SectionId::DebugStrOffsets,
        gimli::SectionId::DebugLoc,
        gimli::SectionId::DebugLocLists,
    ] {
        if let Some(sec) = obj.section_by_name(id.name()) {
            if let Ok(data) = sec.uncompressed_data() {
                map.insert(id.name(), Rc::from(data.as_ref()));
            }
        }
    }
    Some(map)
}

fn find_debug_file(path: &Path, obj: &object::File, debug_dirs: &[PathBuf]) -> Option<PathBuf> {
    let build_id = obj.build_id().ok().flatten();
    for dir in debug_dirs {
        if let Some(id) = build_id {
            if id.len() > 1 {
                let mut name = String::new();
                for byte in &id[1..] {
                    name.push_str(&format!("{:02x}", byte));
                }
                name.push_str(".debug");
                let candidate = dir
                    .join(".build-id")
                    .join(format!("{:02x}", id[0]))
                    .join(name);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
        if let Some(base) = path.file_name() {
            let mut name = base.to_os_string();
            name.push(".debug");
            let candidate = dir.join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Process-wide image cache, keyed by path+mtime; only first-time insertion
/// mutates state.
pub struct ImageCache {
    debug_dirs: Vec<PathBuf>,
    images: Mutex<HashMap<String, Rc<Image>>>,
}

impl ImageCache {
    pub fn new(extra_debug_dirs: Vec<PathBuf>) -> ImageCache {
        let mut debug_dirs = extra_debug_dirs;
        debug_dirs.push(PathBuf::from("/usr/lib/debug"));
        ImageCache {
            debug_dirs,
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, path: &Path) -> Result<Rc<Image>> {
        let key = cache_key(path)?;
        let mut images = match self.images.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(image) = images.get(&key) {
            return Ok(image.clone());
        }
        let image = Rc::new(Image::open(path, &self.debug_dirs)?);
        images.insert(key, image.clone());
        Ok(image)
    }
}

fn cache_key(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    // A replaced file gets a fresh cache entry.
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .ok_or_else(|| anyhow!("no mtime for {}", path.display()))?;
    Ok(format!("{}:{}", path.display(), mtime))
}
