//! Rendering of collected stacks: line-oriented text or a single JSON
//! document, plus the `-d`/`-D` ELF and DWARF structure dumps.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use gimli::{EndianRcSlice, Reader, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use serde::Serialize;

use crate::core::types::ThreadStack;
use crate::Options;

pub fn render_text(
    out: &mut dyn Write,
    process_name: &str,
    stacks: &[ThreadStack],
    options: &Options,
) -> Result<()> {
    writeln!(out, "process: {}", process_name)?;
    for stack in stacks {
        match stack.thread.pthread {
            Some(pthread) => writeln!(
                out,
                "---------- thread ---------- lwp: {}, pthread: {:#x}",
                stack.thread.lwp, pthread
            )?,
            None => writeln!(out, "---------- thread ---------- lwp: {}", stack.thread.lwp)?,
        }
        for (i, frame) in stack.frames.iter().enumerate() {
            write!(out, "#{:<2} {:#018x}", i, frame.ip)?;
            if let Some(ref sym) = frame.symbol {
                if sym.offset > 0 {
                    write!(out, " in {}+{:#x} ({})", sym.name, sym.offset, sym.image)?;
                } else {
                    write!(out, " in {} ({})", sym.name, sym.image)?;
                }
            }
            if !options.no_src {
                if let Some((ref file, line)) = frame.source {
                    write!(out, " at {}:{}", file, line)?;
                }
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    process: &'a str,
    threads: Vec<JsonThread>,
}

#[derive(Serialize)]
struct JsonThread {
    id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<String>,
    frames: Vec<JsonFrame>,
}

#[derive(Serialize)]
struct JsonFrame {
    ip: u64,
    sp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<JsonSource>,
}

#[derive(Serialize)]
struct JsonSource {
    file: String,
    line: u32,
}

pub fn render_json(
    out: &mut dyn Write,
    process_name: &str,
    stacks: &[ThreadStack],
    options: &Options,
) -> Result<()> {
    let threads = stacks
        .iter()
        .map(|stack| JsonThread {
            id: stack.thread.lwp as i64,
            info: stack.thread.pthread.map(|p| format!("pthread {:#x}", p)),
            frames: stack
                .frames
                .iter()
                .map(|frame| JsonFrame {
                    ip: frame.ip,
                    sp: frame.sp,
                    function: frame.symbol.as_ref().map(|s| s.name.clone()),
                    image: frame.symbol.as_ref().map(|s| s.image.clone()),
                    offset: frame.symbol.as_ref().map(|s| s.offset),
                    source: if options.no_src {
                        None
                    } else {
                        frame.source.as_ref().map(|(file, line)| JsonSource {
                            file: file.clone(),
                            line: *line,
                        })
                    },
                })
                .collect(),
        })
        .collect();
    let doc = JsonDocument {
        process: process_name,
        threads,
    };
    serde_json::to_writer_pretty(&mut *out, &doc)?;
    writeln!(out)?;
    Ok(())
}

#[derive(Serialize)]
struct ElfDump {
    path: String,
    kind: String,
    entry: u64,
    segments: Vec<SegmentDump>,
    sections: Vec<SectionDump>,
    symbols: Vec<SymbolDump>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dwarf: Option<Vec<UnitDump>>,
}

#[derive(Serialize)]
struct SegmentDump {
    address: u64,
    size: u64,
    file_offset: u64,
    file_size: u64,
}

#[derive(Serialize)]
struct SectionDump {
    name: String,
    address: u64,
    size: u64,
}

#[derive(Serialize)]
struct SymbolDump {
    name: String,
    address: u64,
    size: u64,
}

#[derive(Serialize)]
struct UnitDump {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comp_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    producer: Option<String>,
    entries: usize,
}

/// Dump the parsed structure of an ELF object as JSON; `with_dwarf` adds a
/// summary of each DWARF compilation unit.
pub fn dump_elf(out: &mut dyn Write, path: &Path, with_dwarf: bool) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let obj = object::File::parse(&*data)
        .with_context(|| format!("parse {} as ELF", path.display()))?;

    let segments = obj
        .segments()
        .map(|seg| {
            let (file_offset, file_size) = seg.file_range();
            SegmentDump {
                address: seg.address(),
                size: seg.size(),
                file_offset,
                file_size,
            }
        })
        .collect();
    let sections = obj
        .sections()
        .map(|sec| SectionDump {
            name: sec.name().unwrap_or("").to_string(),
            address: sec.address(),
            size: sec.size(),
        })
        .collect();
    let symbols = obj
        .symbols()
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(SymbolDump {
                name: name.to_string(),
                address: sym.address(),
                size: sym.size(),
            })
        })
        .collect();

    let dwarf = if with_dwarf {
        Some(dump_dwarf_units(&obj)?)
    } else {
        None
    };

    let dump = ElfDump {
        path: path.display().to_string(),
        kind: format!("{:?}", obj.kind()),
        entry: obj.entry(),
        segments,
        sections,
        symbols,
        dwarf,
    };
    serde_json::to_writer_pretty(&mut *out, &dump)?;
    writeln!(out)?;
    Ok(())
}

fn dump_dwarf_units(obj: &object::File) -> Result<Vec<UnitDump>> {
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let load = |id: gimli::SectionId| -> std::result::Result<
        EndianRcSlice<RunTimeEndian>,
        gimli::Error,
    > {
        let data = obj
            .section_by_name(id.name())
            .and_then(|sec| sec.uncompressed_data().ok())
            .map(|cow| Rc::from(cow.as_ref()))
            .unwrap_or_else(|| Rc::from(&[][..]));
        Ok(EndianRcSlice::new(data, endian))
    };
    let dwarf = gimli::Dwarf::load(load)?;

    let mut units = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        let mut name = None;
        let mut comp_dir = None;
        let mut producer = None;
        let mut count = 0usize;

        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            count += 1;
            if entry.tag() == gimli::DW_TAG_compile_unit {
                let read_str = |attr| {
                    entry
                        .attr_value(attr)
                        .ok()
                        .flatten()
                        .and_then(|v| dwarf.attr_string(&unit, v).ok())
                        .and_then(|s| s.to_string().ok().map(|c| c.into_owned()))
                };
                name = read_str(gimli::DW_AT_name);
                comp_dir = read_str(gimli::DW_AT_comp_dir);
                producer = read_str(gimli::DW_AT_producer);
            }
        }
        units.push(UnitDump {
            name,
            comp_dir,
            producer,
            entries: count,
        });
    }
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Frame, Registers, SymbolInfo, ThreadRecord};

    fn sample_stacks() -> Vec<ThreadStack> {
        vec![ThreadStack {
            thread: ThreadRecord {
                lwp: 1234,
                pthread: Some(0x7f00_0000_0000),
                regs: Registers::default(),
            },
            frames: vec![
                Frame {
                    ip: 0x40_1000,
                    sp: 0x7fff_0000,
                    fp: 0x7fff_0040,
                    symbol: Some(SymbolInfo {
                        image: "a.out".into(),
                        name: "worker".into(),
                        offset: 0x1f,
                    }),
                    source: Some(("worker.c".into(), 42)),
                },
                Frame {
                    ip: 0x40_2000,
                    sp: 0x7fff_0100,
                    fp: 0x7fff_0140,
                    symbol: None,
                    source: None,
                },
            ],
        }]
    }

    #[test]
    fn text_output_has_header_and_thread_blocks() {
        let stacks = sample_stacks();
        let mut out = Vec::new();
        render_text(&mut out, "/bin/app", &stacks, &Options::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("process: /bin/app\n"));
        assert!(text.contains("---- thread ----"));
        assert!(text.contains("worker+0x1f"));
        assert!(text.contains("at worker.c:42"));
    }

    #[test]
    fn suppressing_source_never_changes_frame_count() {
        let stacks = sample_stacks();
        let render = |no_src: bool| {
            let mut out = Vec::new();
            let options = Options {
                no_src,
                ..Options::default()
            };
            render_text(&mut out, "app", &stacks, &options).unwrap();
            String::from_utf8(out).unwrap()
        };
        let with_src = render(false);
        let without = render(true);
        let frames = |text: &str| text.lines().filter(|l| l.starts_with('#')).count();
        assert_eq!(frames(&with_src), frames(&without));
        assert!(with_src.contains("worker.c"));
        assert!(!without.contains("worker.c"));
    }

    #[test]
    fn json_output_is_well_formed_and_matches_schema() {
        let stacks = sample_stacks();
        let mut out = Vec::new();
        render_json(&mut out, "/bin/app", &stacks, &Options::default()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(doc["process"], "/bin/app");
        let threads = doc["threads"].as_array().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0]["id"], 1234);
        let frames = threads[0]["frames"].as_array().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["function"], "worker");
        assert_eq!(frames[0]["source"]["file"], "worker.c");
        assert_eq!(frames[0]["source"]["line"], 42);
        // The unresolved frame omits its optional fields entirely.
        assert!(frames[1].get("function").is_none());
        assert!(frames[1].get("source").is_none());
    }
}
