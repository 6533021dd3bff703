//! The recursive printer over the interpreter's object graph.
//!
//! Dispatch is a map from target type-descriptor address to a tagged printer
//! variant plus a dedup flag; heap-allocated types fall back to a generic
//! printer. Every target read failure inside one object is caught at that
//! object's boundary and replaced with a textual marker, so a torn heap
//! never kills the walk.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use crate::core::mem::{
    copy_address, field, read_c_string, read_i32, read_i64, read_ptr_vec, read_u64, ProcessMemory,
};
use crate::core::types::MemoryCopyError;
use crate::python::layouts::PyLayouts;

const MAX_DEPTH: usize = 10_000;
const MAX_VAROBJECT_ITEMS: i64 = 65_536;
const MAX_OBJECT_BYTES: i64 = 16 * 1024 * 1024;
const MAX_LIST_ELEMENTS: i64 = 100;
const MAX_DICT_SLOTS: i64 = 50;
const MAX_TUPLE_VARS: i64 = 1_000_000;
const MAX_NAME_LEN: usize = 4096;

// Sliced per depth level, four columns each.
static SPACES: &str = "                                                                                                                                ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrinterKind {
    Str,
    Dict,
    Long,
    Frame,
    Int,
    Type,
    Bool,
    Instance,
    Module,
    Class,
    List,
    Float,
    Heap,
}

#[derive(Debug, Clone, Copy)]
pub struct PrinterEntry {
    pub kind: PrinterKind,
    pub dedup: bool,
}

/// The fixed set of builtin printers, by the interpreter symbol naming each
/// type descriptor.
pub const BUILTIN_PRINTERS: &[(&str, PrinterKind, bool)] = &[
    ("PyString_Type", PrinterKind::Str, false),
    ("PyDict_Type", PrinterKind::Dict, true),
    ("PyLong_Type", PrinterKind::Long, false),
    ("PyFrame_Type", PrinterKind::Frame, true),
    ("PyInt_Type", PrinterKind::Int, false),
    ("PyType_Type", PrinterKind::Type, false),
    ("PyBool_Type", PrinterKind::Bool, false),
    ("PyInstance_Type", PrinterKind::Instance, true),
    ("PyModule_Type", PrinterKind::Module, false),
    ("PyClass_Type", PrinterKind::Class, false),
    ("PyList_Type", PrinterKind::List, true),
    ("PyFloat_Type", PrinterKind::Float, false),
];

/// A type descriptor copied out of the target, cached by its address.
struct TypeDesc {
    name: String,
    basicsize: i64,
    itemsize: i64,
    heaptype: bool,
    dictoffset: i64,
}

enum PrintError {
    Io(io::Error),
    Mem(MemoryCopyError),
}

impl From<io::Error> for PrintError {
    fn from(e: io::Error) -> Self {
        PrintError::Io(e)
    }
}

impl From<MemoryCopyError> for PrintError {
    fn from(e: MemoryCopyError) -> Self {
        PrintError::Mem(e)
    }
}

type PrintResult = Result<u64, PrintError>;

pub struct ObjectPrinter<'a> {
    io: &'a dyn ProcessMemory,
    layouts: &'static PyLayouts,
    printers: HashMap<u64, PrinterEntry>,
    do_args: bool,
    depth: usize,
    visited: HashSet<u64>,
    types: HashMap<u64, TypeDesc>,
}

impl<'a> ObjectPrinter<'a> {
    pub fn new(
        io: &'a dyn ProcessMemory,
        layouts: &'static PyLayouts,
        printers: HashMap<u64, PrinterEntry>,
        do_args: bool,
    ) -> ObjectPrinter<'a> {
        ObjectPrinter {
            io,
            layouts,
            printers,
            do_args,
            depth: 0,
            visited: HashSet::new(),
            types: HashMap::new(),
        }
    }

    fn prefix(&self) -> &'static str {
        let want = (self.depth * 4).min(SPACES.len());
        &SPACES[SPACES.len() - want..]
    }

    /// Print one top-level object graph (a thread's frame chain). The dedup
    /// set is scoped to a single top-level print.
    pub fn print_root(&mut self, out: &mut dyn Write, addr: u64) -> io::Result<()> {
        self.visited.clear();
        self.print(out, addr)
    }

    /// The recursive printer. The loop is the tail-iteration step: a printer
    /// returning a non-zero address (the frame chain's `f_back`) continues
    /// at the same depth rather than recursing.
    fn print(&mut self, out: &mut dyn Write, addr: u64) -> io::Result<()> {
        if self.depth > MAX_DEPTH {
            writeln!(out, "too deep")?;
            return Ok(());
        }
        self.depth += 1;
        let mut addr = addr;
        while addr != 0 {
            match self.print_step(out, addr) {
                Ok(next) => addr = next,
                Err(PrintError::Io(e)) => {
                    self.depth -= 1;
                    return Err(e);
                }
                Err(PrintError::Mem(_)) => {
                    write!(out, "(print failed)")?;
                    break;
                }
            }
        }
        self.depth -= 1;
        Ok(())
    }

    fn print_step(&mut self, out: &mut dyn Write, addr: u64) -> PrintResult {
        let lay = self.layouts;
        let header = copy_address(addr, lay.varobject_size + 8, self.io)?;
        let refcnt = field::i64_at(&header, 0)?;
        if refcnt == 0 {
            write!(out, "(dead object)")?;
            return Ok(0);
        }
        let type_addr = field::u64_at(&header, lay.object_type)?;
        let ob_size = field::i64_at(&header, lay.varobject_size)?;

        self.load_type(type_addr)?;
        let desc = &self.types[&type_addr];

        let entry = match self.printers.get(&type_addr) {
            Some(entry) => *entry,
            None => {
                if desc.name == "NoneType" {
                    write!(out, "None")?;
                    return Ok(0);
                } else if desc.heaptype {
                    PrinterEntry {
                        kind: PrinterKind::Heap,
                        dedup: true,
                    }
                } else {
                    write!(
                        out,
                        "{:#x} unprintable-type-{}@{:#x}",
                        addr, desc.name, type_addr
                    )?;
                    return Ok(0);
                }
            }
        };

        if entry.dedup {
            if self.visited.contains(&addr) {
                write!(out, "(already seen)")?;
                return Ok(0);
            }
            self.visited.insert(addr);
        }

        let full_size = if desc.itemsize != 0 {
            if ob_size > MAX_VAROBJECT_ITEMS || ob_size < 0 {
                write!(out, "(skip massive object {})", ob_size)?;
                return Ok(0);
            }
            desc.basicsize + desc.itemsize * ob_size
        } else {
            desc.basicsize
        };
        if full_size < 0 || full_size > MAX_OBJECT_BYTES {
            write!(out, "(skip massive object {})", ob_size)?;
            return Ok(0);
        }

        let buf = copy_address(addr, full_size as usize, self.io)?;
        match entry.kind {
            PrinterKind::Str => self.print_string(out, &buf),
            PrinterKind::Dict => self.print_dict(out, &buf),
            PrinterKind::Long => self.print_long(out, &buf),
            PrinterKind::Frame => self.print_frame(out, &buf, addr),
            PrinterKind::Int => self.print_int(out, &buf),
            PrinterKind::Type => self.print_type(out, &buf),
            PrinterKind::Bool => self.print_bool(out, &buf),
            PrinterKind::Instance => self.print_instance(out, &buf),
            PrinterKind::Module => self.print_module(out),
            PrinterKind::Class => self.print_class(out, &buf),
            PrinterKind::List => self.print_list(out, &buf),
            PrinterKind::Float => self.print_float(out, &buf),
            PrinterKind::Heap => self.print_heap(out, type_addr, addr),
        }
    }

    fn load_type(&mut self, type_addr: u64) -> Result<(), MemoryCopyError> {
        if self.types.contains_key(&type_addr) {
            return Ok(());
        }
        let lay = self.layouts;
        let raw = copy_address(type_addr, lay.type_dictoffset + 8, self.io)?;
        let name_ptr = field::u64_at(&raw, lay.type_name)?;
        let name = read_c_string(name_ptr, MAX_NAME_LEN, self.io).unwrap_or_default();
        let flags = field::u64_at(&raw, lay.type_flags)?;
        self.types.insert(
            type_addr,
            TypeDesc {
                name,
                basicsize: field::i64_at(&raw, lay.type_basicsize)?,
                itemsize: field::i64_at(&raw, lay.type_itemsize)?,
                heaptype: flags & lay.tpflags_heaptype != 0,
                dictoffset: field::i64_at(&raw, lay.type_dictoffset)?,
            },
        );
        Ok(())
    }

    fn print_string(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let lay = self.layouts;
        let len = field::i64_at(buf, lay.varobject_size)?.max(0) as usize;
        let bytes = buf
            .get(lay.string_sval..lay.string_sval + len)
            .ok_or(MemoryCopyError::ShortRead(0, len, 0))?;
        write!(out, "\"{}\"", String::from_utf8_lossy(bytes))?;
        Ok(0)
    }

    fn print_float(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        write!(out, "{}", field::f64_at(buf, self.layouts.float_fval)?)?;
        Ok(0)
    }

    fn print_int(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        write!(out, "{}", field::i64_at(buf, self.layouts.int_ival)?)?;
        Ok(0)
    }

    fn print_bool(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let val = field::i64_at(buf, self.layouts.int_ival)?;
        write!(out, "{}", if val != 0 { "True" } else { "False" })?;
        Ok(0)
    }

    fn print_long(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let lay = self.layouts;
        let ndigits = field::i64_at(buf, lay.varobject_size)?;
        let mut value: i128 = 0;
        for i in 0..ndigits.max(0) as usize {
            let shift = lay.long_shift as usize * i;
            if shift >= 120 {
                // Wider than we can render; show the low digits we have.
                write!(out, "{}... (truncated long)", value)?;
                return Ok(0);
            }
            let digit = field::u32_at(buf, lay.long_digit + i * 4)? as i128;
            value += digit << shift;
        }
        write!(out, "{}", value)?;
        Ok(0)
    }

    fn print_module(&mut self, out: &mut dyn Write) -> PrintResult {
        write!(out, "<python module>")?;
        Ok(0)
    }

    fn print_type(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let name_ptr = field::u64_at(buf, self.layouts.type_name)?;
        let name = read_c_string(name_ptr, MAX_NAME_LEN, self.io)?;
        write!(out, "type :\"{}\"", name)?;
        Ok(0)
    }

    fn print_class(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let name = field::u64_at(buf, self.layouts.class_name)?;
        write!(out, "<class ")?;
        self.print(out, name)?;
        write!(out, ">")?;
        Ok(0)
    }

    fn print_list(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let lay = self.layouts;
        let size = field::i64_at(buf, lay.varobject_size)?.clamp(0, MAX_LIST_ELEMENTS);
        let items_ptr = field::u64_at(buf, lay.list_item)?;
        writeln!(out, "list: ")?;
        let items = read_ptr_vec(items_ptr, size as usize, self.io)?;
        self.depth += 1;
        for item in items {
            write!(out, "{}", self.prefix())?;
            self.print(out, item)?;
            writeln!(out)?;
        }
        self.depth -= 1;
        writeln!(out)?;
        Ok(0)
    }

    fn print_dict(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let lay = self.layouts;
        let used = field::i64_at(buf, lay.dict_used)?;
        if used == 0 {
            return Ok(0);
        }
        let mask = field::i64_at(buf, lay.dict_mask)?;
        let table = field::u64_at(buf, lay.dict_table)?;
        for i in 0..mask.min(MAX_DICT_SLOTS).max(0) {
            let entry = copy_address(
                table + i as u64 * lay.dictentry_size as u64,
                lay.dictentry_size,
                self.io,
            )?;
            let key = field::u64_at(&entry, lay.dictentry_key)?;
            let value = field::u64_at(&entry, lay.dictentry_value)?;
            if value == 0 || key == 0 {
                continue;
            }
            write!(out, "{}", self.prefix())?;
            self.print(out, key)?;
            write!(out, ": ")?;
            self.print(out, value)?;
            writeln!(out)?;
        }
        Ok(0)
    }

    fn print_instance(&mut self, out: &mut dyn Write, buf: &[u8]) -> PrintResult {
        let lay = self.layouts;
        let class = field::u64_at(buf, lay.instance_class)?;
        let dict = field::u64_at(buf, lay.instance_dict)?;
        self.depth += 1;
        write!(out, "\n{}class: ", self.prefix())?;
        self.depth += 1;
        self.print(out, class)?;
        self.depth -= 1;
        writeln!(out, "\n{}dict: ", self.prefix())?;
        self.depth += 1;
        self.print(out, dict)?;
        self.depth -= 1;
        self.depth -= 1;
        Ok(0)
    }

    fn print_heap(&mut self, out: &mut dyn Write, type_addr: u64, addr: u64) -> PrintResult {
        let desc = &self.types[&type_addr];
        write!(out, "{}", desc.name)?;
        let dictoffset = desc.dictoffset;
        if dictoffset > 0 {
            writeln!(out)?;
            self.depth += 1;
            let dict_addr = read_u64(addr + dictoffset as u64, self.io)?;
            self.print(out, dict_addr)?;
            self.depth -= 1;
            writeln!(out)?;
        }
        Ok(0)
    }

    fn print_frame(&mut self, out: &mut dyn Write, buf: &[u8], addr: u64) -> PrintResult {
        let lay = self.layouts;
        let code = field::u64_at(buf, lay.frame_code)?;
        if code != 0 {
            let lasti = field::i32_at(buf, lay.frame_lasti)?;
            let line = self.code_line(code, lasti)?;
            let func = self.code_string(code, lay.code_name)?;
            let file = self.code_string(code, lay.code_filename)?;
            writeln!(out, "{}{} in {}:{}", self.prefix(), func, file, line)?;

            if self.do_args {
                let nlocals = read_i32(code + lay.code_nlocals as u64, self.io)? as i64;
                let varnames = read_u64(code + lay.code_varnames as u64, self.io)?;
                let cellvars = read_u64(code + lay.code_cellvars as u64, self.io)?;
                let freevars = read_u64(code + lay.code_freevars as u64, self.io)?;

                let mut flocals = addr + lay.frame_localsplus as u64;
                self.depth += 1;
                self.print_tuple_vars(out, varnames, flocals, "fastlocals", Some(nlocals))?;
                flocals += nlocals.max(0) as u64 * 8;
                let cells = self.print_tuple_vars(out, cellvars, flocals, "cells", None)?;
                flocals += cells as u64 * 8;
                self.print_tuple_vars(out, freevars, flocals, "freevars", None)?;
                self.depth -= 1;
            }
        }

        if self.do_args {
            let locals = field::u64_at(buf, lay.frame_locals)?;
            if locals != 0 {
                self.depth += 1;
                writeln!(out, "{}locals: ", self.prefix())?;
                self.print(out, locals)?;
                self.depth -= 1;
            }
        }

        Ok(field::u64_at(buf, lay.frame_back)?)
    }

    /// Print `name=value` pairs from a varname tuple and the parallel slots
    /// of the frame's locals area. Returns how many were printed so the
    /// caller can advance past them.
    fn print_tuple_vars(
        &mut self,
        out: &mut dyn Write,
        names_addr: u64,
        values_addr: u64,
        label: &str,
        max: Option<i64>,
    ) -> Result<i64, PrintError> {
        if names_addr == 0 {
            return Ok(0);
        }
        let lay = self.layouts;
        let count = read_i64(names_addr + lay.varobject_size as u64, self.io)?
            .clamp(0, max.unwrap_or(MAX_TUPLE_VARS).max(0));
        if count == 0 {
            return Ok(0);
        }
        let names = read_ptr_vec(
            names_addr + lay.tuple_item as u64,
            count as usize,
            self.io,
        )?;
        let values = read_ptr_vec(values_addr, count as usize, self.io)?;

        writeln!(out, "{}{}:", self.prefix(), label)?;
        self.depth += 1;
        for (name, value) in names.iter().zip(values.iter()) {
            write!(out, "{}", self.prefix())?;
            self.print(out, *name)?;
            write!(out, "=")?;
            self.print(out, *value)?;
            writeln!(out)?;
        }
        self.depth -= 1;
        Ok(count)
    }

    fn code_string(&mut self, code: u64, offset: usize) -> Result<String, PrintError> {
        let ptr = read_u64(code + offset as u64, self.io)?;
        Ok(read_c_string(ptr + self.layouts.string_sval as u64, MAX_NAME_LEN, self.io)?)
    }

    /// Reimplements PyCode_Addr2Line over the code object's packed
    /// line-number table.
    fn code_line(&mut self, code: u64, lasti: i32) -> Result<i32, PrintError> {
        let lay = self.layouts;
        let firstlineno = read_i32(code + lay.code_firstlineno as u64, self.io)?;
        let lnotab_ptr = read_u64(code + lay.code_lnotab as u64, self.io)?;
        if lnotab_ptr == 0 {
            return Ok(firstlineno);
        }
        let len = read_i64(lnotab_ptr + lay.varobject_size as u64, self.io)?
            .clamp(0, MAX_VAROBJECT_ITEMS) as usize;
        let table = copy_address(lnotab_ptr + lay.string_sval as u64, len, self.io)?;
        Ok(line_from_lnotab(&table, firstlineno, lasti))
    }
}

/// Decode the line-number table: pairs of (bytecode delta, line delta),
/// stopping once the accumulated bytecode address passes `lasti`.
pub fn line_from_lnotab(lnotab: &[u8], firstlineno: i32, lasti: i32) -> i32 {
    let mut line = firstlineno;
    let mut addr: i32 = 0;
    for pair in lnotab.chunks(2) {
        addr += pair[0] as i32;
        if addr > lasti {
            break;
        }
        if let Some(&delta) = pair.get(1) {
            line += delta as i32;
        }
    }
    line
}
