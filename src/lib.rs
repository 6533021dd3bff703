//! pstack: print stack traces of running processes and core files.
//!
//! The library half of the tool. `core` holds the target-memory inspector
//! (target I/O, image cache, stop scope, thread enumeration and the native
//! unwinder), `python` holds the embedded-interpreter inspector, and
//! `output` renders what they collect.

pub mod core;
pub mod output;
#[cfg(feature = "python")]
pub mod python;

use std::io::Write;

use anyhow::Result;

pub use crate::core::image::ImageCache;
pub use crate::core::process::Process;
pub use crate::core::types::{Frame, Pid, ThreadStack};

use crate::core::stop::StopScope;
use crate::core::{threads, unwind};

/// Run-time options, set once by the command line and threaded by reference.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub json: bool,
    pub no_src: bool,
    pub do_args: bool,
    pub no_thread_db: bool,
    pub python: bool,
}

/// Inspect one target: freeze it, collect every thread's stack (native or
/// interpreter-level), and render the result. The stop scope is released
/// before rendering so the target resumes as soon as the data is collected.
pub fn inspect(proc: &mut Process, options: &Options, out: &mut dyn Write) -> Result<()> {
    if options.python {
        return inspect_python(proc, options, out);
    }

    let stacks: Vec<ThreadStack> = {
        let _scope = StopScope::new(proc)?;
        threads::list_threads(proc, !options.no_thread_db)
            .into_iter()
            .map(|thread| ThreadStack {
                frames: unwind::unwind(proc, &thread.regs, unwind::DEFAULT_MAX_FRAMES),
                thread,
            })
            .collect()
    };

    if options.json {
        output::render_json(out, &proc.name, &stacks, options)
    } else {
        output::render_text(out, &proc.name, &stacks, options)
    }
}

#[cfg(feature = "python")]
fn inspect_python(proc: &mut Process, options: &Options, out: &mut dyn Write) -> Result<()> {
    let _scope = StopScope::new(proc)?;
    let mut printer = python::PythonPrinter::new(proc, options)?;
    printer.print_stacks(out)
}

#[cfg(not(feature = "python"))]
fn inspect_python(_proc: &mut Process, _options: &Options, _out: &mut dyn Write) -> Result<()> {
    anyhow::bail!("no python support compiled in")
}
