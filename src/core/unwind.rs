//! Native stack unwinding, driven by the `.eh_frame` unwind rules of
//! whichever image covers the current program counter.
//!
//! Produces frames innermost-first. The walk stops as soon as the rules run
//! out: no FDE covering the pc, an unrepresentable CFA rule, a zero or
//! unmapped return address, or the caller's depth cap.

use gimli::{BaseAddresses, CfaRule, EhFrame, LittleEndian, RegisterRule, UnwindSection};
use log::debug;

use crate::core::mem::read_u64;
use crate::core::process::Process;
use crate::core::types::{Frame, Registers};

pub const DEFAULT_MAX_FRAMES: usize = 1024;

struct Cursor {
    pc: u64,
    sp: u64,
    fp: u64,
}

pub fn unwind(proc: &Process, regs: &Registers, max_depth: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut cursor = Cursor {
        pc: regs.rip,
        sp: regs.rsp,
        fp: regs.rbp,
    };

    while frames.len() < max_depth {
        // Return addresses point after the call; adjust every frame but the
        // innermost so rule and symbol lookups land inside the call site.
        let lookup = if frames.is_empty() {
            cursor.pc
        } else {
            cursor.pc.wrapping_sub(1)
        };

        let mut frame = Frame {
            ip: cursor.pc,
            sp: cursor.sp,
            fp: cursor.fp,
            ..Default::default()
        };
        proc.annotate_frame(&mut frame, lookup);
        frames.push(frame);

        cursor = match step(proc, &cursor, lookup) {
            Some(next) => next,
            None => break,
        };
        if cursor.pc == 0 || proc.object_for(cursor.pc.wrapping_sub(1)).is_none() {
            break;
        }
    }
    frames
}

fn step(proc: &Process, cursor: &Cursor, lookup: u64) -> Option<Cursor> {
    let obj = proc.object_for(lookup)?;
    let image = proc.image(obj)?;
    if image.eh_frame.is_empty() {
        debug!("no unwind info in {}", obj.path.display());
        return None;
    }
    let bias = Process::bias(obj, &image);

    let eh_frame = EhFrame::new(&image.eh_frame, LittleEndian);
    let mut bases = BaseAddresses::default()
        .set_eh_frame(image.eh_frame_addr.wrapping_add(bias))
        .set_text(image.text_addr.wrapping_add(bias));
    if let Some(hdr) = image.eh_frame_hdr_addr {
        bases = bases.set_eh_frame_hdr(hdr.wrapping_add(bias));
    }

    let mut ctx = gimli::UnwindContext::new();
    let row = eh_frame
        .unwind_info_for_address(&bases, &mut ctx, lookup, |section, bases, offset| {
            section.cie_from_offset(bases, offset)
        })
        .ok()?;

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let base = if *register == gimli::X86_64::RSP {
                cursor.sp
            } else if *register == gimli::X86_64::RBP {
                cursor.fp
            } else {
                return None;
            };
            base.wrapping_add(*offset as u64)
        }
        // Expression-based CFAs would need a full DWARF evaluator; treat
        // them as the end of what we can recover.
        CfaRule::Expression(_) => return None,
    };

    let ra = match row.register(gimli::X86_64::RA) {
        RegisterRule::Offset(off) => read_u64(cfa.wrapping_add(off as u64), proc.io.as_ref()).ok()?,
        RegisterRule::Register(reg) => {
            if reg == gimli::X86_64::RBP {
                cursor.fp
            } else if reg == gimli::X86_64::RSP {
                cursor.sp
            } else {
                return None;
            }
        }
        // FDEs for PLT stubs and hand-written asm leave the RA column
        // unset; on x86_64 the return address sits just below the CFA. A
        // bogus value read here stops the walk at the caller's zero or
        // unmapped-pc check.
        _ => read_u64(cfa.wrapping_sub(8), proc.io.as_ref()).ok()?,
    };

    let fp = match row.register(gimli::X86_64::RBP) {
        RegisterRule::Offset(off) => {
            read_u64(cfa.wrapping_add(off as u64), proc.io.as_ref()).unwrap_or(cursor.fp)
        }
        RegisterRule::SameValue => cursor.fp,
        _ => cursor.fp,
    };

    Some(Cursor {
        pc: ra,
        sp: cfa,
        fp,
    })
}
