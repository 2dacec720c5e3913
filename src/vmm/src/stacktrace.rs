//! Best-effort guest stack traces for the PrintStacktrace hypercall.

use std::io::Write;

use tracing::info;

use crate::process::Process;

pub const STACK_DEPTH_LIMIT: usize = 128;

/// Unwind from `rsp`/`rip` by scanning the guest stack for return addresses
/// and symbolizing them against the loaded image. Conservative: a stack slot
/// counts as a frame only if it lands inside the image and resolves to a
/// symbol, so locals that happen to look like pointers mostly filter out.
pub fn write_stacktrace(proc: &Process, rsp: u64, rip: u64, out: &mut Vec<u8>) {
    let mut frames = vec![rip];
    if let Some(view) = proc.symbols.as_deref() {
        let (image_lo, image_hi) = (view.load_addr(), view.initial_brk());
        for slot in 0..STACK_DEPTH_LIMIT as u64 {
            match proc.vm.read_user_obj::<u64>(rsp + slot * 8) {
                Ok(value)
                    if (image_lo..image_hi).contains(&value)
                        && view.symbol_for_vaddr(value).is_some() =>
                {
                    frames.push(value)
                }
                Ok(_) => {}
                // ran off the top of the stack
                Err(_) => break,
            }
        }
    }

    let _ = writeln!(out, "guest stacktrace (rsp={rsp:#x}):");
    for (i, addr) in frames.iter().enumerate() {
        let line = match proc
            .symbols
            .as_deref()
            .and_then(|view| view.symbol_for_vaddr(*addr))
        {
            Some((name, offset)) => format!("  #{i} {addr:#x} {name}+{offset:#x}"),
            None => format!("  #{i} {addr:#x} ???"),
        };
        info!("{line}");
        let _ = writeln!(out, "{line}");
    }
}
