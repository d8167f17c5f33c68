//! Disassembly dump of finalized code, for debugging lowerings.
//!
//! Gated by `HOPPER_DISASM=1` so production warm-up stays quiet. Read once
//! and cached.

use std::sync::OnceLock;

use yaxpeax_arch::{Decoder, LengthedInstruction, U8Reader};

static ENABLED: OnceLock<bool> = OnceLock::new();

fn enabled() -> bool {
    *ENABLED.get_or_init(|| match std::env::var("HOPPER_DISASM") {
        Ok(value) => value == "1" || value.eq_ignore_ascii_case("true"),
        Err(_) => false,
    })
}

/// Print a disassembly listing of `code` to stderr when enabled.
pub fn maybe_dump(name: &str, code: &[u8]) {
    if !enabled() {
        return;
    }
    eprintln!("── {name} ({} bytes) ──", code.len());
    eprint!("{}", disassemble(code));
}

/// Decode `code` into one instruction per line.
pub fn disassemble(code: &[u8]) -> String {
    use std::fmt::Write;

    let decoder = yaxpeax_x86::amd64::InstDecoder::default();
    let mut reader = U8Reader::new(code);
    let mut offset = 0usize;
    let mut out = String::new();

    while offset < code.len() {
        match decoder.decode(&mut reader) {
            Ok(inst) => {
                let len = inst.len().to_const() as usize;
                writeln!(&mut out, "{offset:06x}:  {inst}").unwrap();
                offset += len;
            }
            Err(_) => {
                writeln!(&mut out, "{offset:06x}:  <decode error> (0x{:02x})", code[offset])
                    .unwrap();
                offset += 1;
                reader = U8Reader::new(&code[offset..]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembles_simple_sequence() {
        // xor eax, eax; ret
        let listing = disassemble(&[0x31, 0xc0, 0xc3]);
        assert!(listing.contains("xor"));
        assert!(listing.contains("ret"));
    }
}
