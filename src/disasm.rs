//! Debug disassembly of emitted code.

use anyhow::{anyhow, Result};
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use crate::buffer::CodeBuffer;

/// Renders `code`, assumed to start at host address `ip`, as one Nasm-syntax
/// line per instruction. Fails on bytes the decoder rejects, which during
/// translation means an encoder bug.
pub fn listing(code: &[u8], ip: u32) -> Result<Vec<String>> {
    let mut decoder = Decoder::new(32, code, DecoderOptions::NONE);
    decoder.set_ip(ip as u64);

    let mut formatter = NasmFormatter::new();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(anyhow!("invalid instruction at {:#010x}", instr.ip()));
        }

        let mut text = String::new();
        formatter.format(&instr, &mut text);
        lines.push(format!("{:#010x}  {}", instr.ip(), text));
    }

    Ok(lines)
}

/// The current page of `buf`, disassembled.
pub fn page_listing(buf: &CodeBuffer) -> Result<Vec<String>> {
    listing(buf.code(), buf.base())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{AluOp, NativeReg};

    #[test]
    fn test_listing_round_trips() {
        let mut buf = CodeBuffer::new(0x1000, 64);
        buf.alu_ri(AluOp::Mov, NativeReg::ESI, 0);
        buf.mov_r_dmem(NativeReg::EAX, 0x1000);

        let lines = listing(buf.code(), buf.base()).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("xor"), "{}", lines[0]);
        assert!(lines[1].contains("mov"), "{}", lines[1]);
    }

    #[test]
    fn test_listing_rejects_truncated_code() {
        // A lone 0x81 needs a ModR/M byte and an immediate.
        assert!(listing(&[0x81], 0x1000).is_err());
    }
}
