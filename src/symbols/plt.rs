//! Decoding of procedure linkage table stubs.
//!
//! A stub is recognized by its instructions, which either reference the
//! global offset table slot the call goes through or carry the index of
//! the relocation the dynamic linker is to resolve lazily.

use crate::elf::types::EM_AARCH64;
use crate::elf::types::EM_X86_64;
use crate::Addr;


/// The size of a single stub, on all supported architectures.
pub(crate) const PLT_ENTRY_SIZE: u64 = 16;


/// What a stub tells us about its destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PltTarget {
    /// The run-time address of the global offset table slot the stub
    /// jumps through.
    Got(Addr),
    /// The index of the PLT relocation the stub pushes for lazy
    /// binding.
    RelocIndex(u32),
}


fn u32_at(code: &[u8], offset: usize) -> Option<u32> {
    let bytes = code.get(offset..offset + 4)?;
    let mut word = [0; 4];
    let () = word.copy_from_slice(bytes);
    Some(u32::from_le_bytes(word))
}

fn decode_x86_64(addr: Addr, code: &[u8]) -> Option<PltTarget> {
    let mut offset = 0;
    // endbr64
    if code.starts_with(&[0xf3, 0x0f, 0x1e, 0xfa]) {
        offset += 4;
    }
    // bnd prefix
    if code.get(offset) == Some(&0xf2) {
        offset += 1;
    }

    match code.get(offset..offset + 2)? {
        // jmp *disp32(%rip)
        [0xff, 0x25] => {
            let disp = u32_at(code, offset + 2)? as i32;
            let next = addr.wrapping_add(offset as u64 + 6);
            Some(PltTarget::Got(next.wrapping_add_signed(disp.into())))
        }
        // push $imm32
        [0x68, ..] => {
            let index = u32_at(code, offset + 1)?;
            Some(PltTarget::RelocIndex(index))
        }
        _ => None,
    }
}

fn decode_aarch64(addr: Addr, code: &[u8]) -> Option<PltTarget> {
    const BTI_C: u32 = 0xd503245f;

    let mut offset = 0;
    if u32_at(code, 0)? == BTI_C {
        offset += 4;
    }

    // adrp x16, page
    let adrp = u32_at(code, offset)?;
    if adrp & 0x9f00001f != 0x90000010 {
        return None
    }
    let immlo = u64::from((adrp >> 29) & 0x3);
    let immhi = u64::from((adrp >> 5) & 0x7ffff);
    // Sign extend the 21 bit page count.
    let pages = (((immhi << 2) | immlo) << 43) as i64 >> 43;
    let pc = addr.wrapping_add(offset as u64);
    let page = (pc & !0xfff).wrapping_add_signed(pages << 12);

    // ldr x17, [x16, #imm]
    let ldr = u32_at(code, offset + 4)?;
    if ldr & 0xffc003ff != 0xf9400211 {
        return None
    }
    let imm = u64::from((ldr >> 10) & 0xfff) * 8;
    Some(PltTarget::Got(page.wrapping_add(imm)))
}

/// Decode the stub at `addr`, whose code is provided in `code`.
///
/// `None` is returned for unsupported machines and for anything that
/// does not look like a regular stub, such as the table's header.
pub(crate) fn decode(machine: u16, addr: Addr, code: &[u8]) -> Option<PltTarget> {
    match machine {
        EM_X86_64 => decode_x86_64(addr, code),
        EM_AARCH64 => decode_aarch64(addr, code),
        _ => None,
    }
}
