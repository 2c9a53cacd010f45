//! Guest-register residency: the host register file state, the allocation
//! policy on top of it, and the EFLAGS-resident condition/carry tracker.
//!
//! All state lives in an explicit [`Jit`] context. A block translation starts
//! with [`Jit::invalidate_all`], requests host registers per guest
//! instruction, and ends with [`Jit::flush_all`] (leaving mappings intact) or
//! [`Jit::clobber_all`] (dropping them, e.g. before calling out of emitted
//! code).
//!
//! The write-back-before-clobber rule is the load-bearing invariant: a Dirty
//! register is stored to the client CPU image before anything overwrites it,
//! and a Dirty flag or carry is spilled before any emitted instruction
//! touches EFLAGS. The emission primitives do none of this automatically for
//! ALU output flags; per-opcode translators call the clobber operations
//! first.

use std::collections::HashMap;

use crate::buffer::CodeBuffer;
use crate::x86::{AluOp, BitTest, Cond, Mem, NativeReg};

/// A guest register, identified by its byte offset in the client CPU image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PpcReg(pub u32);

/// One of the eight 4-bit fields of the guest condition register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CrField {
    Cr0 = 0,
    Cr1 = 1,
    Cr2 = 2,
    Cr3 = 3,
    Cr4 = 4,
    Cr5 = 5,
    Cr6 = 6,
    Cr7 = 7,
}

/// Residency of a host register (and of the tracked EFLAGS bits).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegState {
    /// Holds nothing.
    Unused,
    /// Holds a copy of a guest value; the memory image is authoritative.
    Mapped,
    /// Holds the authoritative value; must be stored back on eviction.
    Dirty,
}

/// How a register request may be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegHint {
    /// Any allocatable register, preferring the least recently used.
    Any,
    /// One of EAX..EBX, so the 8-bit subregister is addressable.
    Byte,
    /// Exactly this register.
    Fixed(NativeReg),
}

/// Selects the target of a bulk flush or clobber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegSelect {
    All,
    One(NativeReg),
}

/// Addresses supplied by the embedding runtime: the client CPU image and the
/// assembly glue that folds live EFLAGS back into the guest CR and XER.
#[derive(Clone, Copy, Debug)]
pub struct Externs {
    /// Host address of the client CPU image; guest registers are byte
    /// offsets from here.
    pub cpu_base: u32,
    /// Offset of the 32-bit XER image within the CPU image.
    pub xer: u32,
    /// Helper that writes the tracked CR field from the live EFLAGS.
    pub flush_flags: u32,
    /// Helper that also folds CF into XER[CA].
    pub flush_carry_and_flags: u32,
}

// The guest carry is bit 29 of XER in PPC numbering, which lands in bit 5 of
// byte 3 of the little-endian image.
const XER_CA_BIT: u8 = 29;
const XER_CA_BYTE: u32 = 3;
const XER_CA_MASK: u8 = 1 << 5;

/// LRU order over the seven allocatable registers as {prev, next} index
/// links. ESP stays permanently unlinked.
struct Lru {
    prev: [Option<NativeReg>; 8],
    next: [Option<NativeReg>; 8],
    head: NativeReg,
    tail: NativeReg,
}

impl Lru {
    fn new() -> Self {
        use NativeReg::*;
        let order = [EAX, ECX, EDX, EBX, EBP, ESI, EDI];
        let mut lru = Lru {
            prev: [None; 8],
            next: [None; 8],
            head: EAX,
            tail: EDI,
        };
        for pair in order.windows(2) {
            lru.next[pair[0].idx()] = Some(pair[1]);
            lru.prev[pair[1].idx()] = Some(pair[0]);
        }
        lru
    }

    /// Moves `reg` to the most-recently-used end. No-op if it is already
    /// there.
    fn touch(&mut self, reg: NativeReg) {
        assert!(reg != NativeReg::ESP, "ESP is not allocatable");
        let more = match self.next[reg.idx()] {
            Some(more) => more,
            None => return, // already MRU
        };
        match self.prev[reg.idx()] {
            Some(less) => {
                self.next[less.idx()] = Some(more);
                self.prev[more.idx()] = Some(less);
            }
            None => {
                // reg was the LRU head
                self.head = more;
                self.prev[more.idx()] = None;
            }
        }
        self.prev[reg.idx()] = Some(self.tail);
        self.next[reg.idx()] = None;
        self.next[self.tail.idx()] = Some(reg);
        self.tail = reg;
    }
}

/// A JIT translation context: the code buffer plus every piece of allocator
/// and flag-tracker state for the block being translated.
pub struct Jit {
    pub buf: CodeBuffer,
    ext: Externs,
    native_reg: [Option<PpcReg>; 8],
    reg_state: [RegState; 8],
    client_reg: HashMap<PpcReg, NativeReg>,
    lru: Lru,
    native_flags: CrField,
    flags_state: RegState,
    carry_state: RegState,
}

impl Jit {
    pub fn new(buf: CodeBuffer, ext: Externs) -> Self {
        Jit {
            buf,
            ext,
            native_reg: [None; 8],
            reg_state: [RegState::Unused; 8],
            client_reg: HashMap::new(),
            lru: Lru::new(),
            native_flags: CrField::Cr0,
            flags_state: RegState::Unused,
            carry_state: RegState::Unused,
        }
    }

    fn client_addr(&self, creg: PpcReg) -> u32 {
        self.ext.cpu_base + creg.0
    }

    fn map(&mut self, nreg: NativeReg, creg: PpcReg) {
        self.native_reg[nreg.idx()] = Some(creg);
        self.client_reg.insert(creg, nreg);
    }

    fn unmap(&mut self, nreg: NativeReg) {
        if let Some(creg) = self.native_reg[nreg.idx()].take() {
            self.client_reg.remove(&creg);
        }
    }

    fn load(&mut self, nreg: NativeReg, creg: PpcReg) {
        self.buf.mov_r_dmem(nreg, self.client_addr(creg));
        self.map(nreg, creg);
        self.reg_state[nreg.idx()] = RegState::Mapped;
    }

    fn store(&mut self, nreg: NativeReg, creg: PpcReg) {
        self.buf.mov_dmem_r(self.client_addr(creg), nreg);
    }

    fn store_undirty(&mut self, nreg: NativeReg, creg: PpcReg) {
        self.store(nreg, creg);
        self.reg_state[nreg.idx()] = RegState::Mapped;
    }

    /// The guest register currently held by `reg`, if any.
    pub fn register_mapping(&self, reg: NativeReg) -> Option<PpcReg> {
        self.native_reg[reg.idx()]
    }

    /// The host register currently holding `creg`, if any.
    pub fn client_register_mapping(&self, creg: PpcReg) -> Option<NativeReg> {
        self.client_reg.get(&creg).copied()
    }

    pub fn register_state(&self, reg: NativeReg) -> RegState {
        self.reg_state[reg.idx()]
    }

    fn discard(&mut self, reg: NativeReg) {
        // Leaves the LRU position alone; callers re-allocate the register
        // almost immediately.
        self.reg_state[reg.idx()] = RegState::Unused;
    }

    /// Moves `reg` to the most-recently-used end of the LRU list.
    pub fn touch_register(&mut self, reg: NativeReg) {
        self.lru.touch(reg);
    }

    /// Marks `reg` Dirty. Emits nothing and leaves the LRU alone.
    pub fn dirty_register(&mut self, reg: NativeReg) -> NativeReg {
        self.reg_state[reg.idx()] = RegState::Dirty;
        reg
    }

    /// Stores a Dirty `reg` back and unmaps it; Unused afterwards.
    fn spill_and_unmap(&mut self, reg: NativeReg) {
        match self.reg_state[reg.idx()] {
            RegState::Dirty => {
                let creg = self.native_reg[reg.idx()].expect("dirty register with no mapping");
                log::debug!("spilling {:?} to client +{:#x}", reg, creg.0);
                self.store_undirty(reg, creg);
                self.unmap(reg);
                self.reg_state[reg.idx()] = RegState::Unused;
            }
            RegState::Mapped => {
                self.unmap(reg);
                self.reg_state[reg.idx()] = RegState::Unused;
            }
            RegState::Unused => {}
        }
    }

    fn clobber_and_touch(&mut self, reg: NativeReg) {
        self.spill_and_unmap(reg);
        self.lru.touch(reg);
    }

    fn alloc_fixed(&mut self, reg: NativeReg) -> NativeReg {
        self.clobber_and_touch(reg);
        reg
    }

    /// Obtains a scratch register whose prior contents do not matter. The
    /// victim is stored back first if it was Dirty.
    pub fn alloc_register(&mut self, hint: RegHint) -> NativeReg {
        let reg = match hint {
            RegHint::Fixed(reg) => reg,
            RegHint::Byte => {
                let mut reg = self.lru.head;
                while !reg.byte_addressable() {
                    reg = self.lru.next[reg.idx()].expect("no byte-addressable register in LRU");
                }
                reg
            }
            RegHint::Any => self.lru.head,
        };
        self.alloc_fixed(reg)
    }

    /// Maps `creg` for a full overwrite: the result is Dirty and the current
    /// memory image is never loaded. A displaced occupant of a requested
    /// register is moved aside, not spilled.
    pub fn map_client_register_dirty(&mut self, creg: PpcReg, hint: RegHint) -> NativeReg {
        match hint {
            RegHint::Byte => {
                // No translator emits this shape; there is no encoding
                // support behind it either.
                panic!("byte-constrained dirty mapping is not implemented");
            }
            RegHint::Fixed(want) => {
                if let Some(have) = self.native_reg[want.idx()] {
                    if have == creg {
                        self.dirty_register(want);
                        self.touch_register(want);
                        return want;
                    }
                    // creg's old home, if any, is dead: its value is about
                    // to be overwritten.
                    if let Some(old) = self.client_register_mapping(creg) {
                        self.unmap(old);
                        self.discard(old);
                    }
                    // The old occupant needs a new home first; finding one
                    // may itself evict the LRU victim.
                    let temp = self.alloc_register(RegHint::Any);
                    self.map(want, creg);
                    self.reg_state[temp.idx()] = self.reg_state[want.idx()];
                    self.dirty_register(want);
                    if temp != want {
                        // XCHG is one byte when EAX is involved, MOV two
                        // otherwise; want's old value is dead either way.
                        if temp == NativeReg::EAX {
                            self.buf.alu_rr(AluOp::Xchg, temp, want);
                        } else if want == NativeReg::EAX {
                            self.buf.alu_rr(AluOp::Xchg, want, temp);
                        } else {
                            self.buf.alu_rr(AluOp::Mov, temp, want);
                        }
                        self.map(temp, have);
                    }
                } else {
                    // want is free; any stale home of creg is just forgotten
                    if let Some(old) = self.client_register_mapping(creg) {
                        self.unmap(old);
                        self.discard(old);
                    }
                    self.map(want, creg);
                    self.dirty_register(want);
                }
                self.touch_register(want);
                want
            }
            RegHint::Any => {
                let reg = match self.client_register_mapping(creg) {
                    Some(reg) => {
                        self.touch_register(reg);
                        reg
                    }
                    None => {
                        let reg = self.alloc_register(RegHint::Any);
                        self.map(reg, creg);
                        reg
                    }
                };
                self.dirty_register(reg)
            }
        }
    }

    /// Returns a host register holding the current value of `creg`, loading
    /// from the CPU image or shuffling registers as needed. The register
    /// keeps its previous residency state.
    pub fn get_client_register(&mut self, creg: PpcReg, hint: RegHint) -> NativeReg {
        match hint {
            RegHint::Byte => match self.client_register_mapping(creg) {
                None => {
                    let reg = self.alloc_register(RegHint::Byte);
                    self.load(reg, creg);
                    reg
                }
                Some(have) if have.byte_addressable() => {
                    self.touch_register(have);
                    have
                }
                Some(have) => {
                    let want = self.alloc_register(RegHint::Byte);
                    self.buf.alu_rr(AluOp::Mov, want, have);
                    self.unmap(have);
                    self.map(want, creg);
                    self.reg_state[want.idx()] = self.reg_state[have.idx()];
                    self.reg_state[have.idx()] = RegState::Unused;
                    want
                }
            },
            RegHint::Fixed(want) => {
                let home = self.client_register_mapping(creg);
                match self.native_reg[want.idx()] {
                    Some(have) => {
                        if have == creg {
                            self.touch_register(want);
                        } else if let Some(home) = home {
                            // Both values live: swap them, and swap the
                            // bookkeeping with them.
                            self.buf.alu_rr(AluOp::Xchg, want, home);
                            self.reg_state.swap(want.idx(), home.idx());
                            self.map(want, creg);
                            self.map(home, have);
                            self.touch_register(want);
                        } else {
                            self.alloc_fixed(want);
                            self.load(want, creg);
                        }
                    }
                    None => {
                        self.touch_register(want);
                        if let Some(home) = home {
                            self.buf.alu_rr(AluOp::Mov, want, home);
                            self.reg_state[want.idx()] = self.reg_state[home.idx()];
                            self.unmap(home);
                            self.discard(home);
                            self.map(want, creg);
                        } else {
                            self.load(want, creg);
                        }
                    }
                }
                want
            }
            RegHint::Any => match self.client_register_mapping(creg) {
                Some(reg) => {
                    self.touch_register(reg);
                    reg
                }
                None => {
                    let reg = self.alloc_register(RegHint::Any);
                    self.load(reg, creg);
                    reg
                }
            },
        }
    }

    /// [`Jit::get_client_register`], then mark the result Dirty.
    pub fn get_client_register_dirty(&mut self, creg: PpcReg, hint: RegHint) -> NativeReg {
        let reg = self.get_client_register(creg, hint);
        self.dirty_register(reg)
    }

    fn flush_one(&mut self, reg: NativeReg) {
        if self.reg_state[reg.idx()] == RegState::Dirty {
            let creg = self.native_reg[reg.idx()].expect("dirty register with no mapping");
            self.store_undirty(reg, creg);
        }
    }

    fn flush_one_keep_dirty(&mut self, reg: NativeReg) {
        if self.reg_state[reg.idx()] == RegState::Dirty {
            let creg = self.native_reg[reg.idx()].expect("dirty register with no mapping");
            self.store(reg, creg);
        }
    }

    /// Stores Dirty registers back; they revert to Mapped.
    pub fn flush_register(&mut self, sel: RegSelect) {
        match sel {
            RegSelect::All => {
                for &reg in &NativeReg::ALL {
                    self.flush_one(reg);
                }
            }
            RegSelect::One(reg) => self.flush_one(reg),
        }
    }

    /// Debug variant: emits the stores but leaves the Dirty bits set, so the
    /// client image can be inspected without disturbing allocator state.
    pub fn flush_register_dirty(&mut self, sel: RegSelect) {
        match sel {
            RegSelect::All => {
                for &reg in &NativeReg::ALL {
                    self.flush_one_keep_dirty(reg);
                }
            }
            RegSelect::One(reg) => self.flush_one_keep_dirty(reg),
        }
    }

    /// Flushes and unmaps; the registers come back Unused.
    pub fn clobber_register(&mut self, sel: RegSelect) {
        match sel {
            RegSelect::All => {
                // No LRU movement: everything is evicted anyway.
                for &reg in &NativeReg::ALL {
                    self.spill_and_unmap(reg);
                }
            }
            RegSelect::One(reg) => self.spill_and_unmap(reg),
        }
    }

    /// Spills flags, carry and every Dirty register; mappings survive. Called
    /// before leaving a block for interpreter territory.
    pub fn flush_all(&mut self) {
        self.clobber_carry_and_flags();
        self.flush_register(RegSelect::All);
    }

    /// Spills and drops everything, e.g. before a call out of emitted code.
    pub fn clobber_all(&mut self) {
        self.clobber_carry_and_flags();
        self.clobber_register(RegSelect::All);
    }

    /// Forgets all mappings without emitting a byte. Block entry starts
    /// here. The LRU order of the previous block is kept.
    pub fn invalidate_all(&mut self) {
        log::debug!("invalidating all register mappings");
        self.native_reg = [None; 8];
        self.reg_state = [RegState::Unused; 8];
        self.client_reg.clear();
        self.flags_state = RegState::Unused;
        self.carry_state = RegState::Unused;
    }

    /// Declares that the live EFLAGS encode the comparison result destined
    /// for `cr`.
    pub fn map_flags_dirty(&mut self, cr: CrField) {
        self.native_flags = cr;
        self.flags_state = RegState::Dirty;
    }

    /// The CR field the tracked flags belong to.
    pub fn flags_mapping(&self) -> CrField {
        self.native_flags
    }

    pub fn flags_mapped(&self) -> bool {
        self.flags_state != RegState::Unused
    }

    /// Declares that the live CF is the guest carry.
    pub fn map_carry_dirty(&mut self) {
        self.carry_state = RegState::Dirty;
    }

    pub fn carry_mapped(&self) -> bool {
        self.carry_state != RegState::Unused
    }

    /// Makes CF hold the guest carry, loading it from the XER image if it is
    /// not already live.
    pub fn get_client_carry(&mut self) {
        if self.carry_state == RegState::Unused {
            self.clobber_flags();
            let xer = self.ext.cpu_base + self.ext.xer;
            self.buf.btx_mi(BitTest::Bt, Mem::abs(xer), XER_CA_BIT);
            self.carry_state = RegState::Mapped;
        }
    }

    /// Spills the tracked CR field if it is Dirty. Any EFLAGS-resident carry
    /// is invalid afterwards: the spill helpers clobber EFLAGS.
    pub fn clobber_flags(&mut self) {
        if self.flags_state == RegState::Dirty {
            if self.carry_state == RegState::Dirty {
                log::debug!("spilling flags and carry via helper");
                self.buf.call(self.ext.flush_carry_and_flags);
            } else {
                log::debug!("spilling flags via helper");
                self.buf.call(self.ext.flush_flags);
            }
            self.carry_state = RegState::Unused;
        }
        self.flags_state = RegState::Unused;
    }

    /// Spills the guest carry if it is Dirty: through the combined helper
    /// when the flags are Dirty too, else with an inline CF-selected byte
    /// update of the XER image.
    pub fn clobber_carry(&mut self) {
        if self.carry_state == RegState::Dirty {
            if self.flags_state == RegState::Dirty {
                self.buf.call(self.ext.flush_carry_and_flags);
            } else {
                log::debug!("spilling carry inline");
                self.spill_carry_inline();
            }
            self.flags_state = RegState::Unused;
        }
        self.carry_state = RegState::Unused;
    }

    fn spill_carry_inline(&mut self) {
        let ca = Mem::abs(self.ext.cpu_base + self.ext.xer + XER_CA_BYTE);
        let set = self.buf.jcc_fixup(Cond::C);
        self.buf.alu_mi8(AluOp::And, ca, !XER_CA_MASK);
        let done = self.buf.jmp_fixup();
        let here = self.buf.here();
        self.buf.resolve_fixup(set, here);
        self.buf.alu_mi8(AluOp::Or, ca, XER_CA_MASK);
        let here = self.buf.here();
        self.buf.resolve_fixup(done, here);
    }

    /// Spills whatever is Dirty among flags and carry, preferring the
    /// combined helper when both are.
    pub fn clobber_carry_and_flags(&mut self) {
        if self.carry_state == RegState::Dirty {
            if self.flags_state == RegState::Dirty {
                self.buf.call(self.ext.flush_carry_and_flags);
                self.carry_state = RegState::Unused;
                self.flags_state = RegState::Unused;
            } else {
                self.clobber_carry();
            }
        } else {
            self.clobber_flags();
        }
    }

    /// Debug only: emits the flag/carry spills without touching the tracker
    /// state, so the client image can be inspected mid-block.
    pub fn flush_carry_and_flags_dirty(&mut self) {
        if self.carry_state == RegState::Dirty {
            if self.flags_state == RegState::Dirty {
                self.buf.call(self.ext.flush_carry_and_flags);
            } else {
                self.spill_carry_inline();
            }
        } else if self.flags_state == RegState::Dirty {
            self.buf.call(self.ext.flush_flags);
        }
    }
}
