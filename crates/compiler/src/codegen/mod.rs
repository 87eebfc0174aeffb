//! Code generation through a typed value stack.
//!
//! The parser does not build a syntax tree. Each expression production
//! pushes a descriptor of its partially-emitted result onto a bounded value
//! stack, and each operator consumes descriptors, emits machine code, and
//! pushes the descriptor of the result. A descriptor says where the value
//! lives right now: a compile-time constant, a register, a frame slot, the
//! CPU flags, or a pending conditional-branch chain.
//!
//! Forward jumps are resolved with fix-up lists threaded through the text
//! section itself: an undefined label's `c` holds the offset of its most
//! recent 32-bit branch slot, each slot holds the offset of the next, and
//! -1 terminates the list. Defining the label walks the list and rewrites
//! every slot with the final `target - (site + 4)` displacement.
//!
//! # Module Structure
//!
//! - `mod.rs`: value stack, register allocation, operators, jumps/labels
//! - `x86_64.rs`: byte emitter, REX/ModR/M encoding, ABI sequences

mod x86_64;

pub use x86_64::{NB_REGS, Reg, RegClass};

use crate::error::CodeGenError;
use crate::section::{Section, SectionKind};
use crate::symbols::{SymId, SymTable};
use crate::types::{BT_BYTE, TypeWord};
use tcc_pe::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_CNT_UNINITIALIZED_DATA,
    IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
};

/// Capacity of the value stack; exceeding it is a compile error.
pub const VSTACK_SIZE: usize = 256;

// Condition-code nibbles. `0x0F 0x8c` is the near jump and `0x0F 0x9c` the
// byte set for nibble `c`.
pub(crate) const CC_E: u8 = 0x4;
pub(crate) const CC_NE: u8 = 0x5;
pub(crate) const CC_B: u8 = 0x2;
pub(crate) const CC_AE: u8 = 0x3;
pub(crate) const CC_BE: u8 = 0x6;
pub(crate) const CC_A: u8 = 0x7;
pub(crate) const CC_L: u8 = 0xC;
pub(crate) const CC_GE: u8 = 0xD;
pub(crate) const CC_LE: u8 = 0xE;
pub(crate) const CC_G: u8 = 0xF;

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Storage {
    /// Compile-time constant.
    Const(i64),
    /// Address of section storage: a function, global, or string literal.
    Addr { section: SectionKind, offset: i64 },
    /// Live in a register.
    Reg(Reg),
    /// Frame slot at `[rbp + offset]`.
    Local(i64),
    /// The address of the cell was spilled to a frame slot; reaching the
    /// value takes one extra indirection.
    Llocal(i64),
    /// In the CPU flags, as a condition-code nibble.
    Cmp(u8),
    /// Pending branch chain from `&&`/`||`: jumps on `chain` produce
    /// `!val`, falling through produces `val`.
    Branch { val: bool, chain: i64 },
}

/// One value-stack entry.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    pub ty: TypeWord,
    pub storage: Storage,
    /// The entry denotes a memory cell rather than its contents.
    pub lval: bool,
}

/// Binary operators the generator knows how to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// An absolute-address immediate awaiting the final section layout.
#[derive(Debug)]
pub struct AddrPatch {
    /// Offset of the 64-bit immediate in `.text`.
    pub pos: usize,
    pub section: SectionKind,
    pub offset: i64,
}

/// Code generator state: output sections, the value stack, and labels.
pub struct CodeGen {
    pub text: Section,
    pub data: Section,
    /// Created lazily by the first string literal.
    pub rdata: Option<Section>,
    pub bss: Section,
    /// Current output position in `.text`.
    pub ind: usize,
    /// Frame offset cursor; grows downward from the frame pointer.
    pub loc: i64,
    vstack: Vec<Value>,
    /// Label symbols, reset per function.
    pub labels: SymTable,
    pub addr_patches: Vec<AddrPatch>,
}

impl CodeGen {
    pub fn new() -> CodeGen {
        CodeGen {
            text: Section::new(
                ".text",
                IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
            ),
            data: Section::new(
                ".data",
                IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
            ),
            rdata: None,
            bss: Section::new(
                ".bss",
                IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE,
            ),
            ind: 0,
            loc: 0,
            vstack: Vec::new(),
            labels: SymTable::new(),
            addr_patches: Vec::new(),
        }
    }

    // ---- value stack -----------------------------------------------------

    pub fn vstack_len(&self) -> usize {
        self.vstack.len()
    }

    /// Drop everything; used when recovering from a bad statement.
    pub fn clear_vstack(&mut self) {
        self.vstack.clear();
    }

    pub(crate) fn vpush_value(&mut self, v: Value) -> Result<(), CodeGenError> {
        if self.vstack.len() >= VSTACK_SIZE {
            return Err("value stack overflow".into());
        }
        self.vstack.push(v);
        Ok(())
    }

    /// Push a new entry.
    pub fn vset(&mut self, ty: TypeWord, storage: Storage, lval: bool) -> Result<(), CodeGenError> {
        self.vpush_value(Value { ty, storage, lval })
    }

    /// Duplicate the top entry.
    pub fn vpush(&mut self) -> Result<(), CodeGenError> {
        let top = *self.vtop()?;
        self.vpush_value(top)
    }

    pub fn vpop(&mut self) -> Result<Value, CodeGenError> {
        self.vstack.pop().ok_or_else(|| "value stack underflow".into())
    }

    pub fn vswap(&mut self) -> Result<(), CodeGenError> {
        let len = self.vstack.len();
        if len < 2 {
            return Err("value stack underflow".into());
        }
        self.vstack.swap(len - 1, len - 2);
        Ok(())
    }

    pub fn vtop(&mut self) -> Result<&mut Value, CodeGenError> {
        self.vstack.last_mut().ok_or_else(|| "value stack underflow".into())
    }

    fn vtop_ref(&self, depth: usize) -> Result<&Value, CodeGenError> {
        let len = self.vstack.len();
        if depth >= len {
            return Err("value stack underflow".into());
        }
        Ok(&self.vstack[len - 1 - depth])
    }

    // ---- sections --------------------------------------------------------

    /// The read-only data section, created on first use.
    pub fn rdata_mut(&mut self) -> &mut Section {
        self.rdata.get_or_insert_with(|| {
            Section::new(".rdata", IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ)
        })
    }

    /// Append a NUL-terminated string literal to `.rdata` and push its
    /// address as a `char *` value.
    pub fn add_string(&mut self, bytes: &[u8]) -> Result<(), CodeGenError> {
        let rdata = self.rdata_mut();
        let offset = rdata.add(bytes);
        rdata.add(&[0]);
        self.vset(
            TypeWord(BT_BYTE).pointer_to(),
            Storage::Addr {
                section: SectionKind::Rdata,
                offset: offset as i64,
            },
            false,
        )
    }

    // ---- register allocation ---------------------------------------------

    /// Is `r` referenced by any entry except the `keep` topmost?
    fn reg_in_use(&self, r: Reg, keep: usize) -> bool {
        let limit = self.vstack.len().saturating_sub(keep);
        self.vstack[..limit]
            .iter()
            .any(|v| matches!(v.storage, Storage::Reg(x) if x == r))
    }

    /// Spill every entry (below the `keep` topmost) living in `r` to one
    /// fresh frame slot.
    pub(crate) fn spill_reg(&mut self, r: Reg, keep: usize) -> Result<(), CodeGenError> {
        if !self.reg_in_use(r, keep) {
            return Ok(());
        }
        self.loc -= 8;
        let slot = self.loc;
        self.emit_store_reg_slot(r, slot);
        let limit = self.vstack.len().saturating_sub(keep);
        for v in &mut self.vstack[..limit] {
            if matches!(v.storage, Storage::Reg(x) if x == r) {
                v.storage = if v.lval {
                    Storage::Llocal(slot)
                } else {
                    Storage::Local(slot)
                };
                v.lval = true;
            }
        }
        Ok(())
    }

    /// Pick a register of class `rc`, spilling a live one if all are taken.
    /// The top entry is exempt from the liveness scan: it is the value being
    /// materialized, and its current register is read before being replaced.
    fn alloc_reg(&mut self, rc: RegClass) -> Result<Reg, CodeGenError> {
        for &r in rc.candidates() {
            if !self.reg_in_use(r, 1) {
                return Ok(r);
            }
        }
        let r = rc.candidates()[0];
        self.spill_reg(r, 1)?;
        Ok(r)
    }

    /// A register distinct from `avoid` and from every live entry, for
    /// short-lived address computations.
    pub(crate) fn scratch_reg(&mut self, avoid: Reg) -> Result<Reg, CodeGenError> {
        for &r in RegClass::Int.candidates() {
            if r != avoid && !self.reg_in_use(r, 0) {
                return Ok(r);
            }
        }
        let r = *RegClass::Int
            .candidates()
            .iter()
            .find(|&&r| r != avoid)
            .expect("more than one register");
        self.spill_reg(r, 0)?;
        Ok(r)
    }

    /// Materialize the top entry into a register of class `rc`.
    pub fn gv(&mut self, rc: RegClass) -> Result<Reg, CodeGenError> {
        let v = *self.vtop_ref(0)?;
        if let Storage::Reg(r) = v.storage {
            if rc.contains(r) && !v.lval {
                return Ok(r);
            }
        }
        let r = self.alloc_reg(rc)?;
        self.load(r, &v)?;
        let top = self.vtop()?;
        top.storage = Storage::Reg(r);
        top.lval = false;
        Ok(r)
    }

    /// Materialize the two top entries into distinct registers: the
    /// right-hand side (top) into `rc2`, the left-hand side into `rc1`.
    /// Loading the left side can spill the right one; when that happens the
    /// pair is redone.
    pub fn gv2(&mut self, rc1: RegClass, rc2: RegClass) -> Result<(Reg, Reg), CodeGenError> {
        for _ in 0..2 {
            let r2 = self.gv(rc2)?;
            self.vswap()?;
            let r1 = self.gv(rc1)?;
            self.vswap()?;
            let top = *self.vtop_ref(0)?;
            if matches!(top.storage, Storage::Reg(r) if r == r2) && !top.lval {
                return Ok((r1, r2));
            }
        }
        Err("register allocation failed".into())
    }

    // ---- operators -------------------------------------------------------

    /// Emit a binary integer operator over the two top entries.
    pub fn gen_op(&mut self, op: BinOp) -> Result<(), CodeGenError> {
        let rhs_ty = self.vtop_ref(0)?.ty;
        let lhs_ty = self.vtop_ref(1)?.ty;
        if lhs_ty.is_float() || rhs_ty.is_float() {
            return Err("floating-point operations are not implemented".into());
        }

        let lhs_ptr = lhs_ty.is_pointer();
        let rhs_ptr = rhs_ty.is_pointer();
        let mut result_ty = lhs_ty;
        if matches!(op, BinOp::Add | BinOp::Sub) {
            if lhs_ptr && !rhs_ptr {
                self.scale_index(lhs_ty.deref().size())?;
            } else if rhs_ptr && !lhs_ptr && op == BinOp::Add {
                self.vswap()?;
                self.scale_index(rhs_ty.deref().size())?;
                result_ty = rhs_ty;
            } else if lhs_ptr && rhs_ptr {
                // pointer difference; left unscaled in this revision
                result_ty = TypeWord::INT;
            }
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let opcode = match op {
                    BinOp::Add => 0x01,
                    BinOp::Sub => 0x29,
                    BinOp::And => 0x21,
                    BinOp::Or => 0x09,
                    _ => 0x31,
                };
                let (r1, r2) = self.gv2(RegClass::Int, RegClass::Int)?;
                self.emit_alu(opcode, r1, r2);
                self.vpop()?;
                self.vpop()?;
                self.vset(result_ty, Storage::Reg(r1), false)
            }
            BinOp::Mul => {
                let (r1, r2) = self.gv2(RegClass::Int, RegClass::Int)?;
                self.emit_imul(r1, r2);
                self.vpop()?;
                self.vpop()?;
                self.vset(result_ty, Storage::Reg(r1), false)
            }
            BinOp::Div | BinOp::Mod => {
                let (_, r2) = self.gv2(RegClass::Rax, RegClass::Int)?;
                // cqo clobbers rdx, and the remainder lands there
                self.spill_reg(Reg::Rdx, 2)?;
                let divisor = if r2 == Reg::Rdx {
                    self.spill_reg(Reg::Rcx, 2)?;
                    self.emit_mov_rr(Reg::Rcx, Reg::Rdx);
                    Reg::Rcx
                } else {
                    r2
                };
                self.emit_cqo();
                self.emit_unary_f7(7, divisor);
                self.vpop()?;
                self.vpop()?;
                let res = if op == BinOp::Div { Reg::Rax } else { Reg::Rdx };
                self.vset(result_ty, Storage::Reg(res), false)
            }
            BinOp::Shl | BinOp::Shr => {
                let (r1, _) = self.gv2(RegClass::Int, RegClass::Rcx)?;
                let subop = if op == BinOp::Shl {
                    4
                } else if lhs_ty.is_unsigned() {
                    5
                } else {
                    7
                };
                self.emit_shift(subop, r1);
                self.vpop()?;
                self.vpop()?;
                self.vset(result_ty, Storage::Reg(r1), false)
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let (r1, r2) = self.gv2(RegClass::Int, RegClass::Int)?;
                self.emit_cmp(r1, r2);
                let unsigned = lhs_ty.is_unsigned() || rhs_ty.is_unsigned() || lhs_ptr || rhs_ptr;
                let cc = match (op, unsigned) {
                    (BinOp::Eq, _) => CC_E,
                    (BinOp::Ne, _) => CC_NE,
                    (BinOp::Lt, false) => CC_L,
                    (BinOp::Lt, true) => CC_B,
                    (BinOp::Gt, false) => CC_G,
                    (BinOp::Gt, true) => CC_A,
                    (BinOp::Le, false) => CC_LE,
                    (BinOp::Le, true) => CC_BE,
                    (BinOp::Ge, false) => CC_GE,
                    _ => CC_AE,
                };
                self.vpop()?;
                self.vpop()?;
                self.vset(TypeWord::INT, Storage::Cmp(cc), false)
            }
        }
    }

    /// Multiply the top entry by an element size for pointer arithmetic.
    fn scale_index(&mut self, size: usize) -> Result<(), CodeGenError> {
        if size > 1 {
            let r = self.gv(RegClass::Int)?;
            self.emit_imul_imm(r, size as i8);
        }
        Ok(())
    }

    /// Assignment: the stack holds the lvalue then the right-hand side.
    /// The right-hand side's register stays as the result.
    pub fn gen_assign(&mut self) -> Result<(), CodeGenError> {
        let lhs = *self.vtop_ref(1)?;
        if !lhs.lval {
            return Err("lvalue required as left operand of assignment".into());
        }
        let r = self.gv(RegClass::Int)?;
        self.vpop()?;
        let lhs = self.vpop()?;
        self.store(r, &lhs)?;
        self.vset(lhs.ty, Storage::Reg(r), false)
    }

    /// Integer cast: the type word carries the new size; converters for
    /// floating targets are not implemented.
    pub fn gen_cast(&mut self, ty: TypeWord) -> Result<(), CodeGenError> {
        if ty.is_float() || self.vtop_ref(0)?.ty.is_float() {
            return Err("floating-point casts are not implemented".into());
        }
        self.vtop()?.ty = ty;
        Ok(())
    }

    /// Logical negation. Constants fold, comparisons invert their condition
    /// code, branch chains swap polarity; anything else is tested against
    /// zero.
    pub fn gen_not(&mut self) -> Result<(), CodeGenError> {
        let v = *self.vtop_ref(0)?;
        let top = match (v.storage, v.lval) {
            (Storage::Const(c), false) => Storage::Const((c == 0) as i64),
            (Storage::Cmp(cc), false) => Storage::Cmp(cc ^ 1),
            (Storage::Branch { val, chain }, false) => Storage::Branch { val: !val, chain },
            _ => {
                let r = self.gv(RegClass::Int)?;
                self.emit_test(r, r);
                Storage::Cmp(CC_E)
            }
        };
        let entry = self.vtop()?;
        entry.storage = top;
        entry.lval = false;
        entry.ty = TypeWord::INT;
        Ok(())
    }

    /// Arithmetic negation.
    pub fn gen_neg(&mut self) -> Result<(), CodeGenError> {
        let v = *self.vtop_ref(0)?;
        if let (Storage::Const(c), false) = (v.storage, v.lval) {
            self.vtop()?.storage = Storage::Const(c.wrapping_neg());
            return Ok(());
        }
        let r = self.gv(RegClass::Int)?;
        self.emit_unary_f7(3, r);
        Ok(())
    }

    /// Bitwise complement.
    pub fn gen_bnot(&mut self) -> Result<(), CodeGenError> {
        let v = *self.vtop_ref(0)?;
        if let (Storage::Const(c), false) = (v.storage, v.lval) {
            self.vtop()?.storage = Storage::Const(!c);
            return Ok(());
        }
        let r = self.gv(RegClass::Int)?;
        self.emit_unary_f7(2, r);
        Ok(())
    }

    /// Pre/post increment and decrement of the lvalue on top of the stack.
    pub fn gen_incdec(&mut self, post: bool, inc: bool) -> Result<(), CodeGenError> {
        if !self.vtop_ref(0)?.lval {
            return Err("lvalue required as increment operand".into());
        }
        let op = if inc { BinOp::Add } else { BinOp::Sub };
        let step = if self.vtop_ref(0)?.ty.is_pointer() {
            self.vtop_ref(0)?.ty.deref().size() as i64
        } else {
            1
        };
        if post {
            // keep the old value live in its own register across the store
            self.vpush()?;
            let r_old = self.gv(RegClass::Int)?;
            let r_new = self.copy_to_fresh(r_old)?;
            let ty = self.vtop_ref(0)?.ty;
            self.vset(ty, Storage::Reg(r_new), false)?;
            self.vset(TypeWord::INT, Storage::Const(step), false)?;
            self.gen_op(op)?;
            let newv = self.vpop()?;
            let oldv = self.vpop()?;
            let lv = self.vpop()?;
            self.vpush_value(oldv)?;
            self.vpush_value(lv)?;
            self.vpush_value(newv)?;
            self.gen_assign()?;
            self.vpop()?;
            Ok(())
        } else {
            self.vpush()?;
            self.gv(RegClass::Int)?;
            self.vset(TypeWord::INT, Storage::Const(step), false)?;
            self.gen_op(op)?;
            self.gen_assign()
        }
    }

    /// Copy `src` into a register no live entry is using.
    fn copy_to_fresh(&mut self, src: Reg) -> Result<Reg, CodeGenError> {
        let dst = self.scratch_reg(src)?;
        self.emit_mov_rr(dst, src);
        Ok(dst)
    }

    // ---- jumps and labels ------------------------------------------------

    /// Allocate an anonymous, undefined label with an empty fix-up list.
    pub fn gind(&mut self) -> SymId {
        self.labels.push_anon(TypeWord::VOID, 0, -1)
    }

    /// Define `l` at the current output position, patching its fix-up list.
    pub fn glabel(&mut self, l: SymId) {
        let chain = self.labels.get(l).c;
        let target = self.ind;
        self.gsym_chain(chain, target);
        let sym = self.labels.get_mut(l);
        sym.r = 1;
        sym.c = target as i64;
    }

    /// Walk a fix-up chain, rewriting every slot with its displacement to
    /// `target`.
    fn gsym_chain(&mut self, mut chain: i64, target: usize) {
        while chain != -1 {
            let pos = chain as usize;
            chain = self.read_fixup(pos);
            let rel = target as i64 - (pos as i64 + 4);
            self.text.write_u32_at(pos, rel as i32 as u32);
        }
    }

    fn read_fixup(&self, pos: usize) -> i64 {
        let raw = self.text.read_u32_at(pos);
        if raw == u32::MAX { -1 } else { raw as i64 }
    }

    /// Emit the 32-bit displacement of a branch to `l`: the final value if
    /// `l` is defined, otherwise a new head of its fix-up list.
    fn emit_label_rel(&mut self, l: SymId) {
        let sym = self.labels.get(l);
        if sym.r == 1 {
            let rel = sym.c - (self.ind as i64 + 4);
            self.emit_le32(rel as i32 as u32);
        } else {
            let head = sym.c;
            let slot = self.ind;
            self.emit_le32(head as i32 as u32);
            self.labels.get_mut(l).c = slot as i64;
        }
    }

    /// Unconditional jump to `l`.
    pub fn gjmp(&mut self, l: SymId) {
        self.emit_byte(0xE9);
        self.emit_label_rel(l);
    }

    fn gjcc(&mut self, cc: u8, l: SymId) {
        self.emit_byte(0x0F);
        self.emit_byte(0x80 | cc);
        self.emit_label_rel(l);
    }

    /// Pop the condition on top of the stack and jump to `l` when it is
    /// false (`inv` set) or true (`inv` clear).
    pub fn gtst(&mut self, inv: bool, l: SymId) -> Result<(), CodeGenError> {
        let v = self.vpop()?;
        match (v.storage, v.lval) {
            (Storage::Cmp(cc), false) => {
                self.gjcc(if inv { cc ^ 1 } else { cc }, l);
            }
            (Storage::Const(c), false) => {
                if (c != 0) != inv {
                    self.gjmp(l);
                }
            }
            (Storage::Branch { val, chain }, false) => {
                if val == inv {
                    // the pending jumps are exactly the paths that must
                    // reach l; the fallthrough paths continue
                    self.link_chain_to_label(chain, l);
                } else {
                    self.gjmp(l);
                    let here = self.ind;
                    self.gsym_chain(chain, here);
                }
            }
            _ => {
                self.vpush_value(v)?;
                let r = self.gv(RegClass::Int)?;
                self.vpop()?;
                self.emit_test(r, r);
                self.gjcc(if inv { CC_E } else { CC_NE }, l);
            }
        }
        Ok(())
    }

    /// Chain-based variant of [`CodeGen::gtst`] used while lowering `&&`
    /// and `||`: pop the condition, emit a jump taken when it is false
    /// (`inv` set) or true (`inv` clear), and thread the jump onto `chain`.
    /// Returns the new chain head.
    pub fn gvtst(&mut self, inv: bool, chain: i64) -> Result<i64, CodeGenError> {
        let v = self.vpop()?;
        match (v.storage, v.lval) {
            (Storage::Cmp(cc), false) => {
                let cc = if inv { cc ^ 1 } else { cc };
                self.emit_byte(0x0F);
                self.emit_byte(0x80 | cc);
                let slot = self.ind;
                self.emit_le32(chain as i32 as u32);
                Ok(slot as i64)
            }
            (Storage::Const(c), false) => {
                if (c != 0) != inv {
                    Ok(self.gjmp_chain(chain))
                } else {
                    Ok(chain)
                }
            }
            (Storage::Branch { val, chain: pending }, false) => {
                if val == inv {
                    Ok(self.concat_chains(pending, chain))
                } else {
                    let chain = self.gjmp_chain(chain);
                    let here = self.ind;
                    self.gsym_chain(pending, here);
                    Ok(chain)
                }
            }
            _ => {
                self.vpush_value(v)?;
                let r = self.gv(RegClass::Int)?;
                self.vpop()?;
                self.emit_test(r, r);
                self.emit_byte(0x0F);
                self.emit_byte(0x80 | if inv { CC_E } else { CC_NE });
                let slot = self.ind;
                self.emit_le32(chain as i32 as u32);
                Ok(slot as i64)
            }
        }
    }

    /// Push a pending-branch value: `chain` jumps produce `!val`,
    /// fallthrough produces `val`.
    pub fn vset_branch(&mut self, val: bool, chain: i64) -> Result<(), CodeGenError> {
        self.vset(TypeWord::INT, Storage::Branch { val, chain }, false)
    }

    /// Unconditional jump threaded onto `chain`; returns the new head.
    fn gjmp_chain(&mut self, chain: i64) -> i64 {
        self.emit_byte(0xE9);
        let slot = self.ind;
        self.emit_le32(chain as i32 as u32);
        slot as i64
    }

    /// Append chain `b` after chain `a`, returning the combined head.
    fn concat_chains(&mut self, a: i64, b: i64) -> i64 {
        if a == -1 {
            return b;
        }
        if b == -1 {
            return a;
        }
        let mut pos = a as usize;
        loop {
            let next = self.read_fixup(pos);
            if next == -1 {
                break;
            }
            pos = next as usize;
        }
        self.text.write_u32_at(pos, b as i32 as u32);
        a
    }

    /// Point every jump on `chain` at label `l`, resolved or pending.
    fn link_chain_to_label(&mut self, chain: i64, l: SymId) {
        if chain == -1 {
            return;
        }
        let sym = self.labels.get(l);
        if sym.r == 1 {
            let target = sym.c as usize;
            self.gsym_chain(chain, target);
        } else {
            let old_head = sym.c;
            let head = self.concat_chains(chain, old_head);
            self.labels.get_mut(l).c = head;
        }
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        CodeGen::new()
    }
}
