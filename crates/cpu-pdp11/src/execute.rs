//! ALU semantics and condition-code effects.
//!
//! The execute step runs in the ALU stage after the operands landed in the
//! command's scratch cells. It is the only place the PSW changes. All
//! arithmetic is explicit two's complement at the command's width.

use crate::alu::Size;
use crate::command::{Command, Op};
use crate::flags::Psw;
use crate::microcode::{Cell, OperandRef};

const SRC: Cell = Cell::Operand(OperandRef::Src);
const DST: Cell = Cell::Operand(OperandRef::Dst);

impl Command {
    /// Run the command's execute step against the PSW.
    pub(crate) fn execute(&mut self, psw: &mut Psw) {
        match self.op {
            Op::Clr => self.clr(psw),
            Op::Com => self.com(psw),
            Op::Inc => self.inc(psw),
            Op::Dec => self.dec(psw),
            Op::Neg => self.neg(psw),
            Op::Tst => self.tst(psw),
            Op::Asr => self.asr(psw),
            Op::Asl => self.asl(psw),
            Op::Ror => self.ror(psw),
            Op::Rol => self.rol(psw),
            Op::Swab => self.swab(psw),
            Op::Adc => self.adc(psw),
            Op::Sbc => self.sbc(psw),
            Op::Sxt => self.sxt(psw),
            Op::Mov => self.mov(psw),
            Op::Cmp => self.cmp(psw),
            Op::Add => self.add(psw),
            Op::Sub => self.sub(psw),
            Op::Bit => self.bit(psw),
            Op::Bic => self.bic(psw),
            Op::Bis => self.bis(psw),
            Op::Mul => self.mul_exec(psw),
            Op::Xor => self.xor(psw),
            Op::Br => self.branch_taken = true,
            Op::Bne => self.branch_taken = !psw.z(),
            Op::Beq => self.branch_taken = psw.z(),
            Op::Bpl => self.branch_taken = !psw.n(),
            Op::Bmi => self.branch_taken = psw.n(),
            Op::Bvc => self.branch_taken = !psw.v(),
            Op::Bvs => self.branch_taken = psw.v(),
            Op::Bcc => self.branch_taken = !psw.c(),
            Op::Bcs => self.branch_taken = psw.c(),
            Op::Bge => self.branch_taken = !(psw.n() ^ psw.v()),
            Op::Blt => self.branch_taken = psw.n() ^ psw.v(),
            Op::Bgt => self.branch_taken = !(psw.z() || (psw.n() ^ psw.v())),
            Op::Ble => self.branch_taken = psw.z() || (psw.n() ^ psw.v()),
            Op::Bhi => self.branch_taken = !psw.c() && !psw.z(),
            Op::Blos => self.branch_taken = psw.c() || psw.z(),
            // SOB: the decrement already ran; branch while non-zero.
            // Condition codes stay untouched.
            Op::Sob => self.branch_taken = self.cell_word(DST) != 0,
            // The jump group has no ALU execute step.
            Op::Jmp | Op::Jsr | Op::Rts | Op::Mark => {}
        }
    }

    fn dst_signed(&self) -> i32 {
        self.size.signed(self.cell_word(DST))
    }

    fn set_dst_signed(&mut self, size: Size, value: i32) {
        self.set_cell_sized(DST, size, size.truncate(value as u32));
    }

    fn set_nz(&self, psw: &mut Psw, size: Size, value: u16) {
        psw.set_n(size.negative(value));
        psw.set_z(size.zero(value));
    }

    // === Single-operand group ===

    fn clr(&mut self, psw: &mut Psw) {
        psw.clear_codes();
        psw.set_z(true);
        self.set_dst_signed(self.size, 0);
    }

    fn com(&mut self, psw: &mut Psw) {
        let value = !self.dst_signed();
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
        psw.set_c(true);
        self.set_dst_signed(self.size, value);
    }

    fn inc(&mut self, psw: &mut Psw) {
        let mut value = self.dst_signed();
        if value == self.size.max_signed() {
            value = self.size.min_signed();
            psw.set_v(true);
        } else {
            value += 1;
            psw.set_v(false);
        }
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        self.set_dst_signed(self.size, value);
    }

    fn dec(&mut self, psw: &mut Psw) {
        let mut value = self.dst_signed();
        if value == self.size.min_signed() {
            value = self.size.max_signed();
            psw.set_v(true);
        } else {
            value -= 1;
            psw.set_v(false);
        }
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        self.set_dst_signed(self.size, value);
    }

    fn neg(&mut self, psw: &mut Psw) {
        let mut value = self.dst_signed();
        if value != self.size.min_signed() {
            value = -value;
        }
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(value == self.size.min_signed());
        psw.set_c(value != 0);
        self.set_dst_signed(self.size, value);
    }

    fn tst(&mut self, psw: &mut Psw) {
        let value = self.dst_signed();
        psw.clear_codes();
        psw.set_n(value < 0);
        psw.set_z(value == 0);
    }

    fn asr(&mut self, psw: &mut Psw) {
        let mut value = self.dst_signed();
        psw.set_c(value & 1 == 1);
        value >>= 1;
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(psw.c() ^ psw.n());
        self.set_dst_signed(self.size, value);
    }

    fn asl(&mut self, psw: &mut Psw) {
        let size = self.size;
        let mut value = size.unsigned(self.cell_word(DST));
        value <<= 1;
        psw.set_c(value > size.max_unsigned());
        let result = size.truncate(value);
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
        psw.set_v(psw.c() ^ psw.n());
        self.set_cell_sized(DST, size, result);
    }

    fn ror(&mut self, psw: &mut Psw) {
        let size = self.size;
        let mut value = size.unsigned(self.cell_word(DST));
        let out = value & 1 == 1;
        value >>= 1;
        if psw.c() {
            value |= size.sign_bit();
        }
        psw.set_c(out);
        let result = size.truncate(value);
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
        psw.set_v(psw.c() ^ psw.n());
        self.set_cell_sized(DST, size, result);
    }

    fn rol(&mut self, psw: &mut Psw) {
        let size = self.size;
        let mut value = size.unsigned(self.cell_word(DST));
        value = (value << 1) | u32::from(psw.c());
        psw.set_c(value > size.max_unsigned());
        let result = size.truncate(value);
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
        psw.set_v(psw.c() ^ psw.n());
        self.set_cell_sized(DST, size, result);
    }

    fn swab(&mut self, psw: &mut Psw) {
        let value = self.cell_word(DST).rotate_left(8);
        self.set_cell_word(DST, value);
        psw.clear_codes();
        psw.set_n(Size::Byte.negative(value));
        psw.set_z(Size::Byte.zero(value));
    }

    fn adc(&mut self, psw: &mut Psw) {
        let carry = psw.c();
        let mut value = self.dst_signed();
        psw.set_c(value == -1 && carry);
        if value == self.size.max_signed() && carry {
            value = self.size.min_signed();
            psw.set_v(true);
        } else {
            value += i32::from(carry);
            psw.set_v(false);
        }
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        self.set_dst_signed(self.size, value);
    }

    fn sbc(&mut self, psw: &mut Psw) {
        let carry = psw.c();
        let mut value = self.dst_signed();
        psw.set_c(!(value == 0 && carry));
        psw.set_v(value == self.size.min_signed());
        if value == self.size.min_signed() && carry {
            value = self.size.max_signed();
        } else {
            value -= i32::from(carry);
        }
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        self.set_dst_signed(self.size, value);
    }

    fn sxt(&mut self, psw: &mut Psw) {
        let value: u16 = if psw.n() { 0xFFFF } else { 0 };
        psw.set_z(value == 0);
        self.set_cell_word(DST, value);
    }

    // === Double-operand group ===

    fn mov(&mut self, psw: &mut Psw) {
        let size = self.size;
        let value = size.signed(self.cell_word(SRC));
        // Byte MOV into a register widens to a sign-extended word.
        let exec_size = if self.on_byte && self.dst.as_ref().is_some_and(|d| d.mode() == 0) {
            Size::Word
        } else {
            size
        };
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
        self.set_cell_sized(DST, exec_size, exec_size.truncate(value as u32));
    }

    fn cmp(&mut self, psw: &mut Psw) {
        let size = self.size;
        let src = size.unsigned(self.cell_word(SRC));
        let dst = size.unsigned(self.cell_word(DST));
        // src - dst as src + ~dst + 1; C records the borrow (no carry out).
        let sum = src + (!dst & size.mask()) + 1;
        psw.set_c(sum <= size.max_unsigned());
        let result = size.truncate(sum);
        psw.set_v(
            size.negative(size.truncate(dst ^ src)) && !size.negative(size.truncate(dst ^ sum)),
        );
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
    }

    fn add(&mut self, psw: &mut Psw) {
        let size = Size::Word;
        let src = size.unsigned(self.cell_word(SRC));
        let dst = size.unsigned(self.cell_word(DST));
        let sum = dst + src;
        psw.set_c(sum > size.max_unsigned());
        let result = size.truncate(sum);
        psw.set_v(
            !size.negative(size.truncate(dst ^ src)) && size.negative(size.truncate(src ^ sum)),
        );
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
        self.set_cell_word(DST, result);
    }

    fn sub(&mut self, psw: &mut Psw) {
        let size = Size::Word;
        let src = size.unsigned(self.cell_word(SRC));
        let dst = size.unsigned(self.cell_word(DST));
        // dst - src as dst + ~src + 1; C records the borrow.
        let sum = dst + (!src & size.mask()) + 1;
        psw.set_c(sum <= size.max_unsigned());
        let result = size.truncate(sum);
        psw.set_v(
            size.negative(size.truncate(dst ^ src)) && !size.negative(size.truncate(src ^ sum)),
        );
        psw.set_n(size.negative(result));
        psw.set_z(size.zero(result));
        self.set_cell_word(DST, result);
    }

    fn bit(&mut self, psw: &mut Psw) {
        let value = self.size.signed(self.cell_word(SRC)) & self.dst_signed();
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
    }

    fn bic(&mut self, psw: &mut Psw) {
        let value = !self.size.signed(self.cell_word(SRC)) & self.dst_signed();
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
        self.set_dst_signed(self.size, value);
    }

    fn bis(&mut self, psw: &mut Psw) {
        let value = self.size.signed(self.cell_word(SRC)) | self.dst_signed();
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
        self.set_dst_signed(self.size, value);
    }

    fn xor(&mut self, psw: &mut Psw) {
        let value =
            Size::Word.signed(self.cell_word(SRC)) ^ Size::Word.signed(self.cell_word(DST));
        psw.set_n(value < 0);
        psw.set_z(value == 0);
        psw.set_v(false);
        self.set_dst_signed(Size::Word, value);
    }

    /// Signed 16×16 → 32 multiply. Low word lands in the destination
    /// register, the high word in R+1 when the destination is even.
    fn mul_exec(&mut self, psw: &mut Psw) {
        let src = Size::Word.signed(self.cell_word(SRC));
        let dst = Size::Word.signed(self.cell_word(DST));
        let product = dst * src;
        psw.set_n(product < 0);
        psw.set_z(product == 0);
        psw.set_v(false);
        psw.set_c(product < i32::from(i16::MIN) || product > i32::from(i16::MAX));
        self.set_cell_word(DST, product as u16);
        self.extra[0] = (product >> 16) as u16;
    }
}
