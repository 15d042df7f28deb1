//! Processor status word.
//!
//! Four condition codes in the low nibble of a 16-bit word. Only command
//! execution mutates them; everything else reads.

use bitflags::bitflags;

bitflags! {
    /// The processor status word.
    ///
    /// The word form matters only when the PSW crosses memory: pushed on
    /// interrupt entry and loaded from the vector word at address 2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Psw: u16 {
        /// Carry (borrow after subtract/compare).
        const C = 1;
        /// Arithmetic overflow.
        const V = 1 << 1;
        /// Result was zero.
        const Z = 1 << 2;
        /// Result was negative.
        const N = 1 << 3;
    }
}

impl Psw {
    #[must_use]
    pub const fn n(self) -> bool {
        self.contains(Psw::N)
    }

    #[must_use]
    pub const fn z(self) -> bool {
        self.contains(Psw::Z)
    }

    #[must_use]
    pub const fn v(self) -> bool {
        self.contains(Psw::V)
    }

    #[must_use]
    pub const fn c(self) -> bool {
        self.contains(Psw::C)
    }

    pub fn set_n(&mut self, value: bool) {
        self.set(Psw::N, value);
    }

    pub fn set_z(&mut self, value: bool) {
        self.set(Psw::Z, value);
    }

    pub fn set_v(&mut self, value: bool) {
        self.set(Psw::V, value);
    }

    pub fn set_c(&mut self, value: bool) {
        self.set(Psw::C, value);
    }

    /// Clear all four condition codes.
    pub fn clear_codes(&mut self) {
        *self = Psw::empty();
    }

    /// Word form for the interrupt stack frame.
    #[must_use]
    pub const fn to_word(self) -> u16 {
        self.bits()
    }

    /// Rebuild from a word loaded from memory; unknown bits are dropped.
    #[must_use]
    pub const fn from_word(word: u16) -> Self {
        Psw::from_bits_truncate(word)
    }
}

impl Default for Psw {
    fn default() -> Self {
        Psw::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut psw = Psw::default();
        psw.set_z(true);
        psw.set_c(true);
        assert!(psw.z() && psw.c() && !psw.n() && !psw.v());
        psw.clear_codes();
        assert_eq!(psw, Psw::empty());
    }

    #[test]
    fn word_roundtrip() {
        let mut psw = Psw::default();
        psw.set_n(true);
        psw.set_v(true);
        assert_eq!(psw.to_word(), 0b1010);
        assert_eq!(Psw::from_word(0xFFF5), Psw::C | Psw::Z);
    }
}
