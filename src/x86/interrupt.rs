//! Interrupt vectors, exception names and IDT gates.

use bit_field::BitField;

pub const NUM_VECTORS: usize = 256;

pub const DE_VECTOR: u8 = 0;
pub const DB_VECTOR: u8 = 1;
pub const NMI_VECTOR: u8 = 2;
pub const BP_VECTOR: u8 = 3;
pub const OF_VECTOR: u8 = 4;
pub const BR_VECTOR: u8 = 5;
pub const UD_VECTOR: u8 = 6;
pub const NM_VECTOR: u8 = 7;
pub const DF_VECTOR: u8 = 8;
pub const TS_VECTOR: u8 = 10;
pub const NP_VECTOR: u8 = 11;
pub const SS_VECTOR: u8 = 12;
pub const GP_VECTOR: u8 = 13;
pub const PF_VECTOR: u8 = 14;
pub const MF_VECTOR: u8 = 16;
pub const AC_VECTOR: u8 = 17;
pub const MC_VECTOR: u8 = 18;
pub const XM_VECTOR: u8 = 19;
pub const VE_VECTOR: u8 = 20;
pub const CP_VECTOR: u8 = 21;

const EXCEPTION_NAMES: [Option<&str>; 22] = [
    Some("Division by zero"),
    Some("Debug interrupt"),
    Some("Non-maskable interrupt"),
    Some("Breakpoint"),
    Some("Arithmetic overflow"),
    Some("Bound range exception"),
    Some("Illegal instruction error"),
    Some("Device not available error"),
    Some("Double fault"),
    None,
    Some("Invalid TSS error"),
    Some("Segment not present error"),
    Some("Stack segment fault"),
    Some("General protection fault"),
    Some("Page fault"),
    None,
    Some("Floating point exception"),
    Some("Alignment error"),
    Some("Machine check exception"),
    Some("SIMD floating point exception"),
    Some("Virtualization exception"),
    Some("Control protection exception"),
];

/// Human-readable name of an architectural exception vector.
pub fn interrupt_name(vector: usize) -> Option<&'static str> {
    EXCEPTION_NAMES.get(vector).copied().flatten()
}

/// Returns `true` if the CPU pushes an error code for `vector`.
pub const fn has_error_code(vector: u8) -> bool {
    matches!(vector, DF_VECTOR | TS_VECTOR..=PF_VECTOR | AC_VECTOR | CP_VECTOR | 29 | 30)
}

/// Stack frame pushed by the CPU on interrupt delivery in 64-bit mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A 16-byte long-mode interrupt gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtGate([u64; 2]);

impl IdtGate {
    const TYPE_INTERRUPT_GATE: u64 = 0xe;

    /// Present ring-0 interrupt gate to `handler` through code segment `selector`.
    pub fn interrupt(handler: u64, selector: u16) -> Self {
        let mut low = 0u64;
        low.set_bits(0..16, handler.get_bits(0..16));
        low.set_bits(16..32, selector as u64);
        low.set_bits(40..44, Self::TYPE_INTERRUPT_GATE);
        low.set_bit(47, true);
        low.set_bits(48..64, handler.get_bits(16..32));
        Self([low, handler.get_bits(32..64)])
    }

    pub fn from_words(words: [u64; 2]) -> Self {
        Self(words)
    }

    pub fn words(self) -> [u64; 2] {
        self.0
    }

    pub fn handler(self) -> u64 {
        self.0[0].get_bits(0..16) | (self.0[0].get_bits(48..64) << 16) | (self.0[1].get_bits(0..32) << 32)
    }

    pub fn selector(self) -> u16 {
        self.0[0].get_bits(16..32) as u16
    }

    pub fn is_present(self) -> bool {
        self.0[0].get_bit(47)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.0[0].to_le_bytes());
        bytes[8..].copy_from_slice(&self.0[1].to_le_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_names() {
        assert_eq!(interrupt_name(0), Some("Division by zero"));
        assert_eq!(interrupt_name(14), Some("Page fault"));
        assert_eq!(interrupt_name(21), Some("Control protection exception"));
        assert_eq!(interrupt_name(9), None);
        assert_eq!(interrupt_name(15), None);
        assert_eq!(interrupt_name(22), None);
        assert_eq!(interrupt_name(255), None);
    }

    #[test]
    fn test_error_code_vectors() {
        assert!(has_error_code(PF_VECTOR));
        assert!(has_error_code(GP_VECTOR));
        assert!(has_error_code(DF_VECTOR));
        assert!(!has_error_code(UD_VECTOR));
        assert!(!has_error_code(BP_VECTOR));
        assert!(!has_error_code(32));
    }

    #[test]
    fn test_gate_encoding() {
        let gate = IdtGate::interrupt(0xffff_8000_dead_beef, 0x08);
        assert_eq!(gate.handler(), 0xffff_8000_dead_beef);
        assert_eq!(gate.selector(), 0x08);
        assert!(gate.is_present());
        assert_eq!(gate.words()[0], 0xdead_8e00_0008_beef);
        assert_eq!(gate.words()[1], 0xffff_8000);
    }
}
