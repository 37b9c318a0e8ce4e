//! Tests for the register block shared with the nested entry trampolines.

use crate::x86::GeneralRegisters;

#[test]
fn test_general_registers_default() {
    let regs = GeneralRegisters::default();
    for index in (0..16).filter(|&i| i != 4) {
        assert_eq!(regs.get_reg_of_index(index), 0);
    }
}

#[test]
fn test_register_names() {
    assert_eq!(GeneralRegisters::register_name(0), "rax");
    assert_eq!(GeneralRegisters::register_name(4), "rsp");
    assert_eq!(GeneralRegisters::register_name(8), "r8");
    assert_eq!(GeneralRegisters::register_name(15), "r15");
}

#[test]
fn test_index_accessors_round_trip() {
    let mut regs = GeneralRegisters::default();
    for index in (0..16u8).filter(|&i| i != 4) {
        regs.set_reg_of_index(index, 0x100 + index as u64);
    }
    assert_eq!(regs.rax, 0x100);
    assert_eq!(regs.rbx, 0x103);
    assert_eq!(regs.rbp, 0x105);
    assert_eq!(regs.r15, 0x10f);
    assert_eq!(regs._unused_rsp, 0);
    for index in (0..16u8).filter(|&i| i != 4) {
        assert_eq!(regs.get_reg_of_index(index), 0x100 + index as u64);
    }
}

#[test]
#[should_panic(expected = "Illegal index of GeneralRegisters 4")]
fn test_rsp_is_not_indexable() {
    GeneralRegisters::default().get_reg_of_index(4);
}

#[test]
#[should_panic(expected = "Illegal index of GeneralRegisters 16")]
fn test_set_out_of_range_panics() {
    GeneralRegisters::default().set_reg_of_index(16, 1);
}
