// vmcb.rs: the AMD-SVM Virtual Machine Control Block.
//
// A VMCB is one 4 KiB page: a 1 KiB control area at offset 0 (intercepts,
// exit information, nested paging controls) and the state-save area at
// offset 0x400. Every field sits at a fixed offset, so it is modelled with
// tock-registers proxies instead of relying on struct packing.
//
// Reference: AMD64 APM vol. 2, appendix B.

#![allow(non_camel_case_types)]

use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use super::definitions::{SVM_INTERCEPT_BYTES, SVM_INTERCEPT_MAX, SvmExitCode};
use crate::error::{HarnessError, Result};
use crate::x86::{SegmentDescriptor, SegmentFlags};

register_bitfields![u8,
    pub VmcbTlbControl [
        CONTROL OFFSET(0) NUMBITS(3) [
            DoNothing                = 0,
            FlushAllOnVmrun          = 1,
            FlushGuestTlb            = 3,
            FlushGuestNonGlobalTlb   = 7,
        ]
    ]
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE        0,
        SEV_ENABLE       1,
        SEV_ES_ENABLE    2,
    ],
];

register_structs![
    pub VmcbControlArea {
        // Intercept bitmap: CR/DR reads and writes, exceptions, then the
        // instruction intercept vectors. Bit N of the map is intercept ID N.
        (0x0000 => pub intercepts:            [ReadWrite<u8>; SVM_INTERCEPT_BYTES]),
        (0x0014 => _reserved_0014),
        (0x003C => pub pause_filter_thresh:   ReadWrite<u16>),
        (0x003E => pub pause_filter_count:    ReadWrite<u16>),

        (0x0040 => pub iopm_base_pa:          ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:         ReadWrite<u64>),
        (0x0050 => pub tsc_offset:            ReadWrite<u64>),

        (0x0058 => pub guest_asid:            ReadWrite<u32>),
        (0x005C => pub tlb_control:           ReadWrite<u8, VmcbTlbControl::Register>),
        (0x005D => _reserved_005D),

        (0x0060 => pub int_control:           ReadWrite<u32>),
        (0x0064 => pub int_vector:            ReadWrite<u32>),
        (0x0068 => pub int_state:             ReadWrite<u32>),
        (0x006C => _reserved_006C),

        (0x0070 => pub exit_code:             ReadWrite<u64>),
        (0x0078 => pub exit_info_1:           ReadWrite<u64>),
        (0x0080 => pub exit_info_2:           ReadWrite<u64>),
        (0x0088 => pub exit_int_info:         ReadWrite<u32>),
        (0x008C => pub exit_int_info_err:     ReadWrite<u32>),

        (0x0090 => pub nested_ctl:            ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => _reserved_0098),

        (0x00A8 => pub event_inj:             ReadWrite<u32>),
        (0x00AC => pub event_inj_err:         ReadWrite<u32>),
        (0x00B0 => pub nested_cr3:            ReadWrite<u64>),
        (0x00B8 => pub virt_ext:              ReadWrite<u64>),

        (0x00C0 => pub clean_bits:            ReadWrite<u32>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:              ReadWrite<u64>),

        (0x00D0 => pub insn_len:              ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:            [ReadWrite<u8>; 15]),
        (0x00E0 => _reserved_00E0),

        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),

        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),

        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),

        (0x0148 => pub cr4:   ReadWrite<u64>),
        (0x0150 => pub cr3:   ReadWrite<u64>),
        (0x0158 => pub cr0:   ReadWrite<u64>),
        (0x0160 => pub dr7:   ReadWrite<u64>),
        (0x0168 => pub dr6:   ReadWrite<u64>),
        (0x0170 => pub rflags:ReadWrite<u64>),
        (0x0178 => pub rip:   ReadWrite<u64>),
        (0x0180 => _reserved_0180),

        (0x01D8 => pub rsp:          ReadWrite<u64>),
        (0x01E0 => _reserved_01E0),
        (0x01F8 => pub rax:          ReadWrite<u64>),

        (0x0200 => pub star:          ReadWrite<u64>),
        (0x0208 => pub lstar:         ReadWrite<u64>),
        (0x0210 => pub cstar:         ReadWrite<u64>),
        (0x0218 => pub sfmask:        ReadWrite<u64>),
        (0x0220 => pub kernel_gs_base:ReadWrite<u64>),
        (0x0228 => pub sysenter_cs:   ReadWrite<u64>),
        (0x0230 => pub sysenter_esp:  ReadWrite<u64>),
        (0x0238 => pub sysenter_eip:  ReadWrite<u64>),
        (0x0240 => pub cr2:           ReadWrite<u64>),
        (0x0248 => _reserved_0248),

        (0x0268 => pub g_pat:         ReadWrite<u64>),
        (0x0270 => pub dbgctl:        ReadWrite<u64>),
        (0x0278 => _reserved_0278),

        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

/// Plain copy of one VMCB segment field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub attr: u16,
    pub limit: u32,
    pub base: u64,
}

impl VmcbSegment {
    /// Loads a GDT descriptor. Non-present descriptors zero the field;
    /// page-granular limits are stored byte-granular.
    pub fn load_descriptor(&self, selector: u16, desc: &SegmentDescriptor) {
        if !desc.is_present() {
            self.restore(&SegmentState::default());
            return;
        }
        self.restore(&SegmentState {
            selector,
            attr: desc.flags.bits(),
            limit: desc.limit,
            base: desc.base,
        });
    }

    /// Sets a descriptor-table register field (GDTR/IDTR).
    pub fn set_table(&self, base: u64, limit: u16) {
        self.base.set(base);
        self.limit.set(limit as u32);
    }

    pub fn snapshot(&self) -> SegmentState {
        SegmentState {
            selector: self.selector.get(),
            attr: self.attr.get(),
            limit: self.limit.get(),
            base: self.base.get(),
        }
    }

    pub fn restore(&self, state: &SegmentState) {
        self.selector.set(state.selector);
        self.attr.set(state.attr);
        self.limit.set(state.limit);
        self.base.set(state.base);
    }

    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_retain(self.attr.get())
    }
}

impl VmcbControlArea {
    /// Sets or clears intercept `id`.
    pub fn set_intercept(&self, id: u32, enabled: bool) -> Result {
        if id >= SVM_INTERCEPT_MAX {
            return Err(HarnessError::InvalidIntercept(id));
        }
        let byte = &self.intercepts[(id / 8) as usize];
        let bit = 1u8 << (id % 8);
        if enabled {
            byte.set(byte.get() | bit);
        } else {
            byte.set(byte.get() & !bit);
        }
        Ok(())
    }

    pub fn intercept(&self, id: u32) -> Result<bool> {
        if id >= SVM_INTERCEPT_MAX {
            return Err(HarnessError::InvalidIntercept(id));
        }
        Ok(self.intercepts[(id / 8) as usize].get() & (1 << (id % 8)) != 0)
    }
}

/// The state VMLOAD and VMSAVE transfer between a VMCB and the CPU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmLoadSaveStates {
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub tr: SegmentState,
    pub ldtr: SegmentState,
    pub kernel_gs_base: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

impl VmLoadSaveStates {
    pub fn capture(state: &VmcbStateSaveArea) -> Self {
        Self {
            fs: state.fs.snapshot(),
            gs: state.gs.snapshot(),
            tr: state.tr.snapshot(),
            ldtr: state.ldtr.snapshot(),
            kernel_gs_base: state.kernel_gs_base.get(),
            star: state.star.get(),
            lstar: state.lstar.get(),
            cstar: state.cstar.get(),
            sfmask: state.sfmask.get(),
            sysenter_cs: state.sysenter_cs.get(),
            sysenter_esp: state.sysenter_esp.get(),
            sysenter_eip: state.sysenter_eip.get(),
        }
    }

    pub fn apply(&self, state: &VmcbStateSaveArea) {
        state.fs.restore(&self.fs);
        state.gs.restore(&self.gs);
        state.tr.restore(&self.tr);
        state.ldtr.restore(&self.ldtr);
        state.kernel_gs_base.set(self.kernel_gs_base);
        state.star.set(self.star);
        state.lstar.set(self.lstar);
        state.cstar.set(self.cstar);
        state.sfmask.set(self.sfmask);
        state.sysenter_cs.set(self.sysenter_cs);
        state.sysenter_esp.set(self.sysenter_esp);
        state.sysenter_eip.set(self.sysenter_eip);
    }
}

/// Exit information of the last #VMEXIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmExitInfo {
    /// Decoded exit code, or the raw value if the harness does not name it.
    pub exit_code: core::result::Result<SvmExitCode, u64>,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub guest_rip: u64,
    pub guest_next_rip: u64,
}

impl VmcbStruct {
    pub fn exit_info(&self) -> SvmExitInfo {
        SvmExitInfo {
            exit_code: self.control.exit_code.get().try_into(),
            exit_info_1: self.control.exit_info_1.get(),
            exit_info_2: self.control.exit_info_2.get(),
            guest_rip: self.state.rip.get(),
            guest_next_rip: self.control.next_rip.get(),
        }
    }

    /// Physical (identity-mapped) address of this block.
    pub fn addr(&self) -> u64 {
        self as *const Self as u64
    }
}
