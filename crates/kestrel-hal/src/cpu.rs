use crate::memory::VirtAddr;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Register(u8);

impl Register {
    pub const ZERO: Register = Register(0); // x0
    pub const RA: Register = Register(1); // x1 (return address)
    pub const SP: Register = Register(2); // x2 (stack pointer)
    pub const A0: Register = Register(10); // syscall value in, result out
    pub const A1: Register = Register(11); // argument pointer in, blocked flag out

    pub fn new(num: u8) -> Option<Self> {
        if num < 32 {
            Some(Register(num))
        } else {
            None
        }
    }

    pub fn val(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeMode {
    User,
    Supervisor,
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub pc: u32,
    pub regs: [u32; 32],
    pub mode: PrivilegeMode,
}

impl Cpu {
    pub fn new(entry_point: u32) -> Self {
        Self {
            pc: entry_point,
            regs: [0; 32],
            mode: PrivilegeMode::User,
        }
    }

    pub fn read_reg(&self, reg: Register) -> u32 {
        if reg == Register::ZERO {
            0
        } else {
            self.regs[reg.val()]
        }
    }

    pub fn write_reg(&mut self, reg: Register, val: u32) {
        if reg != Register::ZERO {
            self.regs[reg.val()] = val;
        }
    }

    /// Packed syscall value and argument pointer of a pending `ecall`.
    pub fn syscall_args(&self) -> (u32, VirtAddr) {
        (
            self.read_reg(Register::A0),
            VirtAddr::new(self.read_reg(Register::A1)),
        )
    }

    /// Writes the syscall result and the blocked flag for the return path.
    pub fn set_syscall_return(&mut self, value: u32, blocked: bool) {
        self.write_reg(Register::A0, value);
        self.write_reg(Register::A1, blocked as u32);
    }

    /// Loads the registers an `ecall` instruction expects.
    pub fn prepare_syscall(&mut self, value: u32, arg: VirtAddr) {
        self.write_reg(Register::A0, value);
        self.write_reg(Register::A1, arg.val());
    }
}
