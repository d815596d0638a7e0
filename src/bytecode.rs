//! Definitions for the subset of JVM bytecode the runtime executes.
//!
//! Only the instructions of the restricted class-file subset are listed;
//! decoding any other byte is an error, never a silent skip, so
//! malformed code faults instead of hanging the fetch loop.

/// Opcodes for the supported instruction subset, with their values from
/// the JVM specification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OPCode {
    // Constants.
    NOP = 0x00,
    IconstM1 = 0x02,
    Iconst0 = 0x03,
    Iconst1 = 0x04,
    Iconst2 = 0x05,
    Iconst3 = 0x06,
    Iconst4 = 0x07,
    Iconst5 = 0x08,
    Bipush = 0x10,
    Sipush = 0x11,
    Ldc = 0x12,
    // Loads.
    ILoad = 0x15,
    ALoad = 0x19,
    ILoad0 = 0x1a,
    ILoad1 = 0x1b,
    ILoad2 = 0x1c,
    ILoad3 = 0x1d,
    ALoad0 = 0x2a,
    ALoad1 = 0x2b,
    ALoad2 = 0x2c,
    ALoad3 = 0x2d,
    IALoad = 0x2e,
    // Stores.
    IStore = 0x36,
    AStore = 0x3a,
    IStore0 = 0x3b,
    IStore1 = 0x3c,
    IStore2 = 0x3d,
    IStore3 = 0x3e,
    AStore0 = 0x4b,
    AStore1 = 0x4c,
    AStore2 = 0x4d,
    AStore3 = 0x4e,
    IAStore = 0x4f,
    // Stack management.
    Dup = 0x59,
    // Arithmetic.
    IAdd = 0x60,
    ISub = 0x64,
    IMul = 0x68,
    IDiv = 0x6c,
    IRem = 0x70,
    INeg = 0x74,
    // Shifts and bitwise logic.
    IShl = 0x78,
    IShr = 0x7a,
    IUShr = 0x7c,
    IAnd = 0x7e,
    IOr = 0x80,
    IXor = 0x82,
    IInc = 0x84,
    // Comparisons and branches.
    IfEq = 0x99,
    IfNe = 0x9a,
    IfLt = 0x9b,
    IfGe = 0x9c,
    IfGt = 0x9d,
    IfLe = 0x9e,
    IfICmpEq = 0x9f,
    IfICmpNe = 0xa0,
    IfICmpLt = 0xa1,
    IfICmpGe = 0xa2,
    IfICmpGt = 0xa3,
    IfICmpLe = 0xa4,
    Goto = 0xa7,
    // Returns.
    IReturn = 0xac,
    AReturn = 0xb0,
    Return = 0xb1,
    // Invocation.
    GetStatic = 0xb2,
    InvokeVirtual = 0xb6,
    InvokeStatic = 0xb8,
    // Arrays.
    NewArray = 0xbc,
    ArrayLength = 0xbe,
}

impl TryFrom<u8> for OPCode {
    /// The unrecognized opcode byte.
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let opcode = match byte {
            0x00 => Self::NOP,
            0x02 => Self::IconstM1,
            0x03 => Self::Iconst0,
            0x04 => Self::Iconst1,
            0x05 => Self::Iconst2,
            0x06 => Self::Iconst3,
            0x07 => Self::Iconst4,
            0x08 => Self::Iconst5,
            0x10 => Self::Bipush,
            0x11 => Self::Sipush,
            0x12 => Self::Ldc,
            0x15 => Self::ILoad,
            0x19 => Self::ALoad,
            0x1a => Self::ILoad0,
            0x1b => Self::ILoad1,
            0x1c => Self::ILoad2,
            0x1d => Self::ILoad3,
            0x2a => Self::ALoad0,
            0x2b => Self::ALoad1,
            0x2c => Self::ALoad2,
            0x2d => Self::ALoad3,
            0x2e => Self::IALoad,
            0x36 => Self::IStore,
            0x3a => Self::AStore,
            0x3b => Self::IStore0,
            0x3c => Self::IStore1,
            0x3d => Self::IStore2,
            0x3e => Self::IStore3,
            0x4b => Self::AStore0,
            0x4c => Self::AStore1,
            0x4d => Self::AStore2,
            0x4e => Self::AStore3,
            0x4f => Self::IAStore,
            0x59 => Self::Dup,
            0x60 => Self::IAdd,
            0x64 => Self::ISub,
            0x68 => Self::IMul,
            0x6c => Self::IDiv,
            0x70 => Self::IRem,
            0x74 => Self::INeg,
            0x78 => Self::IShl,
            0x7a => Self::IShr,
            0x7c => Self::IUShr,
            0x7e => Self::IAnd,
            0x80 => Self::IOr,
            0x82 => Self::IXor,
            0x84 => Self::IInc,
            0x99 => Self::IfEq,
            0x9a => Self::IfNe,
            0x9b => Self::IfLt,
            0x9c => Self::IfGe,
            0x9d => Self::IfGt,
            0x9e => Self::IfLe,
            0x9f => Self::IfICmpEq,
            0xa0 => Self::IfICmpNe,
            0xa1 => Self::IfICmpLt,
            0xa2 => Self::IfICmpGe,
            0xa3 => Self::IfICmpGt,
            0xa4 => Self::IfICmpLe,
            0xa7 => Self::Goto,
            0xac => Self::IReturn,
            0xb0 => Self::AReturn,
            0xb1 => Self::Return,
            0xb2 => Self::GetStatic,
            0xb6 => Self::InvokeVirtual,
            0xb8 => Self::InvokeStatic,
            0xbc => Self::NewArray,
            0xbe => Self::ArrayLength,
            _ => return Err(byte),
        };
        Ok(opcode)
    }
}
