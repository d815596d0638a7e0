//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
//!
//! Execution is a straight bytecode interpreter: each `invokestatic`
//! recurses into a fresh frame with its own operand stack and local
//! variable slots, and every fault surfaces as a `RuntimeError` instead
//! of tearing the process down.
use std::fmt;
use std::panic;
use std::thread;

use byteorder::{BigEndian, ByteOrder};

use crate::bytecode::OPCode;
use crate::heap::Heap;
use crate::program::{Method, Program};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Deepest chain of frames an `invokestatic` cascade may build before
/// execution is cut off.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Native stack reserved for the interpreter thread. `call` spends one
/// native frame per interpreter frame, and an unoptimized frame can run
/// to tens of kibibytes, so each of the `MAX_CALL_DEPTH` frames gets a
/// 128 KiB budget.
const CALL_STACK_SIZE: usize = MAX_CALL_DEPTH * 128 * 1024;

/// `RuntimeErrorKind` represents the possible errors that can occur
/// during runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    DivisionByZero,
    InvalidShift { amount: i32 },
    InvalidArraySize { count: i32 },
    StackOverflow,
    StackUnderflow,
    UnknownOpcode { opcode: u8, pc: usize },
    TruncatedInstruction { pc: usize },
    BranchOutOfBounds { pc: usize, target: i64 },
    LocalOutOfBounds { index: usize },
    InvalidHandle { handle: i32 },
    IndexOutOfBounds { index: i32, length: usize },
    BadConstant { index: u16 },
    MethodNotFound { index: u16 },
    CallDepthExceeded,
    MissingMain,
    UnexpectedReturnValue,
}

/// `RuntimeError` is a custom type used to handle and represents
/// possible execution failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
}

impl RuntimeError {
    fn new(kind: RuntimeErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            RuntimeErrorKind::DivisionByZero => write!(f, "division by zero"),
            RuntimeErrorKind::InvalidShift { amount } => {
                write!(f, "shift amount {amount} out of range")
            }
            RuntimeErrorKind::InvalidArraySize { count } => {
                write!(f, "invalid array size {count}")
            }
            RuntimeErrorKind::StackOverflow => {
                write!(f, "operand stack grew past max_stack")
            }
            RuntimeErrorKind::StackUnderflow => {
                write!(f, "operand stack underflow")
            }
            RuntimeErrorKind::UnknownOpcode { opcode, pc } => {
                write!(f, "unknown opcode {opcode:#04x} at pc {pc}")
            }
            RuntimeErrorKind::TruncatedInstruction { pc } => {
                write!(f, "instruction at pc {pc} runs past the end of code")
            }
            RuntimeErrorKind::BranchOutOfBounds { pc, target } => {
                write!(f, "branch at pc {pc} targets {target}")
            }
            RuntimeErrorKind::LocalOutOfBounds { index } => {
                write!(f, "local variable slot {index} out of range")
            }
            RuntimeErrorKind::InvalidHandle { handle } => {
                write!(f, "{handle} is not an array handle")
            }
            RuntimeErrorKind::IndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds for length {length}")
            }
            RuntimeErrorKind::BadConstant { index } => {
                write!(f, "constant pool index {index} is not an integer")
            }
            RuntimeErrorKind::MethodNotFound { index } => {
                write!(f, "no static method behind constant pool index {index}")
            }
            RuntimeErrorKind::CallDepthExceeded => {
                write!(f, "call depth exceeded {MAX_CALL_DEPTH} frames")
            }
            RuntimeErrorKind::MissingMain => {
                write!(f, "class has no public static void main(String[])")
            }
            RuntimeErrorKind::UnexpectedReturnValue => {
                write!(f, "main returned a value")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Execution state of a single method invocation: its operand stack,
/// its local variable slots and the stack ceiling declared by the
/// method's Code attribute.
#[derive(Debug)]
struct Frame {
    stack: Vec<i32>,
    locals: Vec<i32>,
    max_stack: usize,
}

impl Frame {
    fn new(method: &Method, locals: Vec<i32>) -> Self {
        Self {
            stack: Vec::with_capacity(method.max_stack as usize),
            locals,
            max_stack: method.max_stack as usize,
        }
    }

    fn push(&mut self, value: i32) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(RuntimeError::new(RuntimeErrorKind::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::StackUnderflow))
    }

    /// Pops the two operands of a binary instruction; the right operand
    /// sits on top of the stack.
    fn pop_pair(&mut self) -> Result<(i32, i32)> {
        let right = self.pop()?;
        let left = self.pop()?;
        Ok((left, right))
    }

    fn load(&self, index: usize) -> Result<i32> {
        self.locals.get(index).copied().ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::LocalOutOfBounds { index })
        })
    }

    fn store(&mut self, index: usize, value: i32) -> Result<()> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::new(
                RuntimeErrorKind::LocalOutOfBounds { index },
            )),
        }
    }

    fn increment(&mut self, index: usize, delta: i32) -> Result<()> {
        match self.locals.get_mut(index) {
            Some(slot) => {
                *slot = slot.wrapping_add(delta);
                Ok(())
            }
            None => Err(RuntimeError::new(
                RuntimeErrorKind::LocalOutOfBounds { index },
            )),
        }
    }
}

fn operand_u8(code: &[u8], pc: usize) -> Result<u8> {
    code.get(pc + 1).copied().ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::TruncatedInstruction { pc })
    })
}

fn operand_i8(code: &[u8], pc: usize) -> Result<i8> {
    operand_u8(code, pc).map(|byte| byte as i8)
}

fn operand_u16(code: &[u8], pc: usize) -> Result<u16> {
    match code.get(pc + 1..pc + 3) {
        Some(bytes) => Ok(BigEndian::read_u16(bytes)),
        None => Err(RuntimeError::new(
            RuntimeErrorKind::TruncatedInstruction { pc },
        )),
    }
}

fn operand_i16(code: &[u8], pc: usize) -> Result<i16> {
    operand_u16(code, pc).map(|value| value as i16)
}

// iinc's two operands: a local slot and a signed increment.
fn operand_pair(code: &[u8], pc: usize) -> Result<(u8, i8)> {
    match code.get(pc + 1..pc + 3) {
        Some(bytes) => Ok((bytes[0], bytes[1] as i8)),
        None => Err(RuntimeError::new(
            RuntimeErrorKind::TruncatedInstruction { pc },
        )),
    }
}

// Branch offsets are relative to the branch opcode's own address.
fn branch_target(pc: usize, offset: i16) -> Result<usize> {
    let target = pc as i64 + i64::from(offset);
    usize::try_from(target).map_err(|_| {
        RuntimeError::new(RuntimeErrorKind::BranchOutOfBounds { pc, target })
    })
}

/// Next pc for a conditional branch: the relative target when taken,
/// the following instruction otherwise. The offset is read either way,
/// so a truncated branch faults even when it is not taken.
fn jump_if(code: &[u8], pc: usize, taken: bool) -> Result<usize> {
    let offset = operand_i16(code, pc)?;
    if taken {
        branch_target(pc, offset)
    } else {
        Ok(pc + 3)
    }
}

fn shift_amount(amount: i32) -> Result<u32> {
    if (0..32).contains(&amount) {
        Ok(amount as u32)
    } else {
        Err(RuntimeError::new(RuntimeErrorKind::InvalidShift { amount }))
    }
}

/// Executes a method to completion and returns the value it left for
/// its caller, if any. `locals` seeds the frame's local variable slots
/// and must already be sized to the method's `max_locals`.
///
/// Interpretation runs on a dedicated thread whose stack is reserved
/// up front for the deepest allowed call chain, so runaway recursion
/// ends in `CallDepthExceeded` instead of exhausting the native stack.
pub fn execute(
    method: &Method,
    locals: Vec<i32>,
    program: &Program,
    heap: &mut Heap,
) -> Result<Option<i32>> {
    thread::scope(|scope| {
        let interpreter = thread::Builder::new()
            .name("interpreter".to_string())
            .stack_size(CALL_STACK_SIZE)
            .spawn_scoped(scope, move || call(method, locals, program, heap, 0))
            .expect("failed to spawn the interpreter thread");
        match interpreter.join() {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    })
}

fn call(
    method: &Method,
    locals: Vec<i32>,
    program: &Program,
    heap: &mut Heap,
    depth: usize,
) -> Result<Option<i32>> {
    if depth >= MAX_CALL_DEPTH {
        return Err(RuntimeError::new(RuntimeErrorKind::CallDepthExceeded));
    }
    let code = &method.code;
    let mut frame = Frame::new(method, locals);
    let mut pc = 0;
    // Walking past the last instruction is an implicit void return.
    while pc < code.len() {
        let opcode = code[pc];
        let op = OPCode::try_from(opcode).map_err(|opcode| {
            RuntimeError::new(RuntimeErrorKind::UnknownOpcode { opcode, pc })
        })?;
        match op {
            OPCode::NOP => pc += 1,
            OPCode::IconstM1
            | OPCode::Iconst0
            | OPCode::Iconst1
            | OPCode::Iconst2
            | OPCode::Iconst3
            | OPCode::Iconst4
            | OPCode::Iconst5 => {
                // iconst_<n> encodes its value in the opcode itself.
                frame.push(i32::from(opcode) - 3)?;
                pc += 1;
            }
            OPCode::Bipush => {
                let value = operand_i8(code, pc)?;
                frame.push(i32::from(value))?;
                pc += 2;
            }
            OPCode::Sipush => {
                let value = operand_i16(code, pc)?;
                frame.push(i32::from(value))?;
                pc += 3;
            }
            OPCode::Ldc => {
                let index = u16::from(operand_u8(code, pc)?);
                let value =
                    program.integer_constant(index).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::BadConstant {
                            index,
                        })
                    })?;
                frame.push(value)?;
                pc += 2;
            }
            OPCode::ILoad | OPCode::ALoad => {
                let index = usize::from(operand_u8(code, pc)?);
                let value = frame.load(index)?;
                frame.push(value)?;
                pc += 2;
            }
            OPCode::ILoad0 | OPCode::ILoad1 | OPCode::ILoad2 | OPCode::ILoad3 => {
                let value = frame.load(usize::from(opcode - 0x1a))?;
                frame.push(value)?;
                pc += 1;
            }
            OPCode::ALoad0 | OPCode::ALoad1 | OPCode::ALoad2 | OPCode::ALoad3 => {
                let value = frame.load(usize::from(opcode - 0x2a))?;
                frame.push(value)?;
                pc += 1;
            }
            OPCode::IStore | OPCode::AStore => {
                let index = usize::from(operand_u8(code, pc)?);
                let value = frame.pop()?;
                frame.store(index, value)?;
                pc += 2;
            }
            OPCode::IStore0
            | OPCode::IStore1
            | OPCode::IStore2
            | OPCode::IStore3 => {
                let value = frame.pop()?;
                frame.store(usize::from(opcode - 0x3b), value)?;
                pc += 1;
            }
            OPCode::AStore0
            | OPCode::AStore1
            | OPCode::AStore2
            | OPCode::AStore3 => {
                let value = frame.pop()?;
                frame.store(usize::from(opcode - 0x4b), value)?;
                pc += 1;
            }
            OPCode::Dup => {
                let value = frame.pop()?;
                frame.push(value)?;
                frame.push(value)?;
                pc += 1;
            }
            OPCode::IAdd => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a.wrapping_add(b))?;
                pc += 1;
            }
            OPCode::ISub => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a.wrapping_sub(b))?;
                pc += 1;
            }
            OPCode::IMul => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a.wrapping_mul(b))?;
                pc += 1;
            }
            OPCode::IDiv => {
                let (a, b) = frame.pop_pair()?;
                if b == 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::DivisionByZero,
                    ));
                }
                // Wrapping keeps i32::MIN / -1 from trapping.
                frame.push(a.wrapping_div(b))?;
                pc += 1;
            }
            OPCode::IRem => {
                let (a, b) = frame.pop_pair()?;
                if b == 0 {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::DivisionByZero,
                    ));
                }
                frame.push(a.wrapping_rem(b))?;
                pc += 1;
            }
            OPCode::INeg => {
                let value = frame.pop()?;
                frame.push(value.wrapping_neg())?;
                pc += 1;
            }
            OPCode::IShl => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a << shift_amount(b)?)?;
                pc += 1;
            }
            OPCode::IShr => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a >> shift_amount(b)?)?;
                pc += 1;
            }
            OPCode::IUShr => {
                let (a, b) = frame.pop_pair()?;
                let value = ((a as u32) >> shift_amount(b)?) as i32;
                frame.push(value)?;
                pc += 1;
            }
            OPCode::IAnd => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a & b)?;
                pc += 1;
            }
            OPCode::IOr => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a | b)?;
                pc += 1;
            }
            OPCode::IXor => {
                let (a, b) = frame.pop_pair()?;
                frame.push(a ^ b)?;
                pc += 1;
            }
            OPCode::IInc => {
                let (index, delta) = operand_pair(code, pc)?;
                frame.increment(usize::from(index), i32::from(delta))?;
                pc += 3;
            }
            OPCode::IfEq => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value == 0)?;
            }
            OPCode::IfNe => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value != 0)?;
            }
            OPCode::IfLt => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value < 0)?;
            }
            OPCode::IfGe => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value >= 0)?;
            }
            OPCode::IfGt => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value > 0)?;
            }
            OPCode::IfLe => {
                let value = frame.pop()?;
                pc = jump_if(code, pc, value <= 0)?;
            }
            OPCode::IfICmpEq => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a == b)?;
            }
            OPCode::IfICmpNe => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a != b)?;
            }
            OPCode::IfICmpLt => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a < b)?;
            }
            OPCode::IfICmpGe => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a >= b)?;
            }
            OPCode::IfICmpGt => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a > b)?;
            }
            OPCode::IfICmpLe => {
                let (a, b) = frame.pop_pair()?;
                pc = jump_if(code, pc, a <= b)?;
            }
            OPCode::Goto => {
                let offset = operand_i16(code, pc)?;
                pc = branch_target(pc, offset)?;
            }
            OPCode::IReturn | OPCode::AReturn => return frame.pop().map(Some),
            OPCode::Return => return Ok(None),
            OPCode::GetStatic => {
                // Field access is out of scope; getstatic only shows up
                // to fetch System.out ahead of a println, so its operand
                // is checked for presence and dropped.
                operand_u16(code, pc)?;
                pc += 3;
            }
            OPCode::InvokeVirtual => {
                // The lone virtual call this subset meets is
                // PrintStream.println(int): print the top of stack in
                // decimal and pop it.
                operand_u16(code, pc)?;
                let value = frame.pop()?;
                println!("{value}");
                pc += 3;
            }
            OPCode::InvokeStatic => {
                let index = operand_u16(code, pc)?;
                let callee = program.resolve_static(index).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::MethodNotFound {
                        index,
                    })
                })?;
                let mut callee_locals = vec![0; callee.max_locals as usize];
                // Arguments come off the stack last-first, landing in
                // the highest parameter slots first.
                for slot in (0..callee.parameter_count).rev() {
                    let value = frame.pop()?;
                    match callee_locals.get_mut(slot) {
                        Some(entry) => *entry = value,
                        None => {
                            return Err(RuntimeError::new(
                                RuntimeErrorKind::LocalOutOfBounds {
                                    index: slot,
                                },
                            ))
                        }
                    }
                }
                let result =
                    call(callee, callee_locals, program, heap, depth + 1)?;
                if let Some(value) = result {
                    frame.push(value)?;
                }
                pc += 3;
            }
            OPCode::NewArray => {
                // int is the only element type here; the atype operand
                // is checked for presence and otherwise ignored.
                operand_u8(code, pc)?;
                let count = frame.pop()?;
                // Zero is fine; negative counts and i32::MAX (one past
                // the largest representable length) are not.
                if !(0..i32::MAX).contains(&count) {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::InvalidArraySize { count },
                    ));
                }
                let handle = heap.allocate(vec![0; count as usize]);
                frame.push(handle)?;
                pc += 2;
            }
            OPCode::ArrayLength => {
                let handle = frame.pop()?;
                let length = match heap.array(handle) {
                    Some(array) => array.len() as i32,
                    None => {
                        return Err(RuntimeError::new(
                            RuntimeErrorKind::InvalidHandle { handle },
                        ))
                    }
                };
                frame.push(length)?;
                pc += 1;
            }
            OPCode::IALoad => {
                let index = frame.pop()?;
                let handle = frame.pop()?;
                let array = heap.array(handle).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::InvalidHandle {
                        handle,
                    })
                })?;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|index| array.get(index))
                    .copied()
                    .ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
                            index,
                            length: array.len(),
                        })
                    })?;
                frame.push(value)?;
                pc += 1;
            }
            OPCode::IAStore => {
                // value on top, then the index, then the array handle.
                let value = frame.pop()?;
                let index = frame.pop()?;
                let handle = frame.pop()?;
                let array = heap.array_mut(handle).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::InvalidHandle {
                        handle,
                    })
                })?;
                let length = array.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|index| array.get_mut(index))
                    .ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
                            index,
                            length,
                        })
                    })?;
                *slot = value;
                pc += 1;
            }
        }
    }
    Ok(None)
}

/// `Runtime` represents an execution context for JVM programs and is
/// responsible for interpreting a program's bytecode starting from its
/// main method.
pub struct Runtime {
    program: Program,
    heap: Heap,
}

impl Runtime {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            heap: Heap::new(),
        }
    }

    /// Runs the program's entry point to completion. The `String[]`
    /// argument slot is seeded with a zero handle; main must complete
    /// without leaving a value behind.
    pub fn run(&mut self) -> Result<()> {
        let main = self
            .program
            .entry_point()
            .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::MissingMain))?;
        let locals = vec![0; main.max_locals as usize];
        match execute(main, locals, &self.program, &mut self.heap)? {
            None => Ok(()),
            Some(_) => Err(RuntimeError::new(
                RuntimeErrorKind::UnexpectedReturnValue,
            )),
        }
    }
}
