//! Instruction dispatch: fetch one opcode at `ip`, decode its inline
//! immediates, evaluate it against the stack and memory.

use std::io::Write;

use crate::bytecode::{BinOp, Instruction, op};
use crate::error::{ErrorCode, State};
use crate::machine::Vm;
use crate::native::NativeFn;
use crate::object::Object;

impl Vm {
    /// Drive the machine until it halts. A step that leaves the error
    /// register dirty is reported and execution continues: programs
    /// are allowed to observe their own errors and recover.
    pub fn run(&mut self) {
        while self.state != State::Halted {
            if self.step().is_err() {
                eprintln!("Error: {}.", self.err_code);
            }
        }
    }

    /// Execute a single instruction. A dispatch failure is recorded in
    /// the error register; the step result is whatever reading the
    /// register reports, so a dirty register keeps reporting until the
    /// program or the error hook clears it.
    pub fn step(&mut self) -> Result<(), ErrorCode> {
        if let Err(code) = self.dispatch() {
            self.error_set(code);
        }
        match self.error_get() {
            ErrorCode::Success => Ok(()),
            code => Err(code),
        }
    }

    fn dispatch(&mut self) -> Result<(), ErrorCode> {
        let at = self.ip;
        let byte = self.read_ip_u8()?;

        if self.verbose {
            eprintln!("{:012X} | {:02X}", at, byte);
        }

        let instruction = self.decode(byte)?;
        self.eval(instruction)
    }

    /// Decode one opcode byte, consuming its inline immediates at `ip`.
    fn decode(&mut self, byte: u8) -> Result<Instruction, ErrorCode> {
        match byte {
            op::HALT => Ok(Instruction::Halt),
            op::NOOP => Ok(Instruction::Noop),
            op::BREAKPOINT => Ok(Instruction::Breakpoint),
            op::ERROR_SET => Ok(Instruction::ErrorSet),
            op::ERROR_GET => Ok(Instruction::ErrorGet),
            op::JUMP => Ok(Instruction::Jump {
                offset: self.read_ip_i32()?,
            }),
            op::JUMP_INDIRECT => Ok(Instruction::JumpIndirect),
            op::JUMP_IF_FALSE => Ok(Instruction::JumpIfFalse {
                offset: self.read_ip_i32()?,
            }),
            op::JUMP_IF_TRUE => Ok(Instruction::JumpIfTrue {
                offset: self.read_ip_i32()?,
            }),
            op::CALL => Ok(Instruction::Call {
                offset: self.read_ip_i32()?,
            }),
            op::CALL_INDIRECT => Ok(Instruction::CallIndirect),
            op::RETURN => Ok(Instruction::Return),
            op::MODULE_OPEN => Ok(Instruction::ModuleOpen),
            op::MODULE_CLOSE => Ok(Instruction::ModuleClose),
            op::NATIVE_LOAD => Ok(Instruction::NativeLoad),
            op::NATIVE_CALL => Ok(Instruction::NativeCall),
            op::IS_NULL_POINTER => Ok(Instruction::IsNullPointer),
            op::IS_NOT_NULL_POINTER => Ok(Instruction::IsNotNullPointer),
            op::IS_STRING => Ok(Instruction::IsString),
            op::ENTER => Ok(Instruction::Enter {
                slots: self.read_ip_u16()?,
            }),
            op::LEAVE => Ok(Instruction::Leave),
            op::PUSH_8..=op::PUSH_64 => {
                let size = 1u64 << (byte - op::PUSH_8);
                Ok(Instruction::Push {
                    value: self.read_ip_zext(size)?,
                })
            }
            op::POP => Ok(Instruction::Pop),
            op::EXCHANGE => Ok(Instruction::Exchange {
                slot: self.read_ip_i16()?,
            }),
            op::SET_AT_SP => Ok(Instruction::SetAtSp {
                slot: self.read_ip_i16()?,
            }),
            op::GET_AT_SP => Ok(Instruction::GetAtSp {
                slot: self.read_ip_i16()?,
            }),
            op::SET_AT_FP => Ok(Instruction::SetAtFp {
                slot: self.read_ip_i16()?,
            }),
            op::GET_AT_FP => Ok(Instruction::GetAtFp {
                slot: self.read_ip_i16()?,
            }),
            op::STORE_8..=op::STORE_64 => Ok(Instruction::Store {
                size: 1u64 << (byte - op::STORE_8),
            }),
            op::LOAD_8..=op::LOAD_64 => Ok(Instruction::Load {
                size: 1u64 << (byte - op::LOAD_8),
            }),
            op::NEGATE => Ok(Instruction::Negate),
            op::ADD => Ok(Instruction::Binary { op: BinOp::Add }),
            op::SUBTRACT => Ok(Instruction::Binary {
                op: BinOp::Subtract,
            }),
            op::MULTIPLY => Ok(Instruction::Binary {
                op: BinOp::Multiply,
            }),
            op::DIVIDE => Ok(Instruction::Binary { op: BinOp::Divide }),
            op::MODULO => Ok(Instruction::Binary { op: BinOp::Modulo }),
            op::INT_MULTIPLY => Ok(Instruction::Binary {
                op: BinOp::IntMultiply,
            }),
            op::INT_DIVIDE => Ok(Instruction::Binary {
                op: BinOp::IntDivide,
            }),
            op::INT_MODULO => Ok(Instruction::Binary {
                op: BinOp::IntModulo,
            }),
            op::IS_EQUAL => Ok(Instruction::Binary { op: BinOp::IsEqual }),
            op::IS_NOT_EQUAL => Ok(Instruction::Binary {
                op: BinOp::IsNotEqual,
            }),
            op::IS_LESS => Ok(Instruction::Binary { op: BinOp::IsLess }),
            op::IS_LESS_OR_EQUAL => Ok(Instruction::Binary {
                op: BinOp::IsLessOrEqual,
            }),
            op::IS_GREATER => Ok(Instruction::Binary {
                op: BinOp::IsGreater,
            }),
            op::IS_GREATER_OR_EQUAL => Ok(Instruction::Binary {
                op: BinOp::IsGreaterOrEqual,
            }),
            op::BIT_NOT => Ok(Instruction::BitNot),
            op::BIT_AND => Ok(Instruction::Binary { op: BinOp::BitAnd }),
            op::BIT_OR => Ok(Instruction::Binary { op: BinOp::BitOr }),
            op::BIT_XOR => Ok(Instruction::Binary { op: BinOp::BitXor }),
            op::BIT_SHIFT_LEFT => Ok(Instruction::Binary {
                op: BinOp::BitShiftLeft,
            }),
            op::BIT_SHIFT_RIGHT => Ok(Instruction::Binary {
                op: BinOp::BitShiftRight,
            }),
            op::BIT_INT_SHIFT_RIGHT => Ok(Instruction::Binary {
                op: BinOp::BitIntShiftRight,
            }),
            op::PRINT => Ok(Instruction::Print),
            _ => Err(ErrorCode::UndefinedInst),
        }
    }

    /// Evaluate one decoded instruction.
    fn eval(&mut self, instruction: Instruction) -> Result<(), ErrorCode> {
        match instruction {
            Instruction::Halt => self.state_set(State::Halted),
            Instruction::Noop => (),
            Instruction::Breakpoint => self.state_set(State::Breaked),
            Instruction::ErrorSet => {
                let code = self.stack_pop()?;
                self.error_set(ErrorCode::from_raw(code.as_unsigned()));
            }
            Instruction::ErrorGet => {
                self.stack_push(Object::from_unsigned(self.err_code as u64))?;
            }
            Instruction::Jump { offset } => {
                self.ip = self.ip.wrapping_add_signed(offset as i64);
            }
            Instruction::JumpIndirect => {
                let target = self.stack_pop()?;
                self.ip = self.ip.wrapping_add_signed(target.as_signed());
            }
            Instruction::JumpIfFalse { offset } => {
                let cond = self.stack_pop()?;
                if cond.as_unsigned() == 0 {
                    self.ip = self.ip.wrapping_add_signed(offset as i64);
                }
            }
            Instruction::JumpIfTrue { offset } => {
                let cond = self.stack_pop()?;
                if cond.as_unsigned() != 0 {
                    self.ip = self.ip.wrapping_add_signed(offset as i64);
                }
            }
            Instruction::Call { offset } => {
                // `ip` already points past the immediate; that is the
                // return address
                self.stack_push(Object::from_unsigned(self.ip))?;
                self.ip = self.ip.wrapping_add_signed(offset as i64);
            }
            Instruction::CallIndirect => {
                let target = self.stack_pop()?;
                self.stack_push(Object::from_unsigned(self.ip))?;
                self.ip = self.ip.wrapping_add_signed(target.as_signed());
            }
            Instruction::Return => {
                let ret = self.stack_pop()?;
                self.ip = ret.as_unsigned();
            }
            Instruction::ModuleOpen => {
                let name_addr = self.stack_pop()?;
                let flags = self.stack_pop()?;
                let name = self.read_cstring(name_addr.as_unsigned())?;
                let handle = self.loader.open(&name, flags.as_signed());
                self.stack_push(Object::from_handle(handle))?;
            }
            Instruction::ModuleClose => {
                let handle = self.stack_pop()?.as_handle();
                if handle.is_null() {
                    return Err(ErrorCode::InvalidModule);
                }
                self.loader.close(handle);
            }
            Instruction::NativeLoad => {
                let handle = self.stack_pop()?.as_handle();
                let name_addr = self.stack_pop()?;
                let name = self.read_cstring(name_addr.as_unsigned())?;
                if handle.is_null() {
                    return Err(ErrorCode::InvalidModule);
                }
                let entry = self.loader.resolve(handle, &name);
                self.stack_push(Object::from_handle(entry))?;
            }
            Instruction::NativeCall => {
                let entry = self.stack_pop()?.as_handle();
                if entry.is_null() {
                    return Err(ErrorCode::InvalidNative);
                }
                // The program vouches for the address; natives are the
                // machine's trust boundary.
                let native: NativeFn = unsafe { std::mem::transmute(entry.raw() as usize) };
                unsafe { native(self) };
            }
            Instruction::IsNullPointer => {
                let word = self.stack_pop()?;
                self.stack_push(Object::from_unsigned(word.is_null() as u64))?;
            }
            Instruction::IsNotNullPointer => {
                let word = self.stack_pop()?;
                self.stack_push(Object::from_unsigned(!word.is_null() as u64))?;
            }
            Instruction::IsString => {
                let addr = self.stack_pop()?;
                let verdict = match self.string_verify(addr.as_unsigned()) {
                    Ok(()) => 1,
                    Err(_) => {
                        // probing must not leave the register dirty
                        self.error_set(ErrorCode::Success);
                        0
                    }
                };
                self.stack_push(Object::from_unsigned(verdict))?;
            }
            Instruction::Enter { slots } => self.frame_enter(slots as i64)?,
            Instruction::Leave => self.frame_leave()?,
            Instruction::Push { value } => self.stack_push(Object::from_unsigned(value))?,
            Instruction::Pop => {
                self.stack_pop()?;
            }
            Instruction::Exchange { slot } => {
                let top = self.stack_pop()?;
                let addr = self.stack_peek(slot as i64)?;
                let other = self.read_object(addr)?;
                self.stack_push(other)?;
                self.write_object(addr, top)?;
            }
            Instruction::SetAtSp { slot } => {
                let value = self.stack_pop()?;
                let addr = self.stack_peek(slot as i64)?;
                self.write_object(addr, value)?;
            }
            Instruction::GetAtSp { slot } => {
                let addr = self.stack_peek(slot as i64)?;
                let value = self.read_object(addr)?;
                self.stack_push(value)?;
            }
            Instruction::SetAtFp { slot } => {
                let value = self.stack_pop()?;
                let addr = self.frame_peek(slot as i64)?;
                self.write_object(addr, value)?;
            }
            Instruction::GetAtFp { slot } => {
                let addr = self.frame_peek(slot as i64)?;
                let value = self.read_object(addr)?;
                self.stack_push(value)?;
            }
            Instruction::Store { size } => {
                let addr = self.stack_pop()?;
                let value = self.stack_pop()?;
                self.memory
                    .write_trunc(addr.as_unsigned(), size, value.as_unsigned())?;
            }
            Instruction::Load { size } => {
                let addr = self.stack_pop()?;
                let value = self.memory.read_zext(addr.as_unsigned(), size)?;
                self.stack_push(Object::from_unsigned(value))?;
            }
            Instruction::Negate => {
                let word = self.stack_pop()?;
                self.stack_push(Object::from_unsigned(word.as_unsigned().wrapping_neg()))?;
            }
            Instruction::BitNot => {
                let word = self.stack_pop()?;
                self.stack_push(Object::from_unsigned(!word.as_unsigned()))?;
            }
            Instruction::Binary { op } => self.eval_binary(op)?,
            Instruction::Print => self.eval_print()?,
        }

        Ok(())
    }

    /// Two-operand ALU evaluation. The first pop is the left operand
    /// of the infix form; a zero right operand fails the divisions
    /// with the operands already consumed and no result pushed.
    fn eval_binary(&mut self, op: BinOp) -> Result<(), ErrorCode> {
        let left = self.stack_pop()?;
        let right = self.stack_pop()?;
        let (a, b) = (left.as_unsigned(), right.as_unsigned());

        let result = match op {
            BinOp::Add => Object::from_unsigned(a.wrapping_add(b)),
            BinOp::Subtract => Object::from_unsigned(a.wrapping_sub(b)),
            BinOp::Multiply => Object::from_unsigned(a.wrapping_mul(b)),
            BinOp::Divide => {
                if b == 0 {
                    return Err(ErrorCode::DivisionByZero);
                }
                Object::from_unsigned(a / b)
            }
            BinOp::Modulo => {
                if b == 0 {
                    return Err(ErrorCode::DivisionByZero);
                }
                Object::from_unsigned(a % b)
            }
            BinOp::IntMultiply => {
                Object::from_signed(left.as_signed().wrapping_mul(right.as_signed()))
            }
            BinOp::IntDivide => {
                if right.as_signed() == 0 {
                    return Err(ErrorCode::DivisionByZero);
                }
                Object::from_signed(left.as_signed().wrapping_div(right.as_signed()))
            }
            BinOp::IntModulo => {
                if right.as_signed() == 0 {
                    return Err(ErrorCode::DivisionByZero);
                }
                Object::from_signed(left.as_signed().wrapping_rem(right.as_signed()))
            }
            BinOp::IsEqual => Object::from_unsigned((a == b) as u64),
            BinOp::IsNotEqual => Object::from_unsigned((a != b) as u64),
            BinOp::IsLess => Object::from_unsigned((a < b) as u64),
            BinOp::IsLessOrEqual => Object::from_unsigned((a <= b) as u64),
            BinOp::IsGreater => Object::from_unsigned((a > b) as u64),
            BinOp::IsGreaterOrEqual => Object::from_unsigned((a >= b) as u64),
            BinOp::BitAnd => Object::from_unsigned(a & b),
            BinOp::BitOr => Object::from_unsigned(a | b),
            BinOp::BitXor => Object::from_unsigned(a ^ b),
            // shift amounts are taken modulo the word width
            BinOp::BitShiftLeft => Object::from_unsigned(a.wrapping_shl(b as u32)),
            BinOp::BitShiftRight => Object::from_unsigned(a.wrapping_shr(b as u32)),
            BinOp::BitIntShiftRight => {
                Object::from_signed(left.as_signed().wrapping_shr(b as u32))
            }
        };

        self.stack_push(result)
    }

    /// Pop a format selector and a value, write the rendering to the
    /// output sink. Output failures do not fault the machine; unknown
    /// selectors render nothing.
    fn eval_print(&mut self) -> Result<(), ErrorCode> {
        let format = self.stack_pop()?;
        let value = self.stack_pop()?;

        match format.as_unsigned() {
            0x00 => {
                let _ = write!(self.out, "{}", value.as_unsigned());
            }
            0x01 => {
                let _ = write!(self.out, "{}", value.as_signed());
            }
            0x02 => {
                let _ = write!(self.out, "{:x}", value.as_unsigned());
            }
            0x03 => {
                let _ = write!(self.out, "{:X}", value.as_unsigned());
            }
            0x04 => {
                let _ = write!(self.out, "{}", value.as_unsigned() as u8 as char);
            }
            0x05 => {
                let addr = value.as_unsigned();
                self.string_verify(addr)?;
                let nul = self.memory.find_nul(addr).ok_or(ErrorCode::InvalidString)?;
                let bytes = self.memory.read(addr, nul - addr)?;
                let _ = self.out.write_all(bytes);
            }
            _ => (),
        }

        Ok(())
    }
}
