//! Error and state registers of the machine.

use std::fmt::{Display, Formatter};

/// Error register values. The numeric assignment is part of the wire
/// contract: programs set and inspect these through `ERROR_SET` and
/// `ERROR_GET`, so the order must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure,
    DivisionByZero,
    OutOfMemory,
    StackOverflow,
    StackUnderflow,
    UndefinedInst,
    UndefinedError,
    UndefinedState,
    InvalidFrame,
    InvalidModule,
    InvalidNative,
    InvalidAddress,
    InvalidString,
}

impl ErrorCode {
    /// Decode a register value. Anything outside the table collapses to
    /// `UndefinedError`, so a program can never store an unknown code.
    pub fn from_raw(value: u64) -> ErrorCode {
        match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::Failure,
            2 => ErrorCode::DivisionByZero,
            3 => ErrorCode::OutOfMemory,
            4 => ErrorCode::StackOverflow,
            5 => ErrorCode::StackUnderflow,
            6 => ErrorCode::UndefinedInst,
            7 => ErrorCode::UndefinedError,
            8 => ErrorCode::UndefinedState,
            9 => ErrorCode::InvalidFrame,
            10 => ErrorCode::InvalidModule,
            11 => ErrorCode::InvalidNative,
            12 => ErrorCode::InvalidAddress,
            13 => ErrorCode::InvalidString,
            _ => ErrorCode::UndefinedError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Failure => "Failure",
            ErrorCode::DivisionByZero => "Division by zero",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::StackOverflow => "Stack overflow",
            ErrorCode::StackUnderflow => "Stack underflow",
            ErrorCode::UndefinedInst => "Undefined instruction",
            ErrorCode::UndefinedError => "Undefined error",
            ErrorCode::UndefinedState => "Undefined state",
            ErrorCode::InvalidFrame => "Invalid frame",
            ErrorCode::InvalidModule => "Invalid module",
            ErrorCode::InvalidNative => "Invalid native",
            ErrorCode::InvalidAddress => "Invalid address",
            ErrorCode::InvalidString => "Invalid string",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

/// Machine state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum State {
    Halted = 0,
    Breaked,
    Ready,
}
