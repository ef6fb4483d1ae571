use thiserror::Error;

/// Failures of the class-file layer: reading, editing and re-encoding a single class.
#[derive(Error, Debug)]
pub enum ClassFileError {
    #[error("bad magic number 0x{0:08X}, not a class file")]
    BadMagic(u32),

    #[error("unexpected end of data at offset {0}")]
    UnexpectedEof(usize),

    #[error("invalid constant pool index #{0}")]
    BadConstantIndex(u16),

    #[error("constant #{index} is not a {expected}")]
    UnexpectedConstant { index: u16, expected: &'static str },

    #[error("unknown constant tag {tag} at #{index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("malformed modified UTF-8 data")]
    BadUtf8,

    #[error("constant pool exceeds 65535 entries")]
    PoolOverflow,

    #[error("unknown opcode 0x{opcode:02X} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("branch target {target} is outside the code (length {len})")]
    BadBranchTarget { target: i64, len: usize },

    #[error("branch offset {0} does not fit a conditional jump")]
    BranchOutOfRange(i64),

    #[error("method code too large ({0} bytes)")]
    CodeTooLarge(usize),

    #[error("malformed descriptor `{0}`")]
    BadDescriptor(String),

    #[error("malformed signature `{0}`")]
    BadSignature(String),

    #[error("malformed attribute {name}: {reason}")]
    BadAttribute { name: String, reason: String },

    #[error("malformed StackMapTable: {0}")]
    BadStackMap(String),

    #[error("type error at instruction {index}: {reason}")]
    Verify { index: usize, reason: String },

    #[error("no frame can be computed for label L{0}")]
    FrameUnavailable(usize),

    #[error("label L{0} is not placed in the code")]
    UnboundLabel(usize),

    #[error("constant text of {0} bytes exceeds the 65535-byte limit")]
    Utf8TooLong(usize),
}

pub type ClassResult<T> = std::result::Result<T, ClassFileError>;
