#![doc = include_str!("../README.md")]

pub mod bitstream;
pub mod parser;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;

pub use parser::{H264Parser, NaluType, ParserError, SliceFamily};
pub use writer::{H264Writer, WriterError};

/// The 4-byte Annex-B byte stream start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
pub const START_CODE_LENGTH: usize = START_CODE.len();
