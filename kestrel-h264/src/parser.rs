//! NAL unit discovery and header parsing.
//!
//! The parser holds at most one SPS and one PPS context (the first of each
//! seen on the stream) plus the context of the most recently parsed slice
//! header. That is exactly the state the [`writer`](crate::writer) needs to
//! synthesize replacement slices for the same stream.

use std::sync::LazyLock;

use memchr::memmem::Finder;
use tracing::debug;

use crate::bitstream::{BitReader, BitstreamError};

pub use pps::PpsContext;
pub use sei::SEI_TYPE_USER_DATA_UNREGISTERED;
pub use slice::{SliceContext, SliceInfo};
pub(crate) use slice::slice_group_change_cycle_bits;
pub use sps::SpsContext;

mod pps;
mod sei;
mod slice;
mod sps;

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("Invalid bitstream: {0}")]
    InvalidBitstream(&'static str),

    #[error("Bitstream ended in the middle of a syntax element")]
    Bitstream(#[from] BitstreamError),

    #[error("Slice refers to parameter sets that have not been seen")]
    MissingParameterSets,
}

/// NAL unit type, the low 5 bits of the NALU header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    SliceNonIdr,
    SlicePartitionA,
    SlicePartitionB,
    SlicePartitionC,
    SliceIdr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    FillerData,
    Other(u8),
}

impl NaluType {
    pub fn from_id(id: u8) -> Self {
        match id & 0x1f {
            1 => NaluType::SliceNonIdr,
            2 => NaluType::SlicePartitionA,
            3 => NaluType::SlicePartitionB,
            4 => NaluType::SlicePartitionC,
            5 => NaluType::SliceIdr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::AccessUnitDelimiter,
            10 => NaluType::EndOfSequence,
            11 => NaluType::EndOfStream,
            12 => NaluType::FillerData,
            other => NaluType::Other(other),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            NaluType::SliceNonIdr => 1,
            NaluType::SlicePartitionA => 2,
            NaluType::SlicePartitionB => 3,
            NaluType::SlicePartitionC => 4,
            NaluType::SliceIdr => 5,
            NaluType::Sei => 6,
            NaluType::Sps => 7,
            NaluType::Pps => 8,
            NaluType::AccessUnitDelimiter => 9,
            NaluType::EndOfSequence => 10,
            NaluType::EndOfStream => 11,
            NaluType::FillerData => 12,
            NaluType::Other(id) => id,
        }
    }

    /// Types 1 and 5 carry coded picture data; everything else is non-VCL.
    pub fn is_vcl(self) -> bool {
        matches!(self, NaluType::SliceNonIdr | NaluType::SliceIdr)
    }
}

/// Slice type family, `slice_type mod 5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceFamily {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceFamily {
    pub fn from_slice_type(slice_type: u32) -> Self {
        match slice_type % 5 {
            0 => SliceFamily::P,
            1 => SliceFamily::B,
            2 => SliceFamily::I,
            3 => SliceFamily::Sp,
            _ => SliceFamily::Si,
        }
    }
}

/// Extent of one NAL unit inside an Annex-B byte stream, start code excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluRange {
    pub start: usize,
    pub end: usize,
}

impl NaluRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Finds the next NAL unit at or after `from`.
///
/// Accepts both the 3-byte and the 4-byte start code form. The NALU extends
/// to the next start code or to the end of input; trailing zero padding
/// (including the leading zeros of a following 4-byte start code) is not part
/// of the returned range.
pub fn find_nalu(data: &[u8], from: usize) -> Option<NaluRange> {
    static FINDER: LazyLock<Finder> = LazyLock::new(|| Finder::new(&[0, 0, 1]));

    let code = FINDER.find(data.get(from..)?)?;
    let start = from + code + 3;

    let end = match FINDER.find(&data[start..]) {
        Some(next) => {
            let mut end = start + next;
            while end > start && data[end - 1] == 0 {
                end -= 1;
            }
            end
        }
        None => {
            let mut end = data.len();
            while end > start && data[end - 1] == 0 {
                end -= 1;
            }
            end
        }
    };

    Some(NaluRange { start, end })
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Collect `user_data_unregistered` SEI payloads while parsing SEI NALUs.
    pub extract_user_data_sei: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            extract_user_data_sei: true,
        }
    }
}

#[derive(Default)]
pub struct H264Parser {
    config: ParserConfig,
    nalu: Vec<u8>,
    last_nalu_type: Option<NaluType>,
    sps: Option<SpsContext>,
    pps: Option<PpsContext>,
    slice: Option<SliceContext>,
    slice_info: Option<SliceInfo>,
    user_data: Vec<Vec<u8>>,
}

impl H264Parser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Binds a single NAL unit (start code already removed) to the parser.
    pub fn setup_nalu(&mut self, data: &[u8]) {
        self.nalu.clear();
        self.nalu.extend_from_slice(data);
    }

    /// Parses the bound NALU into the parser state and returns its type.
    ///
    /// On failure the state of the partially parsed NALU is discarded; the
    /// stored SPS/PPS/slice contexts and the parser itself stay usable.
    pub fn parse_nalu(&mut self) -> Result<NaluType, ParserError> {
        self.last_nalu_type = None;
        self.slice_info = None;
        self.user_data.clear();

        let (&header, rbsp) = self
            .nalu
            .split_first()
            .ok_or(ParserError::InvalidBitstream("empty NALU"))?;
        if header & 0x80 != 0 {
            return Err(ParserError::InvalidBitstream("forbidden_zero_bit is set"));
        }
        let nal_ref_idc = (header >> 5) & 0x3;
        let nalu_type = NaluType::from_id(header);
        self.last_nalu_type = Some(nalu_type);

        let mut reader = BitReader::new(rbsp, true);
        match nalu_type {
            NaluType::Sps => {
                let sps = SpsContext::parse(&mut reader)?;
                match &self.sps {
                    // first parameter set wins; a live stream repeats the
                    // same SPS/PPS pair ahead of every IDR
                    Some(current) if *current != sps => {
                        debug!("Ignoring SPS update for seq_parameter_set_id {}", sps.seq_parameter_set_id);
                    }
                    Some(_) => {}
                    None => self.sps = Some(sps),
                }
            }
            NaluType::Pps => {
                let pps = PpsContext::parse(&mut reader)?;
                match &self.pps {
                    Some(current) if *current != pps => {
                        debug!("Ignoring PPS update for pic_parameter_set_id {}", pps.pic_parameter_set_id);
                    }
                    Some(_) => {}
                    None => self.pps = Some(pps),
                }
            }
            NaluType::SliceNonIdr | NaluType::SliceIdr => {
                let (sps, pps) = self
                    .sps
                    .as_ref()
                    .zip(self.pps.as_ref())
                    .ok_or(ParserError::MissingParameterSets)?;
                let slice =
                    SliceContext::parse(&mut reader, sps, pps, nal_ref_idc, nalu_type.id())?;
                self.slice_info = Some(SliceInfo::from_context(&slice));
                self.slice = Some(slice);
            }
            NaluType::Sei => {
                if self.config.extract_user_data_sei {
                    sei::parse_sei(&mut reader, &mut self.user_data)?;
                }
            }
            _ => {}
        }

        Ok(nalu_type)
    }

    pub fn last_nalu_type(&self) -> Option<NaluType> {
        self.last_nalu_type
    }

    /// Info about the most recently parsed slice NALU, if the last parsed
    /// NALU was a slice.
    pub fn slice_info(&self) -> Option<&SliceInfo> {
        self.slice_info.as_ref()
    }

    pub fn sps_pps_context(&self) -> Option<(&SpsContext, &PpsContext)> {
        self.sps.as_ref().zip(self.pps.as_ref())
    }

    /// Most recently parsed slice header, complete enough to be re-emitted.
    pub fn slice_context(&self) -> Option<&SliceContext> {
        self.slice.as_ref()
    }

    pub fn user_data_sei_count(&self) -> usize {
        self.user_data.len()
    }

    pub fn user_data_sei(&self, index: usize) -> Option<&[u8]> {
        self.user_data.get(index).map(Vec::as_slice)
    }
}
