use crate::bitstream::BitReader;

use super::ParserError;

/// SEI payload type of `user_data_unregistered` (subclause 7.4.2.3.1).
pub const SEI_TYPE_USER_DATA_UNREGISTERED: u32 = 5;

/// Walks the SEI messages of one SEI NALU and collects every
/// `user_data_unregistered` payload, in bitstream order. Other payload
/// types are skipped over.
pub(crate) fn parse_sei(r: &mut BitReader, out: &mut Vec<Vec<u8>>) -> Result<(), ParserError> {
    loop {
        let payload_type = read_ff_coded_value(r)?;
        let payload_size = read_ff_coded_value(r)? as usize;

        if payload_type == SEI_TYPE_USER_DATA_UNREGISTERED {
            let mut payload = Vec::with_capacity(payload_size);
            for _ in 0..payload_size {
                payload.push(r.read_bits(8)? as u8);
            }
            out.push(payload);
        } else {
            for _ in 0..payload_size {
                r.read_bits(8)?;
            }
        }

        if !r.has_more_rbsp_data() {
            return Ok(());
        }
    }
}

/// The `ff_byte` run-length coding used for SEI payload type and size:
/// 0xFF bytes accumulate 255 each until a byte below 0xFF terminates.
fn read_ff_coded_value(r: &mut BitReader) -> Result<u32, ParserError> {
    let mut value = 0u32;
    loop {
        let byte = r.read_bits(8)?;
        value = value
            .checked_add(byte)
            .ok_or(ParserError::InvalidBitstream("SEI ff_byte overflow"))?;
        if byte != 0xff {
            return Ok(value);
        }
    }
}
