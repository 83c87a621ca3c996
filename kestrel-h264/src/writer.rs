//! NALU synthesis.
//!
//! The writer emits three kinds of NAL units from an SPS/PPS context
//! previously captured by the parser: `user_data_unregistered` SEI, skipped-P
//! slices (every macroblock coded as skip) and gray IDR slices (every
//! macroblock an Intra_16x16 DC prediction with zero residual). The slice
//! emitters work from a slice-context template taken from a real slice of the
//! same stream, so the fabricated slice is consistent with whatever the
//! encoder negotiated.
//!
//! Only CAVLC entropy coding is supported for slice data.

use crate::bitstream::{BitWriter, BitstreamError};
use crate::parser::{
    PpsContext, SEI_TYPE_USER_DATA_UNREGISTERED, SliceContext, SliceFamily, SpsContext,
};
use crate::parser::slice_group_change_cycle_bits;
use crate::START_CODE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WriterError {
    #[error("No SPS/PPS context has been set")]
    NotReady,

    #[error("Output buffer too small, {needed} bytes required")]
    BufferTooSmall { needed: usize },

    #[error("Cannot emit unsupported syntax: {0}")]
    Unsupported(&'static str),

    #[error("Syntax element out of range")]
    ValueOutOfRange,
}

enum EmitError {
    /// Scratch buffer exhausted, retry with a larger one.
    Full,
    Unsupported(&'static str),
    ValueOutOfRange,
}

impl From<BitstreamError> for EmitError {
    fn from(err: BitstreamError) -> Self {
        match err {
            BitstreamError::BufferTooSmall => EmitError::Full,
            BitstreamError::UnexpectedEnd | BitstreamError::ValueOutOfRange => {
                EmitError::ValueOutOfRange
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Prefix every emitted NALU with the 4-byte Annex-B start code.
    pub nalu_prefix: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { nalu_prefix: true }
    }
}

const INITIAL_SCRATCH_SIZE: usize = 16 * 1024;

pub struct H264Writer {
    config: WriterConfig,
    sps: Option<SpsContext>,
    pps: Option<PpsContext>,
    scratch: Vec<u8>,
}

impl H264Writer {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            sps: None,
            pps: None,
            scratch: vec![0; INITIAL_SCRATCH_SIZE],
        }
    }

    /// Installs the context every subsequent slice emission refers to.
    pub fn set_sps_pps_context(&mut self, sps: SpsContext, pps: PpsContext) {
        self.sps = Some(sps);
        self.pps = Some(pps);
    }

    pub fn has_sps_pps_context(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Emits a SEI NALU carrying one `user_data_unregistered` message.
    ///
    /// The payload must start with the 16-byte UUID that identifies its
    /// schema. Returns the number of bytes written into `out`.
    pub fn write_sei_nalu(
        &mut self,
        user_data: &[u8],
        out: &mut [u8],
    ) -> Result<usize, WriterError> {
        if user_data.len() < 16 {
            return Err(WriterError::Unsupported(
                "user_data_unregistered shorter than its UUID",
            ));
        }
        let nalu_prefix = self.config.nalu_prefix;
        self.emit(out, |w| emit_sei(w, user_data, nalu_prefix))
    }

    /// Emits a P slice whose `slice_mb_count` macroblocks are all skipped.
    ///
    /// The template is forced to a non-reference-modifying, deblocking-safe
    /// shape: `disable_deblocking_filter_idc = 2` keeps the fabricated slice
    /// from affecting the loop filter across real slice boundaries.
    pub fn write_skipped_p_slice_nalu(
        &mut self,
        first_mb_in_slice: u32,
        slice_mb_count: u32,
        template: &SliceContext,
        out: &mut [u8],
    ) -> Result<usize, WriterError> {
        let (sps, pps) = self
            .sps
            .as_ref()
            .zip(self.pps.as_ref())
            .ok_or(WriterError::NotReady)?;

        let mut slice = template.clone();
        slice.nal_unit_type = 1;
        slice.idr_pic_flag = false;
        slice.first_mb_in_slice = first_mb_in_slice;
        slice.slice_type = if template.slice_type >= 5 { 5 } else { 0 };
        slice.redundant_pic_cnt = 0;
        slice.direct_spatial_mv_pred_flag = false;
        slice.slice_qp_delta = 0;
        // keep the fabricated slice out of the loop filter of real slices
        slice.disable_deblocking_filter_idc = 2;
        slice.slice_alpha_c0_offset_div2 = 0;
        slice.slice_beta_offset_div2 = 0;

        let (sps, pps) = (sps.clone(), pps.clone());
        let nalu_prefix = self.config.nalu_prefix;
        self.emit(out, |w| {
            emit_slice_nalu(w, &sps, &pps, &slice, nalu_prefix, |w| {
                emit_skipped_p_slice_data(w, &pps, slice_mb_count)
            })
        })
    }

    /// Emits an IDR slice of `mb_count` uniformly gray intra macroblocks.
    ///
    /// Used to unblock decoders that refuse to start before a valid IDR:
    /// the slice decodes without reference to any other picture and flushes
    /// the DPB normally.
    pub fn write_gray_i_slice_nalu(
        &mut self,
        first_mb_in_slice: u32,
        mb_count: u32,
        template: &SliceContext,
        out: &mut [u8],
    ) -> Result<usize, WriterError> {
        let (sps, pps) = self
            .sps
            .as_ref()
            .zip(self.pps.as_ref())
            .ok_or(WriterError::NotReady)?;

        let mut slice = template.clone();
        slice.nal_ref_idc = 3;
        slice.nal_unit_type = 5;
        slice.idr_pic_flag = true;
        slice.first_mb_in_slice = first_mb_in_slice;
        slice.slice_type = 2;
        slice.frame_num = 0;
        slice.idr_pic_id = 0;
        slice.pic_order_cnt_lsb = 0;
        slice.delta_pic_order_cnt_bottom = 0;
        slice.delta_pic_order_cnt = [0, 0];
        slice.redundant_pic_cnt = 0;
        slice.slice_qp_delta = 0;
        // the synthesized IDR should flush the DPB normally
        slice.no_output_of_prior_pics_flag = false;
        slice.long_term_reference_flag = false;

        let chroma = matches!(sps.chroma_array_type(), 1 | 2);
        let (sps, pps) = (sps.clone(), pps.clone());
        let nalu_prefix = self.config.nalu_prefix;
        self.emit(out, |w| {
            emit_slice_nalu(w, &sps, &pps, &slice, nalu_prefix, |w| {
                emit_gray_i_slice_data(w, &pps, mb_count, chroma)
            })
        })
    }

    /// Runs `emit_fn` against the scratch buffer, growing it until the NALU
    /// fits, then copies the result into `out`.
    fn emit(
        &mut self,
        out: &mut [u8],
        emit_fn: impl Fn(&mut BitWriter) -> Result<(), EmitError>,
    ) -> Result<usize, WriterError> {
        let size = loop {
            let mut writer = BitWriter::new(&mut self.scratch);
            match emit_fn(&mut writer) {
                Ok(()) => break writer.len(),
                Err(EmitError::Full) => {
                    let grown = self.scratch.len() * 2;
                    self.scratch.resize(grown, 0);
                }
                Err(EmitError::Unsupported(what)) => return Err(WriterError::Unsupported(what)),
                Err(EmitError::ValueOutOfRange) => return Err(WriterError::ValueOutOfRange),
            }
        };

        if out.len() < size {
            return Err(WriterError::BufferTooSmall { needed: size });
        }
        out[..size].copy_from_slice(&self.scratch[..size]);
        Ok(size)
    }
}

fn emit_nalu_header(
    w: &mut BitWriter,
    nal_ref_idc: u8,
    nal_unit_type: u8,
    nalu_prefix: bool,
) -> Result<(), EmitError> {
    if nalu_prefix {
        w.write_bits(32, u32::from_be_bytes(START_CODE), false)?;
    }
    // forbidden_zero_bit, nal_ref_idc, nal_unit_type
    let header = ((nal_ref_idc as u32 & 0x3) << 5) | (nal_unit_type as u32 & 0x1f);
    w.write_bits(8, header, false)?;
    Ok(())
}

fn emit_sei(w: &mut BitWriter, user_data: &[u8], nalu_prefix: bool) -> Result<(), EmitError> {
    emit_nalu_header(w, 0, 6, nalu_prefix)?;

    emit_ff_coded_value(w, SEI_TYPE_USER_DATA_UNREGISTERED)?;
    emit_ff_coded_value(w, user_data.len() as u32)?;
    for &byte in user_data {
        w.write_bits(8, byte as u32, true)?;
    }

    w.write_rbsp_trailing_bits()?;
    Ok(())
}

fn emit_ff_coded_value(w: &mut BitWriter, mut value: u32) -> Result<(), EmitError> {
    while value > 255 {
        w.write_bits(8, 0xff, true)?;
        value -= 255;
    }
    w.write_bits(8, value, true)?;
    Ok(())
}

fn emit_slice_nalu(
    w: &mut BitWriter,
    sps: &SpsContext,
    pps: &PpsContext,
    slice: &SliceContext,
    nalu_prefix: bool,
    emit_slice_data: impl Fn(&mut BitWriter) -> Result<(), EmitError>,
) -> Result<(), EmitError> {
    emit_nalu_header(w, slice.nal_ref_idc, slice.nal_unit_type, nalu_prefix)?;
    emit_slice_header(w, sps, pps, slice)?;
    emit_slice_data(w)?;
    w.write_rbsp_trailing_bits()?;
    Ok(())
}

/// Emits a slice header (subclause 7.3.3), the mirror of the parser.
fn emit_slice_header(
    w: &mut BitWriter,
    sps: &SpsContext,
    pps: &PpsContext,
    slice: &SliceContext,
) -> Result<(), EmitError> {
    let family = slice.family();

    w.write_ue(slice.first_mb_in_slice, true)?;
    w.write_ue(slice.slice_type, true)?;
    w.write_ue(slice.pic_parameter_set_id, true)?;

    if sps.separate_colour_plane_flag {
        w.write_bits(2, slice.colour_plane_id, true)?;
    }

    w.write_bits(sps.log2_max_frame_num(), slice.frame_num, true)?;

    if !sps.frame_mbs_only_flag {
        w.write_bits(1, slice.field_pic_flag as u32, true)?;
        if slice.field_pic_flag {
            w.write_bits(1, slice.bottom_field_flag as u32, true)?;
        }
    }

    if slice.idr_pic_flag {
        w.write_ue(slice.idr_pic_id, true)?;
    }

    if sps.pic_order_cnt_type == 0 {
        w.write_bits(sps.log2_max_pic_order_cnt_lsb(), slice.pic_order_cnt_lsb, true)?;
        if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
            w.write_se(slice.delta_pic_order_cnt_bottom, true)?;
        }
    }
    if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
        w.write_se(slice.delta_pic_order_cnt[0], true)?;
        if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
            w.write_se(slice.delta_pic_order_cnt[1], true)?;
        }
    }

    if pps.redundant_pic_cnt_present_flag {
        w.write_ue(slice.redundant_pic_cnt, true)?;
    }

    if family == SliceFamily::B {
        w.write_bits(1, slice.direct_spatial_mv_pred_flag as u32, true)?;
    }

    if matches!(family, SliceFamily::P | SliceFamily::Sp | SliceFamily::B) {
        w.write_bits(1, slice.num_ref_idx_active_override_flag as u32, true)?;
        if slice.num_ref_idx_active_override_flag {
            w.write_ue(slice.num_ref_idx_l0_active_minus1, true)?;
            if family == SliceFamily::B {
                w.write_ue(slice.num_ref_idx_l1_active_minus1, true)?;
            }
        }
    }

    if slice.nal_unit_type == 20 || slice.nal_unit_type == 21 {
        return Err(EmitError::Unsupported("ref_pic_list_mvc_modification"));
    }
    // ref_pic_list_modification()
    if !matches!(family, SliceFamily::I | SliceFamily::Si) {
        w.write_bits(1, slice.ref_pic_list_modification_flag_l0 as u32, true)?;
        if slice.ref_pic_list_modification_flag_l0 {
            return Err(EmitError::Unsupported("ref_pic_list_modification"));
        }
    }
    if family == SliceFamily::B {
        w.write_bits(1, slice.ref_pic_list_modification_flag_l1 as u32, true)?;
        if slice.ref_pic_list_modification_flag_l1 {
            return Err(EmitError::Unsupported("ref_pic_list_modification"));
        }
    }

    if (pps.weighted_pred_flag && matches!(family, SliceFamily::P | SliceFamily::Sp))
        || (pps.weighted_bipred_idc == 1 && family == SliceFamily::B)
    {
        return Err(EmitError::Unsupported("pred_weight_table"));
    }

    if slice.nal_ref_idc != 0 {
        // dec_ref_pic_marking()
        if slice.idr_pic_flag {
            w.write_bits(1, slice.no_output_of_prior_pics_flag as u32, true)?;
            w.write_bits(1, slice.long_term_reference_flag as u32, true)?;
        } else {
            w.write_bits(1, slice.adaptive_ref_pic_marking_mode_flag as u32, true)?;
            if slice.adaptive_ref_pic_marking_mode_flag {
                return Err(EmitError::Unsupported("adaptive_ref_pic_marking"));
            }
        }
    }

    if pps.entropy_coding_mode_flag && !matches!(family, SliceFamily::I | SliceFamily::Si) {
        w.write_ue(slice.cabac_init_idc, true)?;
    }

    w.write_se(slice.slice_qp_delta, true)?;

    if matches!(family, SliceFamily::Sp | SliceFamily::Si) {
        if family == SliceFamily::Sp {
            w.write_bits(1, slice.sp_for_switch_flag as u32, true)?;
        }
        w.write_se(slice.slice_qs_delta, true)?;
    }

    if pps.deblocking_filter_control_present_flag {
        w.write_ue(slice.disable_deblocking_filter_idc, true)?;
        if slice.disable_deblocking_filter_idc != 1 {
            w.write_se(slice.slice_alpha_c0_offset_div2, true)?;
            w.write_se(slice.slice_beta_offset_div2, true)?;
        }
    }

    if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
        w.write_bits(
            slice_group_change_cycle_bits(sps, pps),
            slice.slice_group_change_cycle,
            true,
        )?;
    }

    Ok(())
}

/// Slice data of a fully skipped P slice: a single `mb_skip_run` covering
/// every macroblock.
fn emit_skipped_p_slice_data(
    w: &mut BitWriter,
    pps: &PpsContext,
    slice_mb_count: u32,
) -> Result<(), EmitError> {
    if pps.entropy_coding_mode_flag {
        return Err(EmitError::Unsupported("CABAC slice data"));
    }
    w.write_ue(slice_mb_count, true)?;
    Ok(())
}

/// Slice data of a gray I slice: `mb_count` Intra_16x16 macroblocks with DC
/// prediction (`I_16x16_2_0_0`), DC chroma prediction and zero residual.
/// With no neighbours to predict from, every block decodes to mid-gray.
fn emit_gray_i_slice_data(
    w: &mut BitWriter,
    pps: &PpsContext,
    mb_count: u32,
    chroma: bool,
) -> Result<(), EmitError> {
    if pps.entropy_coding_mode_flag {
        return Err(EmitError::Unsupported("CABAC slice data"));
    }
    for _ in 0..mb_count {
        w.write_ue(3, true)?; // mb_type I_16x16_2_0_0
        if chroma {
            w.write_ue(0, true)?; // intra_chroma_pred_mode (DC)
        }
        w.write_se(0, true)?; // mb_qp_delta
        w.write_bits(1, 1, true)?; // luma DC coeff_token, zero coefficients
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::bitstream::BitReader;
    use crate::parser::{H264Parser, NaluType, SliceContext, SliceFamily};

    use super::*;

    fn sps_pps_nalus() -> (Vec<u8>, Vec<u8>) {
        let mut sps = vec![0x67];
        sps.extend(crate::test_support::sample_sps_rbsp());
        let mut pps = vec![0x68];
        pps.extend(crate::test_support::sample_pps_rbsp());
        (sps, pps)
    }

    fn synced_parser() -> H264Parser {
        let (sps, pps) = sps_pps_nalus();
        let mut parser = H264Parser::default();
        parser.setup_nalu(&sps);
        parser.parse_nalu().unwrap();
        parser.setup_nalu(&pps);
        parser.parse_nalu().unwrap();
        parser
    }

    fn writer_from(parser: &H264Parser) -> H264Writer {
        let (sps, pps) = parser.sps_pps_context().unwrap();
        let mut writer = H264Writer::new(WriterConfig::default());
        writer.set_sps_pps_context(sps.clone(), pps.clone());
        writer
    }

    fn p_slice_template() -> SliceContext {
        SliceContext {
            nal_ref_idc: 2,
            nal_unit_type: 1,
            slice_type: 5,
            frame_num: 9,
            ..Default::default()
        }
    }

    #[test]
    fn not_ready_without_context() {
        let mut writer = H264Writer::new(WriterConfig::default());
        let mut out = [0u8; 256];
        assert_eq!(
            writer.write_skipped_p_slice_nalu(0, 100, &p_slice_template(), &mut out),
            Err(WriterError::NotReady)
        );
    }

    #[test]
    fn skipped_p_round_trips_through_parser() {
        let mut parser = synced_parser();
        let mut writer = writer_from(&parser);

        let mut out = [0u8; 256];
        let size = writer
            .write_skipped_p_slice_nalu(200, 100, &p_slice_template(), &mut out)
            .unwrap();
        let nalu = &out[..size];
        assert_eq!(&nalu[..4], &START_CODE);

        parser.setup_nalu(&nalu[4..]);
        assert_eq!(parser.parse_nalu().unwrap(), NaluType::SliceNonIdr);
        let info = parser.slice_info().unwrap();
        assert_eq!(info.first_mb_in_slice, 200);
        assert_eq!(info.family, SliceFamily::P);

        // re-parse by hand to check the slice data is exactly one mb_skip_run
        let (sps, pps) = parser.sps_pps_context().unwrap();
        let mut reader = BitReader::new(&nalu[5..], true);
        let slice = SliceContext::parse(&mut reader, sps, pps, 2, 1).unwrap();
        assert_eq!(slice.frame_num, 9);
        assert_eq!(slice.disable_deblocking_filter_idc, 2);
        assert_eq!(slice.slice_qp_delta, 0);
        assert_eq!(reader.read_ue().unwrap(), 100); // mb_skip_run
        assert_eq!(reader.read_bits(1).unwrap(), 1); // stop bit
    }

    #[test]
    fn gray_i_slice_is_an_idr() {
        let mut parser = synced_parser();
        let mut writer = writer_from(&parser);

        let mb_count = 80 * 45;
        let mut out = vec![0u8; 16 * 1024];
        let size = writer
            .write_gray_i_slice_nalu(0, mb_count, &p_slice_template(), &mut out)
            .unwrap();

        parser.setup_nalu(&out[4..size]);
        assert_eq!(parser.parse_nalu().unwrap(), NaluType::SliceIdr);
        let info = parser.slice_info().unwrap();
        assert!(info.idr);
        assert_eq!(info.first_mb_in_slice, 0);
        assert_eq!(info.family, SliceFamily::I);

        let slice = parser.slice_context().unwrap();
        assert_eq!(slice.frame_num, 0);
        assert_eq!(slice.idr_pic_id, 0);
        assert!(!slice.no_output_of_prior_pics_flag);
        assert!(!slice.long_term_reference_flag);

        // first macroblock of the slice data
        let (sps, pps) = parser.sps_pps_context().unwrap();
        let mut reader = BitReader::new(&out[5..size], true);
        SliceContext::parse(&mut reader, sps, pps, 3, 5).unwrap();
        assert_eq!(reader.read_ue().unwrap(), 3); // mb_type I_16x16_2_0_0
        assert_eq!(reader.read_ue().unwrap(), 0); // intra_chroma_pred_mode
        assert_eq!(reader.read_se().unwrap(), 0); // mb_qp_delta
        assert_eq!(reader.read_bits(1).unwrap(), 1); // coeff_token
    }

    #[test]
    fn sei_round_trips_through_parser() {
        let mut parser = synced_parser();
        let mut writer = writer_from(&parser);

        let mut payload = vec![0u8; 16];
        payload.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let mut out = [0u8; 256];
        let size = writer.write_sei_nalu(&payload, &mut out).unwrap();
        assert_eq!(out[4], 0x06);

        parser.setup_nalu(&out[4..size]);
        assert_eq!(parser.parse_nalu().unwrap(), NaluType::Sei);
        assert_eq!(parser.user_data_sei_count(), 1);
        assert_eq!(parser.user_data_sei(0).unwrap(), payload.as_slice());
    }

    #[test]
    fn output_buffer_too_small_reports_needed_size() {
        let parser = synced_parser();
        let mut writer = writer_from(&parser);

        let mut big = [0u8; 256];
        let size = writer
            .write_skipped_p_slice_nalu(0, 3600, &p_slice_template(), &mut big)
            .unwrap();

        let mut small = [0u8; 4];
        assert_eq!(
            writer.write_skipped_p_slice_nalu(0, 3600, &p_slice_template(), &mut small),
            Err(WriterError::BufferTooSmall { needed: size })
        );
    }

    #[test]
    fn cabac_slice_data_is_unsupported() {
        let parser = synced_parser();
        let mut writer = writer_from(&parser);
        let (sps, pps) = parser.sps_pps_context().unwrap();
        let mut cabac_pps = pps.clone();
        cabac_pps.entropy_coding_mode_flag = true;
        writer.set_sps_pps_context(sps.clone(), cabac_pps);

        let mut out = [0u8; 256];
        assert!(matches!(
            writer.write_skipped_p_slice_nalu(0, 10, &p_slice_template(), &mut out),
            Err(WriterError::Unsupported(_))
        ));
    }
}
