use crate::bitstream::BitReader;

use super::pps::{PpsContext, ceil_log2};
use super::sps::SpsContext;
use super::{ParserError, SliceFamily};

/// Classification of the last parsed slice, the subset the access-unit
/// assembler needs on its hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceInfo {
    pub first_mb_in_slice: u32,
    pub slice_type: u32,
    pub family: SliceFamily,
    pub idr: bool,
}

impl SliceInfo {
    pub(crate) fn from_context(slice: &SliceContext) -> Self {
        Self {
            first_mb_in_slice: slice.first_mb_in_slice,
            slice_type: slice.slice_type,
            family: slice.family(),
            idr: slice.idr_pic_flag,
        }
    }
}

/// A fully parsed slice header.
///
/// Complete enough to serve as the template from which the writer emits a
/// replacement slice of the same picture. Syntax the writer cannot re-emit
/// (reference list modifications, prediction weight tables, adaptive
/// reference marking) is parsed over and recorded through its presence
/// flags only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceContext {
    pub nal_ref_idc: u8,
    pub nal_unit_type: u8,
    pub idr_pic_flag: bool,
    pub first_mb_in_slice: u32,
    pub slice_type: u32,
    pub pic_parameter_set_id: u32,
    pub colour_plane_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_flag_l1: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub cabac_init_idc: u32,
    pub slice_qp_delta: i32,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i32,
    pub disable_deblocking_filter_idc: u32,
    pub slice_alpha_c0_offset_div2: i32,
    pub slice_beta_offset_div2: i32,
    pub slice_group_change_cycle: u32,
}

impl SliceContext {
    pub fn family(&self) -> SliceFamily {
        SliceFamily::from_slice_type(self.slice_type)
    }

    /// Parses a slice header (subclause 7.3.3). Slice data is not touched.
    pub(crate) fn parse(
        r: &mut BitReader,
        sps: &SpsContext,
        pps: &PpsContext,
        nal_ref_idc: u8,
        nal_unit_type: u8,
    ) -> Result<Self, ParserError> {
        let mut slice = SliceContext {
            nal_ref_idc,
            nal_unit_type,
            idr_pic_flag: nal_unit_type == 5,
            first_mb_in_slice: r.read_ue()?,
            slice_type: r.read_ue()?,
            pic_parameter_set_id: r.read_ue()?,
            ..Default::default()
        };
        if slice.slice_type > 9 {
            return Err(ParserError::InvalidBitstream("slice_type > 9"));
        }
        let family = slice.family();

        if sps.separate_colour_plane_flag {
            slice.colour_plane_id = r.read_bits(2)?;
        }

        slice.frame_num = r.read_bits(sps.log2_max_frame_num())?;

        if !sps.frame_mbs_only_flag {
            slice.field_pic_flag = r.read_flag()?;
            if slice.field_pic_flag {
                slice.bottom_field_flag = r.read_flag()?;
            }
        }

        if slice.idr_pic_flag {
            slice.idr_pic_id = r.read_ue()?;
        }

        if sps.pic_order_cnt_type == 0 {
            slice.pic_order_cnt_lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb())?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt_bottom = r.read_se()?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            slice.delta_pic_order_cnt[0] = r.read_se()?;
            if pps.bottom_field_pic_order_in_frame_present_flag && !slice.field_pic_flag {
                slice.delta_pic_order_cnt[1] = r.read_se()?;
            }
        }

        if pps.redundant_pic_cnt_present_flag {
            slice.redundant_pic_cnt = r.read_ue()?;
        }

        if family == SliceFamily::B {
            slice.direct_spatial_mv_pred_flag = r.read_flag()?;
        }

        slice.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        slice.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        if matches!(family, SliceFamily::P | SliceFamily::Sp | SliceFamily::B) {
            slice.num_ref_idx_active_override_flag = r.read_flag()?;
            if slice.num_ref_idx_active_override_flag {
                slice.num_ref_idx_l0_active_minus1 = r.read_ue()?;
                if family == SliceFamily::B {
                    slice.num_ref_idx_l1_active_minus1 = r.read_ue()?;
                }
            }
        }

        if nal_unit_type == 20 || nal_unit_type == 21 {
            return Err(ParserError::InvalidBitstream(
                "ref_pic_list_mvc_modification is not supported",
            ));
        }
        // ref_pic_list_modification()
        if !matches!(family, SliceFamily::I | SliceFamily::Si) {
            slice.ref_pic_list_modification_flag_l0 = r.read_flag()?;
            if slice.ref_pic_list_modification_flag_l0 {
                skip_ref_pic_list_modification(r)?;
            }
        }
        if family == SliceFamily::B {
            slice.ref_pic_list_modification_flag_l1 = r.read_flag()?;
            if slice.ref_pic_list_modification_flag_l1 {
                skip_ref_pic_list_modification(r)?;
            }
        }

        if (pps.weighted_pred_flag && matches!(family, SliceFamily::P | SliceFamily::Sp))
            || (pps.weighted_bipred_idc == 1 && family == SliceFamily::B)
        {
            skip_pred_weight_table(r, sps, &slice, family)?;
        }

        if nal_ref_idc != 0 {
            // dec_ref_pic_marking()
            if slice.idr_pic_flag {
                slice.no_output_of_prior_pics_flag = r.read_flag()?;
                slice.long_term_reference_flag = r.read_flag()?;
            } else {
                slice.adaptive_ref_pic_marking_mode_flag = r.read_flag()?;
                if slice.adaptive_ref_pic_marking_mode_flag {
                    skip_adaptive_ref_pic_marking(r)?;
                }
            }
        }

        if pps.entropy_coding_mode_flag && !matches!(family, SliceFamily::I | SliceFamily::Si) {
            slice.cabac_init_idc = r.read_ue()?;
        }

        slice.slice_qp_delta = r.read_se()?;

        if matches!(family, SliceFamily::Sp | SliceFamily::Si) {
            if family == SliceFamily::Sp {
                slice.sp_for_switch_flag = r.read_flag()?;
            }
            slice.slice_qs_delta = r.read_se()?;
        }

        if pps.deblocking_filter_control_present_flag {
            slice.disable_deblocking_filter_idc = r.read_ue()?;
            if slice.disable_deblocking_filter_idc != 1 {
                slice.slice_alpha_c0_offset_div2 = r.read_se()?;
                slice.slice_beta_offset_div2 = r.read_se()?;
            }
        }

        if pps.num_slice_groups_minus1 > 0 && (3..=5).contains(&pps.slice_group_map_type) {
            slice.slice_group_change_cycle =
                r.read_bits(slice_group_change_cycle_bits(sps, pps))?;
        }

        Ok(slice)
    }
}

/// Bit width of `slice_group_change_cycle`, subclause 7.3.3.
pub(crate) fn slice_group_change_cycle_bits(sps: &SpsContext, pps: &PpsContext) -> u32 {
    let pic_size_in_map_units = sps.mb_width() * (sps.pic_height_in_map_units_minus1 + 1);
    let change_rate = pps.slice_group_change_rate_minus1 + 1;
    ceil_log2(pic_size_in_map_units / change_rate + 1)
}

fn skip_ref_pic_list_modification(r: &mut BitReader) -> Result<(), ParserError> {
    loop {
        let modification_of_pic_nums_idc = r.read_ue()?;
        match modification_of_pic_nums_idc {
            0 | 1 => {
                r.read_ue()?; // abs_diff_pic_num_minus1
            }
            2 => {
                r.read_ue()?; // long_term_pic_num
            }
            3 => return Ok(()),
            _ => {
                return Err(ParserError::InvalidBitstream(
                    "modification_of_pic_nums_idc > 3",
                ));
            }
        }
    }
}

fn skip_pred_weight_table(
    r: &mut BitReader,
    sps: &SpsContext,
    slice: &SliceContext,
    family: SliceFamily,
) -> Result<(), ParserError> {
    let chroma = matches!(sps.chroma_array_type(), 1 | 2);
    r.read_ue()?; // luma_log2_weight_denom
    if chroma {
        r.read_ue()?; // chroma_log2_weight_denom
    }
    let mut skip_list = |count: u32| -> Result<(), ParserError> {
        for _ in 0..=count {
            if r.read_flag()? {
                r.read_se()?; // luma_weight
                r.read_se()?; // luma_offset
            }
            if chroma && r.read_flag()? {
                for _ in 0..4 {
                    r.read_se()?; // chroma_weight / chroma_offset
                }
            }
        }
        Ok(())
    };
    skip_list(slice.num_ref_idx_l0_active_minus1)?;
    if family == SliceFamily::B {
        skip_list(slice.num_ref_idx_l1_active_minus1)?;
    }
    Ok(())
}

fn skip_adaptive_ref_pic_marking(r: &mut BitReader) -> Result<(), ParserError> {
    loop {
        let memory_management_control_operation = r.read_ue()?;
        match memory_management_control_operation {
            0 => return Ok(()),
            1 | 4 | 5 => {
                if memory_management_control_operation != 5 {
                    r.read_ue()?;
                }
            }
            2 => {
                r.read_ue()?; // long_term_pic_num
            }
            3 => {
                r.read_ue()?; // difference_of_pic_nums_minus1
                r.read_ue()?; // long_term_frame_idx
            }
            6 => {
                r.read_ue()?; // max_long_term_frame_idx_plus1
            }
            _ => {
                return Err(ParserError::InvalidBitstream(
                    "memory_management_control_operation > 6",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bitstream::{BitReader, BitWriter};
    use crate::test_support::{sample_pps_rbsp, sample_sps_rbsp};

    use super::*;

    fn sample_contexts() -> (SpsContext, PpsContext) {
        let sps_rbsp = sample_sps_rbsp();
        let pps_rbsp = sample_pps_rbsp();
        let sps = SpsContext::parse(&mut BitReader::new(&sps_rbsp, true)).unwrap();
        let pps = PpsContext::parse(&mut BitReader::new(&pps_rbsp, true)).unwrap();
        (sps, pps)
    }

    /// An IDR slice header matching [`sample_contexts`], without the NALU
    /// header byte.
    pub(crate) fn sample_idr_slice_rbsp(first_mb_in_slice: u32) -> Vec<u8> {
        let mut buf = [0u8; 32];
        let mut w = BitWriter::new(&mut buf);
        w.write_ue(first_mb_in_slice, true).unwrap();
        w.write_ue(7, true).unwrap(); // slice_type (I, all slices)
        w.write_ue(0, true).unwrap(); // pic_parameter_set_id
        w.write_bits(10, 0, true).unwrap(); // frame_num
        w.write_ue(0, true).unwrap(); // idr_pic_id
        w.write_bits(1, 0, true).unwrap(); // no_output_of_prior_pics_flag
        w.write_bits(1, 0, true).unwrap(); // long_term_reference_flag
        w.write_se(0, true).unwrap(); // slice_qp_delta
        w.write_ue(0, true).unwrap(); // disable_deblocking_filter_idc
        w.write_se(0, true).unwrap(); // slice_alpha_c0_offset_div2
        w.write_se(0, true).unwrap(); // slice_beta_offset_div2
        // a single skipped macroblock stands in for slice data
        w.write_ue(0, true).unwrap();
        w.write_rbsp_trailing_bits().unwrap();
        let len = w.len();
        buf[..len].to_vec()
    }

    #[test]
    fn parses_idr_slice_header() {
        let (sps, pps) = sample_contexts();
        let rbsp = sample_idr_slice_rbsp(0);
        let slice =
            SliceContext::parse(&mut BitReader::new(&rbsp, true), &sps, &pps, 3, 5).unwrap();

        assert_eq!(slice.first_mb_in_slice, 0);
        assert_eq!(slice.family(), SliceFamily::I);
        assert!(slice.idr_pic_flag);
        assert_eq!(slice.frame_num, 0);
        assert_eq!(slice.idr_pic_id, 0);
        assert_eq!(slice.disable_deblocking_filter_idc, 0);
    }

    #[test]
    fn parses_p_slice_header() {
        let (sps, pps) = sample_contexts();

        let mut buf = [0u8; 32];
        let mut w = BitWriter::new(&mut buf);
        w.write_ue(100, true).unwrap(); // first_mb_in_slice
        w.write_ue(5, true).unwrap(); // slice_type (P, all slices)
        w.write_ue(0, true).unwrap(); // pic_parameter_set_id
        w.write_bits(10, 7, true).unwrap(); // frame_num
        w.write_bits(1, 0, true).unwrap(); // num_ref_idx_active_override_flag
        w.write_bits(1, 0, true).unwrap(); // ref_pic_list_modification_flag_l0
        w.write_bits(1, 0, true).unwrap(); // adaptive_ref_pic_marking_mode_flag
        w.write_se(2, true).unwrap(); // slice_qp_delta
        w.write_ue(2, true).unwrap(); // disable_deblocking_filter_idc
        w.write_rbsp_trailing_bits().unwrap();
        let len = w.len();

        let slice =
            SliceContext::parse(&mut BitReader::new(&buf[..len], true), &sps, &pps, 2, 1).unwrap();

        assert_eq!(slice.first_mb_in_slice, 100);
        assert_eq!(slice.family(), SliceFamily::P);
        assert!(!slice.idr_pic_flag);
        assert_eq!(slice.frame_num, 7);
        assert_eq!(slice.slice_qp_delta, 2);
        assert_eq!(slice.disable_deblocking_filter_idc, 2);
    }
}
