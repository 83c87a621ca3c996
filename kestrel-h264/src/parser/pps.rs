use crate::bitstream::BitReader;

use super::ParserError;

/// Parsed picture parameter set.
///
/// Parsing stops after `redundant_pic_cnt_present_flag`; the optional
/// High-profile tail (8x8 transform, picture scaling matrix) is not needed
/// to parse slice headers or to emit replacement slices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PpsContext {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub slice_group_map_type: u32,
    pub slice_group_change_direction_flag: bool,
    pub slice_group_change_rate_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u32,
    pub pic_init_qp_minus26: i32,
    pub pic_init_qs_minus26: i32,
    pub chroma_qp_index_offset: i32,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
}

impl PpsContext {
    pub(crate) fn parse(r: &mut BitReader) -> Result<Self, ParserError> {
        let mut pps = PpsContext {
            pic_parameter_set_id: r.read_ue()?,
            seq_parameter_set_id: r.read_ue()?,
            entropy_coding_mode_flag: r.read_flag()?,
            bottom_field_pic_order_in_frame_present_flag: r.read_flag()?,
            num_slice_groups_minus1: r.read_ue()?,
            ..Default::default()
        };
        if pps.pic_parameter_set_id > 255 {
            return Err(ParserError::InvalidBitstream("pic_parameter_set_id > 255"));
        }
        if pps.num_slice_groups_minus1 > 7 {
            return Err(ParserError::InvalidBitstream("num_slice_groups_minus1 > 7"));
        }

        if pps.num_slice_groups_minus1 > 0 {
            pps.slice_group_map_type = r.read_ue()?;
            match pps.slice_group_map_type {
                0 => {
                    for _ in 0..=pps.num_slice_groups_minus1 {
                        r.read_ue()?; // run_length_minus1
                    }
                }
                1 => {}
                2 => {
                    for _ in 0..pps.num_slice_groups_minus1 {
                        r.read_ue()?; // top_left
                        r.read_ue()?; // bottom_right
                    }
                }
                3..=5 => {
                    pps.slice_group_change_direction_flag = r.read_flag()?;
                    pps.slice_group_change_rate_minus1 = r.read_ue()?;
                }
                6 => {
                    let pic_size_in_map_units = r.read_ue()? + 1;
                    let id_bits = ceil_log2(pps.num_slice_groups_minus1 + 1);
                    for _ in 0..pic_size_in_map_units {
                        r.read_bits(id_bits)?; // slice_group_id
                    }
                }
                _ => return Err(ParserError::InvalidBitstream("slice_group_map_type > 6")),
            }
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue()?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue()?;
        pps.weighted_pred_flag = r.read_flag()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;
        pps.pic_init_qp_minus26 = r.read_se()?;
        pps.pic_init_qs_minus26 = r.read_se()?;
        pps.chroma_qp_index_offset = r.read_se()?;
        pps.deblocking_filter_control_present_flag = r.read_flag()?;
        pps.constrained_intra_pred_flag = r.read_flag()?;
        pps.redundant_pic_cnt_present_flag = r.read_flag()?;

        Ok(pps)
    }
}

pub(crate) fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::sample_pps_rbsp;

    use super::*;

    #[test]
    fn parses_cavlc_pps() {
        let rbsp = sample_pps_rbsp();
        let pps = PpsContext::parse(&mut BitReader::new(&rbsp, true)).unwrap();

        assert_eq!(pps.pic_parameter_set_id, 0);
        assert!(!pps.entropy_coding_mode_flag);
        assert_eq!(pps.num_slice_groups_minus1, 0);
        assert!(pps.deblocking_filter_control_present_flag);
        assert!(!pps.redundant_pic_cnt_present_flag);
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(1024), 10);
    }
}
