use crate::bitstream::BitReader;

use super::ParserError;

/// Parsed sequence parameter set.
///
/// Holds every field needed to parse the slice headers that reference this
/// SPS and to synthesize replacement slices for the same sequence. VUI
/// parameters are not retained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpsContext {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u32,
    pub bit_depth_chroma_minus8: u32,
    pub qpprime_y_zero_transform_bypass_flag: bool,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,
    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
    pub vui_parameters_present_flag: bool,
}

impl SpsContext {
    pub fn mb_width(&self) -> u32 {
        self.pic_width_in_mbs_minus1 + 1
    }

    pub fn mb_height(&self) -> u32 {
        let map_units = self.pic_height_in_map_units_minus1 + 1;
        if self.frame_mbs_only_flag {
            map_units
        } else {
            map_units * 2
        }
    }

    pub fn log2_max_frame_num(&self) -> u32 {
        self.log2_max_frame_num_minus4 + 4
    }

    pub fn log2_max_pic_order_cnt_lsb(&self) -> u32 {
        self.log2_max_pic_order_cnt_lsb_minus4 + 4
    }

    /// ChromaArrayType of subclause 7.4.2.1.1.
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub(crate) fn parse(r: &mut BitReader) -> Result<Self, ParserError> {
        let mut sps = SpsContext {
            profile_idc: r.read_bits(8)? as u8,
            constraint_flags: r.read_bits(8)? as u8,
            level_idc: r.read_bits(8)? as u8,
            seq_parameter_set_id: r.read_ue()?,
            chroma_format_idc: 1,
            ..Default::default()
        };
        if sps.seq_parameter_set_id > 31 {
            return Err(ParserError::InvalidBitstream("seq_parameter_set_id > 31"));
        }

        if matches!(
            sps.profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            sps.chroma_format_idc = r.read_ue()?;
            if sps.chroma_format_idc > 3 {
                return Err(ParserError::InvalidBitstream("chroma_format_idc > 3"));
            }
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane_flag = r.read_flag()?;
            }
            sps.bit_depth_luma_minus8 = r.read_ue()?;
            sps.bit_depth_chroma_minus8 = r.read_ue()?;
            sps.qpprime_y_zero_transform_bypass_flag = r.read_flag()?;
            if r.read_flag()? {
                // seq_scaling_matrix_present_flag
                let list_count = if sps.chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..list_count {
                    if r.read_flag()? {
                        skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        sps.log2_max_frame_num_minus4 = r.read_ue()?;
        if sps.log2_max_frame_num_minus4 > 12 {
            return Err(ParserError::InvalidBitstream("log2_max_frame_num_minus4 > 12"));
        }

        sps.pic_order_cnt_type = r.read_ue()?;
        match sps.pic_order_cnt_type {
            0 => {
                sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
                if sps.log2_max_pic_order_cnt_lsb_minus4 > 12 {
                    return Err(ParserError::InvalidBitstream(
                        "log2_max_pic_order_cnt_lsb_minus4 > 12",
                    ));
                }
            }
            1 => {
                sps.delta_pic_order_always_zero_flag = r.read_flag()?;
                sps.offset_for_non_ref_pic = r.read_se()?;
                sps.offset_for_top_to_bottom_field = r.read_se()?;
                let count = r.read_ue()?;
                if count > 255 {
                    return Err(ParserError::InvalidBitstream(
                        "num_ref_frames_in_pic_order_cnt_cycle > 255",
                    ));
                }
                sps.offset_for_ref_frame = (0..count)
                    .map(|_| r.read_se())
                    .collect::<Result<_, _>>()?;
            }
            2 => {}
            _ => return Err(ParserError::InvalidBitstream("pic_order_cnt_type > 2")),
        }

        sps.max_num_ref_frames = r.read_ue()?;
        sps.gaps_in_frame_num_value_allowed_flag = r.read_flag()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only_flag = r.read_flag()?;
        if !sps.frame_mbs_only_flag {
            sps.mb_adaptive_frame_field_flag = r.read_flag()?;
        }
        sps.direct_8x8_inference_flag = r.read_flag()?;
        sps.frame_cropping_flag = r.read_flag()?;
        if sps.frame_cropping_flag {
            sps.frame_crop_left_offset = r.read_ue()?;
            sps.frame_crop_right_offset = r.read_ue()?;
            sps.frame_crop_top_offset = r.read_ue()?;
            sps.frame_crop_bottom_offset = r.read_ue()?;
        }
        sps.vui_parameters_present_flag = r.read_flag()?;
        // VUI is not needed downstream and is left unparsed

        Ok(sps)
    }
}

fn skip_scaling_list(r: &mut BitReader, size: u32) -> Result<(), ParserError> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}
