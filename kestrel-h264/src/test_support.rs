//! Hand-assembled NALUs shared by the parser and writer tests.

use crate::bitstream::BitWriter;

/// RBSP of a baseline-profile 1280x720 SPS (80x45 macroblocks), CAVLC,
/// `pic_order_cnt_type = 2`, `log2_max_frame_num = 10`.
pub(crate) fn sample_sps_rbsp() -> Vec<u8> {
    let mut buf = [0u8; 64];
    let mut w = BitWriter::new(&mut buf);
    w.write_bits(8, 66, true).unwrap(); // profile_idc (baseline)
    w.write_bits(8, 0xc0, true).unwrap(); // constraint flags
    w.write_bits(8, 31, true).unwrap(); // level_idc
    w.write_ue(0, true).unwrap(); // seq_parameter_set_id
    w.write_ue(6, true).unwrap(); // log2_max_frame_num_minus4
    w.write_ue(2, true).unwrap(); // pic_order_cnt_type
    w.write_ue(1, true).unwrap(); // max_num_ref_frames
    w.write_bits(1, 0, true).unwrap(); // gaps_in_frame_num_value_allowed_flag
    w.write_ue(79, true).unwrap(); // pic_width_in_mbs_minus1
    w.write_ue(44, true).unwrap(); // pic_height_in_map_units_minus1
    w.write_bits(1, 1, true).unwrap(); // frame_mbs_only_flag
    w.write_bits(1, 1, true).unwrap(); // direct_8x8_inference_flag
    w.write_bits(1, 0, true).unwrap(); // frame_cropping_flag
    w.write_bits(1, 0, true).unwrap(); // vui_parameters_present_flag
    w.write_rbsp_trailing_bits().unwrap();
    let len = w.len();
    buf[..len].to_vec()
}

/// RBSP of a CAVLC PPS with deblocking control present.
pub(crate) fn sample_pps_rbsp() -> Vec<u8> {
    let mut buf = [0u8; 32];
    let mut w = BitWriter::new(&mut buf);
    w.write_ue(0, true).unwrap(); // pic_parameter_set_id
    w.write_ue(0, true).unwrap(); // seq_parameter_set_id
    w.write_bits(1, 0, true).unwrap(); // entropy_coding_mode_flag (CAVLC)
    w.write_bits(1, 0, true).unwrap(); // bottom_field_pic_order_in_frame_present_flag
    w.write_ue(0, true).unwrap(); // num_slice_groups_minus1
    w.write_ue(0, true).unwrap(); // num_ref_idx_l0_default_active_minus1
    w.write_ue(0, true).unwrap(); // num_ref_idx_l1_default_active_minus1
    w.write_bits(1, 0, true).unwrap(); // weighted_pred_flag
    w.write_bits(2, 0, true).unwrap(); // weighted_bipred_idc
    w.write_se(0, true).unwrap(); // pic_init_qp_minus26
    w.write_se(0, true).unwrap(); // pic_init_qs_minus26
    w.write_se(0, true).unwrap(); // chroma_qp_index_offset
    w.write_bits(1, 1, true).unwrap(); // deblocking_filter_control_present_flag
    w.write_bits(1, 0, true).unwrap(); // constrained_intra_pred_flag
    w.write_bits(1, 0, true).unwrap(); // redundant_pic_cnt_present_flag
    w.write_rbsp_trailing_bits().unwrap();
    let len = w.len();
    buf[..len].to_vec()
}
