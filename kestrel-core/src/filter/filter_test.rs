//! End-to-end assembly scenarios, driven synchronously against the filter
//! and the pools (no output thread involved).

use bytes::Bytes;
use kestrel_h264::bitstream::BitWriter;
use kestrel_h264::parser::{H264Parser, ParserConfig, find_nalu};
use kestrel_h264::writer::WriterConfig;
use kestrel_h264::{H264Writer, NaluType, SliceFamily, START_CODE};

use crate::config::ReceiverConfig;
use crate::error::ReceiverError;
use crate::fifo::{AuFifo, AuFifoConfig, AuSyncType, MbStatus, NaluFifo, QueueId};
use crate::telemetry::tests::streaming_sei_payload;

use super::{H264Filter, InputNalu, Pools};

fn make_pipeline(config: ReceiverConfig) -> (H264Filter, Pools, QueueId) {
    let mut au = AuFifo::new(&AuFifoConfig {
        item_count: config.au_fifo_item_count,
        buffer_count: config.au_fifo_buffer_count,
        payload_buffer_size: config.au_buffer_size,
        metadata_buffer_size: config.metadata_buffer_size,
        user_data_buffer_size: config.user_data_buffer_size,
    });
    let queue = au.add_queue();
    let nalu = NaluFifo::new(config.nalu_fifo_size);
    let mut filter = H264Filter::new(config);
    filter.set_running(true);
    (filter, Pools { nalu, au }, queue)
}

fn annexb(header: u8, rbsp: &[u8]) -> Bytes {
    let mut data = START_CODE.to_vec();
    data.push(header);
    data.extend_from_slice(rbsp);
    Bytes::from(data)
}

/// Baseline 1280x720 SPS: 80x45 macroblocks.
fn sps_nalu() -> Bytes {
    let mut buf = [0u8; 64];
    let mut w = BitWriter::new(&mut buf);
    w.write_bits(8, 66, true).unwrap(); // profile_idc
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
    annexb(0x67, &buf[..len])
}

fn pps_nalu() -> Bytes {
    let mut buf = [0u8; 32];
    let mut w = BitWriter::new(&mut buf);
    w.write_ue(0, true).unwrap(); // pic_parameter_set_id
    w.write_ue(0, true).unwrap(); // seq_parameter_set_id
    w.write_bits(1, 0, true).unwrap(); // entropy_coding_mode_flag
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
    annexb(0x68, &buf[..len])
}

/// One IDR slice header (plus a token of slice data) at `first_mb_in_slice`.
fn idr_slice_nalu(first_mb_in_slice: u32) -> Bytes {
    let mut buf = [0u8; 64];
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
    w.write_ue(0, true).unwrap(); // stand-in slice data
    w.write_rbsp_trailing_bits().unwrap();
    let len = w.len();
    annexb(0x65, &buf[..len])
}

/// One P slice header at `first_mb_in_slice`.
fn p_slice_nalu(first_mb_in_slice: u32, frame_num: u32) -> Bytes {
    let mut buf = [0u8; 64];
    let mut w = BitWriter::new(&mut buf);
    w.write_ue(first_mb_in_slice, true).unwrap();
    w.write_ue(5, true).unwrap(); // slice_type (P, all slices)
    w.write_ue(0, true).unwrap(); // pic_parameter_set_id
    w.write_bits(10, frame_num, true).unwrap();
    w.write_bits(1, 0, true).unwrap(); // num_ref_idx_active_override_flag
    w.write_bits(1, 0, true).unwrap(); // ref_pic_list_modification_flag_l0
    w.write_bits(1, 0, true).unwrap(); // adaptive_ref_pic_marking_mode_flag
    w.write_se(0, true).unwrap(); // slice_qp_delta
    w.write_ue(0, true).unwrap(); // disable_deblocking_filter_idc
    w.write_se(0, true).unwrap();
    w.write_se(0, true).unwrap();
    w.write_ue(0, true).unwrap(); // stand-in slice data
    w.write_rbsp_trailing_bits().unwrap();
    let len = w.len();
    annexb(0x41, &buf[..len])
}

/// A non-IDR I slice (intra refresh without IDR signalling).
fn i_slice_nonidr_nalu(first_mb_in_slice: u32, frame_num: u32) -> Bytes {
    let mut buf = [0u8; 64];
    let mut w = BitWriter::new(&mut buf);
    w.write_ue(first_mb_in_slice, true).unwrap();
    w.write_ue(7, true).unwrap(); // slice_type (I, all slices)
    w.write_ue(0, true).unwrap(); // pic_parameter_set_id
    w.write_bits(10, frame_num, true).unwrap();
    w.write_bits(1, 0, true).unwrap(); // adaptive_ref_pic_marking_mode_flag
    w.write_se(0, true).unwrap(); // slice_qp_delta
    w.write_ue(0, true).unwrap(); // disable_deblocking_filter_idc
    w.write_se(0, true).unwrap();
    w.write_se(0, true).unwrap();
    w.write_ue(0, true).unwrap(); // stand-in slice data
    w.write_rbsp_trailing_bits().unwrap();
    let len = w.len();
    annexb(0x41, &buf[..len])
}

fn streaming_sei_nalu(index_in_gop: u8, slice_mb_count: &[u16]) -> Bytes {
    let payload = streaming_sei_payload(index_in_gop, slice_mb_count);
    let mut writer = H264Writer::new(WriterConfig::default());
    let mut out = vec![0u8; 1024];
    let size = writer.write_sei_nalu(&payload, &mut out).unwrap();
    out.truncate(size);
    Bytes::from(out)
}

struct Input {
    data: Bytes,
    ts: u64,
    first: bool,
    last: bool,
    missing_before: u32,
}

impl Input {
    fn new(data: Bytes, ts: u64) -> Self {
        Self {
            data,
            ts,
            first: false,
            last: false,
            missing_before: 0,
        }
    }

    fn first(mut self) -> Self {
        self.first = true;
        self
    }

    fn last(mut self) -> Self {
        self.last = true;
        self
    }

    fn missing_before(mut self, missing: u32) -> Self {
        self.missing_before = missing;
        self
    }
}

fn push(filter: &mut H264Filter, pools: &mut Pools, input: Input) -> Result<(), ReceiverError> {
    filter.push_nalu(
        pools,
        InputNalu {
            data: input.data,
            au_timestamp: input.ts,
            au_timestamp_shifted: input.ts + 777,
            is_first_in_au: input.first,
            is_last_in_au: input.last,
            missing_packets_before: input.missing_before,
            ..Default::default()
        },
    )
}

#[derive(Debug)]
struct CapturedAu {
    payload: Vec<u8>,
    sync_type: AuSyncType,
    incomplete: bool,
    ext_rtp_timestamp: u64,
    nalu_count: usize,
    user_data: Vec<u8>,
    mb_status: Vec<u8>,
}

impl CapturedAu {
    /// Splits the payload back into (type, bytes) per NALU.
    fn nalus(&self) -> Vec<(NaluType, &[u8])> {
        let mut out = Vec::new();
        let mut from = 0;
        while let Some(range) = find_nalu(&self.payload, from) {
            out.push((
                NaluType::from_id(self.payload[range.start]),
                &self.payload[range.start..range.end],
            ));
            from = range.end;
        }
        out
    }
}

fn drain(pools: &mut Pools, queue: QueueId) -> Vec<CapturedAu> {
    let mut out = Vec::new();
    while let Some(item) = pools.au.dequeue(queue) {
        let au = pools.au.au(item).clone();
        let buffer = au.buffer.expect("queued AU has a buffer");
        let record = pools.au.buffer(buffer);
        out.push(CapturedAu {
            payload: record.payload[..au.au_size].to_vec(),
            sync_type: au.sync_type,
            incomplete: au.incomplete,
            ext_rtp_timestamp: au.ext_rtp_timestamp,
            nalu_count: au.nalus.count,
            user_data: record.user_data[..au.user_data_size].to_vec(),
            mb_status: record.mb_status[..au.mb_status_size].to_vec(),
        });
        pools.au.release_item(&mut pools.nalu, item);
    }
    out
}

/// Re-parses one slice NALU (start code included) against the test SPS/PPS.
fn parse_slice(nalu: &[u8]) -> kestrel_h264::parser::SliceInfo {
    let mut parser = H264Parser::new(ParserConfig::default());
    for setup in [&sps_nalu()[4..], &pps_nalu()[4..], &nalu[4..]] {
        parser.setup_nalu(setup);
        parser.parse_nalu().unwrap();
    }
    *parser.slice_info().expect("a slice NALU")
}

#[test]
fn basic_sync_produces_one_idr_au() {
    let (mut filter, mut pools, queue) = make_pipeline(ReceiverConfig::default());

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let au = &aus[0];
    assert_eq!(au.sync_type, AuSyncType::Idr);
    assert!(!au.incomplete);
    assert_eq!(au.ext_rtp_timestamp, 1000);
    assert_eq!(au.nalu_count, 3);
    assert_eq!(
        au.payload.len(),
        sps_nalu().len() + pps_nalu().len() + idr_slice_nalu(0).len()
    );
    let types: Vec<_> = au.nalus().iter().map(|(t, _)| *t).collect();
    assert_eq!(types, vec![NaluType::Sps, NaluType::Pps, NaluType::SliceIdr]);
}

#[test]
fn filtered_out_parameter_sets_shrink_the_au() {
    let config = ReceiverConfig {
        filter_out_sps_pps: true,
        filter_out_sei: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(0, &[3600]), 1000),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let au = &aus[0];
    assert_eq!(au.nalu_count, 1);
    assert_eq!(au.payload.len(), idr_slice_nalu(0).len());
    // the SEI was still decoded before being filtered out
    assert!(!au.user_data.is_empty());
}

#[test]
fn gray_i_seed_precedes_the_real_stream() {
    let config = ReceiverConfig {
        generate_first_gray_i_frame: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 5000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 5000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 5000).last()).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 2);

    let seed = &aus[0];
    assert_eq!(seed.sync_type, AuSyncType::Idr);
    assert_eq!(seed.ext_rtp_timestamp, 4999);
    let seed_nalus = seed.nalus();
    assert_eq!(seed_nalus.len(), 3);
    assert_eq!(seed_nalus[0].0, NaluType::Sps);
    assert_eq!(seed_nalus[1].0, NaluType::Pps);
    assert_eq!(seed_nalus[2].0, NaluType::SliceIdr);
    let gray = parse_slice(seed_nalus[2].1);
    assert_eq!(gray.first_mb_in_slice, 0);
    assert_eq!(gray.family, SliceFamily::I);
    assert!(gray.idr);
    // every macroblock of the seed is concealment
    assert!(
        seed.mb_status
            .iter()
            .all(|&status| status == MbStatus::MissingConcealed as u8)
    );

    let real = &aus[1];
    assert_eq!(real.ext_rtp_timestamp, 5000);
    assert_eq!(real.sync_type, AuSyncType::Idr);
    assert_eq!(filter.stats.gray_i_frame_count, 1);
}

#[test]
fn mid_au_loss_is_concealed_with_a_skipped_p_slice() {
    let config = ReceiverConfig {
        generate_skipped_p_slices: true,
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(0, &[100, 100, 100, 100]), 1000),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(100), 1000)).unwrap();
    // slice at 200 lost; the one at 300 arrives with a gap flagged
    push(
        &mut filter,
        &mut pools,
        Input::new(idr_slice_nalu(300), 1000).missing_before(1).last(),
    )
    .unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let au = &aus[0];
    assert!(au.incomplete);
    assert_eq!(au.sync_type, AuSyncType::Idr);

    let nalus = au.nalus();
    let types: Vec<_> = nalus.iter().map(|(t, _)| *t).collect();
    assert_eq!(
        types,
        vec![
            NaluType::Sps,
            NaluType::Pps,
            NaluType::Sei,
            NaluType::SliceIdr,
            NaluType::SliceIdr,
            NaluType::SliceNonIdr, // the synthesized slice, before its trigger
            NaluType::SliceIdr,
        ]
    );

    let synth = parse_slice(nalus[5].1);
    assert_eq!(synth.first_mb_in_slice, 200);
    assert_eq!(synth.family, SliceFamily::P);

    // macroblock status: 0..200 valid, 200..300 concealed, 300..400 valid
    assert!(au.mb_status[..200]
        .iter()
        .all(|&s| s == MbStatus::ValidISlice as u8));
    assert!(au.mb_status[200..300]
        .iter()
        .all(|&s| s == MbStatus::MissingConcealed as u8));
    assert!(au.mb_status[300..400]
        .iter()
        .all(|&s| s == MbStatus::ValidISlice as u8));

    assert_eq!(filter.stats.concealed_slice_count, 1);
    assert_eq!(filter.stats.incomplete_au_count, 1);
}

#[test]
fn every_gap_of_a_frame_is_concealed_in_order() {
    // 5 slices of [100, 100, 100, 100, 96] macroblocks; slices 1 and 3 are
    // lost. The assembled AU must interleave replacements at the right spots.
    let config = ReceiverConfig {
        generate_skipped_p_slices: true,
        output_incomplete_au: true,
        filter_out_sps_pps: true,
        filter_out_sei: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(0, &[100, 100, 100, 100, 96]), 1000),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000)).unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(idr_slice_nalu(200), 1000).missing_before(1),
    )
    .unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(idr_slice_nalu(400), 1000).missing_before(1).last(),
    )
    .unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let au = &aus[0];
    assert!(au.incomplete);
    assert_eq!(au.nalu_count, 5);

    let nalus = au.nalus();
    let slices: Vec<_> = nalus
        .iter()
        .map(|(nalu_type, bytes)| {
            let info = parse_slice(bytes);
            (*nalu_type, info.first_mb_in_slice, info.family)
        })
        .collect();
    assert_eq!(
        slices,
        vec![
            (NaluType::SliceIdr, 0, SliceFamily::I),
            (NaluType::SliceNonIdr, 100, SliceFamily::P),
            (NaluType::SliceIdr, 200, SliceFamily::I),
            (NaluType::SliceNonIdr, 300, SliceFamily::P),
            (NaluType::SliceIdr, 400, SliceFamily::I),
        ]
    );
    assert_eq!(filter.stats.concealed_slice_count, 2);
}

#[test]
fn missing_tail_is_filled_on_close() {
    let config = ReceiverConfig {
        generate_skipped_p_slices: true,
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();
    drain(&mut pools, queue);

    // P frame in 4 slices of 900 macroblocks; the last one never arrives
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(1, &[900, 900, 900, 900]), 2000).first(),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 1), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(900, 1), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(1800, 1), 2000)).unwrap();
    // the next frame closes the previous one
    push(
        &mut filter,
        &mut pools,
        Input::new(p_slice_nalu(0, 2), 3000).first().missing_before(2),
    )
    .unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let au = &aus[0];
    assert_eq!(au.ext_rtp_timestamp, 2000);
    assert!(au.incomplete);

    let nalus = au.nalus();
    assert_eq!(nalus.len(), 5); // SEI + 3 real slices + tail fill
    let tail = parse_slice(nalus[4].1);
    assert_eq!(tail.first_mb_in_slice, 2700);
    assert_eq!(tail.family, SliceFamily::P);
    assert!(au.mb_status[2700..3600]
        .iter()
        .all(|&s| s == MbStatus::MissingConcealed as u8));
}

#[test]
fn timestamp_change_closes_the_access_unit() {
    let config = ReceiverConfig {
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 900).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 900)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 900).last()).unwrap();
    drain(&mut pools, queue);

    // no markers at all: the boundary comes from the timestamps alone
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 1), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(1800, 1), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 2), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(1800, 2), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 3), 3000)).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 2);
    assert_eq!(aus[0].ext_rtp_timestamp, 1000);
    assert_eq!(aus[0].nalu_count, 2);
    assert_eq!(aus[1].ext_rtp_timestamp, 2000);
    assert_eq!(aus[1].nalu_count, 2);
}

#[test]
fn equal_timestamps_with_first_marker_still_split() {
    let config = ReceiverConfig {
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 900).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 900)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 900).last()).unwrap();
    drain(&mut pools, queue);

    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 1), 1000)).unwrap();
    // same timestamp, but the RTP layer marks a new AU: the marker dominates
    push(
        &mut filter,
        &mut pools,
        Input::new(p_slice_nalu(0, 2), 1000).first(),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 3), 2000)).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 2);
    assert_eq!(aus[0].nalu_count, 1);
    assert_eq!(aus[1].nalu_count, 1);
}

#[test]
fn resync_request_rearms_gray_seeding() {
    let config = ReceiverConfig {
        generate_first_gray_i_frame: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();
    assert_eq!(drain(&mut pools, queue).len(), 2); // seed + real AU

    // the consumer saw a decoding error downstream
    filter.request_resync();

    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 2000).first().last()).unwrap();
    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 2);
    assert_eq!(aus[0].ext_rtp_timestamp, 1999); // a fresh seed
    assert_eq!(aus[1].ext_rtp_timestamp, 2000);

    assert_eq!(filter.stats.resync_count, 1);
    assert_eq!(filter.stats.gray_i_frame_count, 2);
}

#[test]
fn fan_out_duplicates_to_every_registered_queue() {
    let (mut filter, mut pools, queue) = make_pipeline(ReceiverConfig::default());
    // a second consumer, the way a re-sender would attach
    let second_queue = pools.au.add_queue();

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();

    let first = drain(&mut pools, queue);
    let second = drain(&mut pools, second_queue);
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].payload, second[0].payload);
    assert_eq!(first[0].nalu_count, second[0].nalu_count);

    // both copies released their reference; only the current AU holds one
    assert_eq!(
        pools.au.free_buffer_count(),
        ReceiverConfig::default().au_fifo_buffer_count - 1
    );
}

#[test]
fn sync_type_classification_without_idr() {
    let config = ReceiverConfig {
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();
    drain(&mut pools, queue);

    // an all-I picture without IDR signalling
    push(
        &mut filter,
        &mut pools,
        Input::new(i_slice_nonidr_nalu(0, 1), 2000).first().last(),
    )
    .unwrap();
    // a P picture opening a periodic-intra-refresh cycle
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(0, &[3600]), 3000).first(),
    )
    .unwrap();
    push(&mut filter, &mut pools, Input::new(p_slice_nalu(0, 2), 3000).last()).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 2);
    assert_eq!(aus[0].sync_type, AuSyncType::IFrame);
    assert_eq!(aus[1].sync_type, AuSyncType::PirStart);
}

#[test]
fn nalu_pool_exhaustion_drops_the_overflow() {
    let config = ReceiverConfig {
        nalu_fifo_size: 4,
        output_incomplete_au: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();
    drain(&mut pools, queue);

    // five slices into a 4-item pool: the fifth is dropped
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 2000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(100), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(200), 2000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(300), 2000)).unwrap();
    assert_eq!(
        push(
            &mut filter,
            &mut pools,
            Input::new(idr_slice_nalu(400), 2000).last()
        ),
        Err(ReceiverError::QueueFull)
    );

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    assert_eq!(aus[0].nalu_count, 4);
    let expected: usize = (0..4).map(|i| idr_slice_nalu(i * 100).len()).sum();
    assert_eq!(aus[0].payload.len(), expected);
    assert_eq!(filter.stats.dropped_nalu_count, 1);
}

#[test]
fn incomplete_aus_are_dropped_unless_allowed() {
    let (mut filter, mut pools, queue) = make_pipeline(ReceiverConfig::default());

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();
    drain(&mut pools, queue);

    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 2000).first()).unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(idr_slice_nalu(200), 2000).missing_before(1).last(),
    )
    .unwrap();

    assert!(drain(&mut pools, queue).is_empty());
    assert_eq!(filter.stats.dropped_au_count, 1);
    assert_eq!(filter.stats.incomplete_au_count, 1);
}

#[test]
fn length_prefix_rewriting_replaces_start_codes() {
    let config = ReceiverConfig {
        replace_start_codes_with_nalu_size: true,
        ..Default::default()
    };
    let (mut filter, mut pools, queue) = make_pipeline(config);

    push(&mut filter, &mut pools, Input::new(sps_nalu(), 1000).first()).unwrap();
    push(&mut filter, &mut pools, Input::new(pps_nalu(), 1000)).unwrap();
    push(&mut filter, &mut pools, Input::new(idr_slice_nalu(0), 1000).last()).unwrap();

    let aus = drain(&mut pools, queue);
    assert_eq!(aus.len(), 1);
    let payload = &aus[0].payload;

    // walk the AU by length prefixes instead of start codes
    let mut offset = 0;
    let mut sizes = Vec::new();
    while offset < payload.len() {
        let size =
            u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
        sizes.push(size);
        offset += 4 + size;
    }
    assert_eq!(offset, payload.len());
    assert_eq!(
        sizes,
        vec![
            sps_nalu().len() - 4,
            pps_nalu().len() - 4,
            idr_slice_nalu(0).len() - 4
        ]
    );
}

#[test]
fn unsynced_aus_are_dropped_when_waiting_for_sync() {
    // no SPS/PPS at all: non-VCL NALUs still assemble into AUs, but nothing
    // is emitted while the sync gate is closed
    let (mut filter, mut pools, queue) = make_pipeline(ReceiverConfig::default());

    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(0, &[3600]), 1000).first().last(),
    )
    .unwrap();
    push(
        &mut filter,
        &mut pools,
        Input::new(streaming_sei_nalu(1, &[3600]), 2000).first().last(),
    )
    .unwrap();

    assert!(drain(&mut pools, queue).is_empty());
    assert_eq!(filter.stats.dropped_au_count, 2);
}
