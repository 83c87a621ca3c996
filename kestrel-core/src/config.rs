/// Configuration of a [`StreamReceiver`](crate::StreamReceiver), recognized
/// at init time.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Suppress output until SPS and PPS have both been observed.
    pub wait_for_sync: bool,
    /// Emit access units that have recorded gaps.
    pub output_incomplete_au: bool,
    /// Drop SPS/PPS NALUs from emitted access units (the consumer received
    /// them through [`AuConsumer::sps_pps_ready`](crate::AuConsumer::sps_pps_ready)).
    pub filter_out_sps_pps: bool,
    /// Drop SEI NALUs from emitted access units.
    pub filter_out_sei: bool,
    /// Rewrite the 4-byte start code of every stored NALU with its big-endian
    /// payload length, the framing many hardware decoders expect.
    pub replace_start_codes_with_nalu_size: bool,
    /// Conceal missing slices with synthesized skipped-P slices.
    pub generate_skipped_p_slices: bool,
    /// After sync, fabricate one gray IDR picture ahead of the real stream so
    /// a decoder that requires a valid IDR can start immediately.
    pub generate_first_gray_i_frame: bool,

    /// Sizing hints passed through to the RTP layer; the pipeline itself does
    /// not interpret them.
    pub max_packet_size: usize,
    pub max_bitrate: u32,
    pub max_latency_ms: u32,
    pub max_network_latency_ms: u32,

    /// Capacity of the NALU descriptor pool.
    pub nalu_fifo_size: usize,
    /// Capacity of the AU item pool.
    pub au_fifo_item_count: usize,
    /// Number of AU payload buffer records.
    pub au_fifo_buffer_count: usize,
    /// Initial payload buffer size; grows on demand.
    pub au_buffer_size: usize,
    pub metadata_buffer_size: usize,
    pub user_data_buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            output_incomplete_au: false,
            filter_out_sps_pps: false,
            filter_out_sei: false,
            replace_start_codes_with_nalu_size: false,
            generate_skipped_p_slices: false,
            generate_first_gray_i_frame: false,
            max_packet_size: 1500,
            max_bitrate: 0,
            max_latency_ms: 0,
            max_network_latency_ms: 0,
            nalu_fifo_size: 512,
            au_fifo_item_count: 64,
            au_fifo_buffer_count: 16,
            au_buffer_size: 1024 * 1024,
            metadata_buffer_size: 1024,
            user_data_buffer_size: 1024,
        }
    }
}
