/// Counters of a running receiver, readable through
/// [`StreamReceiver::stats`](crate::StreamReceiver::stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Access units delivered to the consumer.
    pub output_au_count: u64,
    /// Access units assembled but never delivered, all causes combined.
    pub dropped_au_count: u64,
    /// NALUs dropped because the NALU descriptor pool was exhausted or no AU
    /// buffer was available.
    pub dropped_nalu_count: u64,
    /// Access units that had gaps recorded, whether concealed or not.
    pub incomplete_au_count: u64,
    /// Skipped-P slices synthesized to cover missing macroblocks.
    pub concealed_slice_count: u64,
    /// Gray IDR pictures fabricated after sync.
    pub gray_i_frame_count: u64,
    /// Resyncs requested by the consumer.
    pub resync_count: u64,
}
