//! Loss concealment: skipped-P gap filling and gray-IDR seeding.
//!
//! The streaming-info slice map is the oracle: for any arriving slice it
//! tells which macroblocks should have preceded it, so a gap flagged by the
//! RTP layer can be translated into an exact macroblock range and covered
//! with a synthesized skipped-P slice.

use kestrel_h264::{NaluType, WriterError, START_CODE_LENGTH};
use tracing::{debug, warn};

use crate::fifo::{AccessUnit, AuSyncType, BufferId, MbStatus, NaluItemId, NaluList};

use super::{H264Filter, InputNalu, Pools};

#[derive(Debug)]
pub(super) enum GapOutcome {
    /// The loss is attributed to the previous AU or to non-VCL NALUs; the
    /// current AU is not affected.
    NotASliceGap,
    /// A slice was missing and a replacement now covers its macroblocks.
    Concealed,
    /// A slice is missing and nothing could be done about it.
    Unconcealed,
}

#[derive(Debug)]
pub(super) enum TailError {
    Disabled,
    NotSynced,
    NoStreamingInfo,
    NoSliceReceived,
    InconsistentSliceMap,
    Synthesis(SynthesisError),
}

#[derive(Debug)]
pub(super) enum SynthesisError {
    Writer(WriterError),
    PoolExhausted,
}

#[derive(Debug)]
pub(super) enum GrayError {
    /// No slice context or picture dimensions yet.
    NotReady,
    Writer(WriterError),
    /// No free buffer or descriptor slot; the seed stays pending.
    PoolExhausted,
}

/// Timestamps stamped onto a synthesized NALU descriptor.
#[derive(Debug, Clone, Copy)]
struct NaluStamp {
    ext_rtp_timestamp: u64,
    ntp_timestamp_local: u64,
    rtp_timestamp: u32,
    input_timestamp: u64,
}

impl H264Filter {
    /// Reacts to `missing_packets_before` on an incoming NALU. Any confirmed
    /// slice gap marks the AU incomplete, concealed or not.
    pub(super) fn handle_missing_packets(
        &mut self,
        pools: &mut Pools,
        nalu_type: Option<NaluType>,
        is_first_in_au: bool,
    ) {
        match self.fill_missing_slices(pools, nalu_type, is_first_in_au) {
            GapOutcome::NotASliceGap => {}
            GapOutcome::Concealed | GapOutcome::Unconcealed => {
                self.cur.incomplete = true;
            }
        }
    }

    fn fill_missing_slices(
        &mut self,
        pools: &mut Pools,
        nalu_type: Option<NaluType>,
        is_first_in_au: bool,
    ) -> GapOutcome {
        if is_first_in_au {
            debug!("Missing packets attributed to the previous access unit");
            self.reset_slice_walk_if_at_frame_start();
            return GapOutcome::NotASliceGap;
        }
        if !nalu_type.is_some_and(NaluType::is_vcl) || self.cur.current_slice_first_mb == Some(0)
        {
            debug!("Missing packets were probably parameter sets or SEI");
            self.reset_slice_walk_if_at_frame_start();
            return GapOutcome::NotASliceGap;
        }

        if !self.config.generate_skipped_p_slices {
            return GapOutcome::Unconcealed;
        }
        if !self.is_synced() {
            return GapOutcome::Unconcealed;
        }
        if self.cur.streaming_info.is_none() && self.cur.slices_received {
            debug!("Streaming info is not available, cannot conceal");
            return GapOutcome::Unconcealed;
        }

        let (first_mb, missing_mbs) = match self.cur.previous_slice_index {
            // nothing received yet: the hole extends from the frame start to
            // the current slice, no slice map needed
            None => match self.cur.current_slice_first_mb {
                Some(first_mb) if first_mb > 0 => (0, first_mb),
                _ => return GapOutcome::Unconcealed,
            },
            Some(index) => {
                let Some(&count) = self.streaming_slice_mb_count.get(index) else {
                    warn!("Slice map does not cover slice index {index}");
                    return GapOutcome::Unconcealed;
                };
                let boundary = self.cur.previous_slice_first_mb + u32::from(count);
                match self.cur.current_slice_first_mb {
                    Some(first_mb) if first_mb > boundary => (boundary, first_mb - boundary),
                    _ => {
                        warn!("Slice map is inconsistent with the received slices");
                        return GapOutcome::Unconcealed;
                    }
                }
            }
        };

        match self.append_skipped_p_slice(pools, first_mb, missing_mbs) {
            Ok(()) => GapOutcome::Concealed,
            Err(err) => {
                warn!("Could not conceal {missing_mbs} missing macroblocks: {err:?}");
                GapOutcome::Unconcealed
            }
        }
    }

    /// A loss at the start of a new frame belongs to the frame before it;
    /// restart the slice walk when the current slice says so.
    fn reset_slice_walk_if_at_frame_start(&mut self) {
        if self.cur.current_slice_first_mb == Some(0) {
            self.cur.previous_slice_first_mb = 0;
            self.cur.previous_slice_index = Some(0);
        }
    }

    /// On AU close: if the last received slice did not reach the bottom of
    /// the picture, covers the remaining macroblocks with a skipped-P slice.
    /// Returns the number of concealed macroblocks, 0 when nothing was
    /// missing.
    pub(super) fn fill_missing_end_of_frame(&mut self, pools: &mut Pools) -> Result<u32, TailError> {
        if !self.config.generate_skipped_p_slices {
            return Err(TailError::Disabled);
        }
        if !self.is_synced() {
            return Err(TailError::NotSynced);
        }
        if self.cur.streaming_info.is_none() {
            return Err(TailError::NoStreamingInfo);
        }
        let Some(index) = self.cur.previous_slice_index else {
            return Err(TailError::NoSliceReceived);
        };
        let Some(&count) = self.streaming_slice_mb_count.get(index) else {
            return Err(TailError::InconsistentSliceMap);
        };

        let first_mb = self.cur.previous_slice_first_mb + u32::from(count);
        let total = self.mb_width * self.mb_height;
        if first_mb >= total {
            return Ok(0);
        }

        let missing = total - first_mb;
        self.append_skipped_p_slice(pools, first_mb, missing)
            .map_err(TailError::Synthesis)?;
        Ok(missing)
    }

    /// Synthesizes a skipped-P slice covering `[first_mb, first_mb + mb_count)`
    /// and appends it to the current access unit.
    fn append_skipped_p_slice(
        &mut self,
        pools: &mut Pools,
        first_mb: u32,
        mb_count: u32,
    ) -> Result<(), SynthesisError> {
        let size = self.write_skipped_p_nalu(first_mb, mb_count)?;

        let buffer = self.current_buffer.expect("current AU buffer present");
        let stamp = NaluStamp {
            ext_rtp_timestamp: self.cur.timestamp.unwrap_or(0),
            ntp_timestamp_local: self.cur.timestamp_shifted,
            rtp_timestamp: self.cur.rtp_timestamp,
            input_timestamp: self.epoch.elapsed().as_micros() as u64,
        };
        let mut nalus = self.cur.nalus;
        let result = append_bytes_as_nalu(
            pools,
            buffer,
            &mut self.cur.au_size,
            &mut nalus,
            &self.temp_nalu[..size],
            NaluType::SliceNonIdr,
            self.config.replace_start_codes_with_nalu_size,
            stamp,
        );
        self.cur.nalus = nalus;
        result?;

        self.mark_mb_status(first_mb, mb_count, MbStatus::MissingConcealed);
        self.stats.concealed_slice_count += 1;
        debug!(first_mb, mb_count, "Inserted a skipped-P slice");
        Ok(())
    }

    fn write_skipped_p_nalu(
        &mut self,
        first_mb: u32,
        mb_count: u32,
    ) -> Result<usize, SynthesisError> {
        let template = self
            .parser
            .slice_context()
            .cloned()
            .ok_or(SynthesisError::Writer(WriterError::NotReady))?;
        loop {
            match self.writer.write_skipped_p_slice_nalu(
                first_mb,
                mb_count,
                &template,
                &mut self.temp_nalu,
            ) {
                Err(WriterError::BufferTooSmall { needed }) => self.temp_nalu.resize(needed, 0),
                Err(err) => return Err(SynthesisError::Writer(err)),
                Ok(size) => return Ok(size),
            }
        }
    }

    /// Fabricates a complete gray IDR picture (SPS + PPS + one I slice
    /// covering the whole frame) and enqueues it with timestamps shifted one
    /// microsecond backward, so it reaches the consumer ahead of the slice
    /// that triggered it.
    pub(super) fn generate_gray_i_frame(
        &mut self,
        pools: &mut Pools,
        input: &InputNalu,
    ) -> Result<(), GrayError> {
        let mb_count = self.mb_width * self.mb_height;
        if mb_count == 0 {
            return Err(GrayError::NotReady);
        }
        let template = self
            .parser
            .slice_context()
            .cloned()
            .ok_or(GrayError::NotReady)?;

        let size = loop {
            match self
                .writer
                .write_gray_i_slice_nalu(0, mb_count, &template, &mut self.temp_nalu)
            {
                Err(WriterError::BufferTooSmall { needed }) => self.temp_nalu.resize(needed, 0),
                Err(WriterError::NotReady) => return Err(GrayError::NotReady),
                Err(err) => return Err(GrayError::Writer(err)),
                Ok(size) => break size,
            }
        };

        let Some(buffer) = pools.au.get_buffer() else {
            return Err(GrayError::PoolExhausted);
        };
        let Some(item) = pools.au.pop_free_item() else {
            pools.au.unref(buffer);
            return Err(GrayError::PoolExhausted);
        };

        let stamp = NaluStamp {
            ext_rtp_timestamp: input.au_timestamp.saturating_sub(1),
            ntp_timestamp_local: input.au_timestamp_shifted.saturating_sub(1),
            rtp_timestamp: input.rtp_timestamp,
            input_timestamp: self.epoch.elapsed().as_micros() as u64,
        };

        let mut au_size = 0usize;
        let mut nalus = NaluList::default();
        let mut parts: Vec<(&[u8], NaluType)> = Vec::with_capacity(3);
        if !self.config.filter_out_sps_pps {
            if let (Some(sps), Some(pps)) = (self.sps_nalu.as_deref(), self.pps_nalu.as_deref()) {
                parts.push((sps, NaluType::Sps));
                parts.push((pps, NaluType::Pps));
            }
        }
        parts.push((&self.temp_nalu[..size], NaluType::SliceIdr));

        for (bytes, nalu_type) in parts {
            let appended = append_bytes_as_nalu(
                pools,
                buffer,
                &mut au_size,
                &mut nalus,
                bytes,
                nalu_type,
                self.config.replace_start_codes_with_nalu_size,
                stamp,
            );
            if appended.is_err() {
                while let Some(nalu) = pools.nalu.list_pop_front(&mut nalus) {
                    pools.nalu.push_free(nalu);
                }
                pools.au.push_free_item(item);
                pools.au.unref(buffer);
                return Err(GrayError::PoolExhausted);
            }
        }

        pools.au.ensure_mb_status_capacity(buffer, mb_count as usize);
        pools.au.buffer_mut(buffer).mb_status[..mb_count as usize]
            .fill(MbStatus::MissingConcealed as u8);

        *pools.au.au_mut(item) = AccessUnit {
            buffer: Some(buffer),
            au_size,
            metadata_size: 0,
            user_data_size: 0,
            mb_status_size: mb_count as usize,
            sync_type: AuSyncType::Idr,
            incomplete: false,
            rtp_timestamp: stamp.rtp_timestamp,
            ext_rtp_timestamp: stamp.ext_rtp_timestamp,
            ntp_timestamp: stamp.ext_rtp_timestamp,
            ntp_timestamp_local: stamp.ntp_timestamp_local,
            input_timestamp: stamp.input_timestamp,
            nalus,
        };

        self.enqueue_item_to_queues(pools, item);
        self.stats.gray_i_frame_count += 1;
        debug!(mb_count, "Seeded a gray IDR picture");
        Ok(())
    }
}

/// Copies one NALU's bytes into an AU buffer and attaches a descriptor to
/// the given list. The synthetic-NALU path of [`H264Filter::append_nalu`].
#[allow(clippy::too_many_arguments)]
fn append_bytes_as_nalu(
    pools: &mut Pools,
    buffer: BufferId,
    au_size: &mut usize,
    nalus: &mut NaluList,
    bytes: &[u8],
    nalu_type: NaluType,
    replace_start_codes: bool,
    stamp: NaluStamp,
) -> Result<NaluItemId, SynthesisError> {
    let Some(item) = pools.nalu.pop_free() else {
        return Err(SynthesisError::PoolExhausted);
    };

    let offset = *au_size;
    let size = bytes.len();
    pools.au.ensure_payload_capacity(buffer, offset + size);
    let payload = &mut pools.au.buffer_mut(buffer).payload;
    payload[offset..offset + size].copy_from_slice(bytes);
    if replace_start_codes {
        let nalu_size = (size - START_CODE_LENGTH) as u32;
        payload[offset..offset + START_CODE_LENGTH].copy_from_slice(&nalu_size.to_be_bytes());
    }

    let nalu = pools.nalu.nalu_mut(item);
    nalu.nalu_type = Some(nalu_type);
    nalu.nal_ref_idc = (bytes[START_CODE_LENGTH] >> 5) & 0x3;
    nalu.payload_offset = offset;
    nalu.payload_size = size;
    nalu.input_timestamp = stamp.input_timestamp;
    nalu.ntp_timestamp = stamp.ext_rtp_timestamp;
    nalu.ntp_timestamp_local = stamp.ntp_timestamp_local;
    nalu.ext_rtp_timestamp = stamp.ext_rtp_timestamp;
    nalu.rtp_timestamp = stamp.rtp_timestamp;

    pools.nalu.list_push_back(nalus, item);
    *au_size += size;
    Ok(item)
}
