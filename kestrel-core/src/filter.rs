//! Access-unit assembly.
//!
//! The filter receives one NAL unit at a time from the RTP receiver, groups
//! NALUs into access units on timestamp and end-of-AU boundaries, learns the
//! SPS/PPS pair to reach sync, conceals packet loss with synthesized slices
//! (see [`conceal`]) and enqueues completed access units onto every consumer
//! queue registered on the AU FIFO.
//!
//! All methods expect the receiver's single mutex to be held; the filter
//! itself holds no lock.

use std::time::Instant;

use bytes::Bytes;
use kestrel_h264::parser::{H264Parser, ParserConfig};
use kestrel_h264::writer::WriterConfig;
use kestrel_h264::{H264Writer, NaluType, SliceFamily, START_CODE, START_CODE_LENGTH};
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::error::ReceiverError;
use crate::fifo::{
    AccessUnit, AuFifo, AuItemId, AuSyncType, BufferId, MbStatus, NaluFifo, NaluList,
};
use crate::stats::ReceiverStats;
use crate::telemetry::{self, StreamingInfo};

mod conceal;

#[cfg(test)]
mod filter_test;

/// One depacketized NAL unit handed in by the RTP layer.
#[derive(Debug, Clone, Default)]
pub struct InputNalu {
    /// The NALU bytes, 4-byte Annex-B start code included.
    pub data: Bytes,
    /// Extended (64-bit) RTP timestamp of the access unit, in microseconds.
    pub au_timestamp: u64,
    /// Same timestamp aligned to the local clock.
    pub au_timestamp_shifted: u64,
    /// Latest useful delivery time on the local clock, 0 if none.
    pub timeout_timestamp: u64,
    /// Raw 32-bit RTP timestamp.
    pub rtp_timestamp: u32,
    pub is_first_in_au: bool,
    pub is_last_in_au: bool,
    /// Packets lost immediately before this NALU, after reordering.
    pub missing_packets_before: u32,
    pub importance: u32,
    pub priority: u32,
    /// Opaque frame metadata carried by the RTP extension, if any.
    pub metadata: Option<Bytes>,
}

/// The pools the filter allocates from. Owned by the receiver, guarded by
/// its mutex, and handed down on every call.
#[derive(Debug)]
pub(crate) struct Pools {
    pub nalu: NaluFifo,
    pub au: AuFifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncState {
    /// SPS or PPS still missing.
    Unsynced,
    /// Parameter sets captured; waiting for the first VCL NALU.
    SyncPending,
    Synced,
}

/// Assembly state of the access unit currently being built.
#[derive(Debug, Default)]
struct CurrentAu {
    au_size: usize,
    incomplete: bool,
    sync_type: AuSyncType,
    slices_all_i: bool,
    slices_received: bool,
    streaming_info: Option<StreamingInfo>,
    /// Index (into the streaming-info slice map) of the last received slice.
    previous_slice_index: Option<usize>,
    previous_slice_first_mb: u32,
    /// `first_mb_in_slice` of the NALU being processed, when it is a parsed
    /// slice.
    current_slice_first_mb: Option<u32>,
    timestamp: Option<u64>,
    timestamp_shifted: u64,
    rtp_timestamp: u32,
    first_nalu_input_time: u64,
    nalus: NaluList,
}

impl CurrentAu {
    fn reset() -> Self {
        Self {
            slices_all_i: true,
            ..Default::default()
        }
    }
}

pub(crate) struct H264Filter {
    config: ReceiverConfig,
    parser: H264Parser,
    writer: H264Writer,
    epoch: Instant,

    state: SyncState,
    running: bool,
    gray_pending: bool,
    /// Set when sync is (re)entered, cleared by the output thread once the
    /// consumer got its `sps_pps_ready` callback.
    pub(crate) sps_pps_pending: bool,
    sps_nalu: Option<Vec<u8>>,
    pps_nalu: Option<Vec<u8>>,
    mb_width: u32,
    mb_height: u32,

    current_buffer: Option<BufferId>,
    cur: CurrentAu,
    // staged per-AU data, copied into the pooled buffer at close
    current_user_data: Vec<u8>,
    current_metadata: Vec<u8>,
    current_mb_status: Vec<u8>,
    streaming_slice_mb_count: Vec<u16>,
    // scratch for synthesized NALUs
    temp_nalu: Vec<u8>,

    pub(crate) stats: ReceiverStats,
}

impl H264Filter {
    pub(crate) fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            parser: H264Parser::new(ParserConfig {
                extract_user_data_sei: true,
            }),
            writer: H264Writer::new(WriterConfig { nalu_prefix: true }),
            epoch: Instant::now(),
            state: SyncState::Unsynced,
            running: false,
            gray_pending: false,
            sps_pps_pending: false,
            sps_nalu: None,
            pps_nalu: None,
            mb_width: 0,
            mb_height: 0,
            current_buffer: None,
            cur: CurrentAu::reset(),
            current_user_data: Vec::new(),
            current_metadata: Vec::new(),
            current_mb_status: Vec::new(),
            streaming_slice_mb_count: Vec::new(),
            temp_nalu: vec![0; 64 * 1024],
            stats: ReceiverStats::default(),
        }
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Forgets sync without forgetting the captured parameter sets; the next
    /// NALU processed while running re-enters sync from them.
    pub(crate) fn invalidate_sync(&mut self) {
        self.state = SyncState::Unsynced;
        self.gray_pending = false;
    }

    /// Consumer-requested resync: back to waiting for the next VCL NALU,
    /// gray-I seeding re-armed.
    pub(crate) fn request_resync(&mut self) {
        if self.state != SyncState::Unsynced {
            self.state = SyncState::SyncPending;
        }
        if self.config.generate_first_gray_i_frame {
            self.gray_pending = true;
        }
        self.stats.resync_count += 1;
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.state != SyncState::Unsynced
    }

    pub(crate) fn sps_pps(&self) -> Option<(&[u8], &[u8])> {
        self.sps_nalu
            .as_deref()
            .zip(self.pps_nalu.as_deref())
    }

    /// Ingests one NAL unit. Everything happens here: AU boundary detection,
    /// parsing, sync, loss concealment, buffer accounting and enqueueing.
    ///
    /// Errors mean this NALU was dropped; the pipeline stays consistent and
    /// keeps accepting input.
    pub(crate) fn push_nalu(
        &mut self,
        pools: &mut Pools,
        input: InputNalu,
    ) -> Result<(), ReceiverError> {
        if input.data.len() <= START_CODE_LENGTH {
            if self.cur.au_size > 0 {
                self.cur.incomplete = true;
            }
            return Err(ReceiverError::BadParameters("NALU too short"));
        }
        if input.data[..START_CODE_LENGTH] != START_CODE {
            if self.cur.au_size > 0 {
                self.cur.incomplete = true;
            }
            return Err(ReceiverError::BadParameters(
                "NALU must start with the 4-byte Annex-B start code",
            ));
        }

        let input_time = self.epoch.elapsed().as_micros() as u64;

        // A new timestamp or an explicit first-NALU marker closes the access
        // unit under construction. The marker dominates: equal timestamps do
        // not keep the AU open when the RTP layer says a new one started.
        if self.cur.au_size > 0
            && (input.is_first_in_au
                || self.cur.timestamp.is_some_and(|ts| ts != input.au_timestamp))
        {
            match self.fill_missing_end_of_frame(pools) {
                Ok(0) => {}
                // a concealed tail is still a recorded gap
                Ok(_) => self.cur.incomplete = true,
                Err(err) => {
                    debug!("Access unit closed with an unfilled tail: {err:?}");
                    self.cur.incomplete = true;
                }
            }
            self.close_current_au(pools);
        }

        let (nalu_type, slice_family) = self.process_nalu(&input);

        if self.gray_pending && nalu_type.is_some_and(NaluType::is_vcl) {
            match self.generate_gray_i_frame(pools, &input) {
                Ok(()) => self.gray_pending = false,
                // keep the seed pending and retry on the next slice
                Err(err) => debug!("Gray IDR picture not generated: {err:?}"),
            }
        }
        if self.state == SyncState::SyncPending
            && !self.gray_pending
            && nalu_type.is_some_and(NaluType::is_vcl)
        {
            self.state = SyncState::Synced;
        }

        if self.current_buffer.is_none() {
            self.current_buffer = pools.au.get_buffer();
            if self.current_buffer.is_none() {
                self.stats.dropped_nalu_count += 1;
                warn!("No free AU buffer, dropping a NALU");
                return Err(ReceiverError::ResourceUnavailable);
            }
        }

        self.cur.timestamp = Some(input.au_timestamp);
        self.cur.timestamp_shifted = input.au_timestamp_shifted;
        self.cur.rtp_timestamp = input.rtp_timestamp;
        if self.cur.first_nalu_input_time == 0 {
            self.cur.first_nalu_input_time = input_time;
        }

        if input.missing_packets_before > 0 {
            self.handle_missing_packets(pools, nalu_type, input.is_first_in_au);
        }

        self.update_current_au(nalu_type, slice_family);

        let mut result = Ok(());
        if nalu_type.is_some() && !self.filtered_out(nalu_type) {
            result = self.append_nalu(pools, &input, nalu_type, input_time);
        }

        if input.is_last_in_au && self.cur.au_size > 0 {
            self.close_current_au(pools);
        }

        result
    }

    /// Releases everything the filter holds on the pools. Called on stop.
    pub(crate) fn release_current(&mut self, pools: &mut Pools) {
        while let Some(nalu) = pools.nalu.list_pop_front(&mut self.cur.nalus) {
            pools.nalu.push_free(nalu);
        }
        if let Some(buffer) = self.current_buffer.take() {
            pools.au.unref(buffer);
        }
        self.cur = CurrentAu::reset();
    }

    /// Parses the NALU and folds the result into the filter state: parameter
    /// set capture, sync, SEI telemetry, slice classification.
    fn process_nalu(&mut self, input: &InputNalu) -> (Option<NaluType>, Option<SliceFamily>) {
        self.cur.current_slice_first_mb = None;

        self.parser.setup_nalu(&input.data[START_CODE_LENGTH..]);
        let nalu_type = match self.parser.parse_nalu() {
            Ok(nalu_type) => nalu_type,
            Err(err) => {
                warn!("Dropping unparseable NALU: {err}");
                if self.cur.au_size > 0 {
                    self.cur.incomplete = true;
                }
                return (None, None);
            }
        };

        let mut slice_family = None;
        match nalu_type {
            NaluType::SliceIdr | NaluType::SliceNonIdr => {
                if nalu_type == NaluType::SliceIdr {
                    self.cur.sync_type = AuSyncType::Idr;
                }
                if self.is_synced() {
                    if let Some(info) = self.parser.slice_info() {
                        slice_family = Some(info.family);
                        if info.family == SliceFamily::P {
                            self.cur.slices_all_i = false;
                        }
                        self.cur.current_slice_first_mb = Some(info.first_mb_in_slice);
                    }
                }
            }
            NaluType::Sei => {
                if self.is_synced() {
                    self.collect_user_data_sei();
                }
            }
            NaluType::Sps => {
                if self.sps_nalu.is_none() {
                    self.sps_nalu = Some(input.data.to_vec());
                }
            }
            NaluType::Pps => {
                if self.pps_nalu.is_none() {
                    self.pps_nalu = Some(input.data.to_vec());
                }
            }
            _ => {}
        }

        self.maybe_sync();

        (Some(nalu_type), slice_family)
    }

    /// Copies the user-data SEI payloads of the just-parsed NALU into the
    /// per-AU staging buffer and picks up the streaming slice map.
    fn collect_user_data_sei(&mut self) {
        for index in 0..self.parser.user_data_sei_count() {
            let Some(payload) = self.parser.user_data_sei(index) else {
                continue;
            };
            self.current_user_data.extend_from_slice(payload);

            match telemetry::parse_streaming_info(payload, &mut self.streaming_slice_mb_count) {
                Ok(Some(info)) => self.cur.streaming_info = Some(info),
                Ok(None) => {}
                Err(err) => warn!("Ignoring malformed streaming info SEI: {err}"),
            }
        }
    }

    /// Reaches sync once both parameter sets are captured while running.
    fn maybe_sync(&mut self) {
        if !self.running
            || self.state != SyncState::Unsynced
            || self.sps_nalu.is_none()
            || self.pps_nalu.is_none()
        {
            return;
        }
        let Some((sps, pps)) = self.parser.sps_pps_context() else {
            return;
        };

        self.mb_width = sps.mb_width();
        self.mb_height = sps.mb_height();
        self.writer.set_sps_pps_context(sps.clone(), pps.clone());

        self.state = SyncState::SyncPending;
        self.sps_pps_pending = true;
        if self.config.generate_first_gray_i_frame {
            self.gray_pending = true;
        }
        info!(
            mb_width = self.mb_width,
            mb_height = self.mb_height,
            "SPS/PPS sync reached"
        );
    }

    /// Advances the slice walk over the streaming-info map and records the
    /// macroblock status of the slice being appended.
    fn update_current_au(&mut self, nalu_type: Option<NaluType>, slice_family: Option<SliceFamily>) {
        if !nalu_type.is_some_and(NaluType::is_vcl) {
            return;
        }
        self.cur.slices_received = true;

        let (Some(info), Some(current_first_mb)) =
            (self.cur.streaming_info, self.cur.current_slice_first_mb)
        else {
            return;
        };
        let slice_count = self.streaming_slice_mb_count.len().min(info.slice_count as usize);

        let mut index = match self.cur.previous_slice_index {
            Some(index) => index,
            None => {
                self.cur.previous_slice_first_mb = 0;
                0
            }
        };
        let mut first_mb = self.cur.previous_slice_first_mb;
        while index < slice_count && first_mb < current_first_mb {
            first_mb += u32::from(self.streaming_slice_mb_count[index]);
            index += 1;
        }
        self.cur.previous_slice_index = Some(index);
        self.cur.previous_slice_first_mb = current_first_mb;

        if index < slice_count {
            let status = match slice_family {
                Some(SliceFamily::I) => MbStatus::ValidISlice,
                _ => MbStatus::ValidPSlice,
            };
            let mb_count = u32::from(self.streaming_slice_mb_count[index]);
            self.mark_mb_status(current_first_mb, mb_count, status);
        }
    }

    fn mark_mb_status(&mut self, first_mb: u32, mb_count: u32, status: MbStatus) {
        let total = (self.mb_width * self.mb_height) as usize;
        if total == 0 {
            return;
        }
        if self.current_mb_status.len() < total {
            self.current_mb_status.resize(total, MbStatus::Unknown as u8);
        }
        let start = (first_mb as usize).min(total);
        let end = (first_mb as usize + mb_count as usize).min(total);
        self.current_mb_status[start..end].fill(status as u8);
    }

    fn filtered_out(&self, nalu_type: Option<NaluType>) -> bool {
        match nalu_type {
            Some(NaluType::Sps | NaluType::Pps) => self.config.filter_out_sps_pps,
            Some(NaluType::Sei) => self.config.filter_out_sei,
            _ => false,
        }
    }

    /// Copies the NALU into the current AU buffer and attaches a descriptor
    /// to the AU's NALU list.
    fn append_nalu(
        &mut self,
        pools: &mut Pools,
        input: &InputNalu,
        nalu_type: Option<NaluType>,
        input_time: u64,
    ) -> Result<(), ReceiverError> {
        let buffer = self.current_buffer.expect("AU buffer acquired above");

        let Some(item) = pools.nalu.pop_free() else {
            self.stats.dropped_nalu_count += 1;
            warn!("NALU pool exhausted, dropping a NALU");
            return Err(ReceiverError::QueueFull);
        };

        let offset = self.cur.au_size;
        let size = input.data.len();
        pools.au.ensure_payload_capacity(buffer, offset + size);
        let payload = &mut pools.au.buffer_mut(buffer).payload;
        payload[offset..offset + size].copy_from_slice(&input.data);
        if self.config.replace_start_codes_with_nalu_size {
            let nalu_size = (size - START_CODE_LENGTH) as u32;
            payload[offset..offset + 4].copy_from_slice(&nalu_size.to_be_bytes());
        }

        if let Some(metadata) = &input.metadata {
            if self.current_metadata.is_empty() {
                self.current_metadata.extend_from_slice(metadata);
            }
        }

        let nalu = pools.nalu.nalu_mut(item);
        nalu.nalu_type = nalu_type;
        nalu.nal_ref_idc = (input.data[START_CODE_LENGTH] >> 5) & 0x3;
        nalu.payload_offset = offset;
        nalu.payload_size = size;
        nalu.input_timestamp = input_time;
        nalu.timeout_timestamp = input.timeout_timestamp;
        nalu.ntp_timestamp = input.au_timestamp;
        nalu.ntp_timestamp_local = input.au_timestamp_shifted;
        nalu.ext_rtp_timestamp = input.au_timestamp;
        nalu.rtp_timestamp = input.rtp_timestamp;
        nalu.is_last_in_au = input.is_last_in_au;
        nalu.missing_packets_before = input.missing_packets_before;
        nalu.importance = input.importance;
        nalu.priority = input.priority;
        nalu.metadata = input.metadata.clone();

        let mut nalus = self.cur.nalus;
        pools.nalu.list_push_back(&mut nalus, item);
        self.cur.nalus = nalus;
        self.cur.au_size += size;

        Ok(())
    }

    /// Finalizes and enqueues the access unit under construction, then
    /// rotates to a fresh buffer. Dropped AUs (not synced, incomplete and
    /// not allowed, pool exhausted, no consumer) release their resources and
    /// reuse the current buffer.
    fn close_current_au(&mut self, pools: &mut Pools) {
        if self.cur.au_size == 0 || self.current_buffer.is_none() {
            self.reset_current_au(pools);
            return;
        }

        if self.cur.sync_type != AuSyncType::Idr {
            if self.cur.slices_all_i && self.cur.slices_received {
                self.cur.sync_type = AuSyncType::IFrame;
            } else if self.cur.streaming_info.is_some_and(|info| info.index_in_gop == 0) {
                self.cur.sync_type = AuSyncType::PirStart;
            }
        }

        if self.cur.incomplete {
            self.stats.incomplete_au_count += 1;
        }

        let cancel = if self.cur.incomplete && !self.config.output_incomplete_au {
            debug!("Access unit dropped (incomplete output is disabled)");
            true
        } else if self.config.wait_for_sync && !self.is_synced() {
            if self.running {
                debug!("Access unit dropped (waiting for sync)");
            }
            true
        } else {
            false
        };
        if cancel {
            self.stats.dropped_au_count += 1;
            self.reset_current_au(pools);
            return;
        }

        let Some(item) = pools.au.pop_free_item() else {
            self.stats.dropped_au_count += 1;
            warn!("AU pool exhausted, dropping an access unit");
            self.reset_current_au(pools);
            return;
        };

        let buffer = self.current_buffer.take().expect("checked above");
        self.stage_au_side_data(pools, buffer);

        *pools.au.au_mut(item) = AccessUnit {
            buffer: Some(buffer),
            au_size: self.cur.au_size,
            metadata_size: self.current_metadata.len(),
            user_data_size: self.current_user_data.len(),
            mb_status_size: self.current_mb_status.len(),
            sync_type: self.cur.sync_type,
            incomplete: self.cur.incomplete,
            rtp_timestamp: self.cur.rtp_timestamp,
            ext_rtp_timestamp: self.cur.timestamp.unwrap_or(0),
            ntp_timestamp: self.cur.timestamp.unwrap_or(0),
            ntp_timestamp_local: self.cur.timestamp_shifted,
            input_timestamp: self.cur.first_nalu_input_time,
            nalus: self.cur.nalus,
        };
        self.cur.nalus = NaluList::default();

        self.enqueue_item_to_queues(pools, item);

        self.current_buffer = pools.au.get_buffer();
        if self.current_buffer.is_none() {
            debug!("No free AU buffer after rotation");
        }
        self.reset_current_au(pools);
    }

    /// Copies the staged metadata, user data and macroblock status into the
    /// buffer record that is about to be handed off.
    fn stage_au_side_data(&mut self, pools: &mut Pools, buffer: BufferId) {
        if self.cur.incomplete {
            for status in self.current_mb_status.iter_mut() {
                if *status == MbStatus::Unknown as u8 {
                    *status = MbStatus::Missing as u8;
                }
            }
        }

        let record = pools.au.buffer_mut(buffer);
        if record.user_data.len() < self.current_user_data.len() {
            record.user_data.resize(self.current_user_data.len(), 0);
        }
        record.user_data[..self.current_user_data.len()]
            .copy_from_slice(&self.current_user_data);
        if record.metadata.len() < self.current_metadata.len() {
            record.metadata.resize(self.current_metadata.len(), 0);
        }
        record.metadata[..self.current_metadata.len()].copy_from_slice(&self.current_metadata);
        if record.mb_status.len() < self.current_mb_status.len() {
            record.mb_status.resize(self.current_mb_status.len(), 0);
        }
        record.mb_status[..self.current_mb_status.len()]
            .copy_from_slice(&self.current_mb_status);
    }

    /// Puts `item` on every registered queue (duplicating for all but the
    /// first) or releases it when nobody listens.
    fn enqueue_item_to_queues(&mut self, pools: &mut Pools, item: AuItemId) {
        let queues: Vec<_> = pools.au.queue_ids().collect();
        let Some((&first, rest)) = queues.split_first() else {
            debug!("No consumer queue registered, releasing the access unit");
            self.stats.dropped_au_count += 1;
            pools.au.release_item(&mut pools.nalu, item);
            return;
        };

        for &queue in rest {
            match pools.au.duplicate_item(&mut pools.nalu, item) {
                Ok(copy) => {
                    if pools.au.enqueue(queue, copy).is_err() {
                        pools.au.release_item(&mut pools.nalu, copy);
                    }
                }
                Err(err) => {
                    self.stats.dropped_au_count += 1;
                    warn!("Access unit fan-out failed: {err}");
                }
            }
        }
        if pools.au.enqueue(first, item).is_err() {
            self.stats.dropped_au_count += 1;
            pools.au.release_item(&mut pools.nalu, item);
        }
    }

    /// Resets the per-AU state; NALU descriptors of an unsent AU go back to
    /// the pool, the buffer (if any) stays current for the next AU.
    fn reset_current_au(&mut self, pools: &mut Pools) {
        let mut nalus = self.cur.nalus;
        while let Some(nalu) = pools.nalu.list_pop_front(&mut nalus) {
            pools.nalu.push_free(nalu);
        }
        self.cur = CurrentAu::reset();
        self.current_user_data.clear();
        self.current_metadata.clear();
        self.current_mb_status.clear();
        self.streaming_slice_mb_count.clear();
    }
}
