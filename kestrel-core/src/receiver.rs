//! The stream receiver front: one coarse lock around the filter and the
//! pools, plus the application-output thread that drains the consumer queue
//! and invokes the [`AuConsumer`] callbacks with the lock dropped.
//!
//! Thread layout: the network thread (owned by the RTP layer, outside this
//! crate) calls [`NaluInput::push_nalu`]; the output thread spawned here
//! blocks on a condition variable signalled at AU enqueue. `pause` and
//! `stop` wait out an in-flight consumer callback through a second condition
//! variable paired with the `callback_in_progress` flag.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use tracing::{Level, debug, span, warn};

use crate::config::ReceiverConfig;
use crate::error::{ConsumerError, ReceiverError};
use crate::fifo::{AuFifo, AuFifoConfig, AuSyncType, NaluFifo, QueueId};
use crate::filter::{H264Filter, InputNalu, Pools};
use crate::stats::ReceiverStats;

/// Everything the consumer needs to know about a delivered access unit,
/// alongside the payload bytes.
#[derive(Debug)]
pub struct AuInfo<'a> {
    /// Bytes copied into the consumer buffer.
    pub size: usize,
    pub sync_type: AuSyncType,
    /// False when gaps were recorded while assembling this AU.
    pub complete: bool,
    pub ext_rtp_timestamp: u64,
    pub ntp_timestamp: u64,
    pub ntp_timestamp_local: u64,
    /// Opaque frame metadata from the RTP extension, empty if none.
    pub metadata: &'a [u8],
    /// Concatenated `user_data_unregistered` SEI payloads of this AU.
    pub user_data: &'a [u8],
    /// Per-macroblock status map (see [`crate::fifo::MbStatus`]), empty
    /// before sync.
    pub mb_status: &'a [u8],
}

/// The outbound callback surface of the receiver.
///
/// Callbacks run on the output thread with the receiver lock dropped; they
/// must not call back into the receiver.
pub trait AuConsumer: Send + 'static {
    /// Called once per (re)sync, before the first access unit that follows
    /// it. The parameter sets are complete Annex-B NALUs.
    fn sps_pps_ready(&mut self, sps: &[u8], pps: &[u8]);

    /// Hands out the buffer the next access unit will be copied into; its
    /// capacity bounds the copy.
    fn get_au_buffer(&mut self) -> Result<BytesMut, ConsumerError>;

    /// Delivers one access unit. Returning
    /// [`ConsumerError::ResyncRequired`] re-arms sync (and gray-IDR seeding
    /// when configured).
    fn au_ready(&mut self, buffer: BytesMut, info: AuInfo<'_>) -> Result<(), ConsumerError>;
}

struct Shared {
    filter: H264Filter,
    pools: Pools,
    output_queue: QueueId,
    running: bool,
    should_stop: bool,
    stopped: bool,
    callback_in_progress: bool,
}

struct ReceiverShared {
    state: Mutex<Shared>,
    /// Signalled on AU enqueue, start and stop.
    output_cond: Condvar,
    /// Signalled when a consumer callback returns.
    callback_cond: Condvar,
}

/// Cloneable handle the network thread uses to feed NALUs in.
#[derive(Clone)]
pub struct NaluInput {
    shared: Arc<ReceiverShared>,
}

impl NaluInput {
    /// Feeds one depacketized NALU into the assembler. An error means this
    /// NALU was dropped; the receiver keeps accepting input.
    pub fn push_nalu(&self, input: InputNalu) -> Result<(), ReceiverError> {
        push_nalu(&self.shared, input)
    }
}

fn push_nalu(shared: &ReceiverShared, input: InputNalu) -> Result<(), ReceiverError> {
    let mut guard = shared.state.lock().unwrap();
    if guard.stopped {
        return Err(ReceiverError::InvalidState);
    }
    if guard.should_stop {
        return Err(ReceiverError::Busy);
    }

    let Shared { filter, pools, .. } = &mut *guard;
    let result = filter.push_nalu(pools, input);

    let has_output = guard.pools.au.queue_len(guard.output_queue) > 0;
    drop(guard);
    if has_output {
        shared.output_cond.notify_all();
    }
    result
}

/// The receive-side pipeline front.
///
/// Owns the assembler, the pools and the output thread. The consumer is
/// moved onto the output thread at construction; `start` opens the tap.
pub struct StreamReceiver {
    shared: Arc<ReceiverShared>,
    output_thread: Option<JoinHandle<()>>,
}

impl StreamReceiver {
    pub fn new<C: AuConsumer>(
        config: ReceiverConfig,
        consumer: C,
    ) -> Result<Self, ReceiverError> {
        if config.nalu_fifo_size == 0
            || config.au_fifo_item_count == 0
            || config.au_fifo_buffer_count == 0
        {
            return Err(ReceiverError::BadParameters("pool sizes must be non-zero"));
        }

        let mut au_fifo = AuFifo::new(&AuFifoConfig {
            item_count: config.au_fifo_item_count,
            buffer_count: config.au_fifo_buffer_count,
            payload_buffer_size: config.au_buffer_size,
            metadata_buffer_size: config.metadata_buffer_size,
            user_data_buffer_size: config.user_data_buffer_size,
        });
        let output_queue = au_fifo.add_queue();

        let shared = Arc::new(ReceiverShared {
            state: Mutex::new(Shared {
                filter: H264Filter::new(config.clone()),
                pools: Pools {
                    nalu: NaluFifo::new(config.nalu_fifo_size),
                    au: au_fifo,
                },
                output_queue,
                running: false,
                should_stop: false,
                stopped: false,
                callback_in_progress: false,
            }),
            output_cond: Condvar::new(),
            callback_cond: Condvar::new(),
        });

        // rendezvous so the thread is live before the constructor returns
        let (ready_sender, ready_receiver) = crossbeam_channel::bounded(0);
        let thread_shared = shared.clone();
        let output_thread = thread::Builder::new()
            .name("kestrel AU output".to_string())
            .spawn(move || {
                let _span = span!(Level::INFO, "AU output").entered();
                ready_sender.send(()).unwrap();
                run_output_thread(&thread_shared, consumer);
                debug!("Closing the AU output thread");
            })
            .unwrap();
        ready_receiver.recv().unwrap();

        Ok(Self {
            shared,
            output_thread: Some(output_thread),
        })
    }

    /// Opens the output: the filter may reach sync and the output thread
    /// starts delivering access units.
    pub fn start(&self) -> Result<(), ReceiverError> {
        let mut guard = self.shared.state.lock().unwrap();
        if guard.stopped || guard.should_stop {
            return Err(ReceiverError::InvalidState);
        }
        guard.running = true;
        guard.filter.set_running(true);
        drop(guard);
        self.shared.output_cond.notify_all();
        Ok(())
    }

    /// Suspends output and invalidates sync; assembly keeps running so the
    /// stream can be resumed with [`start`](Self::start). Waits for an
    /// in-flight consumer callback to return.
    pub fn pause(&self) -> Result<(), ReceiverError> {
        let mut guard = self.shared.state.lock().unwrap();
        if guard.stopped || guard.should_stop {
            return Err(ReceiverError::InvalidState);
        }
        while guard.callback_in_progress {
            guard = self.shared.callback_cond.wait(guard).unwrap();
        }
        guard.running = false;
        guard.filter.set_running(false);
        guard.filter.invalidate_sync();
        debug!("Receiver paused");
        Ok(())
    }

    /// Stops the output thread, joins it, and releases every pooled
    /// resource. Idempotent.
    pub fn stop(&mut self) -> Result<(), ReceiverError> {
        {
            let mut guard = self.shared.state.lock().unwrap();
            if guard.stopped {
                return Ok(());
            }
            guard.should_stop = true;
        }
        self.shared.output_cond.notify_all();
        self.shared.callback_cond.notify_all();

        if let Some(thread) = self.output_thread.take() {
            if thread.join().is_err() {
                warn!("AU output thread panicked");
            }
        }

        let mut guard = self.shared.state.lock().unwrap();
        let Shared { filter, pools, .. } = &mut *guard;
        filter.release_current(pools);
        let flushed = pools.au.flush(&mut pools.nalu);
        pools.nalu.flush();
        guard.stopped = true;
        debug!(flushed, "Receiver stopped");
        Ok(())
    }

    /// The handle the network thread feeds NALUs through.
    pub fn nalu_input(&self) -> NaluInput {
        NaluInput {
            shared: self.shared.clone(),
        }
    }

    /// Convenience for callers that own the receiver directly.
    pub fn push_nalu(&self, input: InputNalu) -> Result<(), ReceiverError> {
        push_nalu(&self.shared, input)
    }

    /// The stored SPS and PPS NALUs, once sync has been reached.
    pub fn get_sps_pps(&self) -> Result<(Vec<u8>, Vec<u8>), ReceiverError> {
        let guard = self.shared.state.lock().unwrap();
        if !guard.filter.is_synced() {
            return Err(ReceiverError::WaitingForSync);
        }
        guard
            .filter
            .sps_pps()
            .map(|(sps, pps)| (sps.to_vec(), pps.to_vec()))
            .ok_or(ReceiverError::WaitingForSync)
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.state.lock().unwrap().filter.stats
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if self.output_thread.is_some() {
            let _ = self.stop();
        }
    }
}

/// Scalar snapshot of an AU taken under the lock, so the consumer callbacks
/// can run without it.
struct AuSnapshot {
    au_size: usize,
    sync_type: AuSyncType,
    incomplete: bool,
    ext_rtp_timestamp: u64,
    ntp_timestamp: u64,
    ntp_timestamp_local: u64,
}

fn run_output_thread<C: AuConsumer>(shared: &ReceiverShared, mut consumer: C) {
    let mut metadata = Vec::new();
    let mut user_data = Vec::new();
    let mut mb_status = Vec::new();

    loop {
        let mut guard = shared.state.lock().unwrap();
        let item = loop {
            if guard.should_stop {
                return;
            }
            if guard.running {
                let output_queue = guard.output_queue;
                if let Some(item) = guard.pools.au.dequeue(output_queue) {
                    break item;
                }
            }
            guard = shared.output_cond.wait(guard).unwrap();
        };

        let sps_pps = if guard.filter.sps_pps_pending {
            guard.filter.sps_pps_pending = false;
            guard
                .filter
                .sps_pps()
                .map(|(sps, pps)| (sps.to_vec(), pps.to_vec()))
        } else {
            None
        };

        let snapshot = {
            let au = guard.pools.au.au(item);
            AuSnapshot {
                au_size: au.au_size,
                sync_type: au.sync_type,
                incomplete: au.incomplete,
                ext_rtp_timestamp: au.ext_rtp_timestamp,
                ntp_timestamp: au.ntp_timestamp,
                ntp_timestamp_local: au.ntp_timestamp_local,
            }
        };
        {
            let au = guard.pools.au.au(item);
            let (metadata_size, user_data_size, mb_status_size) =
                (au.metadata_size, au.user_data_size, au.mb_status_size);
            let buffer_id = au.buffer.expect("delivered AU has a buffer");
            let record = guard.pools.au.buffer(buffer_id);
            metadata.clear();
            metadata.extend_from_slice(&record.metadata[..metadata_size]);
            user_data.clear();
            user_data.extend_from_slice(&record.user_data[..user_data_size]);
            mb_status.clear();
            mb_status.extend_from_slice(&record.mb_status[..mb_status_size]);
        }
        guard.callback_in_progress = true;
        drop(guard);

        if let Some((sps, pps)) = &sps_pps {
            consumer.sps_pps_ready(sps, pps);
        }

        match consumer.get_au_buffer() {
            Ok(mut out) => {
                let mut guard = shared.state.lock().unwrap();
                let size = {
                    let au = guard.pools.au.au(item);
                    let buffer_id = au.buffer.expect("delivered AU has a buffer");
                    let size = snapshot.au_size.min(out.capacity());
                    let record = guard.pools.au.buffer(buffer_id);
                    out.clear();
                    out.extend_from_slice(&record.payload[..size]);
                    size
                };
                let Shared { pools, .. } = &mut *guard;
                pools.au.release_item(&mut pools.nalu, item);
                drop(guard);

                let info = AuInfo {
                    size,
                    sync_type: snapshot.sync_type,
                    complete: !snapshot.incomplete,
                    ext_rtp_timestamp: snapshot.ext_rtp_timestamp,
                    ntp_timestamp: snapshot.ntp_timestamp,
                    ntp_timestamp_local: snapshot.ntp_timestamp_local,
                    metadata: &metadata,
                    user_data: &user_data,
                    mb_status: &mb_status,
                };
                let delivered = consumer.au_ready(out, info);

                let mut guard = shared.state.lock().unwrap();
                guard.callback_in_progress = false;
                match delivered {
                    Ok(()) => guard.filter.stats.output_au_count += 1,
                    Err(ConsumerError::ResyncRequired) => {
                        warn!("Consumer requested a resync");
                        guard.filter.request_resync();
                    }
                    Err(ConsumerError::ResourceUnavailable) => {
                        guard.filter.stats.dropped_au_count += 1;
                    }
                }
                drop(guard);
                shared.callback_cond.notify_all();
            }
            Err(err) => {
                debug!("No AU buffer from the consumer: {err}");
                let mut guard = shared.state.lock().unwrap();
                guard.callback_in_progress = false;
                guard.filter.stats.dropped_au_count += 1;
                if err == ConsumerError::ResyncRequired {
                    guard.filter.request_resync();
                }
                let Shared { pools, .. } = &mut *guard;
                pools.au.release_item(&mut pools.nalu, item);
                drop(guard);
                shared.callback_cond.notify_all();
            }
        }
    }
}
