use tracing::warn;

use super::{FifoError, NaluFifo, NaluList};

/// Index of an AU item slot inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuItemId(pub(crate) usize);

/// Index of a buffer record inside the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub(crate) usize);

/// Handle of a registered consumer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId(pub(crate) usize);

/// Minimum growth step of a payload buffer when one access unit outgrows it.
pub const AU_MIN_REALLOC_SIZE: usize = 64 * 1024;

/// How a decoder may use an access unit as a random access point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuSyncType {
    /// Not a random access point.
    #[default]
    None,
    /// IDR picture.
    Idr,
    /// All slices are I slices, without IDR signalling.
    IFrame,
    /// First picture of a periodic-intra-refresh cycle.
    PirStart,
}

/// Per-macroblock status recorded alongside an access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MbStatus {
    Unknown = 0,
    ValidISlice = 1,
    ValidPSlice = 2,
    /// Covered by a synthesized skipped-P slice.
    MissingConcealed = 3,
    Missing = 4,
}

/// Access unit descriptor: bookkeeping plus the list of contained NALUs.
///
/// The payload bytes live in the pooled [`AuBuffer`] the descriptor points
/// at; the NALUs in the list are in bitstream order and their concatenation
/// is exactly the first `au_size` bytes of that buffer.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    pub buffer: Option<BufferId>,
    pub au_size: usize,
    pub metadata_size: usize,
    pub user_data_size: usize,
    /// Macroblock count covered by the mb-status buffer, 0 if unused.
    pub mb_status_size: usize,
    pub sync_type: AuSyncType,
    /// Gaps were recorded while assembling this AU (concealed or not).
    pub incomplete: bool,
    pub rtp_timestamp: u32,
    pub ext_rtp_timestamp: u64,
    pub ntp_timestamp: u64,
    pub ntp_timestamp_local: u64,
    pub input_timestamp: u64,
    pub nalus: NaluList,
}

/// One pooled buffer record: the four byte arrays an access unit owns plus
/// the reference count that tracks fan-out.
#[derive(Debug, Default)]
pub struct AuBuffer {
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
    pub user_data: Vec<u8>,
    pub mb_status: Vec<u8>,
    ref_count: u32,
}

impl AuBuffer {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

#[derive(Debug, Default)]
struct AuItemSlot {
    au: AccessUnit,
    prev: Option<AuItemId>,
    next: Option<AuItemId>,
}

#[derive(Debug, Default)]
struct AuQueue {
    head: Option<AuItemId>,
    tail: Option<AuItemId>,
    count: usize,
}

#[derive(Debug, Clone)]
pub struct AuFifoConfig {
    pub item_count: usize,
    pub buffer_count: usize,
    pub payload_buffer_size: usize,
    pub metadata_buffer_size: usize,
    pub user_data_buffer_size: usize,
}

/// The access-unit FIFO: an item pool, a reference-counted buffer pool and a
/// registry of per-consumer queues, all sharing the same arenas.
#[derive(Debug)]
pub struct AuFifo {
    items: Vec<AuItemSlot>,
    item_free: Option<AuItemId>,
    item_free_count: usize,
    buffers: Vec<AuBufferRecord>,
    buffer_free: Option<BufferId>,
    buffer_free_count: usize,
    queues: Vec<Option<AuQueue>>,
}

#[derive(Debug, Default)]
struct AuBufferRecord {
    buffer: AuBuffer,
    next_free: Option<BufferId>,
}

impl AuFifo {
    pub fn new(config: &AuFifoConfig) -> Self {
        let mut fifo = Self {
            items: Vec::with_capacity(config.item_count),
            item_free: None,
            item_free_count: 0,
            buffers: Vec::with_capacity(config.buffer_count),
            buffer_free: None,
            buffer_free_count: 0,
            queues: Vec::new(),
        };
        for index in 0..config.item_count {
            fifo.items.push(AuItemSlot {
                next: fifo.item_free,
                ..Default::default()
            });
            fifo.item_free = Some(AuItemId(index));
            fifo.item_free_count += 1;
        }
        for index in 0..config.buffer_count {
            fifo.buffers.push(AuBufferRecord {
                buffer: AuBuffer {
                    payload: vec![0; config.payload_buffer_size],
                    metadata: vec![0; config.metadata_buffer_size],
                    user_data: vec![0; config.user_data_buffer_size],
                    mb_status: Vec::new(),
                    ref_count: 0,
                },
                next_free: fifo.buffer_free,
            });
            fifo.buffer_free = Some(BufferId(index));
            fifo.buffer_free_count += 1;
        }
        fifo
    }

    // --- queue registry ---

    pub fn add_queue(&mut self) -> QueueId {
        for (index, slot) in self.queues.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(AuQueue::default());
                return QueueId(index);
            }
        }
        self.queues.push(Some(AuQueue::default()));
        QueueId(self.queues.len() - 1)
    }

    /// Unregisters a queue, releasing anything still enqueued on it.
    pub fn remove_queue(&mut self, nalu_fifo: &mut NaluFifo, queue: QueueId) -> usize {
        let flushed = self.flush_queue(nalu_fifo, queue);
        if let Some(slot) = self.queues.get_mut(queue.0) {
            *slot = None;
        }
        flushed
    }

    pub fn queue_ids(&self) -> impl Iterator<Item = QueueId> + '_ {
        self.queues
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| QueueId(index))
    }

    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.queues
            .get(queue.0)
            .and_then(Option::as_ref)
            .map_or(0, |q| q.count)
    }

    // --- buffer pool ---

    /// Takes a buffer record off the free list with `ref_count = 1`.
    pub fn get_buffer(&mut self) -> Option<BufferId> {
        let id = self.buffer_free?;
        self.buffer_free = self.buffers[id.0].next_free;
        self.buffer_free_count -= 1;
        let record = &mut self.buffers[id.0];
        record.next_free = None;
        record.buffer.ref_count = 1;
        Some(id)
    }

    pub fn add_ref(&mut self, id: BufferId) {
        self.buffers[id.0].buffer.ref_count += 1;
    }

    /// Drops one reference; at zero the record returns to the free list.
    pub fn unref(&mut self, id: BufferId) {
        let record = &mut self.buffers[id.0];
        if record.buffer.ref_count == 0 {
            warn!("Unref of a buffer whose ref count is already zero");
            return;
        }
        record.buffer.ref_count -= 1;
        if record.buffer.ref_count == 0 {
            record.next_free = self.buffer_free;
            self.buffer_free = Some(id);
            self.buffer_free_count += 1;
        }
    }

    pub fn buffer(&self, id: BufferId) -> &AuBuffer {
        &self.buffers[id.0].buffer
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut AuBuffer {
        &mut self.buffers[id.0].buffer
    }

    pub fn free_buffer_count(&self) -> usize {
        self.buffer_free_count
    }

    /// Grows the payload buffer so `needed` bytes fit, by at least
    /// [`AU_MIN_REALLOC_SIZE`].
    pub fn ensure_payload_capacity(&mut self, id: BufferId, needed: usize) {
        let payload = &mut self.buffers[id.0].buffer.payload;
        if needed > payload.len() {
            let new_size = needed.max(payload.len() + AU_MIN_REALLOC_SIZE);
            payload.resize(new_size, 0);
        }
    }

    /// Grows the mb-status buffer to cover `mb_count` macroblocks.
    pub fn ensure_mb_status_capacity(&mut self, id: BufferId, mb_count: usize) {
        let mb_status = &mut self.buffers[id.0].buffer.mb_status;
        if mb_count > mb_status.len() {
            mb_status.resize(mb_count, MbStatus::Unknown as u8);
        }
    }

    // --- item pool ---

    pub fn pop_free_item(&mut self) -> Option<AuItemId> {
        let id = self.item_free?;
        self.item_free = self.items[id.0].next;
        self.item_free_count -= 1;
        let slot = &mut self.items[id.0];
        slot.au = AccessUnit::default();
        slot.prev = None;
        slot.next = None;
        Some(id)
    }

    pub fn push_free_item(&mut self, id: AuItemId) {
        let slot = &mut self.items[id.0];
        slot.next = self.item_free;
        slot.prev = None;
        self.item_free = Some(id);
        self.item_free_count += 1;
    }

    pub fn free_item_count(&self) -> usize {
        self.item_free_count
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn au(&self, id: AuItemId) -> &AccessUnit {
        &self.items[id.0].au
    }

    pub fn au_mut(&mut self, id: AuItemId) -> &mut AccessUnit {
        &mut self.items[id.0].au
    }

    // --- per-queue FIFO ---

    pub fn enqueue(&mut self, queue: QueueId, id: AuItemId) -> Result<(), FifoError> {
        let tail = self
            .queues
            .get(queue.0)
            .and_then(Option::as_ref)
            .ok_or(FifoError::UnknownQueue)?
            .tail;
        {
            let slot = &mut self.items[id.0];
            slot.next = None;
            slot.prev = tail;
        }
        if let Some(tail) = tail {
            self.items[tail.0].next = Some(id);
        }
        let q = self.queues[queue.0].as_mut().expect("queue checked above");
        q.tail = Some(id);
        if q.head.is_none() {
            q.head = Some(id);
        }
        q.count += 1;
        Ok(())
    }

    pub fn dequeue(&mut self, queue: QueueId) -> Option<AuItemId> {
        let id = self.queues.get(queue.0).and_then(Option::as_ref)?.head?;
        let next = self.items[id.0].next;

        let q = self.queues[queue.0].as_mut().expect("queue checked above");
        match next {
            Some(next) => {
                q.head = Some(next);
                q.count -= 1;
            }
            None => {
                q.head = None;
                q.tail = None;
                q.count = 0;
            }
        }
        if let Some(next) = next {
            self.items[next.0].prev = None;
        }
        let slot = &mut self.items[id.0];
        slot.prev = None;
        slot.next = None;
        Some(id)
    }

    /// Clones an AU item and its NALU items into fresh slots; the clone holds
    /// its own reference on the shared buffer. This is the fan-out path.
    pub fn duplicate_item(
        &mut self,
        nalu_fifo: &mut NaluFifo,
        id: AuItemId,
    ) -> Result<AuItemId, FifoError> {
        let copy_id = self.pop_free_item().ok_or(FifoError::PoolExhausted)?;

        let mut au_copy = self.items[id.0].au.clone();
        au_copy.nalus = NaluList::default();

        let source_nalus: Vec<_> = nalu_fifo.list_iter(&self.items[id.0].au.nalus).collect();
        for source in source_nalus {
            let Some(nalu_copy) = nalu_fifo.pop_free() else {
                // roll back, leaving the source item untouched
                while let Some(nalu) = nalu_fifo.list_pop_front(&mut au_copy.nalus) {
                    nalu_fifo.push_free(nalu);
                }
                self.push_free_item(copy_id);
                return Err(FifoError::PoolExhausted);
            };
            *nalu_fifo.nalu_mut(nalu_copy) = nalu_fifo.nalu(source).clone();
            nalu_fifo.list_push_back(&mut au_copy.nalus, nalu_copy);
        }

        if let Some(buffer) = au_copy.buffer {
            self.add_ref(buffer);
        }
        self.items[copy_id.0].au = au_copy;
        Ok(copy_id)
    }

    /// Releases an item: its NALUs go back to the pool, its buffer reference
    /// is dropped, the slot returns to the free list.
    pub fn release_item(&mut self, nalu_fifo: &mut NaluFifo, id: AuItemId) {
        let mut nalus = self.items[id.0].au.nalus;
        while let Some(nalu) = nalu_fifo.list_pop_front(&mut nalus) {
            nalu_fifo.push_free(nalu);
        }
        self.items[id.0].au.nalus = nalus;
        if let Some(buffer) = self.items[id.0].au.buffer.take() {
            self.unref(buffer);
        }
        self.push_free_item(id);
    }

    pub fn flush_queue(&mut self, nalu_fifo: &mut NaluFifo, queue: QueueId) -> usize {
        let mut flushed = 0;
        while let Some(id) = self.dequeue(queue) {
            self.release_item(nalu_fifo, id);
            flushed += 1;
        }
        flushed
    }

    /// Flushes every registered queue.
    pub fn flush(&mut self, nalu_fifo: &mut NaluFifo) -> usize {
        let queues: Vec<_> = self.queue_ids().collect();
        let mut flushed = 0;
        for queue in queues {
            flushed += self.flush_queue(nalu_fifo, queue);
        }
        flushed
    }
}
