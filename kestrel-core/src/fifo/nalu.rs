use bytes::Bytes;
use kestrel_h264::NaluType;

use super::FifoError;

/// Index of a NALU descriptor slot inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluItemId(pub(crate) usize);

/// One NAL unit as tracked by the pipeline.
///
/// The payload itself lives in the owning access unit's pooled buffer; the
/// descriptor only records its extent there.
#[derive(Debug, Clone, Default)]
pub struct NaluDescriptor {
    pub nalu_type: Option<NaluType>,
    pub nal_ref_idc: u8,
    /// Extent of the NALU (start code included) in the AU payload buffer.
    pub payload_offset: usize,
    pub payload_size: usize,
    pub input_timestamp: u64,
    pub timeout_timestamp: u64,
    pub ntp_timestamp: u64,
    pub ntp_timestamp_local: u64,
    pub ext_rtp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub is_last_in_au: bool,
    pub missing_packets_before: u32,
    pub importance: u32,
    pub priority: u32,
    pub metadata: Option<Bytes>,
}

#[derive(Debug, Default)]
struct NaluSlot {
    nalu: NaluDescriptor,
    prev: Option<NaluItemId>,
    next: Option<NaluItemId>,
}

/// Head and tail of an intrusive NALU list (the NALUs of one access unit).
///
/// The items live in a [`NaluFifo`] pool; all list operations go through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaluList {
    head: Option<NaluItemId>,
    tail: Option<NaluItemId>,
    pub count: usize,
}

/// Fixed-capacity NALU descriptor pool with a free list and a queued list.
#[derive(Debug)]
pub struct NaluFifo {
    pool: Vec<NaluSlot>,
    free_head: Option<NaluItemId>,
    free_count: usize,
    head: Option<NaluItemId>,
    tail: Option<NaluItemId>,
    count: usize,
}

impl NaluFifo {
    pub fn new(capacity: usize) -> Self {
        let mut fifo = Self {
            pool: Vec::with_capacity(capacity),
            free_head: None,
            free_count: 0,
            head: None,
            tail: None,
            count: 0,
        };
        for index in 0..capacity {
            fifo.pool.push(NaluSlot {
                next: fifo.free_head,
                ..Default::default()
            });
            fifo.free_head = Some(NaluItemId(index));
            fifo.free_count += 1;
        }
        fifo
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn nalu(&self, id: NaluItemId) -> &NaluDescriptor {
        &self.pool[id.0].nalu
    }

    pub fn nalu_mut(&mut self, id: NaluItemId) -> &mut NaluDescriptor {
        &mut self.pool[id.0].nalu
    }

    /// Takes a slot off the free list, fields reset.
    pub fn pop_free(&mut self) -> Option<NaluItemId> {
        let id = self.free_head?;
        let next = self.pool[id.0].next;
        if let Some(next) = next {
            self.pool[next.0].prev = None;
        }
        self.free_head = next;
        self.free_count -= 1;

        let slot = &mut self.pool[id.0];
        slot.nalu = NaluDescriptor::default();
        slot.prev = None;
        slot.next = None;
        Some(id)
    }

    pub fn push_free(&mut self, id: NaluItemId) {
        if let Some(free) = self.free_head {
            self.pool[free.0].prev = Some(id);
        }
        let slot = &mut self.pool[id.0];
        slot.next = self.free_head;
        slot.prev = None;
        self.free_head = Some(id);
        self.free_count += 1;
    }

    /// Appends an item to the queued list.
    pub fn enqueue(&mut self, id: NaluItemId) -> Result<(), FifoError> {
        if self.count >= self.capacity() {
            return Err(FifoError::QueueFull);
        }
        let tail = self.tail;
        {
            let slot = &mut self.pool[id.0];
            slot.next = None;
            slot.prev = tail;
        }
        if let Some(tail) = tail {
            self.pool[tail.0].next = Some(id);
        }
        self.tail = Some(id);
        if self.head.is_none() {
            self.head = Some(id);
        }
        self.count += 1;
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<NaluItemId> {
        let id = self.head?;
        let next = self.pool[id.0].next;
        match next {
            Some(next) => {
                self.pool[next.0].prev = None;
                self.head = Some(next);
                self.count -= 1;
            }
            None => {
                self.head = None;
                self.tail = None;
                self.count = 0;
            }
        }
        let slot = &mut self.pool[id.0];
        slot.prev = None;
        slot.next = None;
        Some(id)
    }

    pub fn queued_count(&self) -> usize {
        self.count
    }

    /// Returns every queued item to the free list.
    pub fn flush(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(id) = self.dequeue() {
            self.push_free(id);
            flushed += 1;
        }
        flushed
    }

    /// Appends an item to an access unit's NALU list.
    pub fn list_push_back(&mut self, list: &mut NaluList, id: NaluItemId) {
        {
            let slot = &mut self.pool[id.0];
            slot.next = None;
            slot.prev = list.tail;
        }
        if let Some(tail) = list.tail {
            self.pool[tail.0].next = Some(id);
        }
        list.tail = Some(id);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.count += 1;
    }

    /// Inserts `id` immediately before `before`, which must be on `list`.
    pub fn list_insert_before(&mut self, list: &mut NaluList, id: NaluItemId, before: NaluItemId) {
        let prev = self.pool[before.0].prev;
        {
            let slot = &mut self.pool[id.0];
            slot.next = Some(before);
            slot.prev = prev;
        }
        self.pool[before.0].prev = Some(id);
        match prev {
            Some(prev) => self.pool[prev.0].next = Some(id),
            None => list.head = Some(id),
        }
        list.count += 1;
    }

    pub fn list_pop_front(&mut self, list: &mut NaluList) -> Option<NaluItemId> {
        let id = list.head?;
        let next = self.pool[id.0].next;
        match next {
            Some(next) => {
                self.pool[next.0].prev = None;
                list.head = Some(next);
                list.count -= 1;
            }
            None => {
                list.head = None;
                list.tail = None;
                list.count = 0;
            }
        }
        let slot = &mut self.pool[id.0];
        slot.prev = None;
        slot.next = None;
        Some(id)
    }

    pub fn list_iter<'a>(&'a self, list: &NaluList) -> impl Iterator<Item = NaluItemId> + 'a {
        let mut cursor = list.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.pool[id.0].next;
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_accounting_holds() {
        let mut fifo = NaluFifo::new(4);
        assert_eq!(fifo.free_count(), 4);

        let a = fifo.pop_free().unwrap();
        let b = fifo.pop_free().unwrap();
        assert_eq!(fifo.free_count() + 2, fifo.capacity());

        fifo.push_free(a);
        fifo.push_free(b);
        assert_eq!(fifo.free_count(), 4);
    }

    #[test]
    fn pool_exhaustion() {
        let mut fifo = NaluFifo::new(2);
        assert!(fifo.pop_free().is_some());
        assert!(fifo.pop_free().is_some());
        assert!(fifo.pop_free().is_none());
    }

    #[test]
    fn queue_preserves_order() {
        let mut fifo = NaluFifo::new(8);
        let mut ids = Vec::new();
        for size in [10usize, 20, 30] {
            let id = fifo.pop_free().unwrap();
            fifo.nalu_mut(id).payload_size = size;
            fifo.enqueue(id).unwrap();
            ids.push(id);
        }
        assert_eq!(fifo.queued_count(), 3);

        for expected in [10usize, 20, 30] {
            let id = fifo.dequeue().unwrap();
            assert_eq!(fifo.nalu(id).payload_size, expected);
            fifo.push_free(id);
        }
        assert!(fifo.dequeue().is_none());
        assert_eq!(fifo.free_count(), 8);
    }

    #[test]
    fn au_list_insert_before() {
        let mut fifo = NaluFifo::new(8);
        let mut list = NaluList::default();

        let first = fifo.pop_free().unwrap();
        let third = fifo.pop_free().unwrap();
        fifo.list_push_back(&mut list, first);
        fifo.list_push_back(&mut list, third);

        let second = fifo.pop_free().unwrap();
        fifo.nalu_mut(second).payload_size = 2;
        fifo.list_insert_before(&mut list, second, third);

        let order: Vec<_> = fifo.list_iter(&list).collect();
        assert_eq!(order, vec![first, second, third]);
        assert_eq!(list.count, 3);

        // inserting at the head updates it
        let zeroth = fifo.pop_free().unwrap();
        fifo.list_insert_before(&mut list, zeroth, first);
        assert_eq!(fifo.list_pop_front(&mut list), Some(zeroth));
        assert_eq!(fifo.list_pop_front(&mut list), Some(first));
    }
}
