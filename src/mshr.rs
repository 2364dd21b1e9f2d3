//! Miss-status handling registers.
//!
//! The MSHR is both the per-line transaction queue and the single point of
//! back-pressure: each line address owns an ordered list of pending entries,
//! and the total number of entries across all lines is bounded. The first
//! entry of a list is the transaction currently being served; everything
//! behind it waits. A register also buffers line data that arrived before its
//! transaction could deliver it.

use crate::event::{EventId, MemEvent};
use fnv::FnvHashMap;
use std::collections::VecDeque;

/// Outcome of trying to place an event in the MSHR.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemEventStatus {
    /// The event is at the head of its line and can be served now.
    Ok,
    /// Queued behind another transaction on the same line.
    Stall,
    /// The MSHR is full; the event must be NACKed.
    Reject,
}

pub enum MshrEntry {
    /// A pending transaction.
    Event { event: MemEvent, forwarded: bool, in_progress: bool, acks_needed: u32 },
    /// An outstanding writeback awaiting an AckPut.
    Writeback { needs_ack: bool },
}

#[derive(Default)]
struct MshrRegister {
    entries: VecDeque<MshrEntry>,
    data: Option<Vec<u8>>,
    data_dirty: bool,
}

pub struct Mshr {
    registers: FnvHashMap<u64, MshrRegister>,
    /// None means unbounded.
    max_size: Option<usize>,
    size: usize,
}

impl Mshr {
    /// `max_entries` < 0 means unbounded. Zero is rejected by config
    /// validation before we get here.
    pub fn new(max_entries: i64) -> Mshr {
        Mshr {
            registers: FnvHashMap::default(),
            max_size: if max_entries < 0 { None } else { Some(max_entries as usize) },
            size: 0,
        }
    }

    /// Total entries across all lines, for occupancy sampling.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Insert an event for `addr`. `pos` of None appends; `Some(0)` forces the
    /// head, `Some(1)` the slot just behind it. Returns the slot the event
    /// landed in, or None when the MSHR is full.
    pub fn insert_event(
        &mut self,
        addr: u64,
        event: MemEvent,
        pos: Option<usize>,
        forwarded: bool,
    ) -> Option<usize> {
        if let Some(max) = self.max_size {
            if self.size >= max {
                return None;
            }
        }
        let reg = self.registers.entry(addr).or_default();
        let idx = match pos {
            Some(p) => p.min(reg.entries.len()),
            None => reg.entries.len(),
        };
        reg.entries.insert(
            idx,
            MshrEntry::Event { event, forwarded, in_progress: false, acks_needed: 0 },
        );
        self.size += 1;
        Some(idx)
    }

    /// Record an outstanding writeback at the head of the line so a follow-up
    /// AckPut can be matched against it.
    pub fn insert_writeback(&mut self, addr: u64, needs_ack: bool) {
        let reg = self.registers.entry(addr).or_default();
        reg.entries.push_front(MshrEntry::Writeback { needs_ack });
        self.size += 1;
    }

    /// Whether the line has pending entries.
    pub fn exists(&self, addr: u64) -> bool {
        self.registers.get(&addr).map_or(false, |r| !r.entries.is_empty())
    }

    /// Whether the head entry of the line is an outstanding writeback.
    pub fn pending_writeback(&self, addr: u64) -> bool {
        match self.registers.get(&addr).and_then(|r| r.entries.front()) {
            Some(MshrEntry::Writeback { .. }) => true,
            _ => false,
        }
    }

    pub fn front_is_event(&self, addr: u64) -> bool {
        match self.registers.get(&addr).and_then(|r| r.entries.front()) {
            Some(MshrEntry::Event { .. }) => true,
            _ => false,
        }
    }

    pub fn front_event(&self, addr: u64) -> Option<&MemEvent> {
        match self.registers.get(&addr).and_then(|r| r.entries.front()) {
            Some(MshrEntry::Event { event, .. }) => Some(event),
            _ => None,
        }
    }

    pub fn front_event_id(&self, addr: u64) -> Option<EventId> {
        self.front_event(addr).map(|ev| ev.id())
    }

    pub fn remove_front(&mut self, addr: u64) -> Option<MshrEntry> {
        let entry = self.registers.get_mut(&addr)?.entries.pop_front();
        if entry.is_some() {
            self.size -= 1;
        }
        self.gc(addr);
        entry
    }

    pub fn remove_entry(&mut self, addr: u64, idx: usize) -> Option<MshrEntry> {
        let entry = self.registers.get_mut(&addr)?.entries.remove(idx);
        if entry.is_some() {
            self.size -= 1;
        }
        self.gc(addr);
        entry
    }

    /// Mark the head transaction as having issued an off-node request, so it
    /// is not retried while the request is in flight.
    pub fn set_in_progress(&mut self, addr: u64) {
        if let Some(MshrEntry::Event { in_progress, .. }) =
            self.registers.get_mut(&addr).and_then(|r| r.entries.front_mut())
        {
            *in_progress = true;
        }
    }

    pub fn in_progress(&self, addr: u64) -> bool {
        match self.registers.get(&addr).and_then(|r| r.entries.front()) {
            Some(MshrEntry::Event { in_progress, .. }) => *in_progress,
            _ => false,
        }
    }

    pub fn acks_needed(&self, addr: u64) -> u32 {
        match self.registers.get(&addr).and_then(|r| r.entries.front()) {
            Some(MshrEntry::Event { acks_needed, .. }) => *acks_needed,
            _ => 0,
        }
    }

    pub fn increment_acks_needed(&mut self, addr: u64) {
        if let Some(MshrEntry::Event { acks_needed, .. }) =
            self.registers.get_mut(&addr).and_then(|r| r.entries.front_mut())
        {
            *acks_needed += 1;
        }
    }

    /// Count one ack off the head transaction. Returns true when the counter
    /// reaches zero, which triggers completion of the transaction.
    pub fn decrement_acks_needed(&mut self, addr: u64) -> bool {
        if let Some(MshrEntry::Event { acks_needed, .. }) =
            self.registers.get_mut(&addr).and_then(|r| r.entries.front_mut())
        {
            if *acks_needed > 0 {
                *acks_needed -= 1;
                return *acks_needed == 0;
            }
        }
        false
    }

    /// Clear the evict flag of a stored event once its eviction has been
    /// folded into the current transaction, so a replay does not process the
    /// eviction twice.
    pub fn clear_evict(&mut self, addr: u64, id: EventId) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            for entry in reg.entries.iter_mut() {
                if let MshrEntry::Event { event, .. } = entry {
                    if event.id() == id {
                        event.set_evict(false);
                        return;
                    }
                }
            }
        }
    }

    // Per-line data buffer.

    pub fn has_data(&self, addr: u64) -> bool {
        self.registers.get(&addr).map_or(false, |r| r.data.is_some())
    }

    pub fn get_data(&self, addr: u64) -> Option<&[u8]> {
        self.registers.get(&addr).and_then(|r| r.data.as_deref())
    }

    pub fn set_data(&mut self, addr: u64, payload: Vec<u8>, dirty: bool) {
        let reg = self.registers.entry(addr).or_default();
        reg.data = Some(payload);
        reg.data_dirty = dirty;
    }

    pub fn clear_data(&mut self, addr: u64) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            reg.data = None;
            reg.data_dirty = false;
        }
        self.gc(addr);
    }

    pub fn data_dirty(&self, addr: u64) -> bool {
        self.registers.get(&addr).map_or(false, |r| r.data_dirty)
    }

    pub fn set_data_dirty(&mut self, addr: u64, dirty: bool) {
        if let Some(reg) = self.registers.get_mut(&addr) {
            if reg.data.is_some() {
                reg.data_dirty = dirty;
            }
        }
    }

    /// Drop a register once it holds neither entries nor buffered data.
    fn gc(&mut self, addr: u64) {
        if let Some(reg) = self.registers.get(&addr) {
            if reg.entries.is_empty() && reg.data.is_none() {
                self.registers.remove(&addr);
            }
        }
    }
}
