//! Directory entries and the bounded entry cache.
//!
//! One `DirEntry` exists per line the directory currently tracks. The store
//! keeps every live entry in a map and models directory-entry caching with a
//! bounded LRU list of addresses: entries that fall off the list are spilled
//! to backing memory and must be refetched (`*Fill` states) before the line
//! can be served again.

use fnv::FnvHashMap;
use std::collections::{BTreeSet, VecDeque};

/// Per-line coherence state.
///
/// Single letters are stable. The rest are transient: `IS`/`IM`/`SD` wait for
/// memory data, `IB`/`SB` for a flush response, `IFill`/`SFill`/`MFill` for a
/// directory-entry fill, and the `*Inv` states for invalidation acks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    I,
    S,
    M,
    /// Not present in the directory at all.
    NP,
    IS,
    IM,
    SD,
    IB,
    SB,
    IFill,
    SFill,
    MFill,
    SInv,
    SBInv,
    SDInv,
    SMInv,
    MInv,
    MInvX,
}

impl State {
    /// Only stable entries may be spilled out of the entry cache.
    pub fn is_stable(self) -> bool {
        matches!(self, State::I | State::S | State::M | State::NP)
    }
}

#[derive(Debug)]
pub struct DirEntry {
    base_addr: u64,
    state: State,
    owner: Option<String>,
    sharers: BTreeSet<String>,
    cached: bool,
}

impl DirEntry {
    fn new(base_addr: u64) -> DirEntry {
        DirEntry { base_addr, state: State::I, owner: None, sharers: BTreeSet::new(), cached: true }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn set_cached(&mut self, cached: bool) {
        self.cached = cached;
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn set_owner(&mut self, owner: &str) {
        self.owner = Some(owner.to_owned());
    }

    pub fn remove_owner(&mut self) {
        self.owner = None;
    }

    pub fn sharers(&self) -> &BTreeSet<String> {
        &self.sharers
    }

    pub fn is_sharer(&self, name: &str) -> bool {
        self.sharers.contains(name)
    }

    pub fn has_sharers(&self) -> bool {
        !self.sharers.is_empty()
    }

    pub fn sharer_count(&self) -> usize {
        self.sharers.len()
    }

    pub fn add_sharer(&mut self, name: &str) {
        self.sharers.insert(name.to_owned());
    }

    pub fn remove_sharer(&mut self, name: &str) {
        self.sharers.remove(name);
    }
}

pub struct DirectoryStore {
    entries: FnvHashMap<u64, DirEntry>,
    /// Addresses of cache-resident entries, most recently used first. The map
    /// owns the entries; the list only names them.
    lru: VecDeque<u64>,
    max_cached: u64,
}

impl DirectoryStore {
    pub fn new(max_cached: u64) -> DirectoryStore {
        DirectoryStore { entries: FnvHashMap::default(), lru: VecDeque::new(), max_cached }
    }

    /// Fetch the entry for `addr`, creating one in state I if the directory
    /// has never seen the line. New entries count as resident but only enter
    /// the LRU list on their first update.
    pub fn get_or_create(&mut self, addr: u64) -> &mut DirEntry {
        self.entries.entry(addr).or_insert_with(|| DirEntry::new(addr))
    }

    pub fn get(&self, addr: u64) -> Option<&DirEntry> {
        self.entries.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut DirEntry> {
        self.entries.get_mut(&addr)
    }

    pub fn state_of(&self, addr: u64) -> State {
        self.entries.get(&addr).map_or(State::NP, |e| e.state)
    }

    pub fn cached_count(&self) -> usize {
        self.lru.len()
    }

    pub fn max_cached(&self) -> u64 {
        self.max_cached
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &DirEntry)> {
        self.entries.iter()
    }

    /// Promote `addr` to most-recently-used after an update, dropping entries
    /// that returned to I and spilling over-capacity LRU victims. `busy`
    /// reports whether a line still has MSHR activity; busy lines are neither
    /// dropped nor spilled. Returns the addresses to write back to memory.
    pub fn update_cache(&mut self, addr: u64, busy: impl Fn(u64) -> bool) -> Vec<u64> {
        if self.max_cached == 0 {
            // Caching disabled: drop idle I entries, write everything else
            // straight through.
            if let Some(entry) = self.entries.get(&addr) {
                if entry.state == State::I && !busy(addr) {
                    self.entries.remove(&addr);
                    return Vec::new();
                }
                return vec![addr];
            }
            return Vec::new();
        }

        if let Some(pos) = self.lru.iter().position(|&a| a == addr) {
            self.lru.remove(pos);
        }

        match self.entries.get(&addr) {
            Some(entry) if entry.state == State::I && !busy(addr) => {
                self.entries.remove(&addr);
                return Vec::new();
            }
            Some(_) => (),
            None => return Vec::new(),
        }

        self.lru.push_front(addr);

        let mut spilled = Vec::new();
        while self.lru.len() as u64 > self.max_cached {
            let victim = *self.lru.back().unwrap();
            if busy(victim) {
                break;
            }
            let entry = match self.entries.get_mut(&victim) {
                Some(e) => e,
                None => {
                    self.lru.pop_back();
                    continue;
                }
            };
            if !entry.state.is_stable() {
                break;
            }
            entry.cached = false;
            self.lru.pop_back();
            spilled.push(victim);
        }
        spilled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_start_invalid_and_resident() {
        let mut store = DirectoryStore::new(4);
        let entry = store.get_or_create(0x40);
        assert_eq!(entry.state(), State::I);
        assert!(entry.is_cached());
        assert!(!entry.has_owner());
        assert!(!entry.has_sharers());
        assert_eq!(store.state_of(0x80), State::NP);
    }

    #[test]
    fn idle_invalid_entries_are_dropped_on_update() {
        let mut store = DirectoryStore::new(4);
        store.get_or_create(0x40);
        let spilled = store.update_cache(0x40, |_| false);
        assert!(spilled.is_empty());
        assert!(store.get(0x40).is_none());
    }

    #[test]
    fn busy_invalid_entries_survive() {
        let mut store = DirectoryStore::new(4);
        store.get_or_create(0x40);
        store.update_cache(0x40, |_| true);
        assert!(store.get(0x40).is_some());
    }

    #[test]
    fn lru_spills_oldest_first() {
        let mut store = DirectoryStore::new(2);
        for addr in &[0x40u64, 0x80, 0xc0] {
            let e = store.get_or_create(*addr);
            e.set_state(State::S);
            e.add_sharer("core0");
        }
        store.update_cache(0x40, |_| false);
        store.update_cache(0x80, |_| false);
        let spilled = store.update_cache(0xc0, |_| false);
        assert_eq!(spilled, vec![0x40]);
        assert!(!store.get(0x40).unwrap().is_cached());
        assert!(store.get(0x80).unwrap().is_cached());
        assert_eq!(store.cached_count(), 2);
    }

    #[test]
    fn busy_victims_block_eviction() {
        let mut store = DirectoryStore::new(1);
        for addr in &[0x40u64, 0x80] {
            let e = store.get_or_create(*addr);
            e.set_state(State::S);
            e.add_sharer("core0");
        }
        store.update_cache(0x40, |_| false);
        let spilled = store.update_cache(0x80, |a| a == 0x40);
        assert!(spilled.is_empty());
        // Over capacity, but the busy line may not be spilled.
        assert_eq!(store.cached_count(), 2);
    }

    #[test]
    fn write_through_when_caching_disabled() {
        let mut store = DirectoryStore::new(0);
        let e = store.get_or_create(0x40);
        e.set_state(State::M);
        e.set_owner("core1");
        assert_eq!(store.update_cache(0x40, |_| false), vec![0x40]);
        // Entry stays resident; the write-through only models traffic.
        assert!(store.get(0x40).unwrap().is_cached());
    }
}
