//! The directory controller.
//!
//! All traffic enters through [`DirectoryController::handle_incoming`] and
//! time advances through [`DirectoryController::clock_tick`]; the simulator
//! kernel serializes both, so the controller is single-threaded and never
//! blocks. Suspension is modeled by queueing future-timestamped events on the
//! outgoing queues.

pub mod dir_entry;
mod coherence;

use crate::config::{Config, Protocol};
use crate::error::{FatalError, Result};
use crate::event::{Command, EventId, MemEvent, F_NONCACHEABLE, F_NORESPONSE};
use crate::link::{Endpoint, InitEvent, MemLink, Region};
use crate::mshr::{MemEventStatus, Mshr};
use crate::stats::Stats;
use dir_entry::{DirEntry, DirectoryStore, State};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Size of a directory entry in the backing store, in bytes.
const ENTRY_SIZE: u32 = 4;

/// Mem-side egress records whether the event is directory-entry traffic so it
/// is counted under separate statistics.
struct MemMsg {
    event: MemEvent,
    dir_access: bool,
}

pub struct DirectoryController {
    name: String,
    protocol: Protocol,
    line_size: u32,
    access_latency: u64,
    mshr_latency: u64,
    max_requests_per_cycle: u32,
    #[allow(dead_code)]
    mem_offset: u64,
    region: Region,
    debug_addr: FnvHashSet<u64>,

    cpu_link: Box<dyn MemLink>,
    mem_link: Box<dyn MemLink>,
    clock_cpu_link: bool,
    clock_mem_link: bool,

    timestamp: u64,
    clock_on: bool,
    resume_pending: bool,
    last_active_cycle: u64,

    /// Newly arrived events waiting for the clock.
    event_buffer: VecDeque<MemEvent>,
    /// Transactions to replay: the head of the named line's MSHR queue, keyed
    /// by the event id observed when the retry was scheduled so a stale retry
    /// is dropped rather than replaying the wrong transaction.
    retry_buffer: VecDeque<(u64, EventId)>,
    /// Lines already served this cycle; at most one access per line per cycle.
    addrs_this_cycle: FnvHashSet<u64>,

    /// Time-ordered egress, keyed by delivery cycle. Within a cycle events
    /// leave in insertion order.
    cpu_msg_queue: BTreeMap<u64, VecDeque<MemEvent>>,
    mem_msg_queue: BTreeMap<u64, VecDeque<MemMsg>>,

    mshr: Mshr,
    store: DirectoryStore,

    /// Outstanding fetches/invalidations: line -> destination -> event id.
    /// Used to reconcile acks and to reject stale NACKs.
    responses: FnvHashMap<u64, FnvHashMap<String, EventId>>,
    /// Ingress cycle of each pending request, for latency statistics.
    start_times: FnvHashMap<EventId, u64>,
    /// Original sources of in-flight noncacheable requests.
    noncache_mem_reqs: FnvHashMap<EventId, String>,
    /// In-flight directory-entry fills: request id -> line address.
    dir_mem_accesses: FnvHashMap<EventId, u64>,

    /// Sources that do not track presence; they receive data but are never
    /// recorded as sharers.
    incoherent_src: HashSet<String>,
    /// Whether writebacks must wait for an AckPut.
    wait_wb_ack: bool,

    stats: Stats,
}

impl DirectoryController {
    pub fn new(
        config: &Config,
        mut cpu_link: Box<dyn MemLink>,
        mut mem_link: Box<dyn MemLink>,
    ) -> Result<DirectoryController> {
        config.validate()?;

        let region = config.region();
        cpu_link.set_region(region);
        mem_link.set_region(region);

        let clock_cpu_link = cpu_link.is_clocked();
        let clock_mem_link = mem_link.is_clocked();

        Ok(DirectoryController {
            name: config.name.clone(),
            protocol: config.coherence_protocol,
            line_size: config.cache_line_size,
            access_latency: config.access_latency_cycles,
            mshr_latency: config.mshr_latency_cycles,
            max_requests_per_cycle: config.max_requests_per_cycle,
            mem_offset: config.mem_addr_start,
            region,
            debug_addr: config.debug_addr.iter().cloned().collect(),
            cpu_link,
            mem_link,
            clock_cpu_link,
            clock_mem_link,
            timestamp: 0,
            clock_on: true,
            resume_pending: false,
            last_active_cycle: 0,
            event_buffer: VecDeque::new(),
            retry_buffer: VecDeque::new(),
            addrs_this_cycle: FnvHashSet::default(),
            cpu_msg_queue: BTreeMap::new(),
            mem_msg_queue: BTreeMap::new(),
            mshr: Mshr::new(config.mshr_num_entries),
            store: DirectoryStore::new(config.entry_cache_size),
            responses: FnvHashMap::default(),
            start_times: FnvHashMap::default(),
            noncache_mem_reqs: FnvHashMap::default(),
            dir_mem_accesses: FnvHashMap::default(),
            incoherent_src: HashSet::new(),
            wait_wb_ack: false,
            stats: Stats::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.clear();
    }

    pub fn clock_enabled(&self) -> bool {
        self.clock_on
    }

    pub fn entry(&self, addr: u64) -> Option<&DirEntry> {
        self.store.get(addr)
    }

    pub fn mshr(&self) -> &Mshr {
        &self.mshr
    }

    /// Dump internal state, for end-of-run reporting and debugging.
    pub fn print_status(&self, write: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(write, "DirectoryController {}", self.name)?;
        writeln!(write, "  Cached entries: {}", self.store.cached_count())?;
        writeln!(write, "  Requests waiting to be handled: {}", self.event_buffer.len())?;
        writeln!(write, "  MSHR occupancy: {}", self.mshr.size())?;
        writeln!(write, "  Directory entries:")?;
        for (addr, entry) in self.store.iter() {
            writeln!(write, "    0x{:x} {:?}", addr, entry)?;
        }
        Ok(())
    }

    // #region Untimed init exchange
    //

    /// Run one untimed init phase: advertise this endpoint on both links, then
    /// relay endpoint records across the directory and push initial program
    /// data for our region toward memory.
    pub fn init(&mut self, phase: u32) {
        self.cpu_link.init(phase);
        self.mem_link.init(phase);

        if phase == 0 {
            let adv = InitEvent::Coherence {
                src: self.name.clone(),
                endpoint: Endpoint::Directory,
                tracks_presence: true,
                sends_wb_ack: true,
                line_size: self.line_size,
            };
            self.cpu_link.send_untimed(adv.clone());
            self.mem_link.send_untimed(adv);
        }

        loop {
            let ev = match self.cpu_link.recv_untimed() {
                Some(ev) => ev,
                None => break,
            };
            match ev {
                InitEvent::Coherence { src, endpoint, tracks_presence, .. } => {
                    debug!("{}: init coherence from {} ({:?})", self.name, src, endpoint);
                    if endpoint == Endpoint::Scratchpad {
                        self.wait_wb_ack = true;
                    }
                    if !tracks_presence && self.cpu_link.is_source(&src) {
                        self.incoherent_src.insert(src);
                    }
                }
                InitEvent::Endpoint { regions, .. } => {
                    self.mem_link
                        .send_untimed(InitEvent::Endpoint { src: self.name.clone(), regions });
                }
                InitEvent::Data { addr, payload } => {
                    if self.cpu_link.is_request_address_valid(addr) {
                        self.mem_link.send_untimed(InitEvent::Data { addr, payload });
                    }
                }
            }
        }

        loop {
            let ev = match self.mem_link.recv_untimed() {
                Some(ev) => ev,
                None => break,
            };
            match ev {
                InitEvent::Coherence { src, sends_wb_ack, .. } => {
                    debug!("{}: init coherence from {} (mem side)", self.name, src);
                    if sends_wb_ack {
                        self.wait_wb_ack = true;
                    }
                }
                InitEvent::Endpoint { regions, .. } => {
                    self.cpu_link
                        .send_untimed(InitEvent::Endpoint { src: self.name.clone(), regions });
                }
                InitEvent::Data { .. } => (),
            }
        }
    }

    pub fn setup(&mut self) {
        self.cpu_link.setup();
        self.mem_link.setup();
    }

    pub fn finish(&mut self) {
        self.cpu_link.finish();
        self.mem_link.finish();
    }

    //
    // #endregion

    /// Event ingress. Noncacheable traffic bypasses the state machine and is
    /// forwarded immediately; everything else is buffered for the clock.
    pub fn handle_incoming(&mut self, ev: MemEvent) -> Result<()> {
        if !self.clock_on {
            self.clock_on = true;
            self.resume_pending = true;
        }

        if !ev.cmd().is_cache() || ev.query_flag(F_NONCACHEABLE) {
            return if ev.cmd().is_response() {
                self.handle_noncacheable_response(ev)
            } else {
                self.handle_noncacheable_request(ev)
            };
        }

        if !ev.cmd().is_response() {
            self.start_times.insert(ev.id(), self.timestamp);
        }
        if self.debug_addr_enabled(ev.base_addr()) {
            trace!(
                "{}: {} recv {:?} 0x{:x} from {}",
                self.timestamp,
                self.name,
                ev.cmd(),
                ev.base_addr(),
                ev.src()
            );
        }
        self.event_buffer.push_back(ev);
        Ok(())
    }

    /// Called each cycle; drains egress and handles waiting events. Returns
    /// true when the controller went idle and the clock can be disabled until
    /// the next incoming event.
    pub fn clock_tick(&mut self, cycle: u64) -> Result<bool> {
        if !self.clock_on {
            return Ok(true);
        }
        self.timestamp = cycle;

        if self.resume_pending {
            // Replay occupancy samples for the interval the clock was off.
            let gap = cycle.saturating_sub(self.last_active_cycle + 1);
            for _ in 0..gap {
                self.stats.sample_mshr_occupancy(self.mshr.size());
            }
            self.resume_pending = false;
        }
        self.stats.sample_mshr_occupancy(self.mshr.size());

        self.send_outgoing_events()?;

        let mut idle = true;
        if self.clock_cpu_link {
            idle &= self.cpu_link.clock();
        }
        if self.clock_mem_link {
            idle &= self.mem_link.clock();
        }

        self.addrs_this_cycle.clear();
        let mut requests_this_cycle = 0u32;

        // Replay retries before new arrivals so completed transactions resume
        // ahead of competing traffic.
        let mut i = 0;
        while i < self.retry_buffer.len() {
            if self.max_requests_per_cycle != 0
                && requests_this_cycle == self.max_requests_per_cycle
            {
                break;
            }
            let (addr, id) = self.retry_buffer[i];
            let mut ev = match self.mshr.front_event(addr) {
                Some(ev) if ev.id() == id => ev.clone(),
                // The transaction this retry named is gone; drop the retry.
                _ => {
                    self.retry_buffer.remove(i);
                    continue;
                }
            };
            if self.process_packet(&mut ev, true)? {
                requests_this_cycle += 1;
                self.retry_buffer.remove(i);
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.event_buffer.len() {
            if self.max_requests_per_cycle != 0
                && requests_this_cycle == self.max_requests_per_cycle
            {
                break;
            }
            let mut ev = self.event_buffer[i].clone();
            if self.process_packet(&mut ev, false)? {
                requests_this_cycle += 1;
                self.event_buffer.remove(i);
            } else {
                self.event_buffer[i] = ev;
                i += 1;
            }
        }

        idle &= self.event_buffer.is_empty() && self.retry_buffer.is_empty();
        idle &= self.cpu_msg_queue.is_empty() && self.mem_msg_queue.is_empty();

        if idle {
            self.clock_on = false;
            self.last_active_cycle = self.timestamp;
            return Ok(true);
        }
        Ok(false)
    }

    fn process_packet(&mut self, ev: &mut MemEvent, replay: bool) -> Result<bool> {
        if ev.is_addr_global() && !self.cpu_link.is_request_address_valid(ev.addr()) {
            return Err(FatalError::InvalidAddress { addr: ev.addr() });
        }

        let addr = ev.base_addr();

        if self.addrs_this_cycle.contains(&addr) {
            if self.debug_addr_enabled(addr) {
                debug!(
                    "{}: {} stall {:?} 0x{:x} (line conflict)",
                    self.timestamp,
                    self.name,
                    ev.cmd(),
                    addr
                );
            }
            return Ok(false);
        }

        if !replay {
            self.stats.record_recv(ev.cmd());
        }

        let consumed = if !ev.is_addr_global() {
            self.handle_dir_entry_response(ev)?
        } else {
            match ev.cmd() {
                Command::GetS => self.handle_get_s(ev, replay)?,
                Command::GetX | Command::GetSX => self.handle_get_x(ev, replay)?,
                Command::Write => self.handle_write(ev, replay)?,
                Command::PutS => self.handle_put_s(ev, replay)?,
                Command::PutE => self.handle_put_e(ev, replay)?,
                Command::PutM => self.handle_put_m(ev, replay)?,
                Command::PutX => self.handle_put_x(ev, replay)?,
                Command::FlushLine => self.handle_flush_line(ev, replay)?,
                Command::FlushLineInv => self.handle_flush_line_inv(ev, replay)?,
                Command::FetchInv => self.handle_fetch_inv(ev, replay)?,
                Command::ForceInv => self.handle_force_inv(ev, replay)?,
                Command::GetSResp => self.handle_get_s_resp(ev)?,
                Command::GetXResp => self.handle_get_x_resp(ev)?,
                Command::WriteResp => self.handle_write_resp(ev)?,
                Command::FlushLineResp => self.handle_flush_line_resp(ev)?,
                Command::FetchResp => self.handle_fetch_resp(ev)?,
                Command::FetchXResp => self.handle_fetch_x_resp(ev)?,
                Command::AckInv => self.handle_ack_inv(ev)?,
                Command::AckPut => self.handle_ack_put(ev)?,
                Command::NACK => self.handle_nack(ev)?,
                cmd => {
                    return Err(FatalError::Protocol {
                        cmd,
                        state: self.store.state_of(addr),
                        addr,
                        src: ev.src().to_owned(),
                    })
                }
            }
        };

        if consumed {
            if replay {
                self.stats.mshr_hits += 1;
            }
            self.addrs_this_cycle.insert(addr);
        }
        Ok(consumed)
    }

    // #region Noncacheable pass-through
    //

    fn handle_noncacheable_request(&mut self, mut ev: MemEvent) -> Result<()> {
        if !ev.query_flag(F_NORESPONSE) {
            self.noncache_mem_reqs.insert(ev.id(), ev.src().to_owned());
        }
        self.stats.record_noncache_recv(ev.cmd());
        ev.set_src(&self.name);
        self.forward_by_address(ev, self.timestamp + 1, false)
    }

    fn handle_noncacheable_response(&mut self, mut ev: MemEvent) -> Result<()> {
        let req_id = ev
            .response_to_id()
            .ok_or(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() })?;
        let dst = self
            .noncache_mem_reqs
            .remove(&req_id)
            .ok_or(FatalError::OrphanResponse { cmd: ev.cmd(), id: req_id })?;
        self.stats.record_noncache_recv(ev.cmd());
        ev.set_dst(&dst);
        ev.set_src(&self.name);
        self.forward_by_destination(ev, self.timestamp + 1, false)
    }

    //
    // #endregion

    // #region Egress and routing
    //

    fn send_outgoing_events(&mut self) -> Result<()> {
        while let Some(&t) = self.cpu_msg_queue.keys().next() {
            if t > self.timestamp {
                break;
            }
            let batch = self.cpu_msg_queue.remove(&t).unwrap();
            for ev in batch {
                if let Some(req_id) = ev.response_to_id() {
                    if let Some(start) = self.start_times.remove(&req_id) {
                        let latency = self.timestamp - start;
                        if ev.cmd().is_data_response() {
                            self.stats.get_request_latency += latency;
                        } else {
                            self.stats.replacement_request_latency += latency;
                        }
                    }
                }
                if self.debug_addr_enabled(ev.base_addr()) {
                    trace!(
                        "{}: {} send {:?} 0x{:x} -> {}",
                        self.timestamp,
                        self.name,
                        ev.cmd(),
                        ev.base_addr(),
                        ev.dst()
                    );
                }
                self.stats.record_sent(ev.cmd());
                self.cpu_link.send(ev);
            }
        }

        while let Some(&t) = self.mem_msg_queue.keys().next() {
            if t > self.timestamp {
                break;
            }
            let batch = self.mem_msg_queue.remove(&t).unwrap();
            for msg in batch {
                if msg.dir_access {
                    if msg.event.cmd() == Command::GetS {
                        self.stats.dir_entry_reads += 1;
                    } else {
                        self.stats.dir_entry_writes += 1;
                    }
                } else {
                    self.stats.record_sent(msg.event.cmd());
                }
                if self.debug_addr_enabled(msg.event.base_addr()) {
                    trace!(
                        "{}: {} send {:?} 0x{:x} -> {} (mem)",
                        self.timestamp,
                        self.name,
                        msg.event.cmd(),
                        msg.event.base_addr(),
                        msg.event.dst()
                    );
                }
                self.mem_link.send(msg.event);
            }
        }
        Ok(())
    }

    fn queue_cpu(&mut self, ts: u64, ev: MemEvent) {
        self.cpu_msg_queue.entry(ts).or_insert_with(VecDeque::new).push_back(ev);
    }

    fn queue_mem(&mut self, ts: u64, event: MemEvent, dir_access: bool) {
        self.mem_msg_queue
            .entry(ts)
            .or_insert_with(VecDeque::new)
            .push_back(MemMsg { event, dir_access });
    }

    /// Route by address: the link whose peers own the routing address wins.
    fn forward_by_address(&mut self, mut ev: MemEvent, ts: u64, dir_access: bool) -> Result<()> {
        if let Some(dst) = self.mem_link.find_target_destination(ev.routing_addr()) {
            ev.set_dst(&dst);
            self.queue_mem(ts, ev, dir_access);
            Ok(())
        } else if let Some(dst) = self.cpu_link.find_target_destination(ev.routing_addr()) {
            ev.set_dst(&dst);
            self.queue_cpu(ts, ev);
            Ok(())
        } else {
            Err(FatalError::Routing { dst: ev.dst().to_owned(), addr: ev.routing_addr() })
        }
    }

    /// Route to a named destination over whichever link can reach it.
    fn forward_by_destination(&mut self, ev: MemEvent, ts: u64, dir_access: bool) -> Result<()> {
        if self.cpu_link.is_reachable(ev.dst()) {
            self.queue_cpu(ts, ev);
            Ok(())
        } else if self.mem_link.is_reachable(ev.dst()) {
            self.queue_mem(ts, ev, dir_access);
            Ok(())
        } else {
            Err(FatalError::Routing { dst: ev.dst().to_owned(), addr: ev.routing_addr() })
        }
    }

    //
    // #endregion

    // #region Directory entry spill and fill
    //

    /// Stall `ev` and fetch its directory entry from the backing store.
    fn retrieve_dir_entry(&mut self, ev: &MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let status =
            if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
        match status {
            // Leave the event in its buffer; it will retry next cycle.
            MemEventStatus::Reject => return Ok(false),
            MemEventStatus::Stall => return Ok(true),
            MemEventStatus::Ok => (),
        }

        let state = self.store.state_of(addr);
        let fetching = match state {
            State::I => State::IFill,
            State::S => State::SFill,
            State::M => State::MFill,
            // Fill already in flight for an earlier event.
            State::IFill | State::SFill | State::MFill => return Ok(true),
            other => {
                return Err(FatalError::Protocol {
                    cmd: ev.cmd(),
                    state: other,
                    addr,
                    src: ev.src().to_owned(),
                })
            }
        };
        self.store.get_mut(addr).unwrap().set_state(fetching);

        let mut fill = MemEvent::new(&self.name, 0, 0, Command::GetS, self.line_size);
        fill.set_size(ENTRY_SIZE);
        fill.set_addr_global(false);
        if let Some(dst) = self.mem_link.find_target_destination(0) {
            fill.set_dst(&dst);
        }
        self.dir_mem_accesses.insert(fill.id(), addr);
        let ts = self.timestamp + self.access_latency;
        self.queue_mem(ts, fill, true);
        Ok(true)
    }

    /// A directory-entry fill came back from memory; collapse `*Fill` back to
    /// the stable state and replay the stalled transaction.
    fn handle_dir_entry_response(&mut self, ev: &MemEvent) -> Result<bool> {
        let req_id = ev
            .response_to_id()
            .ok_or(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() })?;
        let addr = self
            .dir_mem_accesses
            .remove(&req_id)
            .ok_or(FatalError::OrphanResponse { cmd: ev.cmd(), id: req_id })?;

        let state = self.store.state_of(addr);
        let stable = match state {
            State::IFill => State::I,
            State::SFill => State::S,
            State::MFill => State::M,
            other => {
                return Err(FatalError::Protocol {
                    cmd: ev.cmd(),
                    state: other,
                    addr,
                    src: ev.src().to_owned(),
                })
            }
        };
        let entry = self.store.get_mut(addr).unwrap();
        entry.set_state(stable);
        entry.set_cached(true);
        self.schedule_retry(addr);
        Ok(true)
    }

    /// Write a spilled entry to the backing store. The entry store is a stub:
    /// every entry lives at a conventional address and the write carries no
    /// payload, it only models the traffic.
    fn send_entry_to_memory(&mut self, _addr: u64) {
        let mut ev = MemEvent::new(&self.name, 0, 0, Command::PutE, self.line_size);
        ev.set_size(ENTRY_SIZE);
        ev.set_flag(F_NORESPONSE);
        if let Some(dst) = self.mem_link.find_target_destination(0) {
            ev.set_dst(&dst);
        }
        let ts = self.timestamp + self.access_latency;
        self.queue_mem(ts, ev, true);
    }

    /// Promote the entry after an update, spilling LRU victims to memory.
    fn update_cache(&mut self, addr: u64) {
        let mshr = &self.mshr;
        let spilled = self.store.update_cache(addr, |a| mshr.exists(a));
        for victim in spilled {
            self.send_entry_to_memory(victim);
        }
    }

    //
    // #endregion

    // #region MSHR interaction
    //

    fn allocate_mshr(
        &mut self,
        ev: &MemEvent,
        forwarded: bool,
        pos: Option<usize>,
    ) -> MemEventStatus {
        match self.mshr.insert_event(ev.base_addr(), ev.clone(), pos, forwarded) {
            None => MemEventStatus::Reject,
            Some(0) => MemEventStatus::Ok,
            Some(_) => MemEventStatus::Stall,
        }
    }

    fn schedule_retry(&mut self, addr: u64) {
        if let Some(id) = self.mshr.front_event_id(addr) {
            self.retry_buffer.push_back((addr, id));
        }
    }

    /// Release the served request's MSHR slot and wake the next transaction.
    fn cleanup_after_request(&mut self, addr: u64, in_mshr: bool) {
        if in_mshr {
            if self.mshr.front_is_event(addr) {
                self.mshr.remove_front(addr);
            } else {
                // A writeback was inserted in front of the request; skip it.
                self.mshr.remove_entry(addr, 1);
            }
        }
        self.finish_transaction(addr);
    }

    /// A response completed the head transaction; drop it and wake the next.
    fn cleanup_after_response(&mut self, addr: u64) {
        self.mshr.remove_front(addr);
        self.finish_transaction(addr);
    }

    fn finish_transaction(&mut self, addr: u64) {
        if self.mshr.front_is_event(addr)
            && !self.mshr.in_progress(addr)
            && self.mshr.acks_needed(addr) == 0
        {
            self.schedule_retry(addr);
        }
        if self.store.state_of(addr).is_stable() && self.store.get(addr).is_some() {
            self.update_cache(addr);
        }
    }

    //
    // #endregion

    // #region Responses table
    //

    fn record_response(&mut self, addr: u64, dst: &str, id: EventId) {
        self.responses.entry(addr).or_default().insert(dst.to_owned(), id);
    }

    fn erase_response(&mut self, addr: u64, src: &str) {
        if let Some(map) = self.responses.get_mut(&addr) {
            map.remove(src);
            if map.is_empty() {
                self.responses.remove(&addr);
            }
        }
    }

    fn has_response_entry(&self, addr: u64, src: &str) -> bool {
        self.responses.get(&addr).map_or(false, |m| m.contains_key(src))
    }

    fn expects_response(&self, addr: u64, dst: &str, id: EventId) -> bool {
        self.responses.get(&addr).and_then(|m| m.get(dst)) == Some(&id)
    }

    /// Number of outstanding fetch/inv responses for a line; matches the MSHR
    /// ack counter while a `*Inv` transition is pending.
    pub fn pending_responses(&self, addr: u64) -> usize {
        self.responses.get(&addr).map_or(0, |m| m.len())
    }

    //
    // #endregion

    fn debug_addr_enabled(&self, addr: u64) -> bool {
        self.debug_addr.is_empty() || self.debug_addr.contains(&addr)
    }
}
