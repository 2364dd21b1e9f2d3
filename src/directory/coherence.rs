//! The coherence state machine.
//!
//! One handler per command, each a match on the line's directory state. A
//! handler either completes the request in place, allocates an MSHR slot and
//! issues subsidiary traffic (memory reads, fetches, invalidations), defers a
//! racing event behind the running transaction, or NACKs when the MSHR is
//! full. Handlers return Ok(false) only when the event must stay in its
//! buffer and retry next cycle.

use super::dir_entry::State;
use super::DirectoryController;
use crate::config::Protocol;
use crate::error::{FatalError, Result};
use crate::event::{Command, MemEvent};
use crate::mshr::MemEventStatus;

impl DirectoryController {
    fn protocol_error(&self, ev: &MemEvent, state: State) -> FatalError {
        FatalError::Protocol {
            cmd: ev.cmd(),
            state,
            addr: ev.base_addr(),
            src: ev.src().to_owned(),
        }
    }

    fn entry_snapshot(&mut self, addr: u64) -> (State, bool) {
        let entry = self.store.get_or_create(addr);
        (entry.state(), entry.is_cached())
    }

    // #region Requests
    //

    pub(super) fn handle_get_s(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        // Dirty data parked here by a racing eviction goes home first.
        if self.mshr.has_data(addr) && self.mshr.data_dirty(addr) {
            self.writeback_data_from_mshr(addr)?;
        }

        let mut status = MemEventStatus::Ok;
        match state {
            State::I => {
                if self.mshr.has_data(addr) {
                    if !in_mshr {
                        // Buffered data can only have been parked by a
                        // transaction that is itself in the MSHR.
                        return Err(self.protocol_error(ev, state));
                    }
                    let data = self.mshr.get_data(addr).unwrap().to_vec();
                    if self.incoherent_src.contains(ev.src()) {
                        self.send_data_response(ev, Command::GetSResp, data, 0)?;
                    } else if self.protocol == Protocol::Mesi {
                        let entry = self.store.get_mut(addr).unwrap();
                        entry.set_state(State::M);
                        entry.set_owner(ev.src());
                        self.send_data_response(ev, Command::GetXResp, data, 0)?;
                        self.mshr.clear_data(addr);
                    } else {
                        let entry = self.store.get_mut(addr).unwrap();
                        entry.set_state(State::S);
                        entry.add_sharer(ev.src());
                        self.send_data_response(ev, Command::GetSResp, data, 0)?;
                    }
                    self.cleanup_after_request(addr, in_mshr);
                } else {
                    // Miss; get the line from memory.
                    status = if in_mshr {
                        MemEventStatus::Ok
                    } else {
                        self.allocate_mshr(ev, false, None)
                    };
                    if status == MemEventStatus::Ok {
                        self.issue_memory_request(ev, true)?;
                        self.store.get_mut(addr).unwrap().set_state(State::IS);
                    }
                }
            }
            State::S => {
                if self.mshr.has_data(addr) {
                    // Saved from an earlier request.
                    if !self.incoherent_src.contains(ev.src()) {
                        self.store.get_mut(addr).unwrap().add_sharer(ev.src());
                    }
                    let data = self.mshr.get_data(addr).unwrap().to_vec();
                    self.send_data_response(ev, Command::GetSResp, data, 0)?;
                    self.cleanup_after_request(addr, in_mshr);
                } else {
                    status = if in_mshr {
                        MemEventStatus::Ok
                    } else {
                        self.allocate_mshr(ev, false, None)
                    };
                    if status == MemEventStatus::Ok {
                        self.issue_memory_request(ev, true)?;
                        self.store.get_mut(addr).unwrap().set_state(State::SD);
                    }
                }
            }
            State::M => {
                status =
                    if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
                if status == MemEventStatus::Ok {
                    // Downgrade the owner to a sharer and pull the data.
                    self.issue_fetch(ev, Command::FetchInvX)?;
                    self.store.get_mut(addr).unwrap().set_state(State::MInvX);
                }
            }
            _ => {
                // Race with an in-flight transition; queue behind it.
                if !in_mshr {
                    status = self.allocate_mshr(ev, false, None);
                }
            }
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    pub(super) fn handle_get_x(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        if self.mshr.has_data(addr) && self.mshr.data_dirty(addr) {
            self.writeback_data_from_mshr(addr)?;
        }

        let mut status = MemEventStatus::Ok;
        match state {
            State::I => {
                if self.mshr.has_data(addr) {
                    if !in_mshr {
                        return Err(self.protocol_error(ev, state));
                    }
                    if !self.incoherent_src.contains(ev.src()) {
                        let entry = self.store.get_mut(addr).unwrap();
                        entry.set_state(State::M);
                        entry.set_owner(ev.src());
                    }
                    let data = self.mshr.get_data(addr).unwrap().to_vec();
                    self.send_data_response(ev, Command::GetXResp, data, 0)?;
                    self.mshr.clear_data(addr);
                    self.cleanup_after_request(addr, in_mshr);
                } else {
                    status = if in_mshr {
                        MemEventStatus::Ok
                    } else {
                        self.allocate_mshr(ev, false, None)
                    };
                    if status == MemEventStatus::Ok {
                        self.store.get_mut(addr).unwrap().set_state(State::IM);
                        self.issue_memory_request(ev, true)?;
                    }
                }
            }
            State::S => {
                let (is_sharer, sharer_count) = {
                    let entry = self.store.get(addr).unwrap();
                    (entry.is_sharer(ev.src()), entry.sharer_count())
                };
                if is_sharer {
                    // Upgrade request; no data needed.
                    if sharer_count == 1 {
                        // No invalidations either; grant in place.
                        if self.mshr.has_data(addr) {
                            self.mshr.clear_data(addr);
                        }
                        let entry = self.store.get_mut(addr).unwrap();
                        entry.set_state(State::M);
                        entry.remove_sharer(ev.src());
                        entry.set_owner(ev.src());
                        self.send_response(ev, 0, 0)?;
                        self.cleanup_after_request(addr, in_mshr);
                    } else {
                        status = if in_mshr {
                            MemEventStatus::Ok
                        } else {
                            self.allocate_mshr(ev, false, None)
                        };
                        if status == MemEventStatus::Ok {
                            if self.mshr.has_data(addr) {
                                self.mshr.clear_data(addr);
                            }
                            self.store.get_mut(addr).unwrap().set_state(State::SInv);
                            self.issue_invalidations(ev, Command::Inv)?;
                        }
                    }
                } else {
                    // Need data as well as invalidations.
                    status = if in_mshr {
                        MemEventStatus::Ok
                    } else {
                        self.allocate_mshr(ev, false, None)
                    };
                    if status == MemEventStatus::Ok {
                        if self.mshr.has_data(addr) {
                            self.store.get_mut(addr).unwrap().set_state(State::SInv);
                        } else {
                            self.store.get_mut(addr).unwrap().set_state(State::SMInv);
                            self.issue_memory_request(ev, true)?;
                        }
                        self.issue_invalidations(ev, Command::Inv)?;
                    }
                }
            }
            State::M => {
                status =
                    if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
                if status == MemEventStatus::Ok {
                    self.store.get_mut(addr).unwrap().set_state(State::MInv);
                    self.issue_fetch(ev, Command::FetchInv)?;
                }
            }
            _ => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, false, None);
                }
            }
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    /// A Write that is not flagged noncacheable is a request to write
    /// coherently by a non-caching device.
    pub(super) fn handle_write(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        let mut status = MemEventStatus::Ok;
        match state {
            State::I => {
                self.flush_stale_mshr_data(addr)?;
                status =
                    if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
                if status == MemEventStatus::Ok {
                    self.store.get_mut(addr).unwrap().set_state(State::IM);
                    // A Write has no line granularity; forward as-is.
                    self.issue_memory_request(ev, false)?;
                }
            }
            State::S => {
                self.flush_stale_mshr_data(addr)?;
                // Invalidate sharers, then forward the Write to memory.
                status =
                    if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
                if status == MemEventStatus::Ok {
                    self.store.get_mut(addr).unwrap().set_state(State::SInv);
                    self.issue_invalidations(ev, Command::Inv)?;
                }
            }
            State::M => {
                self.flush_stale_mshr_data(addr)?;
                status =
                    if in_mshr { MemEventStatus::Ok } else { self.allocate_mshr(ev, false, None) };
                if status == MemEventStatus::Ok {
                    self.store.get_mut(addr).unwrap().set_state(State::MInv);
                    self.issue_fetch(ev, Command::FetchInv)?;
                }
            }
            _ => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, false, None);
                }
            }
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    /// Write back and drop data buffered by a transaction that is now stale.
    fn flush_stale_mshr_data(&mut self, addr: u64) -> Result<()> {
        if self.mshr.has_data(addr) {
            if self.mshr.data_dirty(addr) {
                self.writeback_data_from_mshr(addr)?;
            }
            self.mshr.clear_data(addr);
        }
        Ok(())
    }

    //
    // #endregion

    // #region Flushes
    //

    pub(super) fn handle_flush_line(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        let mut status = MemEventStatus::Ok;
        if !in_mshr {
            self.stats.directory_cache_hits += 1;
            status = self.allocate_mshr(ev, false, None);
        }

        match state {
            State::I => {
                if status == MemEventStatus::Ok {
                    self.issue_flush(ev)?;
                }
            }
            State::S => {
                if status == MemEventStatus::Ok {
                    self.issue_flush(ev)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SB);
                }
            }
            State::M => {
                if status == MemEventStatus::Ok {
                    if ev.evict() {
                        // Fold the eviction into this flush.
                        let entry = self.store.get_mut(addr).unwrap();
                        entry.remove_owner();
                        entry.add_sharer(ev.src());
                        self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                        self.consume_evict(ev);
                    } else if self.store.get(addr).unwrap().has_owner() {
                        self.issue_fetch(ev, Command::FetchInvX)?;
                        self.store.get_mut(addr).unwrap().set_state(State::MInvX);
                        return Ok(true);
                    }
                    self.issue_flush(ev)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SB);
                }
            }
            State::MInv => {
                if ev.evict() {
                    let entry = self.store.get_mut(addr).unwrap();
                    entry.remove_owner();
                    entry.add_sharer(ev.src());
                    entry.set_state(State::SInv);
                    self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                    self.consume_evict(ev);
                }
            }
            State::MInvX => {
                if ev.evict() {
                    let entry = self.store.get_mut(addr).unwrap();
                    entry.remove_owner();
                    entry.add_sharer(ev.src());
                    entry.set_state(State::S);
                    self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                    self.mshr.decrement_acks_needed(addr);
                    let src = ev.src().to_owned();
                    self.erase_response(addr, &src);
                    self.schedule_retry(addr);
                }
            }
            _ => (),
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    pub(super) fn handle_flush_line_inv(
        &mut self,
        ev: &mut MemEvent,
        in_mshr: bool,
    ) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        let mut status = MemEventStatus::Ok;
        if !in_mshr {
            self.stats.directory_cache_hits += 1;
            status = self.allocate_mshr(ev, false, None);
        }

        let src = ev.src().to_owned();
        match state {
            State::I => {
                if status == MemEventStatus::Ok {
                    self.issue_flush(ev)?;
                }
            }
            State::S => {
                if status == MemEventStatus::Ok {
                    if ev.evict() {
                        self.store.get_mut(addr).unwrap().remove_sharer(&src);
                        self.consume_evict(ev);
                    }
                    if self.store.get(addr).unwrap().has_sharers() {
                        self.store.get_mut(addr).unwrap().set_state(State::SInv);
                        self.issue_invalidations(ev, Command::Inv)?;
                    } else {
                        self.store.get_mut(addr).unwrap().set_state(State::IB);
                        self.issue_flush(ev)?;
                    }
                }
            }
            State::M => {
                if status == MemEventStatus::Ok {
                    if ev.evict() {
                        self.store.get_mut(addr).unwrap().remove_owner();
                        self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                        self.consume_evict(ev);
                    }
                    if self.store.get(addr).unwrap().has_owner() {
                        self.store.get_mut(addr).unwrap().set_state(State::MInv);
                        self.issue_fetch(ev, Command::FetchInv)?;
                    } else {
                        self.store.get_mut(addr).unwrap().set_state(State::IB);
                        self.issue_flush(ev)?;
                    }
                }
            }
            State::SD => {
                if ev.evict() {
                    let entry = self.store.get_mut(addr).unwrap();
                    entry.remove_sharer(&src);
                    let empty = !entry.has_sharers();
                    if empty {
                        entry.set_state(State::IS);
                    }
                    self.consume_evict(ev);
                }
            }
            State::SB => {
                if ev.evict() {
                    let entry = self.store.get_mut(addr).unwrap();
                    entry.remove_sharer(&src);
                    let empty = !entry.has_sharers();
                    if empty {
                        entry.set_state(State::I);
                    }
                    self.consume_evict(ev);
                }
            }
            State::MInvX => {
                if ev.evict() {
                    self.store.get_mut(addr).unwrap().remove_owner();
                    self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                    self.consume_evict(ev);
                    self.erase_response(addr, &src);
                    if self.mshr.decrement_acks_needed(addr) {
                        self.store.get_mut(addr).unwrap().set_state(State::I);
                        self.schedule_retry(addr);
                    }
                }
            }
            State::SDInv => {
                if ev.evict() {
                    self.store.get_mut(addr).unwrap().remove_sharer(&src);
                    self.consume_evict(ev);
                    self.erase_response(addr, &src);
                    if self.mshr.decrement_acks_needed(addr) {
                        let entry = self.store.get_mut(addr).unwrap();
                        let next = if entry.has_sharers() { State::SD } else { State::IS };
                        entry.set_state(next);
                        self.schedule_retry(addr);
                    }
                }
            }
            State::SMInv => {
                if ev.evict() {
                    self.store.get_mut(addr).unwrap().remove_sharer(&src);
                    self.consume_evict(ev);
                    self.erase_response(addr, &src);
                    if self.mshr.decrement_acks_needed(addr) {
                        self.store.get_mut(addr).unwrap().set_state(State::IM);
                    }
                }
            }
            State::SInv => {
                if ev.evict() {
                    self.store.get_mut(addr).unwrap().remove_sharer(&src);
                    self.consume_evict(ev);
                    self.erase_response(addr, &src);
                    if self.mshr.decrement_acks_needed(addr) {
                        let entry = self.store.get_mut(addr).unwrap();
                        let next = if entry.has_sharers() { State::S } else { State::I };
                        entry.set_state(next);
                        self.schedule_retry(addr);
                    }
                }
            }
            State::MInv => {
                if ev.evict() {
                    self.store.get_mut(addr).unwrap().remove_sharer(&src);
                    self.consume_evict(ev);
                    self.erase_response(addr, &src);
                    if self.mshr.decrement_acks_needed(addr) {
                        self.store.get_mut(addr).unwrap().set_state(State::I);
                        self.schedule_retry(addr);
                    }
                }
            }
            _ => (),
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    /// The eviction carried by a flush has been applied; make sure a replay
    /// of the same event (from the MSHR or a NACK) does not apply it again.
    fn consume_evict(&mut self, ev: &mut MemEvent) {
        ev.set_evict(false);
        self.mshr.clear_evict(ev.base_addr(), ev.id());
    }

    //
    // #endregion

    // #region Replacements
    //

    pub(super) fn handle_put_s(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        let src = ev.src().to_owned();
        self.store.get_mut(addr).unwrap().remove_sharer(&src);
        self.send_ack_put(ev)?;

        // If this sharer owed us an inv ack, the Put settles it.
        if self.has_response_entry(addr, &src) {
            self.erase_response(addr, &src);
        }

        match state {
            State::S => {
                let entry = self.store.get_mut(addr).unwrap();
                if !entry.has_sharers() {
                    entry.set_state(State::I);
                }
            }
            State::SB => {
                let entry = self.store.get_mut(addr).unwrap();
                if !entry.has_sharers() {
                    entry.set_state(State::I);
                }
            }
            State::SD => {
                let entry = self.store.get_mut(addr).unwrap();
                if !entry.has_sharers() {
                    entry.set_state(State::IS);
                }
            }
            State::SInv => {
                if self.mshr.decrement_acks_needed(addr) {
                    let entry = self.store.get_mut(addr).unwrap();
                    let next = if entry.has_sharers() { State::S } else { State::I };
                    entry.set_state(next);
                    self.schedule_retry(addr);
                    // The retry is already scheduled; don't schedule a second
                    // one from the cleanup below.
                    self.mshr.set_in_progress(addr);
                }
            }
            State::SDInv => {
                if self.mshr.decrement_acks_needed(addr) {
                    let entry = self.store.get_mut(addr).unwrap();
                    let next = if entry.has_sharers() { State::SD } else { State::IS };
                    entry.set_state(next);
                }
            }
            State::SMInv => {
                if self.mshr.decrement_acks_needed(addr) {
                    self.store.get_mut(addr).unwrap().set_state(State::IM);
                }
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.cleanup_after_request(addr, in_mshr);
        Ok(true)
    }

    pub(super) fn handle_put_x(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        let src = ev.src().to_owned();
        {
            let entry = self.store.get_mut(addr).unwrap();
            entry.remove_owner();
            entry.add_sharer(&src);
        }
        self.send_ack_put(ev)?;

        match state {
            State::M => {
                if ev.dirty() {
                    self.writeback_data(ev)?;
                }
                self.store.get_mut(addr).unwrap().set_state(State::S);
            }
            State::MInv => {
                self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                self.store.get_mut(addr).unwrap().set_state(State::SInv);
            }
            State::MInvX => {
                self.mshr.decrement_acks_needed(addr);
                self.erase_response(addr, &src);
                self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                self.store.get_mut(addr).unwrap().set_state(State::S);
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.cleanup_after_request(addr, in_mshr);
        Ok(true)
    }

    pub(super) fn handle_put_e(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        self.store.get_mut(addr).unwrap().remove_owner();
        self.send_ack_put(ev)?;

        match state {
            State::M => {
                self.store.get_mut(addr).unwrap().set_state(State::I);
            }
            State::MInv | State::MInvX => {
                self.mshr.decrement_acks_needed(addr);
                let src = ev.src().to_owned();
                self.erase_response(addr, &src);
                self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                self.store.get_mut(addr).unwrap().set_state(State::I);
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.cleanup_after_request(addr, in_mshr);
        Ok(true)
    }

    pub(super) fn handle_put_m(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        self.store.get_mut(addr).unwrap().remove_owner();
        self.send_ack_put(ev)?;

        match state {
            State::M => {
                self.writeback_data(ev)?;
                self.store.get_mut(addr).unwrap().set_state(State::I);
            }
            State::MInv | State::MInvX => {
                self.mshr.decrement_acks_needed(addr);
                let src = ev.src().to_owned();
                self.erase_response(addr, &src);
                self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
                self.store.get_mut(addr).unwrap().set_state(State::I);
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.cleanup_after_request(addr, in_mshr);
        Ok(true)
    }

    //
    // #endregion

    // #region Shootdowns from the mem side
    //

    pub(super) fn handle_fetch_inv(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        let mut status = MemEventStatus::Ok;
        match state {
            State::I => {
                let front_is_flush = self
                    .mshr
                    .front_event(addr)
                    .map_or(false, |front| front.cmd() == Command::FlushLineInv);
                if !self.mshr.pending_writeback(addr)
                    && !front_is_flush
                    && self.mshr.has_data(addr)
                    && self.mshr.data_dirty(addr)
                {
                    self.send_fetch_response(ev)?;
                } else {
                    self.send_ack_inv(ev)?;
                }
                self.cleanup_after_request(addr, in_mshr);
            }
            State::S => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, None);
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::Inv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SInv);
                }
            }
            State::M => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, None);
                }
                if status == MemEventStatus::Ok {
                    self.issue_fetch(ev, Command::FetchInv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::MInv);
                }
            }
            State::IS | State::IM => {
                if !self.mshr.pending_writeback(addr) {
                    self.send_ack_inv(ev)?;
                }
                self.cleanup_after_request(addr, in_mshr);
            }
            State::IB => {
                self.send_ack_inv(ev)?;
                self.store.get_mut(addr).unwrap().set_state(State::I);
                self.cleanup_after_request(addr, in_mshr);
            }
            State::SB => {
                if !in_mshr {
                    // Ahead of the flush.
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::Inv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SBInv);
                }
            }
            State::SD => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::Inv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SDInv);
                }
            }
            State::SInv | State::MInv | State::MInvX => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(1));
                }
            }
            State::SMInv => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    pub(super) fn handle_force_inv(&mut self, ev: &mut MemEvent, in_mshr: bool) -> Result<bool> {
        let addr = ev.base_addr();
        let (state, cached) = self.entry_snapshot(addr);

        if !cached {
            return self.retrieve_dir_entry(ev, in_mshr);
        }

        if !in_mshr {
            self.stats.directory_cache_hits += 1;
        }

        let mut status = MemEventStatus::Ok;
        match state {
            State::I => {
                self.send_ack_inv(ev)?;
                self.cleanup_after_request(addr, in_mshr);
            }
            State::S => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::ForceInv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SInv);
                }
            }
            State::M => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    let owner = match self.store.get(addr).unwrap().owner() {
                        Some(owner) => owner.to_owned(),
                        None => return Err(self.protocol_error(ev, state)),
                    };
                    self.issue_invalidation(&owner, Some(ev), addr, Command::ForceInv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::MInv);
                }
            }
            State::IS | State::IM | State::IB => {
                if !self.mshr.pending_writeback(addr) {
                    self.send_ack_inv(ev)?;
                }
                self.cleanup_after_request(addr, in_mshr);
            }
            State::SB => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::ForceInv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SBInv);
                }
            }
            State::SD => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
                if status == MemEventStatus::Ok {
                    self.issue_invalidations(ev, Command::ForceInv)?;
                    self.store.get_mut(addr).unwrap().set_state(State::SDInv);
                }
            }
            State::SInv | State::MInv | State::MInvX => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(1));
                }
            }
            State::SMInv => {
                if !in_mshr {
                    status = self.allocate_mshr(ev, true, Some(0));
                }
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        if status == MemEventStatus::Reject {
            self.send_nack(ev)?;
        }
        Ok(true)
    }

    //
    // #endregion

    // #region Responses
    //

    pub(super) fn handle_get_s_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        // Transient entries are never spilled, so the entry is resident.
        let req = match self.mshr.front_event(addr) {
            Some(req) => req.clone(),
            None => return Err(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() }),
        };

        if state != State::IS && state != State::SD {
            return Err(self.protocol_error(ev, state));
        }

        if !self.incoherent_src.contains(req.src()) {
            let entry = self.store.get_mut(addr).unwrap();
            entry.set_state(State::S);
            entry.add_sharer(req.src());
        } else if state == State::IS {
            self.store.get_mut(addr).unwrap().set_state(State::I);
        } else {
            self.store.get_mut(addr).unwrap().set_state(State::S);
        }

        self.send_data_response(&req, Command::GetSResp, ev.payload().to_vec(), 0)?;
        // Save the data so a subsequent GetS is served without memory traffic.
        self.mshr.set_data(addr, ev.payload().to_vec(), false);
        self.cleanup_after_response(addr);
        Ok(true)
    }

    pub(super) fn handle_get_x_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        let req = match self.mshr.front_event(addr) {
            Some(req) => req.clone(),
            None => return Err(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() }),
        };
        let coherent = !self.incoherent_src.contains(req.src());

        match state {
            State::IS if !coherent => {
                self.store.get_mut(addr).unwrap().set_state(State::I);
                self.send_data_response(&req, Command::GetSResp, ev.payload().to_vec(), 0)?;
            }
            State::IS if self.protocol == Protocol::Mesi => {
                let entry = self.store.get_mut(addr).unwrap();
                entry.set_state(State::M);
                entry.set_owner(req.src());
                self.send_data_response(&req, Command::GetXResp, ev.payload().to_vec(), 0)?;
            }
            State::IS | State::SD => {
                let entry = self.store.get_mut(addr).unwrap();
                entry.set_state(State::S);
                if coherent {
                    entry.add_sharer(req.src());
                }
                self.send_data_response(&req, Command::GetSResp, ev.payload().to_vec(), 0)?;
                self.mshr.set_data(addr, ev.payload().to_vec(), false);
            }
            State::IM => {
                if coherent {
                    let entry = self.store.get_mut(addr).unwrap();
                    entry.set_state(State::M);
                    entry.set_owner(req.src());
                } else {
                    self.store.get_mut(addr).unwrap().set_state(State::I);
                }
                self.send_data_response(&req, Command::GetXResp, ev.payload().to_vec(), 0)?;
            }
            State::SMInv => {
                // Invalidations still outstanding; park the data and wait.
                self.store.get_mut(addr).unwrap().set_state(State::SInv);
                self.mshr.set_data(addr, ev.payload().to_vec(), false);
                return Ok(true);
            }
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.cleanup_after_response(addr);
        Ok(true)
    }

    pub(super) fn handle_write_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        let req = match self.mshr.front_event(addr) {
            Some(req) => req.clone(),
            None => return Err(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() }),
        };

        if state != State::IM {
            return Err(self.protocol_error(ev, state));
        }

        self.store.get_mut(addr).unwrap().set_state(State::I);
        let mut resp = req.make_response();
        resp.set_src(&self.name);
        let ts = self.timestamp + self.mshr_latency;
        self.forward_by_destination(resp, ts, false)?;
        self.cleanup_after_response(addr);
        Ok(true)
    }

    pub(super) fn handle_flush_line_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        let req = match self.mshr.front_event(addr) {
            Some(req) => req.clone(),
            None => return Err(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() }),
        };
        self.mshr.clear_data(addr);

        match state {
            State::I => (),
            State::IB => self.store.get_mut(addr).unwrap().set_state(State::I),
            State::SB => self.store.get_mut(addr).unwrap().set_state(State::S),
            _ => return Err(self.protocol_error(ev, state)),
        }

        self.send_response(&req, ev.flags(), ev.mem_flags())?;
        self.cleanup_after_response(addr);
        Ok(true)
    }

    pub(super) fn handle_ack_put(&mut self, ev: &mut MemEvent) -> Result<bool> {
        self.cleanup_after_response(ev.base_addr());
        Ok(true)
    }

    pub(super) fn handle_ack_inv(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);
        let src = ev.src().to_owned();

        {
            let entry = match self.store.get_mut(addr) {
                Some(entry) => entry,
                None => return Err(self.protocol_error(ev, State::NP)),
            };
            if entry.is_sharer(&src) {
                entry.remove_sharer(&src);
            } else {
                entry.remove_owner();
            }
        }

        let done = self.mshr.decrement_acks_needed(addr);
        self.erase_response(addr, &src);

        if !done {
            return Ok(true);
        }

        match state {
            State::MInv => {
                self.store.get_mut(addr).unwrap().set_state(State::I);
                self.schedule_retry(addr);
            }
            State::SInv => {
                let entry = self.store.get_mut(addr).unwrap();
                let next = if entry.has_sharers() { State::S } else { State::I };
                entry.set_state(next);
                self.schedule_retry(addr);
            }
            State::SBInv => {
                let entry = self.store.get_mut(addr).unwrap();
                let next = if entry.has_sharers() { State::SB } else { State::I };
                entry.set_state(next);
                self.schedule_retry(addr);
            }
            State::SDInv => {
                let entry = self.store.get_mut(addr).unwrap();
                let next = if entry.has_sharers() { State::SD } else { State::IS };
                entry.set_state(next);
                self.schedule_retry(addr);
            }
            State::SMInv => {
                self.store.get_mut(addr).unwrap().set_state(State::IM);
            }
            _ => return Err(self.protocol_error(ev, state)),
        }
        Ok(true)
    }

    pub(super) fn handle_fetch_x_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        if state != State::MInvX {
            return Err(self.protocol_error(ev, state));
        }

        self.mshr.decrement_acks_needed(addr);
        let src = ev.src().to_owned();
        self.erase_response(addr, &src);

        // Save the data for the retry and demote the owner to a sharer.
        self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());
        let entry = self.store.get_mut(addr).unwrap();
        entry.remove_owner();
        entry.add_sharer(&src);
        entry.set_state(State::S);
        self.schedule_retry(addr);
        Ok(true)
    }

    pub(super) fn handle_fetch_resp(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let addr = ev.base_addr();
        let state = self.store.state_of(addr);

        if state != State::SInv && state != State::MInv {
            return Err(self.protocol_error(ev, state));
        }

        self.mshr.decrement_acks_needed(addr);
        let src = ev.src().to_owned();
        self.erase_response(addr, &src);
        self.mshr.set_data(addr, ev.payload().to_vec(), ev.dirty());

        self.store.get_mut(addr).unwrap().set_state(State::I);
        self.schedule_retry(addr);

        if ev.dirty() {
            self.writeback_data_from_mshr(addr)?;
        }
        Ok(true)
    }

    pub(super) fn handle_nack(&mut self, ev: &mut MemEvent) -> Result<bool> {
        let nacked = match ev.take_nacked() {
            Some(nacked) => nacked,
            None => return Err(FatalError::OrphanResponse { cmd: ev.cmd(), id: ev.id() }),
        };
        let addr = nacked.base_addr();

        match nacked.cmd() {
            // Our own requests toward memory: always retry.
            Command::GetS
            | Command::GetX
            | Command::GetSX
            | Command::PutM
            | Command::FlushLine
            | Command::FlushLineInv => (),
            // Fetches and invalidations: retry only if the response is still
            // expected from that exact event.
            Command::FetchInv | Command::FetchInvX | Command::Inv | Command::ForceInv => {
                if !self.expects_response(addr, nacked.dst(), nacked.id()) {
                    return Ok(true);
                }
            }
            _ => {
                let state = self.store.state_of(addr);
                return Err(FatalError::Protocol {
                    cmd: nacked.cmd(),
                    state,
                    addr,
                    src: nacked.src().to_owned(),
                });
            }
        }

        let ts = self.timestamp + self.mshr_latency;
        self.forward_by_destination(nacked, ts, false)?;
        Ok(true)
    }

    //
    // #endregion

    // #region Outgoing event construction
    //

    /// Forward a request to memory on behalf of the requester.
    pub(super) fn issue_memory_request(
        &mut self,
        ev: &MemEvent,
        line_granularity: bool,
    ) -> Result<()> {
        let mut req = ev.clone();
        req.set_src(&self.name);
        if line_granularity {
            req.set_size(self.line_size);
        }
        let ts = self.timestamp + self.access_latency;
        self.forward_by_address(req, ts, false)?;
        self.mshr.set_in_progress(ev.base_addr());
        Ok(())
    }

    /// Forward a flush to memory, folding in any dirty data parked in the
    /// MSHR so it is written back by the same flush.
    pub(super) fn issue_flush(&mut self, ev: &MemEvent) -> Result<()> {
        let addr = ev.base_addr();
        let mut flush = ev.clone();
        flush.set_src(&self.name);

        if self.mshr.has_data(addr) && self.mshr.data_dirty(addr) {
            flush.set_evict(true);
            flush.set_payload(self.mshr.get_data(addr).unwrap().to_vec());
            flush.set_dirty(true);
            self.mshr.clear_data(addr);
        } else {
            flush.set_payload(Vec::new());
        }

        self.mshr.set_in_progress(addr);
        let ts = self.timestamp + self.access_latency;
        self.forward_by_address(flush, ts, false)
    }

    /// Send a fetch (FetchInv/FetchInvX) to the line's owner and expect a
    /// response from it.
    pub(super) fn issue_fetch(&mut self, ev: &MemEvent, cmd: Command) -> Result<()> {
        let addr = ev.base_addr();
        let owner = match self.store.get(addr).and_then(|e| e.owner()) {
            Some(owner) => owner.to_owned(),
            None => return Err(self.protocol_error(ev, self.store.state_of(addr))),
        };

        let mut fetch = MemEvent::new(&self.name, ev.addr(), addr, cmd, self.line_size);
        fetch.set_dst(&owner);

        self.record_response(addr, &owner, fetch.id());
        self.mshr.increment_acks_needed(addr);

        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(fetch, ts, false)
    }

    /// Invalidate every sharer except the requester, in sharer-set order.
    pub(super) fn issue_invalidations(&mut self, ev: &MemEvent, cmd: Command) -> Result<()> {
        let addr = ev.base_addr();
        let rqstr = ev.src().to_owned();
        let sharers: Vec<String> = self
            .store
            .get(addr)
            .map(|e| e.sharers().iter().cloned().collect())
            .unwrap_or_default();
        for dst in sharers {
            if dst == rqstr {
                continue;
            }
            self.issue_invalidation(&dst, Some(ev), addr, cmd)?;
        }
        Ok(())
    }

    pub(super) fn issue_invalidation(
        &mut self,
        dst: &str,
        ev: Option<&MemEvent>,
        addr: u64,
        cmd: Command,
    ) -> Result<()> {
        let mut inv = MemEvent::new(&self.name, addr, addr, cmd, self.line_size);
        if let Some(ev) = ev {
            inv.copy_metadata(ev);
        }
        inv.set_dst(dst);

        self.mshr.increment_acks_needed(addr);
        self.record_response(addr, dst, inv.id());

        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(inv, ts, false)
    }

    pub(super) fn send_data_response(
        &mut self,
        req: &MemEvent,
        cmd: Command,
        data: Vec<u8>,
        mem_flags: u32,
    ) -> Result<()> {
        let mut resp = req.make_response_cmd(cmd);
        resp.set_src(&self.name);
        resp.set_size(self.line_size);
        resp.set_payload(data);
        resp.set_mem_flags(mem_flags);
        let ts = self.timestamp + self.mshr_latency;
        self.forward_by_destination(resp, ts, false)
    }

    pub(super) fn send_response(
        &mut self,
        req: &MemEvent,
        flags: u32,
        mem_flags: u32,
    ) -> Result<()> {
        let mut resp = req.make_response();
        resp.set_src(&self.name);
        resp.set_size(self.line_size);
        resp.set_flags(flags);
        resp.set_mem_flags(mem_flags);
        let ts = self.timestamp + self.mshr_latency;
        self.forward_by_destination(resp, ts, false)
    }

    /// Write the payload carried by `ev` back to memory.
    pub(super) fn writeback_data(&mut self, ev: &MemEvent) -> Result<()> {
        let addr = ev.base_addr();
        let mut wb = MemEvent::new(&self.name, addr, addr, Command::PutM, self.line_size);
        wb.copy_metadata(ev);
        wb.set_payload(ev.payload().to_vec());
        wb.set_dirty(ev.dirty());

        if self.wait_wb_ack {
            self.mshr.insert_writeback(addr, false);
        }

        let ts = self.timestamp + self.access_latency;
        self.forward_by_address(wb, ts, false)
    }

    /// Write data parked in the MSHR back to memory; the buffered copy stays
    /// but is clean afterwards.
    pub(super) fn writeback_data_from_mshr(&mut self, addr: u64) -> Result<()> {
        let mut wb = MemEvent::new(&self.name, addr, addr, Command::PutM, self.line_size);
        wb.set_payload(self.mshr.get_data(addr).map(|d| d.to_vec()).unwrap_or_default());
        wb.set_dirty(self.mshr.data_dirty(addr));
        self.mshr.set_data_dirty(addr, false);

        if self.wait_wb_ack {
            self.mshr.insert_writeback(addr, false);
        }

        let ts = self.timestamp + self.mshr_latency;
        self.forward_by_address(wb, ts, false)
    }

    /// Answer a shootdown with the dirty data parked in the MSHR.
    pub(super) fn send_fetch_response(&mut self, ev: &MemEvent) -> Result<()> {
        let addr = ev.base_addr();
        let mut resp = ev.make_response();
        resp.set_src(&self.name);
        resp.set_payload(self.mshr.get_data(addr).map(|d| d.to_vec()).unwrap_or_default());
        resp.set_dirty(self.mshr.data_dirty(addr));
        self.mshr.clear_data(addr);
        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(resp, ts, false)
    }

    pub(super) fn send_ack_inv(&mut self, ev: &MemEvent) -> Result<()> {
        let addr = ev.base_addr();
        let mut ack = ev.make_response_cmd(Command::AckInv);
        ack.set_src(&self.name);
        if self.mshr.has_data(addr) {
            self.mshr.clear_data(addr);
        }
        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(ack, ts, false)
    }

    pub(super) fn send_ack_put(&mut self, ev: &MemEvent) -> Result<()> {
        let mut ack = ev.make_response_cmd(Command::AckPut);
        ack.set_src(&self.name);
        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(ack, ts, false)
    }

    /// Resource exhaustion is the only recoverable failure: hand the event
    /// back and let the peer retry.
    pub(super) fn send_nack(&mut self, ev: &MemEvent) -> Result<()> {
        let nack = ev.make_nack_response(&self.name);
        let ts = self.timestamp + self.access_latency;
        self.forward_by_destination(nack, ts, false)
    }

    //
    // #endregion
}
