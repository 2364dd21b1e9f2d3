//! Controller mechanics: back-pressure, arbitration, entry spill/fill,
//! noncacheable pass-through, clock gating and the untimed init exchange.

mod common;

use common::{make_owned, make_shared, Harness, TestLink};
use memdir::config::{Config, Protocol};
use memdir::directory::dir_entry::State;
use memdir::event::{Command, MemEvent, F_NONCACHEABLE, F_NORESPONSE};
use memdir::link::{Endpoint, InitEvent};
use memdir::FatalError;

fn msi() -> Config {
    Config { coherence_protocol: Protocol::Msi, ..Config::default() }
}

const A1: u64 = 0x1000;
const A2: u64 = 0x2000;

#[test]
fn full_mshr_nacks_and_recovers() {
    let cfg = Config { mshr_num_entries: 1, ..msi() };
    let mut h = Harness::new(cfg);

    let req = h.request("core0", Command::GetS, A1);
    h.deliver(req);
    h.run(2);
    let pending = h.take_mem();
    assert_eq!(pending.len(), 1);

    // The second line finds the MSHR full and is bounced back.
    let req = h.request("core1", Command::GetS, A2);
    h.deliver(req);
    h.run(2);

    let cpu = h.take_cpu();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cmd(), Command::NACK);
    assert_eq!(cpu[0].dst(), "core1");
    let mut nack = cpu[0].clone();
    let nacked = nack.take_nacked().unwrap();
    assert_eq!(nacked.cmd(), Command::GetS);
    assert_eq!(nacked.base_addr(), A2);

    // Finish the first transaction to free the slot, then retry.
    let mut resp = pending[0].make_response_cmd(Command::GetSResp);
    resp.set_payload(vec![1; 64]);
    h.deliver(resp);
    h.run(2);
    h.take_cpu();

    h.deliver(nacked);
    h.run(2);
    assert_eq!(h.answer_memory(Command::GetSResp, &[2; 64]), 1);
    h.run(2);

    let cpu = h.take_cpu();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cmd(), Command::GetSResp);
    assert_eq!(cpu[0].dst(), "core1");
}

#[test]
fn entry_cache_spills_and_refills() {
    let cfg = Config { entry_cache_size: 1, ..msi() };
    let mut h = Harness::new(cfg);

    make_shared(&mut h, A1, &["core0"], &[1; 64]);
    make_shared(&mut h, A2, &["core0"], &[2; 64]);
    h.run(2);

    // Bringing up the second line pushed the first one's entry to memory.
    {
        let entry = h.dc.entry(A1).unwrap();
        assert!(!entry.is_cached());
        assert_eq!(entry.state(), State::S);
    }
    assert!(h.dc.entry(A2).unwrap().is_cached());
    assert_eq!(h.dc.stats().dir_entry_writes, 1);

    // Touching the first line again stalls on an entry fill.
    let req = h.request("core1", Command::GetS, A1);
    h.deliver(req);
    h.run(2);

    let mem = h.take_mem();
    let fill = mem.iter().find(|e| !e.is_addr_global()).expect("entry read");
    assert_eq!(fill.cmd(), Command::GetS);
    assert_eq!(fill.size(), 4);
    assert_eq!(h.dc.entry(A1).unwrap().state(), State::SFill);

    let resp = fill.make_response();
    h.deliver(resp);
    h.run(3);

    // Entry refilled; the stalled read completed from the buffered line and
    // the second line's entry was spilled in turn.
    let cpu = h.take_cpu();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cmd(), Command::GetSResp);
    assert_eq!(cpu[0].dst(), "core1");

    let entry = h.dc.entry(A1).unwrap();
    assert!(entry.is_cached());
    assert_eq!(entry.state(), State::S);
    assert!(entry.is_sharer("core1"));

    assert_eq!(h.dc.stats().dir_entry_reads, 1);
    assert_eq!(h.dc.stats().dir_entry_writes, 2);
    assert!(!h.dc.entry(A2).unwrap().is_cached());

    let spills: Vec<_> = h
        .take_mem()
        .into_iter()
        .filter(|e| e.cmd() == Command::PutE && e.query_flag(F_NORESPONSE))
        .collect();
    assert_eq!(spills.len(), 1);
}

#[test]
fn noncacheable_requests_bypass_the_directory() {
    let mut h = Harness::new(msi());

    let mut req = h.request("core0", Command::GetS, A1);
    req.set_flag(F_NONCACHEABLE);
    h.deliver(req);
    h.run(2);

    // Forwarded toward memory with us as the source; no directory entry.
    let mem = h.take_mem();
    assert_eq!(mem.len(), 1);
    assert_eq!(mem[0].cmd(), Command::GetS);
    assert_eq!(mem[0].src(), h.dc.name());
    assert!(mem[0].query_flag(F_NONCACHEABLE));
    assert!(h.dc.entry(A1).is_none());
    assert_eq!(h.dc.mshr().size(), 0);

    // The reply is matched by id and routed back to the original source.
    let mut resp = mem[0].make_response();
    resp.set_payload(vec![3; 64]);
    h.deliver(resp);
    h.run(2);

    let cpu = h.take_cpu();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cmd(), Command::GetSResp);
    assert_eq!(cpu[0].dst(), "core0");
    assert_eq!(cpu[0].payload(), &[3; 64][..]);
}

#[test]
fn orphan_noncacheable_response_is_fatal() {
    let mut h = Harness::new(msi());

    let mut resp = MemEvent::new("memory0", A1, A1, Command::CustomResp, 64);
    resp.set_dst(h.dc.name());
    let err = h.dc.handle_incoming(resp).unwrap_err();
    assert!(matches!(err, FatalError::OrphanResponse { cmd: Command::CustomResp, .. }));
}

#[test]
fn one_access_per_line_per_cycle() {
    let mut h = Harness::new(msi());

    let req = h.request("core0", Command::GetS, A1);
    h.deliver(req);
    let req = h.request("core1", Command::GetS, A1);
    h.deliver(req);

    // Same line: only the first is handled this cycle.
    h.tick();
    assert_eq!(h.dc.stats().event_recv[Command::GetS as usize], 1);

    // The second one goes in next cycle (and queues behind the first).
    h.tick();
    assert_eq!(h.dc.stats().event_recv[Command::GetS as usize], 2);
}

#[test]
fn request_budget_bounds_work_per_cycle() {
    let cfg = Config { max_requests_per_cycle: 1, ..msi() };
    let mut h = Harness::new(cfg);

    let req = h.request("core0", Command::GetS, A1);
    h.deliver(req);
    let req = h.request("core1", Command::GetS, A2);
    h.deliver(req);

    h.tick();
    assert_eq!(h.dc.stats().event_recv[Command::GetS as usize], 1);
    h.tick();
    assert_eq!(h.dc.stats().event_recv[Command::GetS as usize], 2);
}

#[test]
fn clock_gates_off_when_idle_and_wakes_on_traffic() {
    let mut h = Harness::new(msi());
    assert!(h.dc.clock_enabled());

    let req = h.request("core0", Command::GetS, A1);
    h.deliver(req);
    h.run(2);
    assert_eq!(h.answer_memory(Command::GetSResp, &[1; 64]), 1);
    h.run(2);

    // Everything drained: the clock turns itself off.
    assert!(h.tick());
    assert!(!h.dc.clock_enabled());
    let samples = h.dc.stats().mshr_occupancy_samples;

    // A new event re-enables it, and the idle gap is back-filled in the
    // occupancy statistics on the next tick.
    let req = h.request("core0", Command::GetS, A2);
    h.deliver(req);
    assert!(h.dc.clock_enabled());
    h.cycle += 10;
    h.tick();
    assert!(h.dc.stats().mshr_occupancy_samples > samples + 1);
}

#[test]
fn init_seeds_incoherent_sources() {
    // An endpoint that does not track presence gets data but is never
    // recorded as a sharer.
    let cpu = TestLink::new().reachable(&["core0", "core1"]).sources(&["core0"]).untimed(vec![
        InitEvent::Coherence {
            src: "core0".to_owned(),
            endpoint: Endpoint::Cache,
            tracks_presence: false,
            sends_wb_ack: false,
            line_size: 64,
        },
    ]);
    let mem = TestLink::new().reachable(&["memory0"]).target("memory0");
    let cpu_untimed = cpu.untimed_log();
    let mut h = Harness::with_links(msi(), cpu, mem);
    h.dc.init(0);

    // We advertised ourselves on the cpu side.
    assert!(matches!(
        cpu_untimed.borrow()[0],
        InitEvent::Coherence { endpoint: Endpoint::Directory, .. }
    ));

    let req = h.request("core0", Command::GetS, A1);
    h.deliver(req);
    h.run(2);
    assert_eq!(h.answer_memory(Command::GetSResp, &[9; 64]), 1);
    h.run(2);

    let cpu = h.take_cpu();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].cmd(), Command::GetSResp);
    // Data flowed, but the line did not pick up a sharer.
    assert!(h.dc.entry(A1).is_none());
}

#[test]
fn init_relays_endpoints_and_data_to_memory() {
    let cpu = TestLink::new().reachable(&["core0"]).untimed(vec![
        InitEvent::Endpoint { src: "core0".to_owned(), regions: Vec::new() },
        InitEvent::Data { addr: 0x40, payload: vec![1, 2, 3] },
    ]);
    let mem = TestLink::new().reachable(&["memory0"]).target("memory0");
    let mem_untimed = mem.untimed_log();
    let mut h = Harness::with_links(msi(), cpu, mem);
    h.dc.init(0);

    let sent = mem_untimed.borrow();
    // Our own advertisement, the relayed endpoint, and the program data.
    assert_eq!(sent.len(), 3);
    assert!(matches!(sent[1], InitEvent::Endpoint { ref src, .. } if src == h.dc.name()));
    assert!(matches!(sent[2], InitEvent::Data { addr: 0x40, .. }));
}

#[test]
fn scratchpad_peers_require_writeback_acks() {
    let cpu = TestLink::new().reachable(&["core0", "core1"]).sources(&["core0", "core1"]).untimed(
        vec![InitEvent::Coherence {
            src: "core1".to_owned(),
            endpoint: Endpoint::Scratchpad,
            tracks_presence: true,
            sends_wb_ack: true,
            line_size: 64,
        }],
    );
    let mem = TestLink::new().reachable(&["memory0"]).target("memory0");
    let mut h = Harness::with_links(
        Config { coherence_protocol: Protocol::Mesi, ..Config::default() },
        cpu,
        mem,
    );
    h.dc.init(0);

    make_owned(&mut h, A1, "core1", &[5; 64]);
    let mut put = h.request("core1", Command::PutM, A1);
    put.set_payload(vec![7; 64]);
    put.set_dirty(true);
    h.deliver(put);
    h.run(2);

    // The writeback stays open until memory acknowledges it.
    assert!(h.dc.mshr().pending_writeback(A1));
    let mem_ev = h.take_mem();
    let wb = mem_ev.iter().find(|e| e.cmd() == Command::PutM).unwrap();

    let ack = wb.make_response_cmd(Command::AckPut);
    h.deliver(ack);
    h.run(2);
    assert!(!h.dc.mshr().pending_writeback(A1));
    assert_eq!(h.dc.mshr().size(), 0);
}

#[test]
fn unreachable_destination_is_fatal() {
    let mut h = Harness::new(msi());

    // "ghost" is not reachable on either link, so the response cannot be
    // routed when the memory data comes back.
    let req = h.request("ghost", Command::GetS, A1);
    h.deliver(req);
    h.run(2);
    assert_eq!(h.answer_memory(Command::GetSResp, &[1; 64]), 1);

    h.cycle += 1;
    let err = h.dc.clock_tick(h.cycle).unwrap_err();
    assert!(matches!(err, FatalError::Routing { ref dst, .. } if dst == "ghost"));
}

#[test]
fn unexpected_put_is_a_protocol_violation() {
    let mut h = Harness::new(msi());
    make_shared(&mut h, A1, &["core0"], &[1; 64]);

    // PutM from a sharer of an S line has no recorded owner.
    let put = h.request("core0", Command::PutM, A1);
    h.deliver(put);
    h.cycle += 1;
    let err = h.dc.clock_tick(h.cycle).unwrap_err();
    assert!(matches!(
        err,
        FatalError::Protocol { cmd: Command::PutM, state: State::S, addr, .. } if addr == A1
    ));
}

#[test]
fn nack_of_a_stale_invalidation_is_dropped() {
    let mut h = Harness::new(msi());
    make_shared(&mut h, A1, &["core0", "core1"], &[1; 64]);

    let req = h.request("core0", Command::GetX, A1);
    h.deliver(req);
    h.run(2);
    let cpu = h.take_cpu();
    let inv = cpu.iter().find(|e| e.cmd() == Command::Inv).unwrap();

    // The sharer acknowledges, completing the transaction...
    let ack = inv.make_response();
    h.deliver(ack);
    h.run(3);
    h.take_cpu();

    // ...then a NACK for the (already answered) invalidation straggles in.
    // It no longer matches the responses table and must not be re-sent.
    let nack = inv.make_nack_response("core1");
    h.deliver(nack);
    h.run(3);
    assert!(h.take_cpu().is_empty());
}
