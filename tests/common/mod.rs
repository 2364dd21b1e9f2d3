//! Shared scaffolding for the integration tests: a scriptable link
//! implementation and a harness that wires a controller between two of them.

use memdir::config::Config;
use memdir::event::{Command, MemEvent};
use memdir::link::{InitEvent, MemLink, Region};
use memdir::DirectoryController;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub type SentLog = Rc<RefCell<Vec<MemEvent>>>;
pub type UntimedLog = Rc<RefCell<Vec<InitEvent>>>;

/// A link that records everything sent through it and answers reachability
/// and routing queries from scripted tables.
pub struct TestLink {
    region: Region,
    sent: SentLog,
    untimed_sent: UntimedLog,
    untimed_pending: VecDeque<InitEvent>,
    reachable: Vec<String>,
    sources: Vec<String>,
    /// Destination returned for every routed address, when set.
    target: Option<String>,
}

#[allow(dead_code)]
impl TestLink {
    pub fn new() -> TestLink {
        TestLink {
            region: Region { start: 0, end: u64::max_value(), interleave_size: 0, interleave_step: 0 },
            sent: Rc::new(RefCell::new(Vec::new())),
            untimed_sent: Rc::new(RefCell::new(Vec::new())),
            untimed_pending: VecDeque::new(),
            reachable: Vec::new(),
            sources: Vec::new(),
            target: None,
        }
    }

    pub fn reachable(mut self, names: &[&str]) -> TestLink {
        self.reachable = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn sources(mut self, names: &[&str]) -> TestLink {
        self.sources = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn target(mut self, name: &str) -> TestLink {
        self.target = Some(name.to_owned());
        self
    }

    pub fn untimed(mut self, evs: Vec<InitEvent>) -> TestLink {
        self.untimed_pending = evs.into();
        self
    }

    pub fn sent_log(&self) -> SentLog {
        self.sent.clone()
    }

    pub fn untimed_log(&self) -> UntimedLog {
        self.untimed_sent.clone()
    }
}

impl MemLink for TestLink {
    fn send(&mut self, ev: MemEvent) {
        self.sent.borrow_mut().push(ev);
    }

    fn send_untimed(&mut self, ev: InitEvent) {
        self.untimed_sent.borrow_mut().push(ev);
    }

    fn recv_untimed(&mut self) -> Option<InitEvent> {
        self.untimed_pending.pop_front()
    }

    fn init(&mut self, _phase: u32) {}
    fn setup(&mut self) {}
    fn finish(&mut self) {}

    fn find_target_destination(&self, _addr: u64) -> Option<String> {
        self.target.clone()
    }

    fn is_reachable(&self, dst: &str) -> bool {
        self.reachable.iter().any(|n| n == dst)
    }

    fn is_source(&self, name: &str) -> bool {
        self.sources.iter().any(|n| n == name)
    }

    fn is_request_address_valid(&self, addr: u64) -> bool {
        self.region.contains(addr)
    }

    fn set_region(&mut self, region: Region) {
        self.region = region;
    }

    fn get_region(&self) -> Region {
        self.region
    }
}

#[allow(dead_code)]
pub const LINE: u64 = 64;

/// A controller wired between a cpu-side link (cores plus a non-caching
/// device) and a mem-side link owning all addresses.
pub struct Harness {
    pub dc: DirectoryController,
    pub cpu_sent: SentLog,
    pub mem_sent: SentLog,
    pub cycle: u64,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(cfg: Config) -> Harness {
        let cpu = TestLink::new().reachable(&["core0", "core1", "core2", "core3", "dev0"]);
        let mem = TestLink::new().reachable(&["memory0"]).target("memory0");
        Harness::with_links(cfg, cpu, mem)
    }

    pub fn with_links(cfg: Config, cpu: TestLink, mem: TestLink) -> Harness {
        let cpu_sent = cpu.sent_log();
        let mem_sent = mem.sent_log();
        let dc = DirectoryController::new(&cfg, Box::new(cpu), Box::new(mem)).unwrap();
        Harness { dc, cpu_sent, mem_sent, cycle: 0 }
    }

    pub fn deliver(&mut self, ev: MemEvent) {
        self.dc.handle_incoming(ev).unwrap();
    }

    pub fn tick(&mut self) -> bool {
        self.cycle += 1;
        self.dc.clock_tick(self.cycle).unwrap()
    }

    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.tick();
        }
    }

    /// Tick until both links have been quiet for a cycle.
    pub fn run_to_idle(&mut self) {
        for _ in 0..64 {
            if self.tick() {
                return;
            }
        }
        panic!("controller did not go idle");
    }

    pub fn take_cpu(&mut self) -> Vec<MemEvent> {
        self.cpu_sent.borrow_mut().drain(..).collect()
    }

    pub fn take_mem(&mut self) -> Vec<MemEvent> {
        self.mem_sent.borrow_mut().drain(..).collect()
    }

    /// A request addressed to the directory from a cpu-side agent.
    pub fn request(&self, src: &str, cmd: Command, addr: u64) -> MemEvent {
        let mut ev = MemEvent::new(src, addr, addr & !(LINE - 1), cmd, LINE as u32);
        ev.set_dst(self.dc.name());
        ev
    }

    /// Answer every pending mem-side request with a data response of the
    /// given command, returning how many were answered.
    pub fn answer_memory(&mut self, cmd: Command, payload: &[u8]) -> usize {
        let reqs = self.take_mem();
        let mut n = 0;
        for req in &reqs {
            if req.cmd().is_response() || req.query_flag(memdir::event::F_NORESPONSE) {
                continue;
            }
            let mut resp = req.make_response_cmd(cmd);
            resp.set_payload(payload.to_vec());
            self.deliver(resp);
            n += 1;
        }
        n
    }
}

/// Drive a line into S with the given sharers under MSI (first read fetches
/// from memory, later ones hit the buffered copy).
#[allow(dead_code)]
pub fn make_shared(h: &mut Harness, addr: u64, sharers: &[&str], payload: &[u8]) {
    let mut first = true;
    for src in sharers {
        let req = h.request(src, Command::GetS, addr);
        h.deliver(req);
        h.run(2);
        if first {
            assert_eq!(h.answer_memory(Command::GetSResp, payload), 1);
            first = false;
        }
        h.run(2);
    }
    h.take_cpu();
    h.take_mem();
}

/// Drive a line into M with the given owner (works for MESI and MSI).
#[allow(dead_code)]
pub fn make_owned(h: &mut Harness, addr: u64, owner: &str, payload: &[u8]) {
    let req = h.request(owner, Command::GetX, addr);
    h.deliver(req);
    h.run(2);
    assert_eq!(h.answer_memory(Command::GetXResp, payload), 1);
    h.run(2);
    h.take_cpu();
    h.take_mem();
}
