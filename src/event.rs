//! Event envelope and command vocabulary shared by both links.
//!
//! Every message entering or leaving the directory is a [`MemEvent`]: a tagged
//! command plus a shared envelope (id, source, destination, address, flags).
//! Responses are derived from requests with [`MemEvent::make_response`] so the
//! requester can pair them up by id.

use std::sync::atomic::{AtomicU64, Ordering};

/// Event is not cacheable; it bypasses the coherence state machine entirely.
pub const F_NONCACHEABLE: u32 = 1 << 0;
/// Sender does not expect a response to this event.
pub const F_NORESPONSE: u32 = 1 << 1;

/// Commands that can appear on either link.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    GetS,
    GetX,
    GetSX,
    Write,
    PutS,
    PutE,
    PutM,
    PutX,
    FlushLine,
    FlushLineInv,
    FetchInv,
    FetchInvX,
    ForceInv,
    Inv,
    NACK,
    GetSResp,
    GetXResp,
    WriteResp,
    FlushLineResp,
    FetchResp,
    FetchXResp,
    AckInv,
    AckPut,
    CustomReq,
    CustomResp,
    CustomAck,
}

impl Command {
    pub const COUNT: usize = Command::CustomAck as usize + 1;

    /// Whether the command participates in the coherence protocol. Everything
    /// else takes the noncacheable pass-through path.
    pub fn is_cache(self) -> bool {
        !matches!(self, Command::CustomReq | Command::CustomResp | Command::CustomAck)
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            Command::NACK
                | Command::GetSResp
                | Command::GetXResp
                | Command::WriteResp
                | Command::FlushLineResp
                | Command::FetchResp
                | Command::FetchXResp
                | Command::AckInv
                | Command::AckPut
                | Command::CustomResp
                | Command::CustomAck
        )
    }

    /// Responses to the data-class requests (GetS/GetX/GetSX/Write); the rest
    /// answer replacements (Put*/Flush*). Used to split latency statistics.
    pub fn is_data_response(self) -> bool {
        matches!(self, Command::GetSResp | Command::GetXResp | Command::WriteResp)
    }

    /// The response command a requester expects for this request.
    pub fn response(self) -> Command {
        match self {
            Command::GetS => Command::GetSResp,
            Command::GetX | Command::GetSX => Command::GetXResp,
            Command::Write => Command::WriteResp,
            Command::FlushLine | Command::FlushLineInv => Command::FlushLineResp,
            Command::FetchInv => Command::FetchResp,
            Command::ForceInv | Command::Inv => Command::AckInv,
            Command::FetchInvX => Command::FetchXResp,
            Command::PutS | Command::PutE | Command::PutM | Command::PutX => Command::AckPut,
            Command::CustomReq => Command::CustomResp,
            _ => self,
        }
    }
}

/// Globally unique event identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventId(u64);

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl EventId {
    fn fresh() -> EventId {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The event envelope.
#[derive(Clone, Debug)]
pub struct MemEvent {
    id: EventId,
    response_to_id: Option<EventId>,
    cmd: Command,
    src: String,
    dst: String,
    addr: u64,
    base_addr: u64,
    size: u32,
    payload: Vec<u8>,
    flags: u32,
    mem_flags: u32,
    evict: bool,
    dirty: bool,
    addr_global: bool,
    nacked: Option<Box<MemEvent>>,
}

impl MemEvent {
    pub fn new(src: &str, addr: u64, base_addr: u64, cmd: Command, size: u32) -> MemEvent {
        MemEvent {
            id: EventId::fresh(),
            response_to_id: None,
            cmd,
            src: src.to_owned(),
            dst: String::new(),
            addr,
            base_addr,
            size,
            payload: Vec::new(),
            flags: 0,
            mem_flags: 0,
            evict: false,
            dirty: false,
            addr_global: true,
            nacked: None,
        }
    }

    /// Build the response event for this request: source and destination
    /// swapped, payload empty, paired by `response_to_id`.
    pub fn make_response(&self) -> MemEvent {
        self.make_response_cmd(self.cmd.response())
    }

    pub fn make_response_cmd(&self, cmd: Command) -> MemEvent {
        MemEvent {
            id: EventId::fresh(),
            response_to_id: Some(self.id),
            cmd,
            src: self.dst.clone(),
            dst: self.src.clone(),
            addr: self.addr,
            base_addr: self.base_addr,
            size: self.size,
            payload: Vec::new(),
            flags: self.flags,
            mem_flags: 0,
            evict: false,
            dirty: false,
            addr_global: self.addr_global,
            nacked: None,
        }
    }

    /// Build a NACK carrying this event so the peer can re-send it verbatim.
    pub fn make_nack_response(&self, responder: &str) -> MemEvent {
        let mut nack = MemEvent::new(responder, self.addr, self.base_addr, Command::NACK, 0);
        nack.response_to_id = Some(self.id);
        nack.dst = self.src.clone();
        nack.nacked = Some(Box::new(self.clone()));
        nack
    }

    /// Copy requester-visible metadata from another event (used when a
    /// subsidiary request is issued on behalf of an incoming one).
    pub fn copy_metadata(&mut self, other: &MemEvent) {
        self.flags = other.flags;
        self.mem_flags = other.mem_flags;
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn response_to_id(&self) -> Option<EventId> {
        self.response_to_id
    }

    pub fn cmd(&self) -> Command {
        self.cmd
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn set_src(&mut self, src: &str) {
        self.src = src.to_owned();
    }

    pub fn dst(&self) -> &str {
        &self.dst
    }

    pub fn set_dst(&mut self, dst: &str) {
        self.dst = dst.to_owned();
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// The address links route on. Line-aligned for coherence traffic.
    pub fn routing_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn query_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn mem_flags(&self) -> u32 {
        self.mem_flags
    }

    pub fn set_mem_flags(&mut self, flags: u32) {
        self.mem_flags = flags;
    }

    pub fn evict(&self) -> bool {
        self.evict
    }

    pub fn set_evict(&mut self, evict: bool) {
        self.evict = evict;
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// False only for directory-entry fill traffic, whose address refers to
    /// the entry store rather than the simulated address space.
    pub fn is_addr_global(&self) -> bool {
        self.addr_global
    }

    pub fn set_addr_global(&mut self, global: bool) {
        self.addr_global = global;
    }

    pub fn take_nacked(&mut self) -> Option<MemEvent> {
        self.nacked.take().map(|b| *b)
    }
}
