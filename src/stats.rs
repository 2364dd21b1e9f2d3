//! Statistics counters.
//!
//! Counters live on the controller instance and are sampled or bumped from
//! the clock handler. `print_stats` writes a human-readable dump at the end
//! of simulation.

use crate::event::Command;

pub struct Stats {
    /// Coherence events received, indexed by command.
    pub event_recv: [u64; Command::COUNT],
    /// Noncacheable events received, indexed by command.
    pub noncache_recv: [u64; Command::COUNT],
    /// Events sent, indexed by command.
    pub event_sent: [u64; Command::COUNT],

    /// Requests that found their directory entry resident.
    pub directory_cache_hits: u64,
    /// Events served on replay out of the MSHR.
    pub mshr_hits: u64,
    /// Directory-entry fills read from the backing store.
    pub dir_entry_reads: u64,
    /// Directory-entry spills written to the backing store.
    pub dir_entry_writes: u64,

    /// Cumulative cycles from ingress to response egress for data requests
    /// (GetS/GetX/GetSX/Write) and for replacements (Put*/Flush*).
    pub get_request_latency: u64,
    pub replacement_request_latency: u64,

    /// MSHR occupancy, sampled once per cycle (idle cycles included).
    pub mshr_occupancy_total: u64,
    pub mshr_occupancy_samples: u64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            event_recv: [0; Command::COUNT],
            noncache_recv: [0; Command::COUNT],
            event_sent: [0; Command::COUNT],
            directory_cache_hits: 0,
            mshr_hits: 0,
            dir_entry_reads: 0,
            dir_entry_writes: 0,
            get_request_latency: 0,
            replacement_request_latency: 0,
            mshr_occupancy_total: 0,
            mshr_occupancy_samples: 0,
        }
    }

    pub fn record_recv(&mut self, cmd: Command) {
        self.event_recv[cmd as usize] += 1;
    }

    pub fn record_noncache_recv(&mut self, cmd: Command) {
        self.noncache_recv[cmd as usize] += 1;
    }

    pub fn record_sent(&mut self, cmd: Command) {
        self.event_sent[cmd as usize] += 1;
    }

    pub fn sample_mshr_occupancy(&mut self, occupancy: usize) {
        self.mshr_occupancy_total += occupancy as u64;
        self.mshr_occupancy_samples += 1;
    }

    pub fn clear(&mut self) {
        *self = Stats::new();
    }

    pub fn print_stats(&self, write: &mut dyn std::io::Write) -> std::io::Result<()> {
        const COMMANDS: [Command; Command::COUNT] = [
            Command::GetS,
            Command::GetX,
            Command::GetSX,
            Command::Write,
            Command::PutS,
            Command::PutE,
            Command::PutM,
            Command::PutX,
            Command::FlushLine,
            Command::FlushLineInv,
            Command::FetchInv,
            Command::FetchInvX,
            Command::ForceInv,
            Command::Inv,
            Command::NACK,
            Command::GetSResp,
            Command::GetXResp,
            Command::WriteResp,
            Command::FlushLineResp,
            Command::FetchResp,
            Command::FetchXResp,
            Command::AckInv,
            Command::AckPut,
            Command::CustomReq,
            Command::CustomResp,
            Command::CustomAck,
        ];

        for &cmd in COMMANDS.iter() {
            let i = cmd as usize;
            if self.event_recv[i] != 0 {
                writeln!(write, "{:?} recv = {}", cmd, self.event_recv[i])?;
            }
        }
        for &cmd in COMMANDS.iter() {
            let i = cmd as usize;
            if self.event_sent[i] != 0 {
                writeln!(write, "{:?} sent = {}", cmd, self.event_sent[i])?;
            }
        }
        for &cmd in COMMANDS.iter() {
            let i = cmd as usize;
            if self.noncache_recv[i] != 0 {
                writeln!(write, "{:?} noncache recv = {}", cmd, self.noncache_recv[i])?;
            }
        }
        writeln!(write, "Directory hits    = {}", self.directory_cache_hits)?;
        writeln!(write, "MSHR hits         = {}", self.mshr_hits)?;
        writeln!(write, "Dir entry reads   = {}", self.dir_entry_reads)?;
        writeln!(write, "Dir entry writes  = {}", self.dir_entry_writes)?;
        writeln!(write, "Get latency       = {}", self.get_request_latency)?;
        writeln!(write, "Repl latency      = {}", self.replacement_request_latency)?;
        if self.mshr_occupancy_samples != 0 {
            writeln!(
                write,
                "MSHR occupancy    = {:.2}",
                self.mshr_occupancy_total as f64 / self.mshr_occupancy_samples as f64
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = Stats::new();
        stats.record_recv(Command::GetS);
        stats.record_recv(Command::GetS);
        stats.record_sent(Command::GetSResp);
        stats.sample_mshr_occupancy(3);
        stats.sample_mshr_occupancy(5);
        assert_eq!(stats.event_recv[Command::GetS as usize], 2);
        assert_eq!(stats.event_sent[Command::GetSResp as usize], 1);
        assert_eq!(stats.mshr_occupancy_total, 8);
        assert_eq!(stats.mshr_occupancy_samples, 2);

        let mut out = Vec::new();
        stats.print_stats(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("GetS recv = 2"));
        assert!(text.contains("MSHR occupancy"));
    }
}
