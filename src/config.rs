//! Directory controller configuration.

use crate::error::FatalError;
use serde::{Deserialize, Serialize};

fn default_name() -> String {
    "directory".to_owned()
}
fn default_line_size() -> u32 {
    64
}
fn default_entry_cache_size() -> u64 {
    32768
}
fn default_mshr_entries() -> i64 {
    -1
}
fn default_clock() -> String {
    "1GHz".to_owned()
}
fn default_min_packet_size() -> u32 {
    8
}
fn default_verbose() -> u32 {
    1
}
fn default_range_end() -> u64 {
    u64::max_value()
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[serde(alias = "mesi")]
    Mesi,
    #[serde(alias = "msi")]
    Msi,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Component name, used as the source on all outgoing events.
    #[serde(default = "default_name")]
    pub name: String,

    /// Cache line size in bytes; the granularity of all coherence state.
    #[serde(default = "default_line_size")]
    pub cache_line_size: u32,

    /// MESI grants exclusive ownership on an unshared read; MSI never does.
    pub coherence_protocol: Protocol,

    /// Total MSHR capacity. Negative means unbounded; 0 is invalid.
    #[serde(default = "default_mshr_entries")]
    pub mshr_num_entries: i64,

    /// Number of directory entries kept in memory. 0 disables caching and
    /// every entry update is written through to the backing store.
    #[serde(default = "default_entry_cache_size")]
    pub entry_cache_size: u64,

    /// Events handled per cycle; 0 means unlimited.
    #[serde(default)]
    pub max_requests_per_cycle: u32,

    /// Added to the delivery cycle of outgoing requests.
    #[serde(default)]
    pub access_latency_cycles: u64,

    /// Added to the delivery cycle of responses served from the MSHR.
    #[serde(default)]
    pub mshr_latency_cycles: u64,

    /// The address region this directory owns, in bytes.
    #[serde(default)]
    pub addr_range_start: u64,
    #[serde(default = "default_range_end")]
    pub addr_range_end: u64,
    #[serde(default)]
    pub interleave_size: u64,
    #[serde(default)]
    pub interleave_step: u64,

    /// Offset subtracted by the mem-side link before memory routing.
    #[serde(default)]
    pub mem_addr_start: u64,

    /// Clock frequency, parsed by the simulator kernel.
    #[serde(default = "default_clock")]
    pub clock: String,

    /// Smallest packet the fabric will carry, in bytes.
    #[serde(default = "default_min_packet_size")]
    pub min_packet_size: u32,

    /// When non-empty, restrict per-event debug logging to these line
    /// addresses.
    #[serde(default)]
    pub debug_addr: Vec<u64>,

    #[serde(default = "default_verbose")]
    pub verbose: u32,
    #[serde(default)]
    pub debug_level: u32,
}

impl Config {
    /// Check the parts of the configuration the controller depends on.
    /// Violations are fatal at construction time.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.cache_line_size == 0 {
            return Err(FatalError::Config("cache_line_size must be non-zero".to_owned()));
        }
        if self.mshr_num_entries == 0 {
            return Err(FatalError::Config(
                "mshr_num_entries must be at least 1, or negative for an unbounded MSHR"
                    .to_owned(),
            ));
        }
        let line = u64::from(self.cache_line_size);
        if self.interleave_size % line != 0 {
            return Err(FatalError::Config(format!(
                "interleave_size ({}B) must be a multiple of cache_line_size ({}B)",
                self.interleave_size, line
            )));
        }
        if self.interleave_step % line != 0 {
            return Err(FatalError::Config(format!(
                "interleave_step ({}B) must be a multiple of cache_line_size ({}B)",
                self.interleave_step, line
            )));
        }
        if self.interleave_size != 0 && self.interleave_step < self.interleave_size {
            return Err(FatalError::Config(
                "interleave_step must be at least interleave_size".to_owned(),
            ));
        }
        if self.range_end() <= self.addr_range_start {
            return Err(FatalError::Config(format!(
                "addr_range_end (0x{:x}) must be above addr_range_start (0x{:x})",
                self.addr_range_end, self.addr_range_start
            )));
        }
        Ok(())
    }

    /// An end of 0 means "to the top of the address space".
    pub fn range_end(&self) -> u64 {
        if self.addr_range_end == 0 {
            u64::max_value()
        } else {
            self.addr_range_end
        }
    }

    pub fn region(&self) -> crate::link::Region {
        crate::link::Region {
            start: self.addr_range_start,
            end: self.range_end(),
            interleave_size: self.interleave_size,
            interleave_step: self.interleave_step,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            name: default_name(),
            cache_line_size: default_line_size(),
            coherence_protocol: Protocol::Mesi,
            mshr_num_entries: default_mshr_entries(),
            entry_cache_size: default_entry_cache_size(),
            max_requests_per_cycle: 0,
            access_latency_cycles: 0,
            mshr_latency_cycles: 0,
            addr_range_start: 0,
            addr_range_end: default_range_end(),
            interleave_size: 0,
            interleave_step: 0,
            mem_addr_start: 0,
            clock: default_clock(),
            min_packet_size: default_min_packet_size(),
            debug_addr: Vec::new(),
            verbose: default_verbose(),
            debug_level: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_mshr_rejected() {
        let cfg = Config { mshr_num_entries: 0, ..Config::default() };
        match cfg.validate() {
            Err(FatalError::Config(msg)) => assert!(msg.contains("mshr_num_entries")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn interleave_must_match_line_size() {
        let cfg = Config {
            cache_line_size: 64,
            interleave_size: 96,
            interleave_step: 192,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_range_end_means_max() {
        let cfg = Config { addr_range_end: 0, ..Config::default() };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.range_end(), u64::max_value());
    }
}
