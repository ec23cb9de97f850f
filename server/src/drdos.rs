//! Reflection attack guard for connectionless info and status queries
//!
//! `getinfo` and `getstatus` answers are much larger than the request, which
//! makes them attractive for reflecting traffic at a spoofed victim. Recent
//! answers are remembered per source subnet in a fixed ring and the server
//! stays silent when either a single subnet or the whole ring is too busy.

use log::{debug, warn};
use shared::NetAddr;
use std::net::IpAddr;

/// Span over which receipts are counted
pub const RECEIPT_WINDOW_MSEC: u64 = 2000;

/// Answers one subnet may receive within the window
pub const MAX_RECEIPTS_PER_SUBNET: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Receipt {
    subnet: IpAddr,
    time: u64,
}

/// Fixed ring of recent info/status answers, keyed by subnet
///
/// LAN sources are never recorded or blocked.
pub struct InfoReceipts {
    ring: Vec<Option<Receipt>>,
    last_global_log: Option<u64>,
    last_specific_log: Option<u64>,
}

impl InfoReceipts {
    /// Creates a ring of `capacity` receipts; a full ring inside the window
    /// silences every remote source
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity.max(1)],
            last_global_log: None,
            last_specific_log: None,
        }
    }

    /// Number of receipts the ring holds
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Returns true when the query from `from` must not be answered
    ///
    /// An allowed query is recorded, replacing the oldest receipt.
    pub fn should_block(&mut self, from: &NetAddr, now: u64) -> bool {
        if from.is_lan() {
            return false;
        }

        let subnet = from.subnet();
        let mut global = 0;
        let mut specific = 0;
        let mut oldest = 0;
        let mut oldest_time = u64::MAX;

        for (i, slot) in self.ring.iter().enumerate() {
            match slot {
                Some(receipt) => {
                    if receipt.time + RECEIPT_WINDOW_MSEC > now {
                        global += 1;
                        if receipt.subnet == subnet {
                            specific += 1;
                        }
                    }
                    if receipt.time < oldest_time {
                        oldest_time = receipt.time;
                        oldest = i;
                    }
                }
                None if oldest_time > 0 => {
                    oldest_time = 0;
                    oldest = i;
                }
                None => {}
            }
        }

        if global == self.ring.len() {
            if Self::log_due(&mut self.last_global_log, now) {
                warn!("Detected flood of getinfo/getstatus connectionless packets");
            }
            return true;
        }

        if specific >= MAX_RECEIPTS_PER_SUBNET {
            if Self::log_due(&mut self.last_specific_log, now) {
                debug!(
                    "Possible DRDoS attack to address {}, ignoring getinfo/getstatus packet",
                    from
                );
            }
            return true;
        }

        self.ring[oldest] = Some(Receipt { subnet, time: now });
        false
    }

    /// At most one log line per second for each kind of flood
    fn log_due(last: &mut Option<u64>, now: u64) -> bool {
        match *last {
            Some(t) if t + 1000 > now => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
