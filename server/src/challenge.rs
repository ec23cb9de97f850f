//! Anti-spoofing challenge cache
//!
//! Before a remote client may connect it must ask for a challenge and echo the
//! token back in its `connect` request. A spoofed source address never sees
//! the token, so it cannot complete the handshake.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::Rng;
use shared::NetAddr;

/// Challenge state remembered for one source address
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub addr: NetAddr,
    pub token: i32,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Time the challenge was issued, start of the ping measurement
    pub ping_time: u64,
    /// Challenge round trip measured on the first validation
    pub ping: u64,
    /// Set once a connect validated against this record
    pub connected: bool,
}

/// What to tell a client after an authorization server verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeReply {
    pub to: NetAddr,
    pub text: String,
}

/// Fixed pool of challenge records, one per source address
pub struct ChallengeCache {
    records: Vec<Option<ChallengeRecord>>,
}

impl ChallengeCache {
    /// Creates an empty pool holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            records: vec![None; capacity.max(1)],
        }
    }

    /// Returns the token for `addr`, creating a record if needed
    ///
    /// A pending record for the address is reused. Otherwise the record of a
    /// previous, already validated connection from the same address is
    /// replaced, or the least recently used record is evicted.
    pub fn issue(&mut self, addr: NetAddr, now: u64, rng: &mut StdRng) -> i32 {
        let existing = self
            .records
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.addr == addr));

        if let Some(index) = existing {
            if let Some(record) = self.records[index].as_mut() {
                if !record.connected {
                    record.last_seen = now;
                    return record.token;
                }
            }
        }

        let index = existing.unwrap_or_else(|| self.oldest());
        let token = Self::generate_token(now, rng);
        self.records[index] = Some(ChallengeRecord {
            addr,
            token,
            first_seen: now,
            last_seen: now,
            ping_time: now,
            ping: 0,
            connected: false,
        });
        debug!("Issued challenge {} to {}", token, addr);
        token
    }

    /// Checks a presented token and returns the measured challenge ping
    ///
    /// Leaves every record untouched when nothing matches.
    pub fn validate(&mut self, addr: &NetAddr, token: i32, now: u64) -> Option<u64> {
        let record = self
            .records
            .iter_mut()
            .flatten()
            .find(|r| r.addr == *addr && r.token == token)?;

        if !record.connected {
            record.ping = now.saturating_sub(record.ping_time);
            info!("Client {} connecting with {} challenge ping", addr, record.ping);
        } else {
            debug!("Client {} connecting again with {} challenge ping", addr, record.ping);
        }
        record.connected = true;
        record.last_seen = now;
        Some(record.ping)
    }

    /// Lets the address ask for a fresh challenge after its connection ends
    pub fn mark_disconnected(&mut self, addr: &NetAddr) {
        if let Some(record) = self.records.iter_mut().flatten().find(|r| r.addr == *addr) {
            record.connected = false;
        }
    }

    /// Applies an `ipauthorize <token> <verdict> [reason]` answer
    ///
    /// `accept` repeats the challenge response; any other verdict refuses the
    /// client and forgets the record so it cannot be used later.
    pub fn authorize(
        &mut self,
        token: i32,
        verdict: &str,
        reason: Option<&str>,
    ) -> Option<AuthorizeReply> {
        let index = self
            .records
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.token == token))?;
        let record = self.records[index].as_ref()?;
        let to = record.addr;

        if verdict.eq_ignore_ascii_case("accept") {
            return Some(AuthorizeReply {
                to,
                text: format!("challengeResponse {}", record.token),
            });
        }

        let message = if verdict.eq_ignore_ascii_case("demo") {
            "Server is not a demo server".to_string()
        } else if verdict.eq_ignore_ascii_case("unknown") {
            reason.unwrap_or("Awaiting CD key authorization").to_string()
        } else {
            reason.unwrap_or("Someone is using this CD Key").to_string()
        };
        self.records[index] = None;
        Some(AuthorizeReply {
            to,
            text: format!("print\n{}\n", message),
        })
    }

    /// Record currently held for `addr`, if any
    pub fn get(&self, addr: &NetAddr) -> Option<&ChallengeRecord> {
        self.records.iter().flatten().find(|r| r.addr == *addr)
    }

    /// Number of records in use
    pub fn len(&self) -> usize {
        self.records.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First empty record, else the least recently seen one
    fn oldest(&self) -> usize {
        let mut oldest = 0;
        let mut oldest_time = u64::MAX;
        for (i, record) in self.records.iter().enumerate() {
            match record {
                None => return i,
                Some(r) if r.last_seen < oldest_time => {
                    oldest_time = r.last_seen;
                    oldest = i;
                }
                Some(_) => {}
            }
        }
        oldest
    }

    /// Two random draws mixed with the uptime
    fn generate_token(now: u64, rng: &mut StdRng) -> i32 {
        let high: i32 = rng.gen_range(0..0x8000);
        let low: i32 = rng.gen_range(0..0x8000);
        ((high << 16) ^ low) ^ (now as i32)
    }
}
