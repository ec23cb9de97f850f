//! Sequencing state of one client channel

/// Incoming and outgoing sequence numbers for a connection
///
/// Sequenced datagrams that are not newer than the last one accepted are
/// discarded, so a message is processed at most once and never out of order.
#[derive(Debug, Clone)]
pub struct Netchan {
    pub qport: u16,
    incoming_sequence: i32,
    outgoing_sequence: i32,
    dropped: i32,
}

impl Netchan {
    pub fn new(qport: u16) -> Self {
        Self {
            qport,
            incoming_sequence: 0,
            outgoing_sequence: 1,
            dropped: 0,
        }
    }

    /// Accepts or rejects an incoming sequence number
    pub fn process(&mut self, sequence: i32) -> bool {
        if sequence <= self.incoming_sequence {
            return false;
        }
        self.dropped = sequence - (self.incoming_sequence + 1);
        self.incoming_sequence = sequence;
        true
    }

    /// Claims the sequence number for the next outgoing message
    pub fn next_outgoing(&mut self) -> i32 {
        let sequence = self.outgoing_sequence;
        self.outgoing_sequence += 1;
        sequence
    }

    /// Sequence number the next outgoing message will carry
    pub fn outgoing_sequence(&self) -> i32 {
        self.outgoing_sequence
    }

    pub fn incoming_sequence(&self) -> i32 {
        self.incoming_sequence
    }

    /// Packets skipped before the last accepted one
    pub fn dropped(&self) -> i32 {
        self.dropped
    }
}
