use std::collections::VecDeque;

use crate::message::{BitMessage, MessageError};
use crate::protocol::{sequence_more_recent, MAX_SEQUENCE};
use crate::queue::{PacketQueue, PacketRecord};

pub const MAX_RELIABLE_PAYLOAD: usize = 1024;

/// Reliable-in-order message channel layered on the packet ack algebra.
///
/// Every outgoing packet carries the whole pending set, so a message keeps
/// riding until some packet that carried it is acknowledged. Each packet
/// remembers the highest reliable sequence it carried; acking that packet
/// confirms the pending prefix up to the mark. The receive side accepts
/// only the next expected sequence, which makes retransmitted duplicates
/// free to ignore.
#[derive(Debug, Default)]
pub struct ReliableChannel {
    pending: PacketQueue,
    payloads: VecDeque<Vec<u8>>,
    first_pending: u16,
    next_outgoing: u16,
    expected_incoming: u16,
    ready: VecDeque<Vec<u8>>,
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for reliable delivery. Fails when the pending
    /// queue is out of space; the caller should back off and retry after
    /// acks drain it.
    pub fn send(&mut self, data: &[u8], time_ms: u32) -> bool {
        debug_assert!(data.len() <= MAX_RELIABLE_PAYLOAD);
        let record = PacketRecord {
            sequence: self.next_outgoing,
            time: time_ms,
            size: data.len() as u32,
        };
        if !self.pending.add(&record) {
            return false;
        }
        if self.payloads.is_empty() {
            self.first_pending = self.next_outgoing;
        }
        self.payloads.push_back(data.to_vec());
        self.next_outgoing = self.next_outgoing.wrapping_add(1);
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.payloads.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.payloads.len()
    }

    /// Writes the pending set into an outgoing payload: a count byte, then
    /// `{sequence, length, bytes}` per message. Messages that no longer fit
    /// the buffer are left for the next packet. Returns the sequence of the
    /// last message written, the ack mark to associate with the packet.
    pub fn write_block(&self, msg: &mut BitMessage) -> Result<Option<u16>, MessageError> {
        let count_state = msg.save_write_state();
        msg.write_u8(0)?;

        let mut count: u32 = 0;
        let mut mark = None;
        let mut sequence = self.first_pending;
        for payload in &self.payloads {
            if count == u8::MAX as u32 {
                break;
            }
            if (4 + payload.len()) * 8 > msg.remaining_write_bits() {
                break;
            }
            msg.write_u16(sequence)?;
            msg.write_u16(payload.len() as u16)?;
            msg.write_data(payload)?;
            mark = Some(sequence);
            count += 1;
            sequence = sequence.wrapping_add(1);
        }

        if count > 0 {
            let end_state = msg.save_write_state();
            msg.restore_write_state(count_state);
            msg.write_u8(count as u8)?;
            msg.restore_write_state(end_state);
        }
        Ok(mark)
    }

    /// Parses the reliable block from an incoming payload, delivering
    /// in-order messages and discarding retransmits already seen.
    pub fn read_block(&mut self, msg: &mut BitMessage) -> Result<(), MessageError> {
        let count = msg.read_u8()?;
        for _ in 0..count {
            let sequence = msg.read_u16()?;
            let len = msg.read_u16()? as usize;
            let mut data = vec![0u8; len];
            if msg.read_data(&mut data) != len {
                return Err(MessageError::OutOfData);
            }
            if sequence == self.expected_incoming {
                self.ready.push_back(data);
                self.expected_incoming = self.expected_incoming.wrapping_add(1);
            }
        }
        Ok(())
    }

    /// Confirms delivery of every pending message up to and including
    /// `mark`, dequeuing the prefix.
    pub fn confirm(&mut self, mark: u16) {
        while !self.payloads.is_empty()
            && !sequence_more_recent(self.first_pending, mark, MAX_SEQUENCE)
        {
            self.pending.get();
            self.payloads.pop_front();
            self.first_pending = self.first_pending.wrapping_add(1);
        }
    }

    /// Next delivered message, in send order.
    pub fn receive(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.payloads.clear();
        self.first_pending = 0;
        self.next_outgoing = 0;
        self.expected_incoming = 0;
        self.ready.clear();
    }
}
