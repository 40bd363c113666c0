use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};

use crate::message::{BitMessage, MessageError};
use crate::protocol::{
    bit_index_for_sequence, generate_ack_bits, sequence_more_recent, PacketHeader,
    MAX_PACKET_SIZE, MAX_SEQUENCE,
};
use crate::queue::PacketRecord;
use crate::reliable::ReliableChannel;
use crate::stats::{LossEstimator, NetworkStats, PacketLossSimulation, RateEstimator};

pub const DEFAULT_TIMEOUT_MS: u32 = 10_000;
pub const DEFAULT_MAX_RATE: u32 = 64_000;
pub const MAX_RTT_MS: u32 = 1_000;

const RTT_SMOOTHING: f32 = 0.1;
// received history keeps the ack target plus the 33 sequences behind it
const ACK_WINDOW: u16 = 34;
const OUTGOING_RATE_WINDOW_MS: u32 = 1_000;
const LOSS_WINDOW_MS: u32 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    ConnectFail,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("connection is not running")]
    NotRunning,
    #[error("no remote address set")]
    NotConnected,
    #[error("message payload does not fit in a datagram: {size} bytes")]
    PayloadTooLarge { size: usize },
    #[error("reliable send queue is full")]
    ReliableQueueFull,
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Reliable-enough connection to a single remote peer over UDP.
///
/// Every datagram carries a sequence number plus an acknowledgment of the
/// newest sequence seen from the peer and a bitmask covering the 32
/// sequences behind it. Delivery confirmation, RTT estimation, rate shaping
/// and loss accounting all derive from that header exchange. The connection
/// is driven synchronously from the owning game loop: `ready_to_send` →
/// `send_message`, drain `receive_message`, `update` once per tick.
pub struct Connection {
    socket: Option<UdpSocket>,
    remote_address: Option<SocketAddr>,
    protocol_id: u32,
    mode: Mode,
    state: ConnectionState,

    max_rate: u32,
    last_send_time: u32,
    last_data_bytes: i64,

    outgoing_rate: RateEstimator,
    incoming_rate: RateEstimator,
    loss: LossEstimator,

    local_sequence: u16,
    remote_sequence: u16,
    max_sequence: u16,

    rtt: f32,
    max_rtt: f32,
    timeout_ms: u32,
    timeout_acc: u32,
    clock_ms: u32,

    sent: VecDeque<PacketRecord>,
    received: VecDeque<PacketRecord>,
    pending_ack: VecDeque<PacketRecord>,
    acked: VecDeque<PacketRecord>,

    reliable: ReliableChannel,
    // (packet sequence, highest reliable sequence it carried)
    reliable_marks: VecDeque<(u16, u16)>,

    stats: NetworkStats,
    loss_sim: PacketLossSimulation,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl Connection {
    pub fn new(protocol_id: u32, timeout_ms: u32) -> Self {
        Self {
            socket: None,
            remote_address: None,
            protocol_id,
            mode: Mode::None,
            state: ConnectionState::Disconnected,
            max_rate: DEFAULT_MAX_RATE,
            last_send_time: 0,
            last_data_bytes: 0,
            outgoing_rate: RateEstimator::new(OUTGOING_RATE_WINDOW_MS),
            incoming_rate: RateEstimator::new(OUTGOING_RATE_WINDOW_MS),
            loss: LossEstimator::new(LOSS_WINDOW_MS),
            local_sequence: 0,
            remote_sequence: 0,
            max_sequence: MAX_SEQUENCE,
            rtt: 0.0,
            max_rtt: MAX_RTT_MS as f32,
            timeout_ms,
            timeout_acc: 0,
            clock_ms: 0,
            sent: VecDeque::new(),
            received: VecDeque::new(),
            pending_ack: VecDeque::new(),
            acked: VecDeque::new(),
            reliable: ReliableChannel::new(),
            reliable_marks: VecDeque::new(),
            stats: NetworkStats::default(),
            loss_sim: PacketLossSimulation::default(),
            recv_buffer: [0; MAX_PACKET_SIZE],
        }
    }

    /// Opens the socket. Port 0 binds an ephemeral port.
    pub fn start(&mut self, port: u16) -> Result<(), NetError> {
        assert!(self.socket.is_none(), "connection already running");
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_nonblocking(true)?;
        log::info!("connection started on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        assert!(self.socket.is_some(), "connection is not running");
        log::info!("stopping connection");
        self.clear_data();
        self.socket = None;
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Waits for a client; the first valid datagram completes the
    /// connection and pins its sender as the remote address.
    pub fn listen(&mut self) {
        self.clear_data();
        self.mode = Mode::Server;
        self.state = ConnectionState::Listening;
        log::info!("listening for connection");
    }

    pub fn connect(&mut self, addr: SocketAddr) {
        assert!(self.socket.is_some(), "connection is not running");
        self.clear_data();
        self.mode = Mode::Client;
        self.state = ConnectionState::Connecting;
        self.remote_address = Some(addr);
        log::info!("connecting to {addr}");
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn is_listening(&self) -> bool {
        self.state == ConnectionState::Listening
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connect_fail(&self) -> bool {
        self.state == ConnectionState::ConnectFail
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    pub fn local_sequence(&self) -> u16 {
        self.local_sequence
    }

    pub fn remote_sequence(&self) -> u16 {
        self.remote_sequence
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn round_trip_time(&self) -> f32 {
        self.rtt
    }

    /// Maximum outgoing rate in bytes per second; 0 disables the limit.
    pub fn set_max_outgoing_rate(&mut self, rate: u32) {
        self.max_rate = rate;
    }

    pub fn max_outgoing_rate(&self) -> u32 {
        self.max_rate
    }

    /// Average outgoing rate over the last second, in bytes.
    pub fn outgoing_rate(&self) -> u32 {
        self.outgoing_rate.value()
    }

    /// Average incoming rate over the last second, in bytes.
    pub fn incoming_rate(&self) -> u32 {
        self.incoming_rate.value()
    }

    /// Incoming packet loss percentage over the last five seconds.
    pub fn incoming_packet_loss(&self) -> f32 {
        self.loss.percent()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn set_loss_simulation(&mut self, sim: PacketLossSimulation) {
        self.loss_sim = sim;
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack.len()
    }

    pub fn pending_ack_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending_ack.iter().map(|r| r.sequence)
    }

    pub fn acked_count(&self) -> usize {
        self.acked.len()
    }

    /// True when the leaky bucket has drained enough to send more data.
    pub fn ready_to_send(&self, time_ms: u32) -> bool {
        if self.max_rate == 0 {
            return true;
        }
        let delta = time_ms.saturating_sub(self.last_send_time) as i64;
        if delta > 1000 {
            return true;
        }
        self.last_data_bytes - delta * self.max_rate as i64 / 1000 <= 0
    }

    /// Stamps a header onto `msg`'s bytes, prepends any pending reliable
    /// messages, and transmits the datagram to the remote peer.
    pub fn send_message(&mut self, msg: &BitMessage, time_ms: u32) -> Result<usize, NetError> {
        let socket = self.socket.as_ref().ok_or(NetError::NotRunning)?;
        let remote = self.remote_address.ok_or(NetError::NotConnected)?;
        self.clock_ms = self.clock_ms.max(time_ms);

        let ack_bits = generate_ack_bits(
            self.remote_sequence,
            self.received.iter().map(|r| r.sequence),
            self.max_sequence,
        );
        let header = PacketHeader::new(
            self.protocol_id,
            self.local_sequence,
            self.remote_sequence,
            ack_bits,
        );

        let mut payload = BitMessage::with_capacity(MAX_PACKET_SIZE - PacketHeader::SIZE);
        let mark = self.reliable.write_block(&mut payload)?;
        payload
            .write_data(msg.data())
            .map_err(|_| NetError::PayloadTooLarge { size: msg.len() })?;

        let mut datagram = Vec::with_capacity(PacketHeader::SIZE + payload.len());
        datagram.extend_from_slice(&header.encode());
        datagram.extend_from_slice(payload.data());

        if self.loss_sim.should_drop() {
            log::debug!("simulated loss of outgoing packet {}", self.local_sequence);
        } else {
            socket.send_to(&datagram, remote)?;
        }

        if let Some(mark) = mark {
            self.reliable_marks.push_back((self.local_sequence, mark));
        }
        self.packet_sent(datagram.len());

        let delta = time_ms.saturating_sub(self.last_send_time) as i64;
        if delta > 1000 {
            self.last_data_bytes = 0;
        } else {
            self.last_data_bytes -= delta * self.max_rate as i64 / 1000;
            if self.last_data_bytes < 0 {
                self.last_data_bytes = 0;
            }
        }
        self.last_data_bytes += datagram.len() as i64;
        self.last_send_time = time_ms;

        self.outgoing_rate.update(time_ms, datagram.len());
        self.stats.bytes_sent += datagram.len() as u64;

        Ok(datagram.len())
    }

    /// Polls the socket for the next valid datagram; `Ok(None)` means no
    /// data is pending. On success `msg` holds the user payload, positioned
    /// for reading. Short, foreign and malformed datagrams are dropped and
    /// polling continues.
    pub fn receive_message(
        &mut self,
        msg: &mut BitMessage,
        time_ms: u32,
    ) -> Result<Option<usize>, NetError> {
        if self.socket.is_none() {
            return Err(NetError::NotRunning);
        }
        self.clock_ms = self.clock_ms.max(time_ms);

        loop {
            let (size, sender) = {
                let socket = self.socket.as_ref().ok_or(NetError::NotRunning)?;
                match socket.recv_from(&mut self.recv_buffer) {
                    Ok(v) => v,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            };

            let Ok(header) = PacketHeader::decode(&self.recv_buffer[..size]) else {
                log::warn!("short datagram ({size} bytes) from {sender}");
                continue;
            };
            if header.protocol_id != self.protocol_id {
                log::debug!(
                    "datagram with foreign protocol id {:#x} from {sender}",
                    header.protocol_id
                );
                continue;
            }

            if self.mode == Mode::Server && !self.is_connected() {
                log::info!("server accepted connection from {sender}");
                self.state = ConnectionState::Connected;
                self.remote_address = Some(sender);
            }
            if self.remote_address != Some(sender) {
                log::debug!("datagram from unexpected sender {sender}");
                continue;
            }
            if self.mode == Mode::Client && self.state == ConnectionState::Connecting {
                log::info!("client completed connection with {sender}");
                self.state = ConnectionState::Connected;
            }

            self.packet_received(header.sequence, size, time_ms);
            self.process_ack(header.ack, header.ack_bits);

            let payload_len = size - PacketHeader::SIZE;
            let mut block = BitMessage::from_bytes(&self.recv_buffer[PacketHeader::SIZE..size]);
            if self.reliable.read_block(&mut block).is_err() {
                log::warn!("malformed reliable block from {sender}");
                continue;
            }
            let consumed = block.read_count();

            msg.begin_writing();
            if msg
                .write_data(&self.recv_buffer[PacketHeader::SIZE + consumed..size])
                .is_err()
            {
                log::warn!("payload larger than receiving message buffer");
                continue;
            }
            msg.begin_reading();

            self.timeout_acc = 0;
            return Ok(Some(payload_len - consumed));
        }
    }

    /// Queues a message for reliable in-order delivery; it piggybacks on
    /// outgoing packets until one of them is acknowledged.
    pub fn send_reliable_message(&mut self, data: &[u8], time_ms: u32) -> Result<(), NetError> {
        if data.len() > crate::reliable::MAX_RELIABLE_PAYLOAD {
            return Err(NetError::PayloadTooLarge { size: data.len() });
        }
        if !self.reliable.send(data, time_ms) {
            return Err(NetError::ReliableQueueFull);
        }
        Ok(())
    }

    /// Next reliable message delivered by the peer, in send order.
    pub fn receive_reliable_message(&mut self) -> Option<Vec<u8>> {
        self.reliable.receive()
    }

    /// Reliable messages queued but not yet confirmed by the peer.
    pub fn reliable_pending_count(&self) -> usize {
        self.reliable.pending_len()
    }

    pub fn clear_reliable_messages(&mut self) {
        self.reliable.clear();
        self.reliable_marks.clear();
    }

    /// Per-tick maintenance: ages the packet histories, expires entries
    /// that fell out of their windows (expired pending acks count as lost),
    /// and runs the connection timeout.
    pub fn update(&mut self, delta_ms: u32) {
        self.clock_ms = self.clock_ms.saturating_add(delta_ms);

        for rec in self
            .sent
            .iter_mut()
            .chain(self.received.iter_mut())
            .chain(self.pending_ack.iter_mut())
            .chain(self.acked.iter_mut())
        {
            rec.time = rec.time.saturating_add(delta_ms);
        }

        let max_rtt = self.max_rtt as u32;
        while self.sent.front().is_some_and(|r| r.time > max_rtt) {
            self.sent.pop_front();
        }

        if !self.received.is_empty() {
            let min_sequence = self.remote_sequence.wrapping_sub(ACK_WINDOW);
            while self
                .received
                .front()
                .is_some_and(|r| !sequence_more_recent(r.sequence, min_sequence, self.max_sequence))
            {
                self.received.pop_front();
            }
        }

        while self.acked.front().is_some_and(|r| r.time > max_rtt * 2) {
            self.acked.pop_front();
        }

        let mut dropped = 0u32;
        while self.pending_ack.front().is_some_and(|r| r.time > max_rtt) {
            self.pending_ack.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("{dropped} packets expired unacknowledged");
            self.stats.packets_lost += dropped as u64;
            self.loss.update(self.clock_ms, 0, dropped);
            self.stats.packet_loss_percent = self.loss.percent();
            self.reliable_marks
                .retain(|&(seq, _)| self.pending_ack.iter().any(|r| r.sequence == seq));
        }

        self.timeout_acc = self.timeout_acc.saturating_add(delta_ms);
        if self.timeout_acc > self.timeout_ms {
            if self.state == ConnectionState::Connecting {
                log::warn!("connect timed out");
                self.clear_data();
                self.state = ConnectionState::ConnectFail;
            } else if self.state == ConnectionState::Connected {
                log::warn!("connection timed out");
                self.clear_data();
            }
        }
    }

    fn packet_sent(&mut self, size: usize) {
        debug_assert!(
            !self.sent.iter().any(|r| r.sequence == self.local_sequence),
            "local sequence reused before cycling the window"
        );
        debug_assert!(
            !self
                .pending_ack
                .iter()
                .any(|r| r.sequence == self.local_sequence),
            "local sequence still awaiting ack"
        );

        let record = PacketRecord {
            sequence: self.local_sequence,
            time: 0,
            size: size as u32,
        };
        self.sent.push_back(record);
        self.pending_ack.push_back(record);
        self.stats.packets_sent += 1;

        self.local_sequence = if self.local_sequence >= self.max_sequence {
            0
        } else {
            self.local_sequence + 1
        };
    }

    fn packet_received(&mut self, sequence: u16, size: usize, time_ms: u32) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += size as u64;
        self.incoming_rate.update(time_ms, size);
        self.loss.update(time_ms, 1, 0);
        self.stats.packet_loss_percent = self.loss.percent();

        // duplicates count toward the totals but are otherwise ignored
        if self.received.iter().any(|r| r.sequence == sequence) {
            return;
        }
        self.received.push_back(PacketRecord {
            sequence,
            time: 0,
            size: size as u32,
        });
        if sequence_more_recent(sequence, self.remote_sequence, self.max_sequence) {
            self.remote_sequence = sequence;
        }
    }

    fn process_ack(&mut self, ack: u16, ack_bits: u32) {
        let mut i = 0;
        while i < self.pending_ack.len() {
            let rec = self.pending_ack[i];

            let mut acked = rec.sequence == ack;
            if !acked && !sequence_more_recent(rec.sequence, ack, self.max_sequence) {
                let bit = bit_index_for_sequence(rec.sequence, ack, self.max_sequence);
                if bit <= 31 {
                    acked = (ack_bits >> bit) & 1 == 1;
                }
            }

            if acked {
                self.rtt = (self.rtt + (rec.time as f32 - self.rtt) * RTT_SMOOTHING)
                    .min(self.max_rtt);
                self.stats.rtt_ms = self.rtt;

                if let Some(pos) = self
                    .reliable_marks
                    .iter()
                    .position(|&(seq, _)| seq == rec.sequence)
                {
                    let (_, mark) = self.reliable_marks[pos];
                    self.reliable.confirm(mark);
                }

                self.pending_ack.remove(i);
                self.acked.push_back(rec);
            } else {
                i += 1;
            }
        }

        // marks whose packet left the pending set are spent
        self.reliable_marks
            .retain(|&(seq, _)| self.pending_ack.iter().any(|r| r.sequence == seq));
    }

    fn clear_data(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.remote_address = None;
        self.local_sequence = 0;
        self.remote_sequence = 0;
        self.rtt = 0.0;
        self.timeout_acc = 0;
        self.last_send_time = 0;
        self.last_data_bytes = 0;
        self.sent.clear();
        self.received.clear();
        self.pending_ack.clear();
        self.acked.clear();
        self.reliable.clear();
        self.reliable_marks.clear();
        self.outgoing_rate.reset();
        self.incoming_rate.reset();
        self.loss.reset();
        self.stats = NetworkStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_PROTOCOL_ID;

    fn connection() -> Connection {
        Connection::new(DEFAULT_PROTOCOL_ID, DEFAULT_TIMEOUT_MS)
    }

    fn pending(conn: &mut Connection, sequence: u16, time: u32) {
        conn.pending_ack.push_back(PacketRecord {
            sequence,
            time,
            size: 100,
        });
    }

    #[test]
    fn test_process_ack_exact_match() {
        let mut conn = connection();
        pending(&mut conn, 0, 40);

        conn.process_ack(0, 0);
        assert_eq!(conn.pending_ack_count(), 0);
        assert_eq!(conn.acked_count(), 1);
        assert!((conn.round_trip_time() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_process_ack_bitmask() {
        let mut conn = connection();
        pending(&mut conn, 0, 32);
        pending(&mut conn, 1, 16);
        pending(&mut conn, 2, 16);

        // ack 2 with the bit for sequence 0 set; sequence 1 stays pending
        conn.process_ack(2, 0b10);
        assert_eq!(conn.pending_ack_sequences().collect::<Vec<_>>(), vec![1]);
        assert_eq!(conn.acked_count(), 2);
    }

    #[test]
    fn test_process_ack_never_acks_the_future() {
        let mut conn = connection();
        pending(&mut conn, 10, 16);

        conn.process_ack(5, u32::MAX);
        assert_eq!(conn.pending_ack_count(), 1);
        assert_eq!(conn.acked_count(), 0);
    }

    #[test]
    fn test_unacked_entries_persist() {
        let mut conn = connection();
        pending(&mut conn, 0, 16);
        pending(&mut conn, 1, 16);

        conn.process_ack(0, 0);
        assert_eq!(conn.pending_ack_sequences().collect::<Vec<_>>(), vec![1]);

        // a later ack can still confirm it
        conn.process_ack(1, 0);
        assert_eq!(conn.pending_ack_count(), 0);
    }

    #[test]
    fn test_local_sequence_wraps() {
        let mut conn = connection();
        conn.local_sequence = MAX_SEQUENCE;
        conn.packet_sent(100);
        assert_eq!(conn.local_sequence(), 0);
    }

    #[test]
    fn test_duplicate_receive_counted_once() {
        let mut conn = connection();
        conn.packet_received(5, 100, 0);
        conn.packet_received(5, 100, 0);

        assert_eq!(conn.stats().packets_received, 2);
        assert_eq!(conn.received.len(), 1);
        assert_eq!(conn.remote_sequence(), 5);
    }

    #[test]
    fn test_out_of_order_receive_keeps_remote_sequence() {
        let mut conn = connection();
        conn.packet_received(5, 100, 0);
        conn.packet_received(3, 100, 0);

        assert_eq!(conn.remote_sequence(), 5);
        assert_eq!(conn.received.len(), 2);
    }

    #[test]
    fn test_ready_to_send_unlimited() {
        let mut conn = connection();
        conn.set_max_outgoing_rate(0);
        assert!(conn.ready_to_send(0));
    }

    #[test]
    fn test_ready_to_send_throttles() {
        let mut conn = connection();
        conn.set_max_outgoing_rate(1000);
        conn.last_send_time = 0;
        conn.last_data_bytes = 500;

        // 500 bytes owed at 1000 B/s: drained after half a second
        assert!(!conn.ready_to_send(100));
        assert!(conn.ready_to_send(500));
        // anything beyond a second is always allowed
        assert!(conn.ready_to_send(1500));
    }

    #[test]
    fn test_update_expires_pending_as_lost() {
        let mut conn = connection();
        pending(&mut conn, 0, 0);
        pending(&mut conn, 1, 0);

        conn.update(MAX_RTT_MS + 1);
        assert_eq!(conn.pending_ack_count(), 0);
        assert_eq!(conn.stats().packets_lost, 2);
        assert!(conn.incoming_packet_loss() > 0.0);
    }

    #[test]
    fn test_update_trims_received_window() {
        let mut conn = connection();
        for seq in 0..100u16 {
            conn.packet_received(seq, 100, 0);
        }
        conn.update(16);

        assert!(conn.received.len() <= ACK_WINDOW as usize);
        assert_eq!(conn.remote_sequence(), 99);
    }

    #[test]
    fn test_connect_timeout() {
        let mut conn = connection();
        conn.mode = Mode::Client;
        conn.state = ConnectionState::Connecting;

        conn.update(DEFAULT_TIMEOUT_MS + 1);
        assert!(conn.is_connect_fail());
    }
}
