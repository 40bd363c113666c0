pub mod connection;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod reliable;
pub mod stats;

pub use connection::{
    Connection, ConnectionState, NetError, DEFAULT_MAX_RATE, DEFAULT_TIMEOUT_MS, MAX_RTT_MS,
};
pub use message::{BitMessage, MessageError, ReadState, WriteState};
pub use protocol::{
    bit_index_for_sequence, generate_ack_bits, sequence_more_recent, PacketHeader, ProtocolError,
    DEFAULT_PROTOCOL_ID, MAX_MESSAGE_SIZE, MAX_PACKET_SIZE, MAX_SEQUENCE,
};
pub use queue::{PacketQueue, PacketRecord, PACKET_QUEUE_SIZE};
pub use reliable::{ReliableChannel, MAX_RELIABLE_PAYLOAD};
pub use stats::{LossEstimator, NetworkStats, PacketLossSimulation, RateEstimator};
