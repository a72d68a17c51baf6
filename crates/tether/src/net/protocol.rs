use bitflags::bitflags;

pub const HEADER_SIZE: usize = 17;
pub const MAX_PAYLOAD_SIZE: usize = 1200;
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;
pub const DEFAULT_PORT: u16 = 27015;

/// Width of the acknowledgment bitfield carried next to `ack`.
pub const ACK_WINDOW: u16 = 32;

const SEQUENCE_HALF_RANGE: u16 = 32768;

// Header byte 16 is reserved: written as zero, ignored on decode.
const RESERVED_BYTE: u8 = 0;

/// Wraparound-aware ordering for 16-bit sequence numbers.
///
/// `a` is newer than `b` when the forward distance from `b` to `a` is
/// non-zero and less than half the sequence space.
#[inline]
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < SEQUENCE_HALF_RANGE
}

#[inline]
pub fn sequence_less_than(a: u16, b: u16) -> bool {
    sequence_greater_than(b, a)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    ConnectAck,
    Disconnect,
    Heartbeat,
    Ack,
    Data,
    ReliableData,
    /// A type byte this build does not know. The payload is kept opaque so
    /// newer peers can extend the protocol.
    Unknown(u8),
}

impl PacketType {
    pub fn is_control(self) -> bool {
        matches!(
            self,
            PacketType::Connect
                | PacketType::ConnectAck
                | PacketType::Disconnect
                | PacketType::Heartbeat
                | PacketType::Ack
        )
    }
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0 => PacketType::Connect,
            1 => PacketType::ConnectAck,
            2 => PacketType::Disconnect,
            3 => PacketType::Heartbeat,
            4 => PacketType::Ack,
            5 => PacketType::Data,
            6 => PacketType::ReliableData,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Connect => 0,
            PacketType::ConnectAck => 1,
            PacketType::Disconnect => 2,
            PacketType::Heartbeat => 3,
            PacketType::Ack => 4,
            PacketType::Data => 5,
            PacketType::ReliableData => 6,
            PacketType::Unknown(other) => other,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const RELIABLE = 1 << 0;
        const COMPRESSED = 1 << 1;
        const ENCRYPTED = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u16,
    pub ack: u16,
    pub ack_bits: u32,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("datagram too short: {0} bytes, header needs {HEADER_SIZE}")]
    TooShort(usize),
    #[error("payload size mismatch: header declares {declared} bytes, datagram carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),
}

impl Packet {
    pub fn new(packet_type: PacketType, flags: PacketFlags, payload: Vec<u8>) -> Self {
        Self {
            sequence: 0,
            ack: 0,
            ack_bits: 0,
            packet_type,
            flags,
            timestamp: 0,
            payload,
        }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Sequence numbers this packet's header acknowledges: `ack` itself and
    /// `ack - i - 1` for every set bit `i` of `ack_bits`.
    pub fn acknowledged(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.ack).chain(
            (0..ACK_WINDOW)
                .filter(|bit| self.ack_bits & (1 << bit) != 0)
                .map(|bit| self.ack.wrapping_sub(bit + 1)),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + payload_len);
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.ack.to_le_bytes());
        out.push(self.packet_type.into());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.ack_bits.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        // Bounded by MAX_PAYLOAD_SIZE above, fits in u16.
        out.extend_from_slice(&(payload_len as u16).to_le_bytes());
        out.push(RESERVED_BYTE);
        out.extend_from_slice(&self.payload);

        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let Some((header, payload)) = data.split_first_chunk::<HEADER_SIZE>() else {
            return Err(PacketError::TooShort(data.len()));
        };

        let declared = usize::from(u16::from_le_bytes([header[14], header[15]]));
        if payload.len() != declared {
            return Err(PacketError::SizeMismatch {
                declared,
                actual: payload.len(),
            });
        }

        Ok(Self {
            sequence: u16::from_le_bytes([header[0], header[1]]),
            ack: u16::from_le_bytes([header[2], header[3]]),
            packet_type: PacketType::from(header[4]),
            flags: PacketFlags::from_bits_retain(header[5]),
            ack_bits: u32::from_le_bytes([header[6], header[7], header[8], header[9]]),
            timestamp: u32::from_le_bytes([header[10], header[11], header[12], header[13]]),
            payload: payload.to_vec(),
        })
    }
}
