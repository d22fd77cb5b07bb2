//! Wire encoding and decoding for BitChat mesh packets.
//!
//! All multi-byte integer fields are big-endian (network byte order). The
//! header is variable length: the recipient ID and trailing signature are
//! only present when the corresponding flag bit is set.
//!
//! ```text
//! version:u8 type:u8 ttl:u8 timestamp:u64 flags:u8 senderID:8B
//! [recipientID:8B] payloadLen:u16 payload[..] [signature:64B]
//! ```

use crate::error::PacketError;

/// Fixed-size portion of the header: version, type, ttl, timestamp, flags, senderID, payloadLen.
const HEADER_FIXED_SIZE: usize = 1 + 1 + 1 + 8 + 1 + 8 + 2;

/// Size of a peer ID in bytes.
pub const PEER_ID_SIZE: usize = 8;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Recipient ID reserved for broadcast to the whole mesh.
pub const BROADCAST_RECIPIENT: [u8; PEER_ID_SIZE] = [0xFF; PEER_ID_SIZE];

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Payloads larger than this are rejected outright, before fragmentation logic runs.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Message type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Plaintext peer presence announcement.
    Announce = 0x01,
    /// Peer is leaving the mesh.
    Leave = 0x03,
    /// Chat message payload.
    Message = 0x04,
    /// First fragment of a split message.
    FragmentStart = 0x05,
    /// Continuation fragment.
    FragmentContinue = 0x06,
    /// Final fragment.
    FragmentEnd = 0x07,
    /// Channel presence announcement.
    ChannelAnnounce = 0x08,
    /// Channel message-retention policy update.
    ChannelRetention = 0x09,
    /// Delivery acknowledgment.
    DeliveryAck = 0x0A,
    /// Request for delivery status of a prior message.
    DeliveryStatusRequest = 0x0B,
    /// Read receipt.
    ReadReceipt = 0x0C,
    /// Noise `XX` handshake, initiator to responder.
    NoiseHandshakeInit = 0x10,
    /// Noise `XX` handshake, responder to initiator.
    NoiseHandshakeResp = 0x11,
    /// Noise transport-mode encrypted payload.
    NoiseEncrypted = 0x13,
    /// Signed binding of fingerprint to current ephemeral peer ID.
    NoiseIdentityAnnounce = 0x14,
    /// Request to verify a channel's shared password.
    ChannelKeyVerifyRequest = 0x15,
    /// Response to a channel key verification request.
    ChannelKeyVerifyResponse = 0x16,
    /// Rotated channel password distribution.
    ChannelPasswordUpdate = 0x17,
    /// Channel metadata (topic, description).
    ChannelMetadata = 0x18,
    /// Version negotiation hello.
    VersionHello = 0x20,
    /// Version negotiation acknowledgment.
    VersionAck = 0x21,
}

impl TryFrom<u8> for MessageType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x03 => Ok(Self::Leave),
            0x04 => Ok(Self::Message),
            0x05 => Ok(Self::FragmentStart),
            0x06 => Ok(Self::FragmentContinue),
            0x07 => Ok(Self::FragmentEnd),
            0x08 => Ok(Self::ChannelAnnounce),
            0x09 => Ok(Self::ChannelRetention),
            0x0A => Ok(Self::DeliveryAck),
            0x0B => Ok(Self::DeliveryStatusRequest),
            0x0C => Ok(Self::ReadReceipt),
            0x10 => Ok(Self::NoiseHandshakeInit),
            0x11 => Ok(Self::NoiseHandshakeResp),
            0x13 => Ok(Self::NoiseEncrypted),
            0x14 => Ok(Self::NoiseIdentityAnnounce),
            0x15 => Ok(Self::ChannelKeyVerifyRequest),
            0x16 => Ok(Self::ChannelKeyVerifyResponse),
            0x17 => Ok(Self::ChannelPasswordUpdate),
            0x18 => Ok(Self::ChannelMetadata),
            0x20 => Ok(Self::VersionHello),
            0x21 => Ok(Self::VersionAck),
            other => Err(PacketError::Malformed(format!(
                "unknown message type: 0x{other:02X}"
            ))),
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Recipient ID field is present (directed packet, not broadcast).
    pub const HAS_RECIPIENT: u8 = 0b0000_0001;
    /// Trailing signature field is present.
    pub const HAS_SIGNATURE: u8 = 0b0000_0010;

    /// Empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Set the recipient-present bit.
    #[must_use]
    pub fn with_recipient(mut self) -> Self {
        self.0 |= Self::HAS_RECIPIENT;
        self
    }

    /// Set the signature-present bit.
    #[must_use]
    pub fn with_signature(mut self) -> Self {
        self.0 |= Self::HAS_SIGNATURE;
        self
    }

    /// Whether a recipient ID follows the sender ID.
    #[must_use]
    pub fn has_recipient(&self) -> bool {
        self.0 & Self::HAS_RECIPIENT != 0
    }

    /// Whether a trailing signature is present.
    #[must_use]
    pub fn has_signature(&self) -> bool {
        self.0 & Self::HAS_SIGNATURE != 0
    }

    /// Raw byte value.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// A decoded mesh packet.
///
/// Owns its payload and optional signature; the header fields that drive
/// routing decisions (ttl, sender, recipient) are plain copies.
#[derive(Debug, Clone)]
pub struct Packet {
    version: u8,
    message_type: MessageType,
    ttl: u8,
    timestamp: u64,
    sender_id: [u8; PEER_ID_SIZE],
    recipient_id: Option<[u8; PEER_ID_SIZE]>,
    payload: Vec<u8>,
    signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Protocol version this packet was encoded with.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Message type.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Remaining relay hop count.
    #[must_use]
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Milliseconds since the Unix epoch, as set by the originator.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Ephemeral peer ID of the originator.
    #[must_use]
    pub fn sender_id(&self) -> [u8; PEER_ID_SIZE] {
        self.sender_id
    }

    /// Destination peer ID, or `None` for a mesh-wide broadcast.
    #[must_use]
    pub fn recipient_id(&self) -> Option<[u8; PEER_ID_SIZE]> {
        self.recipient_id
    }

    /// Whether this packet is addressed to a single peer rather than broadcast.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none_or(|r| r == BROADCAST_RECIPIENT)
    }

    /// Packet payload (still Noise-encrypted for `NoiseEncrypted` messages).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Ed25519 signature over the header and payload, if present.
    #[must_use]
    pub fn signature(&self) -> Option<&[u8; SIGNATURE_SIZE]> {
        self.signature.as_ref()
    }

    /// Decrement TTL by one, returning `None` once it reaches zero (do not relay).
    #[must_use]
    pub fn decremented_ttl(&self) -> Option<u8> {
        self.ttl.checked_sub(1).filter(|&t| t > 0)
    }

    /// Clone this packet with a new TTL, for relay.
    #[must_use]
    pub fn with_ttl(&self, ttl: u8) -> Self {
        Self {
            ttl,
            ..self.clone()
        }
    }

    /// Parse a packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Malformed` if the buffer is too short, the
    /// message type byte is unrecognized, or the declared payload length
    /// does not fit within the remaining bytes.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        Self::parse_with_limit(data, usize::MAX)
    }

    /// Parse a packet, rejecting declared payload lengths above `max_payload`.
    ///
    /// # Errors
    ///
    /// As [`Packet::parse`], plus `PacketError::PayloadTooLarge` if the
    /// declared payload length exceeds `max_payload`.
    pub fn parse_with_limit(data: &[u8], max_payload: usize) -> Result<Self, PacketError> {
        if data.len() < HEADER_FIXED_SIZE {
            return Err(PacketError::Malformed(format!(
                "header too short: expected at least {HEADER_FIXED_SIZE}, got {}",
                data.len()
            )));
        }

        let version = data[0];
        let message_type = MessageType::try_from(data[1])?;
        let ttl = data[2];
        let timestamp = u64::from_be_bytes(data[3..11].try_into().unwrap());
        let flags = PacketFlags(data[11]);
        let mut sender_id = [0u8; PEER_ID_SIZE];
        sender_id.copy_from_slice(&data[12..20]);

        let mut cursor = 20;

        let recipient_id = if flags.has_recipient() {
            if data.len() < cursor + PEER_ID_SIZE {
                return Err(PacketError::Malformed("truncated recipient id".into()));
            }
            let mut r = [0u8; PEER_ID_SIZE];
            r.copy_from_slice(&data[cursor..cursor + PEER_ID_SIZE]);
            cursor += PEER_ID_SIZE;
            Some(r)
        } else {
            None
        };

        if data.len() < cursor + 2 {
            return Err(PacketError::Malformed("truncated payload length".into()));
        }
        let payload_len = u16::from_be_bytes([data[cursor], data[cursor + 1]]) as usize;
        cursor += 2;

        if payload_len > max_payload {
            return Err(PacketError::PayloadTooLarge {
                size: payload_len,
                limit: max_payload,
            });
        }

        if data.len() < cursor + payload_len {
            return Err(PacketError::Malformed("truncated payload".into()));
        }
        let payload = data[cursor..cursor + payload_len].to_vec();
        cursor += payload_len;

        let signature = if flags.has_signature() {
            if data.len() < cursor + SIGNATURE_SIZE {
                return Err(PacketError::Malformed("truncated signature".into()));
            }
            let mut s = [0u8; SIGNATURE_SIZE];
            s.copy_from_slice(&data[cursor..cursor + SIGNATURE_SIZE]);
            Some(s)
        } else {
            None
        };

        Ok(Self {
            version,
            message_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }

    /// Encode this packet to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = PacketFlags::new();
        if self.recipient_id.is_some() {
            flags = flags.with_recipient();
        }
        if self.signature.is_some() {
            flags = flags.with_signature();
        }

        let mut buf = Vec::with_capacity(
            HEADER_FIXED_SIZE
                + self.recipient_id.map_or(0, |_| PEER_ID_SIZE)
                + self.payload.len()
                + self.signature.map_or(0, |_| SIGNATURE_SIZE),
        );

        buf.push(self.version);
        buf.push(self.message_type as u8);
        buf.push(self.ttl);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.push(flags.as_u8());
        buf.extend_from_slice(&self.sender_id);
        if let Some(r) = self.recipient_id {
            buf.extend_from_slice(&r);
        }
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        if let Some(s) = self.signature {
            buf.extend_from_slice(&s);
        }

        buf
    }
}

/// Builder for constructing outgoing packets.
pub struct PacketBuilder {
    version: u8,
    message_type: MessageType,
    ttl: u8,
    timestamp: u64,
    sender_id: [u8; PEER_ID_SIZE],
    recipient_id: Option<[u8; PEER_ID_SIZE]>,
    payload: Vec<u8>,
    signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl PacketBuilder {
    /// Start building a packet of the given type, originating from `sender_id`.
    #[must_use]
    pub fn new(message_type: MessageType, sender_id: [u8; PEER_ID_SIZE], ttl: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl,
            timestamp: 0,
            sender_id,
            recipient_id: None,
            payload: Vec::new(),
            signature: None,
        }
    }

    /// Set the originator timestamp (milliseconds since the Unix epoch).
    #[must_use]
    pub fn timestamp(mut self, ts: u64) -> Self {
        self.timestamp = ts;
        self
    }

    /// Address this packet to a specific peer instead of broadcasting.
    #[must_use]
    pub fn recipient(mut self, recipient_id: [u8; PEER_ID_SIZE]) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    /// Set the payload bytes.
    #[must_use]
    pub fn payload(mut self, data: Vec<u8>) -> Self {
        self.payload = data;
        self
    }

    /// Attach a signature.
    #[must_use]
    pub fn signature(mut self, sig: [u8; SIGNATURE_SIZE]) -> Self {
        self.signature = Some(sig);
        self
    }

    /// Finish building the packet.
    #[must_use]
    pub fn build(self) -> Packet {
        Packet {
            version: self.version,
            message_type: self.message_type,
            ttl: self.ttl,
            timestamp: self.timestamp,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            payload: self.payload,
            signature: self.signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> [u8; PEER_ID_SIZE] {
        [1, 2, 3, 4, 5, 6, 7, 8]
    }

    #[test]
    fn broadcast_roundtrip() {
        let packet = PacketBuilder::new(MessageType::Message, sender(), 7)
            .timestamp(1_700_000_000_000)
            .payload(b"hello mesh".to_vec())
            .build();

        let bytes = packet.encode();
        let parsed = Packet::parse(&bytes).unwrap();

        assert_eq!(parsed.message_type(), MessageType::Message);
        assert_eq!(parsed.ttl(), 7);
        assert_eq!(parsed.sender_id(), sender());
        assert!(parsed.recipient_id().is_none());
        assert!(parsed.is_broadcast());
        assert_eq!(parsed.payload(), b"hello mesh");
    }

    #[test]
    fn directed_with_signature_roundtrip() {
        let recipient = [9u8; PEER_ID_SIZE];
        let sig = [0xABu8; SIGNATURE_SIZE];

        let packet = PacketBuilder::new(MessageType::NoiseIdentityAnnounce, sender(), 1)
            .recipient(recipient)
            .payload(vec![1, 2, 3])
            .signature(sig)
            .build();

        let bytes = packet.encode();
        let parsed = Packet::parse(&bytes).unwrap();

        assert_eq!(parsed.recipient_id(), Some(recipient));
        assert!(!parsed.is_broadcast());
        assert_eq!(parsed.signature(), Some(&sig));
    }

    #[test]
    fn rejects_short_buffer() {
        let short = [0u8; 5];
        assert!(matches!(
            Packet::parse(&short),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut packet = PacketBuilder::new(MessageType::Message, sender(), 1).build();
        packet.message_type = MessageType::Message;
        let mut bytes = packet.encode();
        bytes[1] = 0x99;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn enforces_payload_limit() {
        let packet = PacketBuilder::new(MessageType::Message, sender(), 1)
            .payload(vec![0u8; 64])
            .build();
        let bytes = packet.encode();

        assert!(matches!(
            Packet::parse_with_limit(&bytes, 16),
            Err(PacketError::PayloadTooLarge { size: 64, limit: 16 })
        ));
    }

    #[test]
    fn ttl_decrements_and_floors_at_none() {
        let one_hop = PacketBuilder::new(MessageType::Message, sender(), 1).build();
        assert_eq!(one_hop.decremented_ttl(), None);

        let two_hop = PacketBuilder::new(MessageType::Message, sender(), 2).build();
        assert_eq!(two_hop.decremented_ttl(), Some(1));
    }

    #[test]
    fn broadcast_recipient_constant_is_all_ones() {
        assert_eq!(BROADCAST_RECIPIENT, [0xFF; PEER_ID_SIZE]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = Packet::parse(&data);
            }

            #[test]
            fn prop_roundtrip_preserves_payload(
                ttl in 1u8..=20,
                timestamp in any::<u64>(),
                payload in prop::collection::vec(any::<u8>(), 0..512)
            ) {
                let packet = PacketBuilder::new(MessageType::Message, sender(), ttl)
                    .timestamp(timestamp)
                    .payload(payload.clone())
                    .build();

                let bytes = packet.encode();
                let parsed = Packet::parse(&bytes).unwrap();

                prop_assert_eq!(parsed.ttl(), ttl);
                prop_assert_eq!(parsed.timestamp(), timestamp);
                prop_assert_eq!(parsed.payload(), payload.as_slice());
            }
        }
    }
}
