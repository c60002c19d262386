//! CP02 wire protocol - message types and framing
//!
//! Every exchange with the charger is one frame: a fixed 9-byte header followed
//! by the payload.
//!
//! ```text
//! byte  0        1       2        3         4      5..=7        8
//!       version  msg_id  service  sequence  flags  size (u24)   checksum
//! ```
//!
//! `service` is signed on the wire: a negative value is a successful response,
//! a non-negative value is a request code. The checksum is the wrapping sum of
//! header bytes 0..=7.

pub mod ble;
pub mod telemetry;

/// Length of the fixed frame header
pub const HEADER_LEN: usize = 9;

/// Largest payload the 24-bit size field can describe
pub const MAX_PAYLOAD_LEN: usize = 0x00FF_FFFF;

/// Version used for every request built by [`Message::request`]
pub const REQUEST_VERSION: u8 = 0;

// Header flags
pub const FLAG_NONE: u8 = 0x0;
pub const FLAG_SYN: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x2;
pub const FLAG_FIN: u8 = 0x3;
pub const FLAG_RST: u8 = 0x4;
pub const FLAG_SYN_ACK: u8 = 0x5;

/// A frame that could not be decoded. Never fatal to a session: the frame is
/// dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, header needs {HEADER_LEN}")]
    TooShort { len: usize },
    #[error("checksum mismatch: header carries 0x{expected:02x}, computed 0x{actual:02x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("size mismatch: header declares {declared} bytes, frame carries {actual}")]
    Size { declared: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes does not fit the 24-bit size field")]
    PayloadTooLarge { len: usize },
}

/// Byte order of the 24-bit size field.
///
/// Decoding has always branched on the frame version: version 0 is big-endian,
/// anything newer little-endian. Encoding uses the same rule, so a version 0
/// request is byte-for-byte what the deployed firmware expects, and frames of
/// every version survive a decode/encode round trip. [`Message::encode_with`]
/// can still force one order for tooling that must mimic a specific peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOrder {
    BigEndian,
    LittleEndian,
}

impl SizeOrder {
    pub fn for_version(version: u8) -> Self {
        if version == 0 {
            SizeOrder::BigEndian
        } else {
            SizeOrder::LittleEndian
        }
    }

    fn write(self, size: usize) -> [u8; 3] {
        let b = [(size >> 16) as u8, (size >> 8) as u8, size as u8];
        match self {
            SizeOrder::BigEndian => b,
            SizeOrder::LittleEndian => [b[2], b[1], b[0]],
        }
    }

    fn read(self, b: [u8; 3]) -> usize {
        let (hi, mid, lo) = match self {
            SizeOrder::BigEndian => (b[0], b[1], b[2]),
            SizeOrder::LittleEndian => (b[2], b[1], b[0]),
        };
        ((hi as usize) << 16) | ((mid as usize) << 8) | lo as usize
    }
}

/// A decoded (or to-be-encoded) frame. `size` and `checksum` are derived from
/// the other fields, see [`Message::size`] and [`Message::checksum`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub msg_id: u8,
    pub service: i8,
    pub sequence: u8,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Message {
    /// A host request: version 0, sequence 0, `ACK` flag (the device executes
    /// single-frame commands on `ACK`).
    pub fn request(msg_id: u8, service: u8, payload: Vec<u8>) -> Self {
        Self {
            version: REQUEST_VERSION,
            msg_id,
            service: service as i8,
            sequence: 0,
            flags: FLAG_ACK,
            payload,
        }
    }

    /// Negative service code on the wire means the device accepted the command
    pub fn is_success(&self) -> bool {
        self.service < 0
    }

    /// The service byte as sent on the wire
    pub fn service_code(&self) -> u8 {
        self.service as u8
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Checksum this message's header carries when encoded in its own version
    pub fn checksum(&self) -> u8 {
        checksum(&self.header(SizeOrder::for_version(self.version)))
    }

    fn header(&self, order: SizeOrder) -> [u8; HEADER_LEN] {
        let size = order.write(self.payload.len());
        let mut header = [
            self.version,
            self.msg_id,
            self.service as u8,
            self.sequence,
            self.flags,
            size[0],
            size[1],
            size[2],
            0,
        ];
        header[8] = checksum(&header);
        header
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.encode_with(SizeOrder::for_version(self.version))
    }

    /// Encode with an explicit size-field byte order
    pub fn encode_with(&self, order: SizeOrder) -> Result<Vec<u8>, EncodeError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge { len: self.payload.len() });
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header(order));
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort { len: data.len() });
        }

        let actual = checksum(&data[..HEADER_LEN]);
        if actual != data[8] {
            return Err(DecodeError::Checksum { expected: data[8], actual });
        }

        let version = data[0];
        let declared = SizeOrder::for_version(version).read([data[5], data[6], data[7]]);
        let payload = &data[HEADER_LEN..];
        if declared != payload.len() {
            return Err(DecodeError::Size { declared, actual: payload.len() });
        }

        Ok(Self {
            version,
            msg_id: data[1],
            service: data[2] as i8,
            sequence: data[3],
            flags: data[4],
            payload: payload.to_vec(),
        })
    }
}

/// Wrapping sum of header bytes 0..=7; the checksum byte itself is excluded.
pub fn checksum(header: &[u8]) -> u8 {
    header
        .iter()
        .take(HEADER_LEN - 1)
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
}

pub fn encode(
    version: u8,
    msg_id: u8,
    service: i8,
    sequence: u8,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>, EncodeError> {
    Message { version, msg_id, service, sequence, flags, payload: payload.to_vec() }.encode()
}

pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    Message::decode(data)
}

pub fn is_success(message: &Message) -> bool {
    message.is_success()
}

/// Prepend the session token when the command requires one
pub fn auth_commands(needs_token: bool, token: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    if needs_token {
        buf.push(token);
    }
    buf.extend_from_slice(payload);
    buf
}
