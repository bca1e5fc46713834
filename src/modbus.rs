use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// Largest register count a single read holding registers request may carry.
pub const MAX_READ_COUNT: u16 = 125;
/// Largest register count a single write multiple registers request may carry.
pub const MAX_WRITE_COUNT: u16 = 123;

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

pub const READ_HOLDINGS: u8 = 0x03;
pub const WRITE_SINGLE: u8 = 0x06;
pub const WRITE_MULTIPLE: u8 = 0x10;

pub fn crc16(data: &[u8]) -> u16 {
    CRC.checksum(data)
}

#[derive(Debug, Clone)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

impl Request {
    /// How many bytes the device will send back for this request if it succeeds.
    ///
    /// Used to extend the response deadline by the time it takes to clock the reply out over the
    /// serial line.
    pub fn expected_response_length(&self) -> u32 {
        match &self.operation {
            // address, function, byte count, data, crc
            Operation::GetHoldings { address: _, count } => 5 + 2 * u32::from(*count),
            Operation::SetHolding { .. } | Operation::SetHoldings { .. } => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => READ_HOLDINGS,
            Operation::SetHolding { .. } => WRITE_SINGLE,
            Operation::SetHoldings { .. } => WRITE_MULTIPLE,
        }
    }

    pub fn address(&self) -> u16 {
        match *self {
            Operation::GetHoldings { address, .. }
            | Operation::SetHolding { address, .. }
            | Operation::SetHoldings { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode { function_code: u8, code: u8 },
    GetHoldings { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, count: u16 },
}

impl ResponseKind {
    pub fn function_code(&self) -> u8 {
        match self {
            ResponseKind::ErrorCode { function_code, .. } => *function_code,
            ResponseKind::GetHoldings { .. } => READ_HOLDINGS,
            ResponseKind::SetHolding { .. } => WRITE_SINGLE,
            ResponseKind::SetHoldings { .. } => WRITE_MULTIPLE,
        }
    }
}

/// A decoded RTU reply frame. RTU has no transaction ids; the connection worker pairs these
/// with the request that is currently on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub device_id: u8,
    pub kind: ResponseKind,
}

pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

pub struct ModbusRTUCodec {}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.extend_from_slice(&[req.device_id, req.operation.function_code()]);
        match &req.operation {
            Operation::GetHoldings { address, count } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&count.to_be_bytes());
            }
            Operation::SetHolding { address, value } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&value.to_be_bytes());
            }
            Operation::SetHoldings { address, values } => {
                let count = u16::try_from(values.len())
                    .ok()
                    .filter(|c| (1..=MAX_WRITE_COUNT).contains(c))
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "write multiple registers request must carry 1 to 123 values",
                        )
                    })?;
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&count.to_be_bytes());
                dst.extend_from_slice(&[(count * 2) as u8]);
                for value in values {
                    dst.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        let crc = crc16(&dst[start..]);
        dst.extend_from_slice(&crc.to_le_bytes());
        trace!(message = "sending encoded", buffer = ?&dst[start..]);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Reply;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let [device_id, function_code, payload @ ..] = &src[..] else {
                return Ok(None);
            };
            let (device_id, function_code) = (*device_id, *function_code);
            let frame_length = match function_code {
                READ_HOLDINGS => {
                    let Some(&byte_count) = payload.first() else {
                        return Ok(None);
                    };
                    if byte_count % 2 != 0 {
                        src.advance(1);
                        continue;
                    }
                    3 + usize::from(byte_count) + 2
                }
                WRITE_SINGLE | WRITE_MULTIPLE => 8,
                c if c & 0x80 != 0 => 5,
                _ => {
                    src.advance(1);
                    continue;
                }
            };
            let Some(frame) = src.get(..frame_length) else {
                return Ok(None);
            };
            let (body, checksum) = frame.split_at(frame_length - 2);
            let checksum = u16::from_le_bytes([checksum[0], checksum[1]]);
            if crc16(body) != checksum {
                debug!(message = "crc mismatch, resynchronizing", frame = ?frame);
                src.advance(1);
                continue;
            }
            let word = |i: usize| u16::from_be_bytes([body[i], body[i + 1]]);
            let kind = match function_code {
                READ_HOLDINGS => ResponseKind::GetHoldings {
                    values: body[3..]
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                },
                WRITE_SINGLE => ResponseKind::SetHolding { address: word(2), value: word(4) },
                WRITE_MULTIPLE => ResponseKind::SetHoldings { address: word(2), count: word(4) },
                _ => ResponseKind::ErrorCode { function_code: function_code & 0x7F, code: body[2] },
            };
            src.advance(frame_length);
            return Ok(Some(Reply { device_id, kind }));
        }
    }
}
