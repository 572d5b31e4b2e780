use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest number of holding registers requested in a single read.
pub const MAX_SAFE_READ_COUNT: u16 = 123;

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_SINGLE_REGISTER: u8 = 0x06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
}

impl Operation {
    fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => READ_HOLDING_REGISTERS,
            Operation::SetHolding { .. } => WRITE_SINGLE_REGISTER,
        }
    }

    fn pdu(&self) -> [u8; 5] {
        let (a, b) = match *self {
            Operation::GetHoldings { address, count } => (address, count),
            Operation::SetHolding { address, value } => (address, value),
        };
        let [a0, a1] = a.to_be_bytes();
        let [b0, b1] = b.to_be_bytes();
        [self.function_code(), a0, a1, b0, b1]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    GetHoldings { values: Vec<u8> },
    SetHolding { address: u16, value: u16 },
}

impl ResponseKind {
    fn parse(function_code: u8, payload: &[u8]) -> Option<Self> {
        if function_code & 0x80 != 0 {
            let [code, ..] = payload else { return None };
            return Some(Self::ErrorCode(*code));
        }
        match function_code {
            READ_HOLDING_REGISTERS => {
                let [_, values @ ..] = payload else { return None };
                Some(Self::GetHoldings {
                    values: values.to_vec(),
                })
            }
            WRITE_SINGLE_REGISTER => {
                let [a, b, c, d] = payload else { return None };
                Some(Self::SetHolding {
                    address: u16::from_be_bytes([*a, *b]),
                    value: u16::from_be_bytes([*c, *d]),
                })
            }
            _ => None,
        }
    }
}

/// Modbus TCP framing: MBAP header followed by the PDU.
pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend(req.transaction_id.to_be_bytes());
        // Protocol identifier, then the length of unit id + PDU.
        dst.extend([0, 0, 0, 6, req.device_id]);
        dst.extend(req.operation.pdu());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, remainder)) = src.split_first_chunk::<6>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let required_length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            let Some((data, _)) = remainder.split_at_checked(required_length) else {
                return Ok(None);
            };
            let parsed = match data {
                [device_id, function_code, payload @ ..] => {
                    ResponseKind::parse(*function_code, payload).map(|kind| Response {
                        transaction_id,
                        device_id: *device_id,
                        kind,
                    })
                }
                _ => None,
            };
            src.advance(6 + required_length);
            match parsed {
                Some(response) => return Ok(Some(response)),
                None => trace!(message = "skipping unusable frame", transaction_id),
            }
        }
    }
}

/// Modbus RTU framing carried over a byte stream, as spoken by serial-to-TCP bridges.
///
/// RTU frames carry no transaction id, so responses are tagged with the id of the most recently
/// encoded request.
#[derive(Default)]
pub struct ModbusRTUCodec {
    pending_transaction: u16,
}

fn crc(bytes: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(bytes).to_le_bytes()
}

impl Encoder<Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.pending_transaction = req.transaction_id;
        let start = dst.len();
        dst.extend([req.device_id]);
        dst.extend(req.operation.pdu());
        let crc = crc(&dst[start..]);
        dst.extend(crc);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some(&[device_id, function_code]) = src.first_chunk::<2>() else {
                return Ok(None);
            };
            let frame_length = if function_code & 0x80 != 0 {
                5
            } else {
                match function_code {
                    READ_HOLDING_REGISTERS => match src.get(2) {
                        Some(count) => 5 + usize::from(*count),
                        None => return Ok(None),
                    },
                    WRITE_SINGLE_REGISTER => 8,
                    _ => {
                        src.advance(1);
                        continue;
                    }
                }
            };
            let Some(frame) = src.get(..frame_length) else {
                return Ok(None);
            };
            let (body, checksum) = frame.split_at(frame_length - 2);
            if crc(body) != checksum {
                trace!(message = "checksum mismatch, resynchronizing");
                src.advance(1);
                continue;
            }
            let kind = ResponseKind::parse(function_code, &body[2..]);
            src.advance(frame_length);
            let Some(kind) = kind else {
                continue;
            };
            return Ok(Some(Response {
                device_id,
                transaction_id: self.pending_transaction,
                kind,
            }));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Framer {
    /// Modbus TCP with MBAP headers.
    Tcp,
    /// Modbus RTU frames over a TCP socket.
    Rtu,
}

pub enum FrameCodec {
    Tcp(ModbusTCPCodec),
    Rtu(ModbusRTUCodec),
}

impl From<Framer> for FrameCodec {
    fn from(framer: Framer) -> Self {
        match framer {
            Framer::Tcp => Self::Tcp(ModbusTCPCodec {}),
            Framer::Rtu => Self::Rtu(ModbusRTUCodec::default()),
        }
    }
}

impl Encoder<Request> for FrameCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            FrameCodec::Tcp(c) => c.encode(req, dst),
            FrameCodec::Rtu(c) => c.encode(req, dst),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            FrameCodec::Tcp(c) => c.decode(src),
            FrameCodec::Rtu(c) => c.decode(src),
        }
    }
}

/// Split big-endian register bytes into words.
pub fn words(values: &[u8]) -> Vec<u16> {
    values
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect()
}
