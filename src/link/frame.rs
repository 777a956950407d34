//! Modbus RTU framing for "read holding registers"
//!
//! Request:  `addr | 0x03 | start (BE) | quantity (BE) | crc (LE)`
//! Response: `addr | 0x03 | byte count | data ... | crc (LE)`
//! Exception: `addr | 0x83 | code | crc (LE)`

use crate::PollError;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Protocol limit for a single read
pub const MAX_READ_QUANTITY: u16 = 125;

const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/MODBUS (reflected 0x8005, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn push_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

pub fn build_read_request(slave: u8, start: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    push_crc(&mut frame);
    frame
}

/// Length of a successful response carrying `quantity` registers
pub fn response_len(quantity: u16) -> usize {
    5 + 2 * quantity as usize
}

/// Validate a response frame and extract its registers
pub fn parse_read_response(frame: &[u8], slave: u8, quantity: u16) -> Result<Vec<u16>, PollError> {
    if frame.len() < 5 {
        return Err(PollError::MalformedFrame(format!(
            "short frame ({} bytes)",
            frame.len()
        )));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(PollError::ChecksumMismatch { computed, received });
    }

    if body[0] != slave {
        return Err(PollError::MalformedFrame(format!(
            "answer from address {} instead of {slave}",
            body[0]
        )));
    }

    if body[1] == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        return Err(PollError::Exception(body[2]));
    }
    if body[1] != READ_HOLDING_REGISTERS {
        return Err(PollError::MalformedFrame(format!(
            "unexpected function code {:#04x}",
            body[1]
        )));
    }

    let byte_count = body[2] as usize;
    if byte_count != 2 * quantity as usize || body.len() != 3 + byte_count {
        return Err(PollError::MalformedFrame(format!(
            "byte count {byte_count} does not match {quantity} registers ({} bytes received)",
            frame.len()
        )));
    }

    Ok(body[3..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Build the response a meter sends for a successful read
pub fn build_read_response(slave: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(response_len(registers.len() as u16));
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((registers.len() * 2) as u8);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    push_crc(&mut frame);
    frame
}

pub fn build_exception_response(slave: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, READ_HOLDING_REGISTERS | EXCEPTION_FLAG, code];
    push_crc(&mut frame);
    frame
}
