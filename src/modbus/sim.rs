//! Scripted slave devices behind a `BusTransport`, for exercising the master
//! and drivers without hardware.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::crc::crc16_modbus;
use super::master::{FC_READ_HOLDING, FC_READ_INPUT, FC_WRITE_SINGLE};
use super::transport::{BusTransport, CommProfile};
use crate::utils::error::BusError;

const EX_ILLEGAL_FUNCTION: u8 = 0x01;
const EX_ILLEGAL_ADDRESS: u8 = 0x02;

/// One simulated responder on the bus.
pub(crate) struct SimSlave {
    pub address: u8,
    pub input: HashMap<u16, u16>,
    pub holding: HashMap<u16, u16>,
    pub supports_input: bool,
    pub supports_holding: bool,
    /// A dead device: never answers at all.
    pub silent: bool,
    /// Flip a CRC byte on every response.
    pub corrupt_crc: bool,
}

impl SimSlave {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            input: HashMap::new(),
            holding: HashMap::new(),
            supports_input: true,
            supports_holding: true,
            silent: false,
            corrupt_crc: false,
        }
    }
}

/// A bus segment of simulated slaves. `send_frame` computes the response the
/// addressed slave would produce; `recv_frame` hands it back.
pub(crate) struct SimBus {
    slaves: Vec<SimSlave>,
    pending: Mutex<Option<Vec<u8>>>,
    pub applied_profiles: Mutex<Vec<CommProfile>>,
}

impl SimBus {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self {
            slaves,
            pending: Mutex::new(None),
            applied_profiles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_slave(slave: SimSlave) -> Self {
        Self::new(vec![slave])
    }

    fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 8 {
            return None;
        }
        let data_len = request.len() - 2;
        let crc = u16::from_le_bytes([request[data_len], request[data_len + 1]]);
        if crc != crc16_modbus(&request[..data_len]) {
            return None;
        }

        let addr = request[0];
        let fc = request[1];
        let slave = self.slaves.iter().find(|s| s.address == addr)?;
        if slave.silent {
            return None;
        }

        let arg1 = u16::from_be_bytes([request[2], request[3]]);
        let arg2 = u16::from_be_bytes([request[4], request[5]]);

        let mut response = match fc {
            FC_READ_INPUT | FC_READ_HOLDING => {
                let (bank, supported) = if fc == FC_READ_INPUT {
                    (&slave.input, slave.supports_input)
                } else {
                    (&slave.holding, slave.supports_holding)
                };
                if !supported {
                    exception(addr, fc, EX_ILLEGAL_FUNCTION)
                } else {
                    let mut words = Vec::with_capacity(arg2 as usize);
                    for i in 0..arg2 {
                        match bank.get(&(arg1 + i)) {
                            Some(&value) => words.push(value),
                            None => return Some(finish(
                                exception(addr, fc, EX_ILLEGAL_ADDRESS),
                                slave.corrupt_crc,
                            )),
                        }
                    }
                    let mut frame = vec![addr, fc, (2 * words.len()) as u8];
                    for word in words {
                        frame.extend_from_slice(&word.to_be_bytes());
                    }
                    frame
                }
            }
            FC_WRITE_SINGLE => {
                if slave.holding.contains_key(&arg1) {
                    // echo request header verbatim
                    request[..6].to_vec()
                } else {
                    exception(addr, fc, EX_ILLEGAL_ADDRESS)
                }
            }
            _ => exception(addr, fc, EX_ILLEGAL_FUNCTION),
        };

        response = finish(response, slave.corrupt_crc);
        Some(response)
    }
}

fn exception(addr: u8, fc: u8, code: u8) -> Vec<u8> {
    vec![addr, fc | 0x80, code]
}

fn finish(mut frame: Vec<u8>, corrupt: bool) -> Vec<u8> {
    let crc = crc16_modbus(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    if corrupt {
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
    }
    frame
}

impl BusTransport for SimBus {
    fn apply_profile(&self, profile: &CommProfile) -> Result<(), BusError> {
        self.applied_profiles.lock().unwrap().push(*profile);
        Ok(())
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), BusError> {
        *self.pending.lock().unwrap() = self.respond(frame);
        Ok(())
    }

    fn recv_frame(&self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, BusError> {
        self.pending.lock().unwrap().take().ok_or(BusError::Timeout)
    }
}
