use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use super::crc::crc16_modbus;
use super::guard::BusGuard;
use super::transport::BusTransport;
use crate::utils::error::BusError;

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_READ_INPUT: u8 = 0x04;
pub const FC_WRITE_SINGLE: u8 = 0x06;

/// Canonical probe registers used by `ping`. Vendor firmware inconsistently
/// implements Input vs Holding access, so the probe tries both banks.
pub const PING_INPUT_REG: u16 = 0x0001;
pub const PING_HOLDING_REG: u16 = 0x0000;

/// The two addressable register banks of the Modbus data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRegion {
    Input,
    Holding,
}

impl RegisterRegion {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterRegion::Input => FC_READ_INPUT,
            RegisterRegion::Holding => FC_READ_HOLDING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingOutcome {
    pub alive: bool,
    /// 0x04 or 0x03 when `alive`; `None` when the slave never answered.
    pub function_code: Option<u8>,
}

/// Modbus RTU master over a shared half-duplex bus.
///
/// Every transaction claims the bus guard for its full request/response
/// window and releases it before decoding. The master never retries;
/// retry/backoff policy belongs to the caller, since blanket retries here
/// would amplify bus contention.
pub struct ModbusMaster {
    transport: Arc<dyn BusTransport>,
    guard: Arc<BusGuard>,
}

impl ModbusMaster {
    pub fn new(transport: Arc<dyn BusTransport>, guard: Arc<BusGuard>) -> Self {
        Self { transport, guard }
    }

    pub fn guard(&self) -> &Arc<BusGuard> {
        &self.guard
    }

    pub async fn read_input_registers(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, BusError> {
        self.read_registers(slave, RegisterRegion::Input, start, count, timeout)
            .await
    }

    pub async fn read_holding_registers(
        &self,
        slave: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, BusError> {
        self.read_registers(slave, RegisterRegion::Holding, start, count, timeout)
            .await
    }

    pub async fn read_registers(
        &self,
        slave: u8,
        region: RegisterRegion,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, BusError> {
        if count == 0 || count > 0x7D {
            return Err(BusError::InvalidResponse(format!(
                "register count {} out of range",
                count
            )));
        }
        let fc = region.function_code();
        let mut request = vec![slave, fc];
        request.extend_from_slice(&start.to_be_bytes());
        request.extend_from_slice(&count.to_be_bytes());
        append_crc(&mut request);

        let expected_len = 5 + 2 * count as usize;
        let response = self.transact(&request, expected_len, timeout)?;
        let payload = check_response(&response, slave, fc)?;

        if payload.len() != 2 * count as usize {
            return Err(BusError::InvalidResponse(format!(
                "expected {} data bytes, got {}",
                2 * count,
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub async fn write_single_register(
        &self,
        slave: u8,
        reg: u16,
        value: u16,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let mut request = vec![slave, FC_WRITE_SINGLE];
        request.extend_from_slice(&reg.to_be_bytes());
        request.extend_from_slice(&value.to_be_bytes());
        append_crc(&mut request);

        // the slave echoes the request verbatim
        let response = self.transact(&request, 8, timeout)?;
        check_response(&response, slave, FC_WRITE_SINGLE)?;
        if response.len() != 8 || response[..6] != request[..6] {
            return Err(BusError::InvalidResponse("write echo mismatch".into()));
        }
        Ok(())
    }

    /// Layered liveness probe: Input-register read at the canonical probe
    /// address first (0x04), then a Holding-register read (0x03) before
    /// declaring the slave unreachable.
    pub async fn ping(&self, slave: u8, timeout: Duration) -> PingOutcome {
        match self
            .read_input_registers(slave, PING_INPUT_REG, 1, timeout)
            .await
        {
            Ok(_) => {
                info!("ping addr={} -> alive fc=0x04", slave);
                return PingOutcome {
                    alive: true,
                    function_code: Some(FC_READ_INPUT),
                };
            }
            Err(e) => debug!("ping addr={} fc=0x04 failed: {}", slave, e),
        }

        match self
            .read_holding_registers(slave, PING_HOLDING_REG, 1, timeout)
            .await
        {
            Ok(_) => {
                info!("ping addr={} -> alive fc=0x03", slave);
                PingOutcome {
                    alive: true,
                    function_code: Some(FC_READ_HOLDING),
                }
            }
            Err(e) => {
                debug!("ping addr={} fc=0x03 failed: {}", slave, e);
                PingOutcome {
                    alive: false,
                    function_code: None,
                }
            }
        }
    }

    /// Claim the bus, run one request/response exchange, release the bus.
    /// Decoding happens after release so the bus frees as early as possible.
    fn transact(
        &self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        if !self.guard.try_acquire(timeout) {
            warn!("bus busy, transaction to addr={} dropped", request[0]);
            return Err(BusError::BusBusy);
        }

        debug!("tx {}", hex::encode(request));
        let result = self
            .transport
            .send_frame(request)
            .and_then(|_| self.transport.recv_frame(expected_len, timeout));
        self.guard.release();

        match &result {
            Ok(frame) => debug!("rx {}", hex::encode(frame)),
            Err(e) => debug!("rx failed: {}", e),
        }
        result
    }
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Validate slave echo, function echo, exception frames and CRC; return the
/// data payload (everything between the byte-count/function header and the
/// CRC trailer).
fn check_response<'a>(response: &'a [u8], slave: u8, fc: u8) -> Result<&'a [u8], BusError> {
    if response.len() < 5 {
        return Err(BusError::InvalidResponse(format!(
            "short frame ({} bytes)",
            response.len()
        )));
    }

    let data_len = response.len() - 2;
    let received_crc = u16::from_le_bytes([response[data_len], response[data_len + 1]]);
    let calculated_crc = crc16_modbus(&response[..data_len]);
    if received_crc != calculated_crc {
        return Err(BusError::InvalidResponse("CRC mismatch".into()));
    }

    if response[0] != slave {
        return Err(BusError::InvalidResponse(format!(
            "slave echo mismatch (sent {}, got {})",
            slave, response[0]
        )));
    }

    if response[1] == (fc | 0x80) {
        return Err(BusError::Exception(response[2]));
    }
    if response[1] != fc {
        return Err(BusError::InvalidResponse(format!(
            "function echo mismatch (sent 0x{:02X}, got 0x{:02X})",
            fc, response[1]
        )));
    }

    match fc {
        FC_READ_HOLDING | FC_READ_INPUT => {
            let byte_count = response[2] as usize;
            if response.len() != 5 + byte_count {
                return Err(BusError::InvalidResponse(format!(
                    "length mismatch (byte count {}, frame {})",
                    byte_count,
                    response.len()
                )));
            }
            Ok(&response[3..data_len])
        }
        _ => Ok(&response[2..data_len]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::sim::{SimBus, SimSlave};

    fn master_for(bus: SimBus) -> ModbusMaster {
        ModbusMaster::new(Arc::new(bus), Arc::new(BusGuard::new()))
    }

    fn timeout() -> Duration {
        Duration::from_millis(100)
    }

    #[tokio::test]
    async fn reads_exactly_count_words() {
        let mut slave = SimSlave::new(7);
        slave.input.insert(0x0010, 1234);
        slave.input.insert(0x0011, 0);
        slave.input.insert(0x0012, 65535);
        let master = master_for(SimBus::with_slave(slave));

        let words = master
            .read_input_registers(7, 0x0010, 3, timeout())
            .await
            .unwrap();
        assert_eq!(words, vec![1234, 0, 65535]);
    }

    #[tokio::test]
    async fn holding_read_uses_fc03() {
        let mut slave = SimSlave::new(9);
        slave.holding.insert(0x0000, 42);
        let master = master_for(SimBus::with_slave(slave));

        let words = master
            .read_holding_registers(9, 0x0000, 1, timeout())
            .await
            .unwrap();
        assert_eq!(words, vec![42]);
    }

    #[tokio::test]
    async fn missing_register_maps_to_exception() {
        let slave = SimSlave::new(3);
        let master = master_for(SimBus::with_slave(slave));

        let err = master
            .read_input_registers(3, 0x0100, 1, timeout())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Exception(0x02)));
    }

    #[tokio::test]
    async fn corrupted_crc_is_invalid_response() {
        let mut slave = SimSlave::new(5);
        slave.holding.insert(0x0000, 1);
        slave.corrupt_crc = true;
        let master = master_for(SimBus::with_slave(slave));

        let err = master
            .read_holding_registers(5, 0x0000, 1, timeout())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn silent_slave_times_out() {
        let master = master_for(SimBus::with_slave(SimSlave::new(2)));

        let err = master
            .read_input_registers(4, 0x0001, 1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));
    }

    #[tokio::test]
    async fn busy_guard_fails_fast() {
        let mut slave = SimSlave::new(1);
        slave.input.insert(0x0001, 7);
        let guard = Arc::new(BusGuard::new());
        let master = ModbusMaster::new(Arc::new(SimBus::with_slave(slave)), Arc::clone(&guard));

        assert!(guard.try_acquire(Duration::from_millis(10)));
        let err = master
            .read_input_registers(1, 0x0001, 1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::BusBusy));
        guard.release();

        assert!(master
            .read_input_registers(1, 0x0001, 1, timeout())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn write_single_register_echoes() {
        let mut slave = SimSlave::new(5);
        slave.holding.insert(0x0101, 5);
        let master = master_for(SimBus::with_slave(slave));

        master
            .write_single_register(5, 0x0101, 9, timeout())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ping_prefers_input_bank() {
        let mut slave = SimSlave::new(11);
        slave.input.insert(PING_INPUT_REG, 250);
        slave.holding.insert(PING_HOLDING_REG, 250);
        let master = master_for(SimBus::with_slave(slave));

        let outcome = master.ping(11, timeout()).await;
        assert!(outcome.alive);
        assert_eq!(outcome.function_code, Some(FC_READ_INPUT));
    }

    #[tokio::test]
    async fn ping_falls_back_to_holding_bank() {
        let mut slave = SimSlave::new(11);
        slave.supports_input = false;
        slave.holding.insert(PING_HOLDING_REG, 250);
        let master = master_for(SimBus::with_slave(slave));

        let outcome = master.ping(11, timeout()).await;
        assert!(outcome.alive);
        assert_eq!(outcome.function_code, Some(FC_READ_HOLDING));
    }

    #[tokio::test]
    async fn ping_reports_dead_slave() {
        let master = master_for(SimBus::with_slave(SimSlave::new(2)));

        let outcome = master.ping(60, Duration::from_millis(20)).await;
        assert!(!outcome.alive);
        assert_eq!(outcome.function_code, None);
    }
}
