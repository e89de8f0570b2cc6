//! Bus-facing command engine.
//!
//! The master writes a 3-byte frame, then keeps reading until it gets a
//! completion code; an energy read that succeeded is followed by one more read
//! for the 24-byte payload. Reads must be answered immediately, so the HTTP
//! work happens in [`BusPeripheral::service`], which the host loop drives,
//! while the bus callbacks on [`BusHandle`] only move bytes in and out of a
//! single result slot.
//!
//! ```text
//!   Idle ──write──▶ CommandPending ──service──▶ ResultReady ──read──▶ Idle
//!                        │ read: BUSY                │ read ('E', 0)
//!                        ▼                           ▼
//!                   CommandPending             PayloadReady ──read──▶ Idle
//! ```

pub mod tunnel;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use device_registry::DeviceRegistry;
use plug_client::{PlugError, PlugTarget, PlugTransport};
use types::{code, DeviceAddress, EnergySample, ENERGY_PAYLOAD_LEN};

pub const FRAME_LEN: usize = 3;
pub const PRIMARY_ADDRESS: u8 = 0x35;
pub const SECONDARY_ADDRESS: u8 = 0x55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    PowerOn,
    PowerOff,
    ReadRssi,
    ReadEnergy,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'H' => Some(Opcode::PowerOn),
            b'L' => Some(Opcode::PowerOff),
            b'R' => Some(Opcode::ReadRssi),
            b'E' => Some(Opcode::ReadEnergy),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Opcode::PowerOn => b'H',
            Opcode::PowerOff => b'L',
            Opcode::ReadRssi => b'R',
            Opcode::ReadEnergy => b'E',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Opcode::PowerOn => "power_on",
            Opcode::PowerOff => "power_off",
            Opcode::ReadRssi => "read_rssi",
            Opcode::ReadEnergy => "read_energy",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("command frame must be {FRAME_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub address: DeviceAddress,
}

impl Command {
    pub fn new(opcode: Opcode, group: u8, sub: u8) -> Self {
        Self {
            opcode,
            address: DeviceAddress::new(group, sub),
        }
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let [op, group, sub] = <[u8; FRAME_LEN]>::try_from(frame)
            .map_err(|_| FrameError::Length(frame.len()))?;
        let opcode = Opcode::from_byte(op).ok_or(FrameError::UnknownOpcode(op))?;
        Ok(Self::new(opcode, group, sub))
    }

    pub fn to_bytes(self) -> [u8; FRAME_LEN] {
        [
            self.opcode.as_byte(),
            self.address.group,
            self.address.sub,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    CommandPending,
    ResultReady,
    PayloadReady,
}

/// What the peripheral puts on the bus for one read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Code(i8),
    Energy([u8; ENERGY_PAYLOAD_LEN]),
}

impl Reply {
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Reply::Code(value) => vec![*value as u8],
            Reply::Energy(payload) => payload.to_vec(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: PeripheralState,
    command: Option<Command>,
    completion: i8,
    energy: EnergySample,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    wake: Notify,
}

/// The bus side of the peripheral. Cheap to clone; every method returns
/// without waiting on I/O.
#[derive(Debug, Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl BusHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: PeripheralState::Idle,
                    command: None,
                    completion: code::UNKNOWN_STATE,
                    energy: EnergySample::default(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PeripheralState {
        self.lock().state
    }

    /// Master wrote bytes to us. Returns whether a command was accepted.
    pub fn on_receive(&self, bytes: &[u8]) -> bool {
        let mut slot = self.lock();
        if slot.state != PeripheralState::Idle {
            debug!(state = ?slot.state, len = bytes.len(), "write ignored, command in flight");
            metrics::counter!("bridge_frames_dropped_total").increment(1);
            return false;
        }

        match Command::parse(bytes) {
            Ok(command) => {
                debug!(opcode = command.opcode.label(), address = %command.address, "command accepted");
                slot.command = Some(command);
                slot.state = PeripheralState::CommandPending;
                drop(slot);
                self.shared.wake.notify_one();
                true
            }
            Err(err) => {
                debug!(error = %err, "frame dropped");
                metrics::counter!("bridge_frames_dropped_total").increment(1);
                false
            }
        }
    }

    /// Master asked for bytes.
    pub fn on_request(&self) -> Reply {
        let mut slot = self.lock();
        match slot.state {
            PeripheralState::CommandPending => {
                debug!("read while command pending");
                Reply::Code(code::BUSY)
            }
            PeripheralState::ResultReady => {
                let energy_follows = slot.completion == code::SUCCESS
                    && matches!(
                        slot.command,
                        Some(Command {
                            opcode: Opcode::ReadEnergy,
                            ..
                        })
                    );
                slot.state = if energy_follows {
                    PeripheralState::PayloadReady
                } else {
                    PeripheralState::Idle
                };
                debug!(completion = slot.completion, "completion code sent");
                Reply::Code(slot.completion)
            }
            PeripheralState::PayloadReady => {
                slot.state = PeripheralState::Idle;
                Reply::Energy(slot.energy.to_bytes())
            }
            PeripheralState::Idle => {
                warn!("read requested with no command outstanding");
                Reply::Code(code::UNKNOWN_STATE)
            }
        }
    }

    /// Takes the buffered command so only one service step can run it. The
    /// state stays `CommandPending` until [`complete`](Self::complete).
    fn claim_command(&self) -> Option<Command> {
        let mut slot = self.lock();
        match slot.state {
            PeripheralState::CommandPending => slot.command.take(),
            _ => None,
        }
    }

    fn complete(&self, command: Command, completion: i8, energy: Option<EnergySample>) {
        let mut slot = self.lock();
        slot.command = Some(command);
        slot.completion = completion;
        if let Some(sample) = energy {
            slot.energy = sample;
        }
        slot.state = PeripheralState::ResultReady;
    }
}

/// Owns the plug table and the transport; the host loop calls
/// [`service`](Self::service) or [`run`](Self::run).
pub struct BusPeripheral<T> {
    handle: BusHandle,
    registry: DeviceRegistry,
    transport: T,
}

impl<T: PlugTransport> BusPeripheral<T> {
    pub fn new(registry: DeviceRegistry, transport: T) -> Self {
        Self {
            handle: BusHandle::new(),
            registry,
            transport,
        }
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Executes the buffered command, if any. Returns whether work was done.
    pub async fn service(&self) -> bool {
        let Some(command) = self.handle.claim_command() else {
            return false;
        };

        let (completion, energy) = self.dispatch(command).await;
        metrics::counter!("bridge_commands_total", "opcode" => command.opcode.label()).increment(1);
        self.handle.complete(command, completion, energy);
        true
    }

    async fn dispatch(&self, command: Command) -> (i8, Option<EnergySample>) {
        let target = match PlugTarget::resolve(&self.registry, command.address) {
            Ok(target) => target,
            Err(err) => {
                warn!(address = %command.address, error = %err, "command for unknown plug");
                record_failure(command.opcode);
                return (code::PLUG_REF_INVALID, None);
            }
        };

        match command.opcode {
            Opcode::PowerOn | Opcode::PowerOff => {
                let on = command.opcode == Opcode::PowerOn;
                match self.transport.set_power(&target, on).await {
                    Ok(()) => {
                        info!(address = %command.address, on, "plug switched");
                        (code::SUCCESS, None)
                    }
                    Err(err) => {
                        warn!(address = %command.address, on, error = %err, "switching plug failed");
                        record_failure(command.opcode);
                        (code::TASMOTA_REQUEST_FAILED, None)
                    }
                }
            }
            Opcode::ReadRssi => match self.transport.query_rssi(&target).await {
                Ok(rssi) => (rssi.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8, None),
                Err(err) => {
                    warn!(address = %command.address, error = %err, "rssi query failed");
                    record_failure(command.opcode);
                    (query_failure_code(&err), None)
                }
            },
            Opcode::ReadEnergy => match self.transport.query_energy(&target).await {
                Ok(sample) => (code::SUCCESS, Some(sample)),
                Err(err) => {
                    warn!(address = %command.address, error = %err, "energy query failed");
                    record_failure(command.opcode);
                    (query_failure_code(&err), None)
                }
            },
        }
    }

    /// Services commands as they arrive, with `interval` as a fallback tick,
    /// until `shutdown` flips to true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(plugs = self.registry.addresses().len(), "bus peripheral ready");
        loop {
            if *shutdown.borrow() {
                info!("bus peripheral shutdown requested");
                break;
            }

            self.service().await;

            tokio::select! {
                _ = self.handle.shared.wake.notified() => {},
                _ = sleep(interval) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("bus peripheral shutdown channel closed");
                        break;
                    }
                }
            }
        }
    }
}

fn record_failure(opcode: Opcode) {
    metrics::counter!("bridge_command_failures_total", "opcode" => opcode.label()).increment(1);
}

fn query_failure_code(err: &PlugError) -> i8 {
    if err.is_decode() {
        code::JSON_ERROR
    } else {
        code::HTTP_REQUEST_FAILED
    }
}
