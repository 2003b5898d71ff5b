//! A bus-participant runtime for the eBUS field-bus, a half-duplex,
//! multi-master serial protocol used in heating/HVAC equipment at 2400 baud.
//!
//! # Uses
//!
//! - Embedders that sit on an eBUS network (a gateway, a data logger, a
//!   thermostat simulator) can attach to a serial device or a TCP proxy,
//!   observe every telegram on the wire, and send their own telegrams without
//!   reimplementing arbitration, escaping, or CRC handling.
//! - The codec half ([`Sequence`] and [`Telegram`]) can be used standalone to
//!   parse or build telegrams captured elsewhere, without running the FSM.
//!
//! # Organization
//!
//! - [`Sequence`] and [`Telegram`] implement the wire codec: escaping,
//!   CRC-8, and telegram framing/validation.
//! - [`device::Device`] is the narrow byte-level transport the FSM drives;
//!   [`device::SerialDevice`] and [`device::TcpDevice`] are the two concrete
//!   transports.
//! - [`Fsm`] is the bus state machine that owns a `Device` and drives
//!   arbitration, sending, receiving, and re-synchronisation.
//! - [`Engine`] hosts the FSM on its own thread and exposes the
//!   application-facing `send`/`open`/`close` contract.
//!
//! The CLI front-end, the TCP/UDP control server, the forwarding fan-out to
//! remote subscribers, and the sink-based logger front-end are deliberately
//! not part of this crate; it is a library meant to be embedded by them.

pub mod address;
pub mod sequence;
pub use sequence::{Sequence, SequenceError};

pub mod telegram;
pub use telegram::{Telegram, TelegramError, TelegramType};

pub mod device;
pub use device::{Device, DeviceError};

pub mod raw_dump;
pub use raw_dump::RawDump;

pub mod options;
pub use options::EngineOptions;

pub mod fsm;
pub use fsm::Fsm;
pub use fsm::error::FsmError;

pub mod engine;
pub use engine::{Engine, IdentifyDecision, PublishEvent, SendHandle, SendOutcome};

/// Synchronisation/idle marker on the wire: the inter-telegram gap.
pub const SYN: u8 = 0xAA;
/// Escape prefix used to encode `SYN`/`EXT` inside a telegram body.
pub const EXT: u8 = 0xA9;
/// Positive acknowledgement byte.
pub const ACK: u8 = 0x00;
/// Negative acknowledgement byte.
pub const NAK: u8 = 0xFF;
/// Broadcast destination address.
pub const BROADCAST: u8 = 0xFE;
