//! USB device stack
//!
//! The [`Device`] consumes [`Event`]s from an [`EndpointHardware`]
//! implementation. It runs control transfers on endpoint 0, and forwards data
//! endpoint completions to the handlers that set them up.

pub mod control;
pub mod device;
pub mod endpoint;
mod event;
pub mod pma;
pub mod setup;
pub mod standard;

pub use control::{
    Completion, ControlPipe, ControlState, DataStage, RequestResult, CONTROL_BUFFER_LEN,
};
pub use device::{ConfigHandler, Device, RequestHandler, TableFull};
pub use endpoint::{EndpointCallback, EndpointEngine, EndpointHardware, Slot, Stat};
pub use event::Event;
pub use setup::{request_type, SetupPacket};
pub use standard::{Descriptors, LANGUAGE_ID_EN_US};
