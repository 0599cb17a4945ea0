//! Events reported by the USB peripheral

use usb_device::endpoint::EndpointAddress;

/// Something the USB peripheral observed
///
/// Produced by [`EndpointHardware::poll`](crate::usb::EndpointHardware::poll)
/// and consumed by [`Device::dispatch`](crate::usb::Device::dispatch).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Event {
    /// Bus reset
    Reset,
    /// SETUP packet received on endpoint 0
    Setup,
    /// OUT packet received
    Out(EndpointAddress),
    /// IN packet acknowledged by the host
    In(EndpointAddress),
    Suspend,
    Resume,
    /// Start of frame
    Sof,
}
