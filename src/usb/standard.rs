//! Standard USB requests (chapter 9)

use super::control::{DataStage, RequestResult};
use super::device::{Requests, MAX_INTERFACES};
use super::endpoint::{EndpointEngine, EndpointHardware, MAX_ENDPOINTS};
use super::setup::SetupPacket;
use usb_device::{
    control::{Recipient, Request, RequestType},
    descriptor::descriptor_type,
    endpoint::EndpointAddress,
};

/// English (United States)
pub const LANGUAGE_ID_EN_US: u16 = 0x0409;

/// `bmAttributes` bit of a configuration descriptor
const SELF_POWERED: u8 = 0x40;

/// Static descriptors of the device
///
/// Descriptors are returned in their USB wire format.
pub trait Descriptors {
    /// The 18-byte device descriptor
    fn device(&self) -> &[u8];
    /// The configuration descriptor at `index`, followed by all its interface,
    /// class-specific and endpoint descriptors
    fn configuration(&self, index: u8) -> Option<&[u8]>;
    /// The string with index `index`, starting at 1
    fn string(&self, index: u8) -> Option<&str>;
    /// The one supported language
    fn language_id(&self) -> u16 {
        LANGUAGE_ID_EN_US
    }
    /// Any other descriptor, like the BOS descriptor
    fn other(&self, _kind: u8, _index: u8) -> Option<&[u8]> {
        None
    }
}

/// Iterates over the descriptors packed into a configuration descriptor
struct Walk<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.rest.first()? as usize;
        if len < 2 || len > self.rest.len() {
            return None;
        }
        let (descriptor, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(descriptor)
    }
}

fn walk(configuration: &[u8]) -> Walk<'_> {
    Walk {
        rest: configuration,
    }
}

/// Find the configuration with `bConfigurationValue == value`
pub(crate) fn find_configuration<D: Descriptors>(descriptors: &D, value: u8) -> Option<&[u8]> {
    let count = descriptors.device().get(17).copied().unwrap_or(1);
    (0..count)
        .filter_map(|index| descriptors.configuration(index))
        .find(|configuration| configuration.get(5) == Some(&value))
}

/// `bNumInterfaces`
pub(crate) fn interface_count(configuration: &[u8]) -> u8 {
    configuration.get(4).copied().unwrap_or(0)
}

pub(crate) fn is_self_powered(configuration: &[u8]) -> bool {
    configuration.get(7).map_or(false, |attributes| attributes & SELF_POWERED != 0)
}

/// Does the configuration describe alternate setting `alt` of `interface`?
pub(crate) fn has_alt_setting(configuration: &[u8], interface: u8, alt: u8) -> bool {
    walk(configuration).any(|d| {
        d.len() >= 4 && d[1] == descriptor_type::INTERFACE && d[2] == interface && d[3] == alt
    })
}

/// Encode a string descriptor into `buffer`, returning its length
///
/// The string is UTF-16LE encoded, and cut at the longest length `bLength`
/// can express.
pub(crate) fn string_descriptor(string: &str, buffer: &mut [u8]) -> usize {
    let limit = buffer.len().min(254);
    let mut len = 2;
    let mut units = [0; 2];
    for c in string.chars() {
        let encoded = c.encode_utf16(&mut units);
        if len + encoded.len() * 2 > limit {
            break;
        }
        for unit in encoded.iter() {
            buffer[len..len + 2].copy_from_slice(&unit.to_le_bytes());
            len += 2;
        }
    }
    buffer[0] = len as u8;
    buffer[1] = descriptor_type::STRING;
    len
}

impl<H: EndpointHardware, C, D: Descriptors> Requests<'_, H, C, D> {
    /// Handle a standard request
    pub(super) fn standard(
        &mut self,
        engine: &mut EndpointEngine<H, C>,
        setup: &SetupPacket,
        stage: &mut DataStage<'_, C>,
    ) -> RequestResult {
        if setup.kind() != RequestType::Standard {
            return RequestResult::NotSupported;
        }
        match setup.recipient() {
            Recipient::Device => self.device_request(engine, setup, stage),
            Recipient::Interface => self.interface_request(setup, stage),
            Recipient::Endpoint => endpoint_request(engine, setup, stage),
            _ => RequestResult::NotSupported,
        }
    }

    fn device_request(
        &mut self,
        engine: &mut EndpointEngine<H, C>,
        setup: &SetupPacket,
        stage: &mut DataStage<'_, C>,
    ) -> RequestResult {
        match setup.request {
            Request::GET_STATUS => {
                let configuration = match *self.configuration {
                    0 => self.descriptors.configuration(0),
                    value => find_configuration(self.descriptors, value),
                };
                let self_powered = configuration.map_or(false, is_self_powered);
                stage.respond(&[self_powered as u8, 0]);
                RequestResult::Handled
            }
            // The address is latched after the status stage
            Request::SET_ADDRESS if setup.request_type == 0 && setup.value < 128 => {
                RequestResult::Handled
            }
            Request::GET_CONFIGURATION => {
                stage.respond(&[*self.configuration]);
                RequestResult::Handled
            }
            Request::SET_CONFIGURATION => self.set_configuration(engine, setup.value as u8),
            Request::GET_DESCRIPTOR => self.get_descriptor(setup, stage),
            _ => RequestResult::NotSupported,
        }
    }

    fn set_configuration(&mut self, engine: &mut EndpointEngine<H, C>, value: u8) -> RequestResult {
        if value != 0 && find_configuration(self.descriptors, value).is_none() {
            return RequestResult::NotSupported;
        }
        debug!("SET_CONFIGURATION {}", value);
        *self.configuration = value;
        *self.alt_settings = [0; MAX_INTERFACES];
        engine.reset_endpoints();
        for handler in self.config_handlers.iter().flatten() {
            handler(self.ctx, engine, value);
        }
        RequestResult::Handled
    }

    fn get_descriptor(&mut self, setup: &SetupPacket, stage: &mut DataStage<'_, C>) -> RequestResult {
        let kind = (setup.value >> 8) as u8;
        let index = setup.value as u8;
        let descriptor = match kind {
            descriptor_type::DEVICE => Some(self.descriptors.device()),
            descriptor_type::CONFIGURATION => self.descriptors.configuration(index),
            descriptor_type::STRING if index == 0 => {
                let [lo, hi] = self.descriptors.language_id().to_le_bytes();
                stage.respond(&[4, descriptor_type::STRING, lo, hi]);
                return RequestResult::Handled;
            }
            descriptor_type::STRING => {
                if setup.index != self.descriptors.language_id() {
                    return RequestResult::NotSupported;
                }
                let Some(string) = self.descriptors.string(index) else {
                    return RequestResult::NotSupported;
                };
                stage.respond_with(|buffer| string_descriptor(string, buffer));
                return RequestResult::Handled;
            }
            _ => self.descriptors.other(kind, index),
        };
        match descriptor {
            Some(descriptor) => {
                stage.respond(descriptor);
                RequestResult::Handled
            }
            None => RequestResult::NotSupported,
        }
    }

    fn interface_request(&mut self, setup: &SetupPacket, stage: &mut DataStage<'_, C>) -> RequestResult {
        let Some(configuration) = find_configuration(self.descriptors, *self.configuration) else {
            return RequestResult::NotSupported;
        };
        let interface = setup.index as u8;
        if setup.index >= interface_count(configuration) as u16 {
            return RequestResult::NotSupported;
        }
        match setup.request {
            Request::GET_STATUS => {
                stage.respond(&[0, 0]);
                RequestResult::Handled
            }
            Request::GET_INTERFACE => {
                let alt = self
                    .alt_settings
                    .get(interface as usize)
                    .copied()
                    .unwrap_or(0);
                stage.respond(&[alt]);
                RequestResult::Handled
            }
            Request::SET_INTERFACE => {
                let alt = setup.value as u8;
                if setup.value > 0xFF || !has_alt_setting(configuration, interface, alt) {
                    return RequestResult::NotSupported;
                }
                match self.alt_settings.get_mut(interface as usize) {
                    Some(setting) => *setting = alt,
                    None if alt > 0 => return RequestResult::NotSupported,
                    None => {}
                }
                RequestResult::Handled
            }
            _ => RequestResult::NotSupported,
        }
    }
}

fn endpoint_request<H: EndpointHardware, C>(
    engine: &mut EndpointEngine<H, C>,
    setup: &SetupPacket,
    stage: &mut DataStage<'_, C>,
) -> RequestResult {
    let address = EndpointAddress::from(setup.index as u8);
    if address.index() >= MAX_ENDPOINTS || !engine.is_enabled(address) {
        return RequestResult::NotSupported;
    }
    match (setup.request, setup.value) {
        (Request::GET_STATUS, _) => {
            stage.respond(&[engine.is_stalled(address) as u8, 0]);
            RequestResult::Handled
        }
        (Request::CLEAR_FEATURE, Request::FEATURE_ENDPOINT_HALT) => {
            engine.set_stalled(address, false);
            RequestResult::Handled
        }
        (Request::SET_FEATURE, Request::FEATURE_ENDPOINT_HALT) => {
            engine.set_stalled(address, true);
            RequestResult::Handled
        }
        _ => RequestResult::NotSupported,
    }
}

#[cfg(test)]
mod test {
    use super::{find_configuration, has_alt_setting, interface_count, is_self_powered, string_descriptor};
    use crate::sim::SimDescriptors;

    #[test]
    fn ascii_string() {
        let mut buffer = [0; 256];
        let len = string_descriptor("Ab", &mut buffer);
        assert_eq!(&buffer[..len], &[6, 3, b'A', 0, b'b', 0]);
    }

    #[test]
    fn supplementary_plane_string() {
        let mut buffer = [0; 256];
        let len = string_descriptor("é😀", &mut buffer);
        assert_eq!(&buffer[..len], &[8, 3, 0xE9, 0, 0x3D, 0xD8, 0x00, 0xDE]);
    }

    #[test]
    fn long_string_is_cut() {
        let mut buffer = [0; 256];
        let string: std::string::String = core::iter::repeat('x').take(200).collect();
        let len = string_descriptor(&string, &mut buffer);
        assert_eq!(len, 254);
        assert_eq!(buffer[0], 254);
    }

    #[test]
    fn walk_configuration() {
        let descriptors = SimDescriptors;
        let configuration = find_configuration(&descriptors, 1).unwrap();
        assert_eq!(interface_count(configuration), 2);
        assert!(!is_self_powered(configuration));
        assert!(has_alt_setting(configuration, 0, 0));
        assert!(has_alt_setting(configuration, 1, 0));
        assert!(!has_alt_setting(configuration, 1, 1));
        assert!(!has_alt_setting(configuration, 2, 0));
        assert!(find_configuration(&descriptors, 2).is_none());
    }
}
