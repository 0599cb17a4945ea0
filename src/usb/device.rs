//! USB device: event dispatch and request routing

use super::control::{ControlPipe, DataStage, Dispatch, RequestResult};
use super::endpoint::{EndpointEngine, EndpointHardware};
use super::setup::SetupPacket;
use super::standard::Descriptors;
use super::Event;

/// Capacity of the request filter table
pub const MAX_REQUEST_FILTERS: usize = 4;
/// Capacity of the set-configuration handler table
pub const MAX_CONFIG_HANDLERS: usize = 4;
/// Interfaces whose alternate setting is tracked
pub const MAX_INTERFACES: usize = 4;

/// A handler table has no free entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct TableFull;

/// Handles control requests that pass a filter
pub type RequestHandler<C> = fn(&mut C, &SetupPacket, &mut DataStage<'_, C>) -> RequestResult;

/// Called after SET_CONFIGURATION, and with configuration 0 after a bus reset
/// of a configured device
pub type ConfigHandler<H, C> = fn(&mut C, &mut EndpointEngine<H, C>, u8);

struct RequestFilter<C> {
    request_type: u8,
    mask: u8,
    handler: RequestHandler<C>,
}

/// A USB device
///
/// `H` is the peripheral, `C` the context handed to every handler, and `D`
/// supplies the descriptors.
pub struct Device<H, C, D> {
    engine: EndpointEngine<H, C>,
    control: ControlPipe<C>,
    descriptors: D,
    filters: [Option<RequestFilter<C>>; MAX_REQUEST_FILTERS],
    config_handlers: [Option<ConfigHandler<H, C>>; MAX_CONFIG_HANDLERS],
    configuration: u8,
    alt_settings: [u8; MAX_INTERFACES],
    suspended: bool,
}

impl<H: EndpointHardware, C, D: Descriptors> Device<H, C, D> {
    /// Create a device using `pma_size` bytes of packet memory
    ///
    /// Nothing happens on the bus until the host resets the device.
    pub fn new(hw: H, descriptors: D, pma_size: u16) -> Self {
        let max_packet_size_0 = descriptors.device().get(7).copied().unwrap_or(64);
        Device {
            engine: EndpointEngine::new(hw, pma_size, max_packet_size_0 as u16),
            control: ControlPipe::new(),
            descriptors,
            filters: Default::default(),
            config_handlers: Default::default(),
            configuration: 0,
            alt_settings: [0; MAX_INTERFACES],
            suspended: false,
        }
    }

    /// Route requests with `(bmRequestType & mask) == request_type` to `handler`
    ///
    /// Filters run in registration order, ahead of the standard requests.
    pub fn register_request_filter(
        &mut self,
        request_type: u8,
        mask: u8,
        handler: RequestHandler<C>,
    ) -> Result<(), TableFull> {
        let slot = self
            .filters
            .iter_mut()
            .find(|filter| filter.is_none())
            .ok_or(TableFull)?;
        *slot = Some(RequestFilter {
            request_type,
            mask,
            handler,
        });
        Ok(())
    }

    /// Call `handler` whenever the configuration changes
    ///
    /// Registering the same handler twice has no effect.
    pub fn register_config_handler(&mut self, handler: ConfigHandler<H, C>) -> Result<(), TableFull> {
        if self
            .config_handlers
            .iter()
            .flatten()
            .any(|&registered| registered as usize == handler as usize)
        {
            return Ok(());
        }
        let slot = self
            .config_handlers
            .iter_mut()
            .find(|entry| entry.is_none())
            .ok_or(TableFull)?;
        *slot = Some(handler);
        Ok(())
    }

    pub fn engine(&self) -> &EndpointEngine<H, C> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut EndpointEngine<H, C> {
        &mut self.engine
    }

    pub fn descriptors(&self) -> &D {
        &self.descriptors
    }

    /// The active configuration value, or 0
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn is_configured(&self) -> bool {
        self.configuration != 0
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Alternate setting of an interface
    pub fn alt_setting(&self, interface: u8) -> u8 {
        self.alt_settings
            .get(interface as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Handle all events that the peripheral has pending
    pub fn poll(&mut self, context: &mut C) {
        while let Some(event) = self.engine.hardware_mut().poll() {
            self.dispatch(context, event);
        }
    }

    /// Handle one event
    pub fn dispatch(&mut self, context: &mut C, event: Event) {
        match event {
            Event::Reset => {
                debug!("RESET");
                let was_configured = self.is_configured();
                self.engine.reset();
                self.control.reset();
                self.configuration = 0;
                self.alt_settings = [0; MAX_INTERFACES];
                self.suspended = false;
                if was_configured {
                    for handler in self.config_handlers.iter().flatten() {
                        handler(context, &mut self.engine, 0);
                    }
                }
            }
            Event::Setup => {
                self.engine.begin_setup();
                let mut requests = Requests {
                    ctx: &mut *context,
                    filters: &self.filters,
                    config_handlers: &self.config_handlers,
                    descriptors: &self.descriptors,
                    configuration: &mut self.configuration,
                    alt_settings: &mut self.alt_settings,
                };
                self.control.setup(&mut self.engine, &mut requests);
                self.engine.end_control();
            }
            Event::Out(address) if address.index() == 0 => {
                self.engine.begin_control();
                let mut requests = Requests {
                    ctx: &mut *context,
                    filters: &self.filters,
                    config_handlers: &self.config_handlers,
                    descriptors: &self.descriptors,
                    configuration: &mut self.configuration,
                    alt_settings: &mut self.alt_settings,
                };
                let completion = self.control.out(&mut self.engine, &mut requests);
                self.engine.end_control();
                if let Some(completion) = completion {
                    completion(context, self.control.request());
                }
            }
            Event::In(address) if address.index() == 0 => {
                self.engine.complete_control_in();
                if let Some(completion) = self.control.in_complete(&mut self.engine) {
                    completion(context, self.control.request());
                }
            }
            Event::Out(address) => self.engine.on_out(context, address),
            Event::In(address) => self.engine.on_in(context, address),
            Event::Suspend => {
                trace!("SUSPEND");
                self.suspended = true;
            }
            Event::Resume => {
                trace!("RESUME");
                self.suspended = false;
            }
            Event::Sof => {}
        }
    }
}

/// Device state a control request may touch
pub(crate) struct Requests<'a, H, C, D> {
    pub(crate) ctx: &'a mut C,
    filters: &'a [Option<RequestFilter<C>>; MAX_REQUEST_FILTERS],
    pub(crate) config_handlers: &'a [Option<ConfigHandler<H, C>>; MAX_CONFIG_HANDLERS],
    pub(crate) descriptors: &'a D,
    pub(crate) configuration: &'a mut u8,
    pub(crate) alt_settings: &'a mut [u8; MAX_INTERFACES],
}

impl<H: EndpointHardware, C, D: Descriptors> Dispatch<EndpointEngine<H, C>, C>
    for Requests<'_, H, C, D>
{
    fn dispatch(
        &mut self,
        engine: &mut EndpointEngine<H, C>,
        setup: &SetupPacket,
        stage: &mut DataStage<'_, C>,
    ) -> RequestResult {
        for filter in self.filters.iter().flatten() {
            if setup.request_type & filter.mask != filter.request_type {
                continue;
            }
            match (filter.handler)(self.ctx, setup, stage) {
                RequestResult::Next => {}
                result => return result,
            }
        }
        self.standard(engine, setup, stage)
    }
}
