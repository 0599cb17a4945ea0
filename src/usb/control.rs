//! Control transfers on endpoint 0
//!
//! [`ControlPipe`] runs the SETUP / DATA / STATUS protocol. It's independent
//! of the endpoint engine: endpoint 0 is reached through [`ControlEndpoint`],
//! and requests are answered by a [`Dispatch`] implementation.

use super::endpoint::{EndpointEngine, EndpointHardware, EP0_IN, EP0_OUT};
use super::setup::SetupPacket;
use usb_device::{control::Request, UsbDirection, UsbError};

/// Size of the shared control data buffer
///
/// OUT requests announcing more data than this are stalled. IN responses are
/// truncated to it.
pub const CONTROL_BUFFER_LEN: usize = 256;

/// Outcome of handling a control request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RequestResult {
    /// The request was handled
    Handled,
    /// The request is recognized, but invalid. Endpoint 0 stalls.
    NotSupported,
    /// Not for this handler; try the next one
    Next,
}

/// Runs once the status stage of a request is done
pub type Completion<C> = fn(&mut C, &SetupPacket);

/// Data stage of a request, as seen by a request handler
///
/// For OUT requests, [`data`](Self::data) holds the data received from the
/// host. For IN requests, the handler stores its response with
/// [`respond`](Self::respond).
pub struct DataStage<'a, C> {
    buffer: &'a mut [u8; CONTROL_BUFFER_LEN],
    len: usize,
    completion: Option<Completion<C>>,
}

impl<'a, C> DataStage<'a, C> {
    pub fn new(buffer: &'a mut [u8; CONTROL_BUFFER_LEN], len: usize) -> Self {
        DataStage {
            buffer,
            len: len.min(CONTROL_BUFFER_LEN),
            completion: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Copy a response into the control buffer
    ///
    /// Returns the number of bytes that fit.
    pub fn respond(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(CONTROL_BUFFER_LEN);
        self.buffer[..len].copy_from_slice(&data[..len]);
        self.len = len;
        len
    }

    /// Build a response in place
    ///
    /// `fill` writes into the whole buffer, and returns the response length.
    pub fn respond_with(&mut self, fill: impl FnOnce(&mut [u8]) -> usize) {
        let len = fill(&mut self.buffer[..]);
        self.len = len.min(CONTROL_BUFFER_LEN);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `completion` after the status stage
    pub fn on_complete(&mut self, completion: Completion<C>) {
        self.completion = Some(completion);
    }
}

/// Endpoint 0, as needed by the control pipe
pub trait ControlEndpoint {
    fn max_packet_size(&self) -> usize;
    /// Copy the packet that was just received
    fn read(&mut self, buffer: &mut [u8]) -> usize;
    /// Submit one IN packet
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError>;
    /// Stall both directions
    fn stall(&mut self);
    fn set_address(&mut self, address: u8);
}

impl<H: EndpointHardware, C> ControlEndpoint for EndpointEngine<H, C> {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size_0() as usize
    }
    fn read(&mut self, buffer: &mut [u8]) -> usize {
        self.read_packet(EP0_OUT.into(), buffer)
    }
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        self.transmit_packet(EP0_IN.into(), data)
    }
    fn stall(&mut self) {
        self.set_stalled(EP0_OUT.into(), true);
    }
    fn set_address(&mut self, address: u8) {
        EndpointEngine::set_address(self, address);
    }
}

/// Answers control requests
pub trait Dispatch<Io, C> {
    fn dispatch(
        &mut self,
        io: &mut Io,
        setup: &SetupPacket,
        stage: &mut DataStage<'_, C>,
    ) -> RequestResult;
}

/// Where the control transfer stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ControlState {
    Idle,
    /// Endpoint 0 is stalled until the next SETUP
    Stalled,
    /// More IN data follows the packet in flight
    DataIn,
    /// The packet in flight is the last IN data packet
    LastDataIn,
    /// Waiting for the zero-length status packet to go out
    StatusIn,
    DataOut,
    LastDataOut,
    /// Waiting for the host's zero-length status packet
    StatusOut,
}

/// The control transfer in progress
pub struct ControlPipe<C> {
    state: ControlState,
    setup: SetupPacket,
    buffer: [u8; CONTROL_BUFFER_LEN],
    /// Response length, or received length for OUT data
    len: usize,
    /// Next IN byte to send
    cursor: usize,
    /// Bytes the host still expects
    remaining: usize,
    completion: Option<Completion<C>>,
}

impl<C> Default for ControlPipe<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ControlPipe<C> {
    pub const fn new() -> Self {
        ControlPipe {
            state: ControlState::Idle,
            setup: SetupPacket {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                length: 0,
            },
            buffer: [0; CONTROL_BUFFER_LEN],
            len: 0,
            cursor: 0,
            remaining: 0,
            completion: None,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// The request of the current (or last) transfer
    pub fn request(&self) -> &SetupPacket {
        &self.setup
    }

    /// Abandon the transfer in progress
    pub fn reset(&mut self) {
        self.state = ControlState::Idle;
        self.completion = None;
        self.len = 0;
        self.cursor = 0;
        self.remaining = 0;
    }

    fn stall<Io: ControlEndpoint>(&mut self, io: &mut Io) {
        debug!("EP0 STALL {}", self.setup);
        io.stall();
        self.state = ControlState::Stalled;
    }

    fn write<Io: ControlEndpoint>(&mut self, io: &mut Io, start: usize, end: usize) -> bool {
        match io.write(&self.buffer[start..end]) {
            Ok(_) => true,
            Err(_error) => {
                warn!("EP0 write failed: {}", _error);
                self.stall(io);
                false
            }
        }
    }

    /// A SETUP packet arrived
    pub fn setup<Io, D>(&mut self, io: &mut Io, dispatch: &mut D)
    where
        Io: ControlEndpoint,
        D: Dispatch<Io, C>,
    {
        self.completion = None;
        let mut raw = [0; SetupPacket::LEN];
        let len = io.read(&mut raw);
        let Some(setup) = SetupPacket::parse(&raw[..len]) else {
            self.stall(io);
            return;
        };
        trace!("SETUP {}", setup);
        self.setup = setup;

        if setup.length == 0 || setup.direction() == UsbDirection::In {
            self.handle_request(io, dispatch);
        } else if setup.length as usize > CONTROL_BUFFER_LEN {
            self.stall(io);
        } else {
            self.len = 0;
            self.state = if setup.length as usize > io.max_packet_size() {
                ControlState::DataOut
            } else {
                ControlState::LastDataOut
            };
        }
    }

    /// Dispatch a request that has no OUT data
    fn handle_request<Io, D>(&mut self, io: &mut Io, dispatch: &mut D)
    where
        Io: ControlEndpoint,
        D: Dispatch<Io, C>,
    {
        let setup = self.setup;
        let mut stage = DataStage::new(&mut self.buffer, 0);
        let result = dispatch.dispatch(io, &setup, &mut stage);
        let (len, completion) = (stage.len, stage.completion);

        if result != RequestResult::Handled {
            self.stall(io);
            return;
        }
        self.completion = completion;
        if setup.length > 0 {
            self.len = len.min(setup.length as usize);
            self.cursor = 0;
            self.remaining = setup.length as usize;
            self.send_data_in(io);
        } else if self.write(io, 0, 0) {
            self.state = ControlState::StatusIn;
        }
    }

    fn send_data_in<Io: ControlEndpoint>(&mut self, io: &mut Io) {
        let mps = io.max_packet_size();
        let left = self.len - self.cursor;
        let start = self.cursor;
        if left > mps {
            if self.write(io, start, start + mps) {
                self.cursor += mps;
                self.remaining -= mps;
                self.state = ControlState::DataIn;
            }
        } else if self.write(io, start, self.len) {
            // A full last packet doesn't end the transfer if the host
            // expects more. A zero-length packet follows.
            self.state = if left == mps && left < self.remaining {
                ControlState::DataIn
            } else {
                ControlState::LastDataIn
            };
            self.cursor = self.len;
            self.remaining -= left;
        }
    }

    /// Accept one DATA OUT packet into the control buffer
    fn read_data_out<Io: ControlEndpoint>(&mut self, io: &mut Io) -> bool {
        let expected = io
            .max_packet_size()
            .min(self.setup.length as usize - self.len);
        let start = self.len;
        let len = io.read(&mut self.buffer[start..start + expected]);
        if len != expected {
            self.stall(io);
            return false;
        }
        self.len += len;
        true
    }

    /// An OUT packet arrived
    ///
    /// Returns the completion to run, if the transfer just ended.
    pub fn out<Io, D>(&mut self, io: &mut Io, dispatch: &mut D) -> Option<Completion<C>>
    where
        Io: ControlEndpoint,
        D: Dispatch<Io, C>,
    {
        match self.state {
            ControlState::DataOut => {
                if self.read_data_out(io)
                    && self.setup.length as usize - self.len <= io.max_packet_size()
                {
                    self.state = ControlState::LastDataOut;
                }
            }
            ControlState::LastDataOut => {
                if !self.read_data_out(io) {
                    return None;
                }
                let setup = self.setup;
                let mut stage = DataStage::new(&mut self.buffer, self.len);
                let result = dispatch.dispatch(io, &setup, &mut stage);
                let completion = stage.completion;
                if result == RequestResult::Handled {
                    self.completion = completion;
                    if self.write(io, 0, 0) {
                        self.state = ControlState::StatusIn;
                    }
                } else {
                    self.stall(io);
                }
            }
            ControlState::StatusOut => {
                io.read(&mut []);
                self.state = ControlState::Idle;
                return self.completion.take();
            }
            _ => self.stall(io),
        }
        None
    }

    /// An IN packet on endpoint 0 was collected by the host
    ///
    /// Returns the completion to run, if the transfer just ended.
    pub fn in_complete<Io: ControlEndpoint>(&mut self, io: &mut Io) -> Option<Completion<C>> {
        match self.state {
            ControlState::DataIn => self.send_data_in(io),
            ControlState::LastDataIn => self.state = ControlState::StatusOut,
            ControlState::StatusIn => {
                self.state = ControlState::Idle;
                if self.setup.request_type == 0 && self.setup.request == Request::SET_ADDRESS {
                    io.set_address(self.setup.value as u8);
                }
                return self.completion.take();
            }
            _ => self.stall(io),
        }
        None
    }
}
