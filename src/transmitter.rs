//! Per-output-jack data-plane state: forwards blocks to the network backend
//! and remembers the peak level of the last block sent, for metering.

use crate::network::Network;
use crate::{AudioPacket, Error};
use zerocopy::AsBytes;

pub(crate) struct OutputTransmitter {
    last_level: f32,
}

impl OutputTransmitter {
    pub fn new() -> Self {
        OutputTransmitter { last_level: 0.0 }
    }

    pub fn send<T: Network<I, O>, const I: usize, const O: usize>(
        &mut self,
        interface: &mut T,
        jack_id: usize,
        block: &AudioPacket,
    ) -> Result<(), Error> {
        self.last_level = block.peak_normalized();
        interface.jack_send(jack_id, block.as_bytes())
    }

    pub fn get_level(&self) -> f32 {
        self.last_level
    }
}
