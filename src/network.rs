//! The backend abstraction a [`crate::Module`] is generic over: control-plane
//! directive datagrams plus per-jack data-plane datagrams. Implementations
//! live in [`crate::socket_native`], [`crate::socket_local`] and
//! [`crate::socket_smoltcp`], one compiled in per `network-*` feature.

use crate::Error;

/// A transport carrying both the patch-coordinator's control-plane
/// multicast and the `I` input / `O` output jack data-plane multicasts.
///
/// Implementations own socket/interface state and are non-blocking:
/// `recv`-shaped methods return [`Error::NoData`] (or similar) when nothing
/// is currently available rather than blocking the tick loop.
pub trait Network<const I: usize, const O: usize> {
    /// Drive any internal event loop (DHCP, ARP, interface polling). Native
    /// and local backends are plain sockets and can no-op this.
    fn poll(&mut self, _time: i64) -> Result<bool, Error> {
        Ok(true)
    }

    /// Whether the control-plane socket currently has room to send.
    fn can_send(&mut self) -> bool;

    fn recv_directive(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    fn send_directive(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Join the multicast group backing `output` jack `addr` on behalf of
    /// the local `input_jack_id`, so it can be read with [`Self::jack_recv`].
    fn jack_connect(&mut self, input_jack_id: usize, addr: [u8; 4], time: i64) -> Result<(), Error>;
    fn jack_recv(&mut self, input_jack_id: usize, buf: &mut [u8]) -> Result<usize, Error>;

    fn jack_send(&mut self, output_jack_id: usize, buf: &[u8]) -> Result<(), Error>;
    /// Multicast group/port this output jack publishes on.
    fn jack_addr(&mut self, output_jack_id: usize) -> Result<([u8; 4], u16), Error>;

    fn jack_disconnect(&mut self, input_jack_id: usize, time: i64) -> Result<(), Error>;
}
