//! Local socket interface.
//!
//! Simulates multicast delivery in-process with `std::sync::mpsc` channels
//! keyed by group address, for tests and wasm — grounded on
//! `core/src/socket_local.rs`'s `lazy_static` `SENDERS` map/`thread_rng`
//! group-address pattern, adapted to this crate's per-jack `Network`
//! surface.
//!
//! The teacher hardcodes the control-plane group to a single fixed address,
//! which is fine for its single in-process demo but would let unrelated
//! test functions bleed directives into each other once multiple scenario
//! tests share one `cargo test` binary. [`LocalInterface::new`] takes a
//! `network` byte that every address (control-plane and jack) it allocates
//! is namespaced under, so two `LocalInterface` groups created with
//! different `network` values never see each other's traffic while modules
//! sharing the same value still do — the same pub/sub mechanism, just
//! partitioned per simulated network.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Mutex;
use std::vec::Vec;

use rand::{thread_rng, Rng};

use crate::network::Network;
use crate::{Error, JACK_PORT};

lazy_static! {
    static ref SENDERS: Mutex<HashMap<[u8; 4], Vec<SyncSender<Vec<u8>>>>> = Mutex::new(HashMap::new());
}

fn patch_group(network: u8) -> [u8; 4] {
    [239, network, 0, 0]
}

fn publish(group: [u8; 4], buf: &[u8]) {
    let mut senders = SENDERS.lock().unwrap();
    if let Some(subs) = senders.get_mut(&group) {
        let payload = buf.to_vec();
        subs.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

fn subscribe(group: [u8; 4], capacity: usize) -> Receiver<Vec<u8>> {
    let (tx, rx) = sync_channel(capacity);
    SENDERS.lock().unwrap().entry(group).or_insert_with(Vec::new).push(tx);
    rx
}

fn drain_into(rx: &Receiver<Vec<u8>>, buf: &mut [u8]) -> Result<usize, Error> {
    match rx.try_recv() {
        Ok(payload) => {
            if payload.len() > buf.len() {
                return Err(Error::Network);
            }
            buf[..payload.len()].copy_from_slice(&payload);
            Ok(payload.len())
        }
        Err(TryRecvError::Empty) => Err(Error::NoData),
        Err(TryRecvError::Disconnected) => Err(Error::Network),
    }
}

pub struct LocalInterface<const I: usize, const O: usize> {
    patch_group: [u8; 4],
    rx_directive: Receiver<Vec<u8>>,
    rx_jacks: [Option<Receiver<Vec<u8>>>; I],
    output_addrs: [[u8; 4]; O],
}

impl<const I: usize, const O: usize> LocalInterface<I, O> {
    /// `network` partitions the simulated multicast fabric: modules built
    /// with the same value share a control-plane group and can see each
    /// other's output jacks' groups; different values are fully isolated.
    pub fn new(network: u8) -> Self {
        let mut rng = thread_rng();
        let patch_group = patch_group(network);
        LocalInterface {
            patch_group,
            rx_directive: subscribe(patch_group, 64),
            rx_jacks: [(); I].map(|_| None),
            output_addrs: [(); O]
                .map(|_| [239, network, rng.gen_range(0..255), rng.gen_range(1..255)]),
        }
    }
}

impl<const I: usize, const O: usize> Network<I, O> for LocalInterface<I, O> {
    fn can_send(&mut self) -> bool {
        true
    }

    fn recv_directive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        drain_into(&self.rx_directive, buf)
    }

    fn send_directive(&mut self, buf: &[u8]) -> Result<(), Error> {
        publish(self.patch_group, buf);
        Ok(())
    }

    fn jack_connect(&mut self, input_jack_id: usize, addr: [u8; 4], time: i64) -> Result<(), Error> {
        if input_jack_id >= I {
            return Err(Error::InvalidJackId);
        }
        self.jack_disconnect(input_jack_id, time)?;
        self.rx_jacks[input_jack_id] = Some(subscribe(addr, crate::BUFFER_SIZE));
        Ok(())
    }

    fn jack_recv(&mut self, input_jack_id: usize, buf: &mut [u8]) -> Result<usize, Error> {
        match self.rx_jacks.get(input_jack_id) {
            Some(Some(rx)) => drain_into(rx, buf),
            Some(None) => Err(Error::NoData),
            None => Err(Error::InvalidJackId),
        }
    }

    fn jack_send(&mut self, output_jack_id: usize, buf: &[u8]) -> Result<(), Error> {
        let addr = *self.output_addrs.get(output_jack_id).ok_or(Error::InvalidJackId)?;
        publish(addr, buf);
        Ok(())
    }

    fn jack_addr(&mut self, output_jack_id: usize) -> Result<([u8; 4], u16), Error> {
        let addr = *self.output_addrs.get(output_jack_id).ok_or(Error::InvalidJackId)?;
        Ok((addr, JACK_PORT))
    }

    fn jack_disconnect(&mut self, input_jack_id: usize, _time: i64) -> Result<(), Error> {
        if input_jack_id >= I {
            return Err(Error::InvalidJackId);
        }
        self.rx_jacks[input_jack_id] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_stay_within_a_network() {
        let mut a: LocalInterface<0, 0> = LocalInterface::new(200);
        let mut b: LocalInterface<0, 0> = LocalInterface::new(200);
        let mut other: LocalInterface<0, 0> = LocalInterface::new(201);

        a.send_directive(b"hello").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.recv_directive(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(matches!(other.recv_directive(&mut buf), Err(Error::NoData)));
    }

    #[test]
    fn jack_round_trip_delivers_a_sent_block() {
        let mut src: LocalInterface<0, 1> = LocalInterface::new(1);
        let mut dst: LocalInterface<1, 0> = LocalInterface::new(1);

        let (addr, _port) = src.jack_addr(0).unwrap();
        dst.jack_connect(0, addr, 0).unwrap();
        src.jack_send(0, b"block").unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(dst.jack_recv(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"block");
    }
}
