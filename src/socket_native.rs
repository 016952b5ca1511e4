//! Native socket interface.
//!
//! Implements [`Network`] on top of the host OS's UDP stack: one socket for
//! the control-plane multicast, one per input jack (joins its source's
//! multicast group on [`connect`](Network::jack_connect)), one per output
//! jack (its own multicast group, chosen at construction). Grounded on
//! `core/src/socket_native.rs`'s use of `socket2`/`local-ip-address`/`ipnet`/
//! `rand`, adapted to this crate's per-jack `Network` surface.

use core::mem::MaybeUninit;
use core::str::FromStr;
use ipnet::Ipv4Net;
use local_ip_address::list_afinet_netifas;
use rand::{thread_rng, Rng};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::IpAddr::V4;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::vec::Vec;

use crate::network::Network;
use crate::{Error, JACK_PORT, PATCH_EP, PREFERRED_SUBNET};

impl From<local_ip_address::Error> for Error {
    fn from(_: local_ip_address::Error) -> Self {
        Error::Network
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(_: ipnet::AddrParseError) -> Self {
        Error::Parse
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(_: std::net::AddrParseError) -> Self {
        Error::Parse
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Network
    }
}

pub struct NativeInterface<const I: usize, const O: usize> {
    patch_socket: Socket,
    patch_ep: SocketAddrV4,
    input_sockets: Vec<Socket>,
    input_groups: Vec<Option<Ipv4Addr>>,
    output_sockets: Vec<Socket>,
    output_eps: Vec<SocketAddrV4>,
    local_addr: Ipv4Addr,
}

impl<const I: usize, const O: usize> NativeInterface<I, O> {
    pub fn new() -> Result<Self, Error> {
        let ips = list_afinet_netifas()?;
        let preferred_subnet: Ipv4Net = PREFERRED_SUBNET.parse()?;
        let mut local_addr = Ipv4Addr::UNSPECIFIED;
        for (name, ip) in ips {
            if let V4(addr) = ip {
                debug!("found interface {}: {}", name, addr);
                if preferred_subnet.contains(&addr) {
                    local_addr = addr;
                }
            }
        }
        info!("using local address {}", local_addr);

        let patch_ep = SocketAddrV4::from_str(PATCH_EP)?;
        let patch_socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        patch_socket.set_reuse_address(true)?;
        patch_socket.set_nonblocking(true)?;
        patch_socket.bind(&SocketAddr::from((local_addr, patch_ep.port())).into())?;
        patch_socket.join_multicast_v4(patch_ep.ip(), &local_addr)?;

        let mut input_sockets = Vec::with_capacity(I);
        for _ in 0..I {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&SocketAddr::from((local_addr, JACK_PORT)).into())?;
            input_sockets.push(socket);
        }

        // Administratively-scoped (239.0.0.0/8) group, random within it, one
        // per output jack; the port is the fixed JACK_PORT shared by every
        // data-plane socket (only the group distinguishes jacks).
        let mut rng = thread_rng();
        let mut output_sockets = Vec::with_capacity(O);
        let mut output_eps = Vec::with_capacity(O);
        for _ in 0..O {
            let addr = Ipv4Addr::new(239, rng.gen_range(0..255), rng.gen_range(0..255), rng.gen_range(1..255));
            let ep = SocketAddrV4::new(addr, JACK_PORT);
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_nonblocking(true)?;
            socket.set_multicast_ttl_v4(8)?;
            info!("output jack endpoint: {}", ep);
            output_sockets.push(socket);
            output_eps.push(ep);
        }

        Ok(NativeInterface {
            patch_socket,
            patch_ep,
            input_sockets,
            input_groups: vec![None; I],
            output_sockets,
            output_eps,
            local_addr,
        })
    }
}

impl<const I: usize, const O: usize> Network<I, O> for NativeInterface<I, O> {
    fn can_send(&mut self) -> bool {
        true
    }

    fn recv_directive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        // Safety: `recv_from` never writes uninitialised bytes past what it
        // reports as read, so reinterpreting as `MaybeUninit` is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match self.patch_socket.recv_from(uninit) {
            Ok((size, _)) => Ok(size),
            Err(_) => Err(Error::NoData),
        }
    }

    fn send_directive(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.patch_socket.send_to(buf, &self.patch_ep.into()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err(Error::Network),
        }
    }

    fn jack_connect(&mut self, input_jack_id: usize, addr: [u8; 4], time: i64) -> Result<(), Error> {
        if input_jack_id >= self.input_sockets.len() {
            return Err(Error::InvalidJackId);
        }
        self.jack_disconnect(input_jack_id, time)?;
        let group = Ipv4Addr::from(addr);
        self.input_sockets[input_jack_id].join_multicast_v4(&group, &self.local_addr)?;
        self.input_groups[input_jack_id] = Some(group);
        Ok(())
    }

    fn jack_recv(&mut self, input_jack_id: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let socket = self.input_sockets.get(input_jack_id).ok_or(Error::InvalidJackId)?;
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match socket.recv_from(uninit) {
            Ok((size, _)) => Ok(size),
            Err(_) => Err(Error::NoData),
        }
    }

    fn jack_send(&mut self, output_jack_id: usize, buf: &[u8]) -> Result<(), Error> {
        let socket = self.output_sockets.get(output_jack_id).ok_or(Error::InvalidJackId)?;
        let ep = self.output_eps.get(output_jack_id).ok_or(Error::InvalidJackId)?;
        match socket.send_to(buf, &(*ep).into()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err(Error::Network),
        }
    }

    fn jack_addr(&mut self, output_jack_id: usize) -> Result<([u8; 4], u16), Error> {
        let ep = self.output_eps.get(output_jack_id).ok_or(Error::InvalidJackId)?;
        Ok((ep.ip().octets(), ep.port()))
    }

    fn jack_disconnect(&mut self, input_jack_id: usize, _time: i64) -> Result<(), Error> {
        if input_jack_id >= self.input_sockets.len() {
            return Err(Error::InvalidJackId);
        }
        if let Some(old) = self.input_groups[input_jack_id].take() {
            self.input_sockets[input_jack_id].leave_multicast_v4(&old, &self.local_addr)?;
        }
        Ok(())
    }
}
