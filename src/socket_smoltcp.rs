//! smoltcp-based socket interface.
//!
//! Provides [`Network`] plus DHCP-driven address configuration on top of a
//! `smoltcp` device, for hosts (microcontrollers) with no native OS socket
//! layer. Grounded directly on `core/src/socket_smoltcp.rs`, adapted to
//! this crate's per-jack `Network` surface (`jack_addr` reporting a
//! `(group, port)` pair instead of group alone, `poll` reporting whether
//! the interface made progress).

use core::str::FromStr;

use itertools::izip;
use smoltcp::{
    iface::{
        Interface, InterfaceBuilder, Neighbor, NeighborCache, Route, Routes, SocketHandle,
        SocketStorage,
    },
    phy::Device,
    socket::{Dhcpv4Event, Dhcpv4Socket, UdpPacketMetadata, UdpSocket, UdpSocketBuffer},
    time::Instant,
    wire::{EthernetAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address, Ipv4Cidr},
};

use crate::network::Network;
use crate::{Error, JACK_PORT};

/// Backing storage for a [`SmoltcpInterface`]. `N` must be `1 + I + O` (the
/// control-plane group plus one group per jack) until const-generic
/// expressions are stable — see `core/src/socket_smoltcp.rs`'s identical
/// constraint.
pub struct SmoltcpStorage<'a, const I: usize, const O: usize, const N: usize> {
    ip_addrs: [IpCidr; 1],
    neighbor_storage: [Option<(IpAddress, Neighbor)>; 16],
    routes_storage: [Option<(IpCidr, Route)>; 1],
    ipv4_multicast_storage: [Option<(Ipv4Address, ())>; N],
    sockets: [SocketStorage<'a>; 16],
    server_rx_metadata_buffer: [UdpPacketMetadata; 32],
    server_rx_payload_buffer: [u8; 2048],
    server_tx_metadata_buffer: [UdpPacketMetadata; 32],
    server_tx_payload_buffer: [u8; 4096],
    input_jack_rx_metadata_buffers: [[UdpPacketMetadata; 16]; I],
    input_jack_rx_payload_buffers: [[u8; 4096]; I],
    input_jack_tx_metadata_buffers: [[UdpPacketMetadata; 0]; I],
    input_jack_tx_payload_buffers: [[u8; 0]; I],
    output_jack_rx_metadata_buffers: [[UdpPacketMetadata; 0]; O],
    output_jack_rx_payload_buffers: [[u8; 0]; O],
    output_jack_tx_metadata_buffers: [[UdpPacketMetadata; 16]; O],
    output_jack_tx_payload_buffers: [[u8; 4096]; O],
}

impl<'a, const I: usize, const O: usize, const N: usize> Default for SmoltcpStorage<'a, I, O, N> {
    fn default() -> Self {
        SmoltcpStorage {
            ip_addrs: [IpCidr::new(Ipv4Address::UNSPECIFIED.into(), 0)],
            neighbor_storage: [None; 16],
            routes_storage: [None; 1],
            ipv4_multicast_storage: [None; N],
            sockets: [0; 16].map(|_| Default::default()),
            server_rx_metadata_buffer: [UdpPacketMetadata::EMPTY; 32],
            server_rx_payload_buffer: [0; 2048],
            server_tx_metadata_buffer: [UdpPacketMetadata::EMPTY; 32],
            server_tx_payload_buffer: [0; 4096],
            input_jack_rx_metadata_buffers: [[UdpPacketMetadata::EMPTY; 16]; I],
            input_jack_rx_payload_buffers: [[0; 4096]; I],
            input_jack_tx_metadata_buffers: [[UdpPacketMetadata::EMPTY; 0]; I],
            input_jack_tx_payload_buffers: [[0; 0]; I],
            output_jack_rx_metadata_buffers: [[UdpPacketMetadata::EMPTY; 0]; O],
            output_jack_rx_payload_buffers: [[0; 0]; O],
            output_jack_tx_metadata_buffers: [[UdpPacketMetadata::EMPTY; 16]; O],
            output_jack_tx_payload_buffers: [[0; 4096]; O],
        }
    }
}

pub struct SmoltcpInterface<'a, DeviceT: for<'d> Device<'d>, const I: usize, const O: usize, const N: usize> {
    iface: Interface<'a, DeviceT>,
    dhcp_handle: SocketHandle,
    dhcp_configured: bool,
    server_handle: SocketHandle,
    patch_ep: IpEndpoint,
    input_jack_handles: [SocketHandle; I],
    input_jack_endpoints: [Option<IpEndpoint>; I],
    output_jack_handles: [SocketHandle; O],
    output_jack_endpoints: [IpEndpoint; O],
}

impl<'a, DeviceT, const I: usize, const O: usize, const N: usize> SmoltcpInterface<'a, DeviceT, I, O, N>
where
    DeviceT: for<'d> Device<'d>,
{
    pub fn new(device: DeviceT, src_mac: [u8; 6], storage: &'a mut SmoltcpStorage<'a, I, O, N>) -> Self {
        let neighbor_cache = NeighborCache::new(&mut storage.neighbor_storage[..]);
        let routes = Routes::new(&mut storage.routes_storage[..]);
        let ethernet_addr = EthernetAddress(src_mac);

        let mut iface = InterfaceBuilder::new(device, &mut storage.sockets[..])
            .hardware_addr(ethernet_addr.into())
            .ip_addrs(&mut storage.ip_addrs[..])
            .routes(routes)
            .neighbor_cache(neighbor_cache)
            .ipv4_multicast_groups(&mut storage.ipv4_multicast_storage[..])
            .finalize();

        let dhcp_handle = iface.add_socket(Dhcpv4Socket::new());

        let server_socket = UdpSocket::new(
            UdpSocketBuffer::new(&mut storage.server_rx_metadata_buffer[..], &mut storage.server_rx_payload_buffer[..]),
            UdpSocketBuffer::new(&mut storage.server_tx_metadata_buffer[..], &mut storage.server_tx_payload_buffer[..]),
        );
        let server_handle = iface.add_socket(server_socket);

        let mut input_jack_handles: [SocketHandle; I] = [Default::default(); I];
        for (slot, (rx_meta, rx_payload, tx_meta, tx_payload)) in izip!(
            storage.input_jack_rx_metadata_buffers.iter_mut(),
            storage.input_jack_rx_payload_buffers.iter_mut(),
            storage.input_jack_tx_metadata_buffers.iter_mut(),
            storage.input_jack_tx_payload_buffers.iter_mut(),
        )
        .enumerate()
        {
            let socket = UdpSocket::new(
                UdpSocketBuffer::new(&mut rx_meta[..], &mut rx_payload[..]),
                UdpSocketBuffer::new(&mut tx_meta[..], &mut tx_payload[..]),
            );
            input_jack_handles[slot] = iface.add_socket(socket);
        }

        let mut output_jack_handles: [SocketHandle; O] = [Default::default(); O];
        for (slot, (rx_meta, rx_payload, tx_meta, tx_payload)) in izip!(
            storage.output_jack_rx_metadata_buffers.iter_mut(),
            storage.output_jack_rx_payload_buffers.iter_mut(),
            storage.output_jack_tx_metadata_buffers.iter_mut(),
            storage.output_jack_tx_payload_buffers.iter_mut(),
        )
        .enumerate()
        {
            let socket = UdpSocket::new(
                UdpSocketBuffer::new(&mut rx_meta[..], &mut rx_payload[..]),
                UdpSocketBuffer::new(&mut tx_meta[..], &mut tx_payload[..]),
            );
            output_jack_handles[slot] = iface.add_socket(socket);
        }

        let patch_ep = IpEndpoint::from_str(crate::PATCH_EP).unwrap();

        SmoltcpInterface {
            iface,
            dhcp_handle,
            dhcp_configured: false,
            server_handle,
            patch_ep,
            input_jack_handles,
            input_jack_endpoints: [None; I],
            output_jack_handles,
            output_jack_endpoints: [IpEndpoint::UNSPECIFIED; O],
        }
    }

    fn set_ipv4_addr(&mut self, cidr: Ipv4Cidr) {
        self.iface.update_ip_addrs(|addrs| {
            let dest = addrs.iter_mut().next().unwrap();
            *dest = IpCidr::Ipv4(cidr);
        });
    }

    fn dhcp_poll(&mut self, time: i64) {
        let event = self.iface.get_socket::<Dhcpv4Socket>(self.dhcp_handle).poll();
        match event {
            None => {}
            Some(Dhcpv4Event::Configured(config)) => {
                info!("DHCP config acquired: {}", config.address);
                self.set_ipv4_addr(config.address);
                let addr_bytes = config.address.address().as_bytes();
                for (slot, ep) in self.output_jack_endpoints.iter_mut().enumerate() {
                    let group = Ipv4Address::new(239, addr_bytes[2], addr_bytes[3], slot as u8);
                    *ep = IpEndpoint::new(IpAddress::Ipv4(group), JACK_PORT);
                }

                if let Some(router) = config.router {
                    let _ = self.iface.routes_mut().add_default_ipv4_route(router);
                } else {
                    self.iface.routes_mut().remove_default_ipv4_route();
                }

                let t = Instant::from_millis(time);
                if let Err(e) = self.iface.join_multicast_group(self.patch_ep.addr, t) {
                    info!("control-plane multicast join failed: {}", e);
                }
                for ep in self.output_jack_endpoints {
                    if let Err(e) = self.iface.join_multicast_group(ep.addr, t) {
                        info!("jack multicast join failed: {}", e);
                    }
                }
                self.dhcp_configured = true;
            }
            Some(Dhcpv4Event::Deconfigured) => {
                info!("DHCP lease lost");
                self.set_ipv4_addr(Ipv4Cidr::new(Ipv4Address::UNSPECIFIED, 0));
                self.iface.routes_mut().remove_default_ipv4_route();
                self.dhcp_configured = false;
            }
        }
    }
}

impl<'a, DeviceT, const I: usize, const O: usize, const N: usize> Network<I, O>
    for SmoltcpInterface<'a, DeviceT, I, O, N>
where
    DeviceT: for<'d> Device<'d>,
{
    fn poll(&mut self, time: i64) -> Result<bool, Error> {
        let progressed = self.iface.poll(Instant::from_millis(time)).map_err(|_| Error::Network)?;
        self.dhcp_poll(time);
        if self.dhcp_configured {
            let server = self.iface.get_socket::<UdpSocket>(self.server_handle);
            if !server.is_open() {
                info!("opening control-plane socket");
                server.bind(self.patch_ep.port).map_err(|_| Error::Network)?;
            }
            let mut port = 30000;
            for h in self.output_jack_handles {
                let socket = self.iface.get_socket::<UdpSocket>(h);
                if !socket.is_open() {
                    socket.bind(port).map_err(|_| Error::Network)?;
                    port += 1;
                }
            }
        }
        Ok(progressed)
    }

    fn can_send(&mut self) -> bool {
        let socket = self.iface.get_socket::<UdpSocket>(self.server_handle);
        socket.can_send() && self.dhcp_configured
    }

    fn recv_directive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let socket = self.iface.get_socket::<UdpSocket>(self.server_handle);
        if socket.can_recv() && self.dhcp_configured {
            socket.recv_slice(buf).map(|(size, _)| size).map_err(|_| Error::Network)
        } else {
            Err(Error::NoData)
        }
    }

    fn send_directive(&mut self, buf: &[u8]) -> Result<(), Error> {
        let ep = self.patch_ep;
        let socket = self.iface.get_socket::<UdpSocket>(self.server_handle);
        if socket.can_send() && self.dhcp_configured {
            socket.send_slice(buf, ep).map(|_| ()).map_err(|_| Error::Network)
        } else {
            Err(Error::Network)
        }
    }

    fn jack_connect(&mut self, input_jack_id: usize, addr: [u8; 4], time: i64) -> Result<(), Error> {
        let group = Ipv4Address::from_bytes(&addr);
        let ep = IpEndpoint::new(IpAddress::Ipv4(group), JACK_PORT);
        self.jack_disconnect(input_jack_id, time)?;
        let t = Instant::from_millis(time);
        self.iface.join_multicast_group(ep.addr, t).map_err(|_| Error::Network)?;
        self.input_jack_endpoints[input_jack_id] = Some(ep);
        let socket = self.iface.get_socket::<UdpSocket>(self.input_jack_handles[input_jack_id]);
        socket.bind(ep).map_err(|_| Error::Network)
    }

    fn jack_recv(&mut self, input_jack_id: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let socket = self.iface.get_socket::<UdpSocket>(self.input_jack_handles[input_jack_id]);
        if socket.can_recv() && self.dhcp_configured {
            socket.recv_slice(buf).map(|(size, _)| size).map_err(|_| Error::Network)
        } else {
            Err(Error::NoData)
        }
    }

    fn jack_send(&mut self, output_jack_id: usize, buf: &[u8]) -> Result<(), Error> {
        let ep = self.output_jack_endpoints[output_jack_id];
        let socket = self.iface.get_socket::<UdpSocket>(self.output_jack_handles[output_jack_id]);
        if socket.can_send() && self.dhcp_configured && ep.is_specified() {
            socket.send_slice(buf, ep).map(|_| ()).map_err(|_| Error::Network)
        } else {
            Err(Error::Network)
        }
    }

    fn jack_addr(&mut self, output_jack_id: usize) -> Result<([u8; 4], u16), Error> {
        let ep = self.output_jack_endpoints[output_jack_id];
        let addr = ep.addr.as_bytes().try_into().map_err(|_| Error::InvalidJackId)?;
        Ok((addr, ep.port))
    }

    fn jack_disconnect(&mut self, input_jack_id: usize, time: i64) -> Result<(), Error> {
        let t = Instant::from_millis(time);
        if let Some(old) = self.input_jack_endpoints[input_jack_id] {
            self.iface.leave_multicast_group(old.addr, t).map_err(|_| Error::Network)?;
        }
        let socket = self.iface.get_socket::<UdpSocket>(self.input_jack_handles[input_jack_id]);
        if socket.is_open() {
            socket.close();
        }
        Ok(())
    }
}
