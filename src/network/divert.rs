//! Packet interception driver.
//!
//! [`PacketDiverter`] abstracts the kernel driver that hands packets to user
//! space and takes back the ones allowed through. On Windows it is backed by
//! WinDivert; elsewhere opening it fails with [`DriverError::Unsupported`].
//! Packets not reinjected are dropped by the driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DriverError;

/// Outbound TCP/UDP plus inbound DNS answers, so resolved addresses can be
/// mapped back to their domain.
pub const FILTER: &str = "(outbound and (tcp or udp)) or (inbound and udp.SrcPort == 53)";

/// Filter matching nothing, used to probe the driver.
pub const PROBE_FILTER: &str = "false";

/// Largest packet the driver hands over.
pub const MAX_PACKET_SIZE: usize = 65_535;

/// A packet taken from the driver, with the opaque address needed to put it
/// back.
#[derive(Debug, Clone)]
pub struct Diverted<A> {
    pub data: Vec<u8>,
    pub outbound: bool,
    pub address: A,
}

/// Ends a blocked [`PacketDiverter::recv`] from another thread.
pub trait DriverShutdown: Send + Sync + 'static {
    fn shutdown(&self);
}

impl DriverShutdown for Arc<AtomicBool> {
    fn shutdown(&self) {
        self.store(true, Ordering::SeqCst);
    }
}

/// Source of intercepted packets.
pub trait PacketDiverter: Send + 'static {
    type Address: Send;
    type Shutdown: DriverShutdown;

    /// Handle that makes a pending and every later `recv` return
    /// [`DriverError::Closed`].
    fn shutdown_handle(&self) -> Self::Shutdown;

    /// Block until the next packet. [`DriverError::Closed`] ends the capture.
    fn recv(&mut self) -> Result<Diverted<Self::Address>, DriverError>;

    /// Let a packet continue on its way.
    fn reinject(&mut self, packet: &Diverted<Self::Address>) -> Result<(), DriverError>;

    /// Deliver `reply` to the sender of `original`, in the opposite direction.
    fn inject_reply(
        &mut self,
        original: &Diverted<Self::Address>,
        reply: Vec<u8>,
    ) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// Whether the driver can be opened on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub available: bool,
    pub message: String,
}

/// Try to open and close a handle that captures nothing.
pub fn driver_status() -> DriverStatus {
    match SystemDiverter::open(PROBE_FILTER).and_then(|mut handle| handle.close()) {
        Ok(()) => DriverStatus {
            available: true,
            message: "WinDivert driver loaded".to_string(),
        },
        Err(DriverError::Unsupported) => DriverStatus {
            available: false,
            message: DriverError::Unsupported.to_string(),
        },
        Err(err) => DriverStatus {
            available: false,
            message: format!("WinDivert driver not available: {err}"),
        },
    }
}

#[cfg(windows)]
pub use self::windows::WinDivertDiverter as SystemDiverter;

#[cfg(not(windows))]
pub use self::unsupported::UnsupportedDiverter as SystemDiverter;

#[cfg(windows)]
mod windows {
    use std::borrow::Cow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use windivert::prelude::*;

    use super::{Diverted, MAX_PACKET_SIZE, PacketDiverter};
    use crate::error::DriverError;

    /// How long a receive waits before checking for shutdown.
    const RECV_WAIT_MS: u32 = 250;

    /// WinDivert handle at the network layer.
    pub struct WinDivertDiverter {
        handle: Option<WinDivert<NetworkLayer>>,
        buffer: Vec<u8>,
        shutdown: Arc<AtomicBool>,
    }

    impl WinDivertDiverter {
        /// Open a handle. Needs administrator rights and the WinDivert driver.
        pub fn open(filter: &str) -> Result<Self, DriverError> {
            let handle = WinDivert::network(filter, 0, WinDivertFlags::new()).map_err(|err| {
                DriverError::Open {
                    filter: filter.to_string(),
                    message: err.to_string(),
                }
            })?;
            tracing::info!(filter, "WinDivert handle opened");
            Ok(Self {
                handle: Some(handle),
                buffer: vec![0u8; MAX_PACKET_SIZE],
                shutdown: Arc::default(),
            })
        }

        fn handle(&self) -> Result<&WinDivert<NetworkLayer>, DriverError> {
            self.handle.as_ref().ok_or(DriverError::Closed)
        }
    }

    impl PacketDiverter for WinDivertDiverter {
        type Address = WinDivertAddress<NetworkLayer>;
        type Shutdown = Arc<AtomicBool>;

        fn shutdown_handle(&self) -> Self::Shutdown {
            Arc::clone(&self.shutdown)
        }

        fn recv(&mut self) -> Result<Diverted<Self::Address>, DriverError> {
            let handle = self.handle.as_ref().ok_or(DriverError::Closed)?;
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Err(DriverError::Closed);
                }
                let packet = handle
                    .recv_wait(Some(&mut self.buffer), RECV_WAIT_MS)
                    .map_err(|err| DriverError::Recv(err.to_string()))?;
                if let Some(packet) = packet {
                    return Ok(Diverted {
                        data: packet.data.to_vec(),
                        outbound: packet.address.outbound(),
                        address: packet.address,
                    });
                }
            }
        }

        fn reinject(&mut self, packet: &Diverted<Self::Address>) -> Result<(), DriverError> {
            let out = WinDivertPacket {
                address: packet.address.clone(),
                data: Cow::Borrowed(packet.data.as_slice()),
            };
            self.handle()?
                .send(&out)
                .map_err(|err| DriverError::Send(err.to_string()))?;
            Ok(())
        }

        fn inject_reply(
            &mut self,
            original: &Diverted<Self::Address>,
            reply: Vec<u8>,
        ) -> Result<(), DriverError> {
            let mut address = original.address.clone();
            address.set_outbound(!original.outbound);
            let out = WinDivertPacket {
                address,
                data: Cow::Owned(reply),
            };
            self.handle()?
                .send(&out)
                .map_err(|err| DriverError::Send(err.to_string()))?;
            Ok(())
        }

        fn close(&mut self) -> Result<(), DriverError> {
            if let Some(mut handle) = self.handle.take() {
                handle
                    .close(CloseAction::Nothing)
                    .map_err(|err| DriverError::Send(err.to_string()))?;
                tracing::info!("WinDivert handle closed");
            }
            Ok(())
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use super::{Diverted, DriverShutdown, PacketDiverter};
    use crate::error::DriverError;

    /// Stand-in for platforms without WinDivert. It cannot be constructed.
    pub enum UnsupportedDiverter {}

    pub enum NoShutdown {}

    impl DriverShutdown for NoShutdown {
        fn shutdown(&self) {
            match *self {}
        }
    }

    impl UnsupportedDiverter {
        pub fn open(_filter: &str) -> Result<Self, DriverError> {
            Err(DriverError::Unsupported)
        }
    }

    impl PacketDiverter for UnsupportedDiverter {
        type Address = ();
        type Shutdown = NoShutdown;

        fn shutdown_handle(&self) -> NoShutdown {
            match *self {}
        }

        fn recv(&mut self) -> Result<Diverted<()>, DriverError> {
            match *self {}
        }

        fn reinject(&mut self, _packet: &Diverted<()>) -> Result<(), DriverError> {
            match *self {}
        }

        fn inject_reply(&mut self, _original: &Diverted<()>, _reply: Vec<u8>) -> Result<(), DriverError> {
            match *self {}
        }

        fn close(&mut self) -> Result<(), DriverError> {
            match *self {}
        }
    }
}
