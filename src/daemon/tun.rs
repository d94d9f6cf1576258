//! The local tunnel interface.

use tracing::info;
use tun::{configure, AsyncDevice};

use crate::{config::Config, daemon::error::DaemonError};

/// Creates the tunnel interface named in `config` and brings it up.
///
/// Needs `CAP_NET_ADMIN`. Frames are read without the packet information
/// prefix, so every read yields a bare IP packet.
pub fn open_interface(config: &Config) -> Result<AsyncDevice, DaemonError> {
    let mut configuration = configure();
    configuration.name(&config.interface_name).up();
    if let Some(address) = config.interface_address {
        configuration.address(address);
    }
    if let Some(netmask) = config.interface_netmask {
        configuration.netmask(netmask);
    }
    #[cfg(target_os = "linux")]
    configuration.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&configuration)?;
    info!(interface = %config.interface_name, "tunnel interface is up");
    Ok(device)
}
