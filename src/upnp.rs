//! UPnP port mapping fallback for NAT traversal.
//!
//! Used exactly once, when matchmaking reports the chain unreachable: ask the
//! local internet gateway to forward the chain port to this machine, then let
//! the caller re-run the reachability check.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};
use igd_next::{Gateway, PortMappingProtocol, SearchOptions};

/// Description attached to the created mapping so it can be recognized (and
/// replaced) later.
const MAPPING_DESCRIPTION: &str = "dragonchain";

/// How long to wait for a gateway to answer the SSDP search.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Abstraction over NAT port mapping.
#[allow(async_fn_in_trait)]
pub trait PortMapper {
    /// Forward external TCP `port` on the gateway to the same port on this
    /// machine.
    async fn map_port(&self, port: u16) -> Result<()>;
}

/// Production implementation using IGD (v1 or v2) gateway discovery.
pub struct IgdPortMapper;

/// The local address the gateway should forward to: the address of whichever
/// interface routes to the gateway itself.
fn local_address_for(gateway_addr: SocketAddr) -> Result<std::net::IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding discovery socket")?;
    socket
        .connect(gateway_addr)
        .context("routing to the gateway")?;
    Ok(socket.local_addr().context("reading local address")?.ip())
}

fn add_mapping(gateway: &Gateway, port: u16) -> Result<()> {
    // A gateway that cannot answer this is not a usable NAT device.
    gateway
        .get_external_ip()
        .context("gateway did not report an external ip")?;

    let ip = local_address_for(gateway.addr)?;
    // Clean up any stale mapping first; absence is not an error.
    let _ = gateway.remove_port(PortMappingProtocol::TCP, port);
    gateway
        .add_port(
            PortMappingProtocol::TCP,
            port,
            SocketAddr::new(ip, port),
            0,
            MAPPING_DESCRIPTION,
        )
        .context("adding port mapping on the gateway")?;
    Ok(())
}

impl PortMapper for IgdPortMapper {
    async fn map_port(&self, port: u16) -> Result<()> {
        // igd-next discovery is blocking; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || {
            let gateway = igd_next::search_gateway(SearchOptions {
                timeout: Some(DISCOVERY_TIMEOUT),
                ..SearchOptions::default()
            })
            .context("couldn't find a UPnP compatible router")?;
            add_mapping(&gateway, port)
        })
        .await
        .context("port mapping task failed")?
    }
}
