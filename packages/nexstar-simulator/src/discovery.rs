//! discovery.rs — WiFly discovery beacon
//!
//! The hardware bridge announces itself by spraying a fixed payload at the
//! broadcast address every few seconds. Failures are logged and ignored;
//! discovery is best-effort and must never take the simulator down.

use tokio::net::UdpSocket;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const BEACON: [u8; 110] = [b'X'; 110];
const BEACON_PERIOD: Duration = Duration::from_secs(5);
const DISCOVERY_TARGET: (&str, u16) = ("255.255.255.255", 55555);

pub async fn broadcast(aux_port: u16, shutdown: CancellationToken) {
    let socket = match UdpSocket::bind(("0.0.0.0", aux_port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("discovery: could not bind UDP {aux_port}: {e} (beacon disabled)");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("discovery: broadcast flag rejected: {e} (beacon disabled)");
        return;
    }

    let mut ticker = interval(BEACON_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&BEACON, DISCOVERY_TARGET).await {
                    warn!("discovery send failed: {e}");
                }
            }
        }
    }
}
