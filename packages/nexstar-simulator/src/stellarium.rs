//! stellarium.rs — sky-chart TCP server (port 10001)
//!
//! Planetarium clients connect here instead of the AUX port. Incoming
//! bytes are GOTO requests; outgoing traffic is a 24-byte position status
//! fanned out to every client at 10 Hz through a broadcast channel, the
//! same pattern the tick loop uses for its cadence.

use std::f64::consts::TAU;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::coords;
use crate::mount::SharedMount;
use aux_types::stellarium::{encode_status, parse_goto_stream};

/// Status broadcast period.
pub const STATUS_PERIOD: Duration = Duration::from_millis(100);

/// Compute the current status packet for chart clients: sky pointing with
/// refraction applied, transformed to apparent RA/Dec at the observer site.
pub async fn current_status(mount: &SharedMount) -> [u8; 24] {
    let (sky_az, sky_alt, observer) = {
        let mount = mount.lock().await;
        let (az, alt) = mount.get_sky_altaz();
        (az, mount.refracted_alt(alt), mount.observer())
    };
    let observer = *observer.lock().unwrap();
    let now = Utc::now();
    let (ra, dec) = coords::radec_of(sky_az * TAU, sky_alt * TAU, now, &observer);
    let micros = now.timestamp_micros().max(0) as u64;
    encode_status(micros, ra, dec)
}

/// Periodic status broadcaster. Clients subscribe to `tx`; sending with no
/// subscribers is not an error.
pub async fn broadcast_status(
    mount: SharedMount,
    tx: broadcast::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(STATUS_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let packet = current_status(&mount).await;
                let _ = tx.send(packet.to_vec());
            }
        }
    }
}

/// Accept loop for the Stellarium port.
pub async fn serve(
    listener: TcpListener,
    mount: SharedMount,
    tx: broadcast::Sender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    tokio::spawn(handle_client(
                        stream,
                        mount.clone(),
                        tx.subscribe(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("Stellarium accept failed: {e}"),
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    mount: SharedMount,
    mut status_rx: broadcast::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    mount.lock().await.push_msg("Stellarium client connected.");
    let mut buf = vec![0u8; 1024];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            status = status_rx.recv() => match status {
                Ok(packet) => {
                    if stream.write_all(&packet).await.is_err() {
                        return;
                    }
                }
                // A slow client that missed packets just picks up the next one.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => return,
                Ok(n) => {
                    let mount = mount.lock().await;
                    for goto in parse_goto_stream(&buf[..n]) {
                        mount.push_msg(&format!(
                            "Stellarium GoTo: RA={:.2}h Dec={:.2}deg",
                            goto.ra_hours, goto.dec_deg
                        ));
                    }
                }
                Err(e) => {
                    warn!("Stellarium socket error: {e}");
                    return;
                }
            }
        }
    }
}
