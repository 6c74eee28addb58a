//! gateway.rs — AUX TCP gateway (port 2000)
//!
//! Emulates the WiFly serial bridge inside the mount. A connection starts
//! transparent: every byte goes straight onto the AUX bus and the bus
//! echo + replies come back verbatim. Sending `$$$` drops the session into
//! the Roving Networks command console until `exit`; the console only ever
//! echoes and acknowledges, no command actually reconfigures anything.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::mount::{Mount, SharedMount};

const COMMAND_PROMPT: &[u8] = b"\r\nAOK\r\n<2.40-CEL> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Transparent,
    Command,
}

/// Handle one chunk of client bytes against the current session mode,
/// returning whatever should be written back.
pub fn process_chunk(mode: &mut SessionMode, mount: &mut Mount, data: &[u8]) -> Vec<u8> {
    match mode {
        SessionMode::Transparent => {
            if data.starts_with(b"$$$") {
                // Escape into the command console; the remainder of this
                // buffer is discarded, as the real bridge does.
                *mode = SessionMode::Command;
                b"CMD\r\n".to_vec()
            } else {
                mount.handle_stream(data)
            }
        }
        SessionMode::Command => {
            let mut out = Vec::new();
            for raw_line in data.split(|&b| b == b'\n') {
                let line = raw_line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                out.extend_from_slice(line);
                if line == b"exit" {
                    *mode = SessionMode::Transparent;
                    out.extend_from_slice(b"\r\nEXIT\r\n");
                } else {
                    out.extend_from_slice(COMMAND_PROMPT);
                }
            }
            out
        }
    }
}

/// Accept loop for the AUX port. Each peer gets its own task; the listener
/// stops accepting when the shutdown token fires.
pub async fn serve(listener: TcpListener, mount: SharedMount, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(stream, peer, mount.clone(), shutdown.clone()));
                }
                Err(e) => warn!("AUX accept failed: {e}"),
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mount: SharedMount,
    shutdown: CancellationToken,
) {
    let mut mode = SessionMode::Transparent;
    let mut announced = false;
    let mut buf = vec![0u8; 1024];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    mount.lock().await.push_msg("Connection closed.");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("AUX socket error from {peer}: {e}");
                    return;
                }
            }
        };

        let response = {
            let mut mount = mount.lock().await;
            if !announced {
                mount.push_msg(&format!("Client connected from {peer}"));
                announced = true;
            }
            process_chunk(&mut mode, &mut mount, &buf[..n])
        };

        if !response.is_empty() {
            if let Err(e) = stream.write_all(&response).await {
                warn!("AUX write to {peer} failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mount::Observer;
    use crate::SimulatorConfig;
    use aux_types::encode;
    use std::sync::{Arc, Mutex};

    fn mount() -> Mount {
        let observer = Arc::new(Mutex::new(Observer {
            latitude: 50.1822,
            longitude: 19.7925,
            elevation: 400.0,
        }));
        Mount::new(&SimulatorConfig::default(), observer)
    }

    #[test]
    fn test_transparent_passthrough() {
        let mut mode = SessionMode::Transparent;
        let mut mount = mount();
        let request = encode(0x20, 0x10, 0xFE, &[]);
        let response = process_chunk(&mut mode, &mut mount, &request);
        assert!(response.starts_with(&request));
        assert_eq!(mode, SessionMode::Transparent);
    }

    #[test]
    fn test_escape_sequence_enters_command_mode() {
        let mut mode = SessionMode::Transparent;
        let mut mount = mount();
        // Bytes trailing the escape in the same buffer are discarded.
        let response = process_chunk(&mut mode, &mut mount, b"$$$garbage");
        assert_eq!(response, b"CMD\r\n");
        assert_eq!(mode, SessionMode::Command);
    }

    #[test]
    fn test_command_mode_echo_and_prompt() {
        let mut mode = SessionMode::Command;
        let mut mount = mount();
        let response = process_chunk(&mut mode, &mut mount, b"get everything\r\n");
        assert_eq!(response, b"get everything\r\nAOK\r\n<2.40-CEL> ");
        assert_eq!(mode, SessionMode::Command);
    }

    #[test]
    fn test_exit_returns_to_transparent() {
        let mut mode = SessionMode::Command;
        let mut mount = mount();
        let response = process_chunk(&mut mode, &mut mount, b"exit\r\n");
        assert_eq!(response, b"exit\r\nEXIT\r\n");
        assert_eq!(mode, SessionMode::Transparent);

        // Back on the bus: AUX frames work again.
        let request = encode(0x20, 0x10, 0x05, &[]);
        let response = process_chunk(&mut mode, &mut mount, &request);
        assert!(response.starts_with(&request));
    }

    #[test]
    fn test_command_mode_handles_multiple_lines() {
        let mut mode = SessionMode::Command;
        let mut mount = mount();
        let response = process_chunk(&mut mode, &mut mount, b"ver\r\nexit\r\n");
        assert_eq!(response, b"ver\r\nAOK\r\n<2.40-CEL> exit\r\nEXIT\r\n");
        assert_eq!(mode, SessionMode::Transparent);
    }

    #[test]
    fn test_empty_lines_ignored_in_command_mode() {
        let mut mode = SessionMode::Command;
        let mut mount = mount();
        let response = process_chunk(&mut mode, &mut mount, b"\r\n\r\n");
        assert!(response.is_empty());
    }

    #[test]
    fn test_dollar_frames_only_match_at_start() {
        let mut mode = SessionMode::Transparent;
        let mut mount = mount();
        // A valid frame followed by "$$$" later in the stream is not an
        // escape; only a buffer *starting* with the guard switches modes.
        let mut data = encode(0x20, 0x10, 0xFE, &[]);
        data.extend_from_slice(b"$$$");
        let response = process_chunk(&mut mode, &mut mount, &data);
        assert_eq!(mode, SessionMode::Transparent);
        assert!(response.starts_with(&data[..6]));
    }
}
