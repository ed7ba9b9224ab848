/// Byte-level splice forwarding between a client and a backend
///
/// The minimal proxy variant: no protocol awareness, just two copy loops
/// multiplexed on one task. Used instead of the message-framed session
/// when the crate is built with the `splice` feature.
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::pool::{Backend, PooledConn};
use crate::server::ServerStats;

/// Copy buffer per direction.
const BUFFER_SIZE: usize = 4096;

/// Forward bytes in both directions until either side closes or errors.
///
/// EOF is an expected termination and is not logged; other errors are
/// logged and evict the backend's connections so that sibling sessions
/// reconnect elsewhere. The backend's kill switch also ends the loop.
pub async fn splice(
    mut client: TcpStream,
    conn: PooledConn,
    backend: Arc<dyn Backend>,
    stats: Arc<ServerStats>,
) {
    let (mut upstream, kill_switch, _guard) = conn.into_parts();

    let mut client_buf = [0u8; BUFFER_SIZE];
    let mut upstream_buf = [0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = kill_switch.cancelled() => {
                log::warn!("backend {} failed; dropping spliced session", backend.addr());
                break;
            }

            res = client.read(&mut client_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    stats.add_transferred(n);
                    if let Err(err) = upstream.write_all(&client_buf[..n]).await {
                        log::error!("failed to write to backend {}: {err}", backend.addr());
                        backend.fail();
                        break;
                    }
                }
                Err(err) => {
                    log::error!("failed to read from client: {err}");
                    break;
                }
            },

            res = upstream.read(&mut upstream_buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    stats.add_transferred(n);
                    if let Err(err) = client.write_all(&upstream_buf[..n]).await {
                        log::error!("failed to write to client: {err}");
                        break;
                    }
                }
                Err(err) => {
                    log::error!("failed to read from backend {}: {err}", backend.addr());
                    backend.fail();
                    break;
                }
            },
        }
    }
    // Both sockets close here, before the caller decrements the
    // live-connection counter.
}
