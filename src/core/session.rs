/// Per-client proxy session
///
/// Handles the tagless startup negotiation on the raw socket, dials a
/// backend of the listener's role, man-in-the-middles the authentication
/// exchange, then forwards messages in both directions until either side
/// goes away.
///
/// The proxy rewrites an MD5 challenge into a cleartext request so that it
/// always sees the real credentials; postgres salts every MD5 exchange
/// differently, which would otherwise make pooling sessions across
/// backends impossible.
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::core::connection::FramedConnection;
use crate::error::{PorteraError, PorteraResult};
use crate::pool::{Backend, InflightGuard, Pool};
use crate::protocol::{
    read_start_frame, AuthenticationRequest, Message, Startup, Vocabulary,
};
use crate::server::{ListenerRole, ServerStats};

/// Until the client is authenticated, the whole exchange must finish
/// within this window.
const STARTUP_DEADLINE: Duration = Duration::from_secs(60);

/// Drive one accepted client connection to completion.
pub async fn handle_client(
    stream: TcpStream,
    role: ListenerRole,
    pool: Arc<Pool>,
    stats: Arc<ServerStats>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let established = match timeout(STARTUP_DEADLINE, establish(stream, role, &pool, &peer)).await
    {
        Ok(Ok(Some(session))) => session,
        // A CancelRequest round trip, a clean disconnect, or an error that
        // was already logged where it happened.
        Ok(Ok(None)) | Ok(Err(())) => {
            eprintln!("DEBUG establish returned None/Err");
            return;
        }
        Err(_) => {
            eprintln!("DEBUG startup timed out");
            log::warn!("client {peer}: startup did not finish within the deadline");
            return;
        }
    };

    // Successfully authenticated; no more deadline.
    proxy(established, &stats).await;
}

/// A session that made it through startup and authentication.
struct Established {
    frontend: FramedConnection,
    backend: FramedConnection,
    handle: Arc<dyn Backend>,
    /// Keeps the connection registered with its backend until teardown.
    _guard: InflightGuard,
}

async fn establish(
    mut stream: TcpStream,
    role: ListenerRole,
    pool: &Pool,
    peer: &str,
) -> Result<Option<Established>, ()> {
    let start = match handle_startup(&mut stream).await {
        Ok(msg) => msg,
        Err(err) => {
            eprintln!("DEBUG startup error: {err}");
            if !err.is_eof() {
                log::error!("client {peer}: error handling startup: {err}");
            }
            return Err(());
        }
    };

    let mut frontend = FramedConnection::new(stream, Vocabulary::Frontend);

    // A CancelRequest may go to any backend; regular sessions follow the
    // listener's role.
    let dialed = if matches!(start, Message::CancelRequest { .. }) {
        pool.dial_for_read().await
    } else {
        match role {
            ListenerRole::Primary => pool.dial_for_write().await,
            ListenerRole::Follower => pool.dial_for_read().await,
        }
    };
    let (handle, conn) = match dialed {
        Ok(pair) => pair,
        Err(err) => {
            log::error!("client {peer}: couldn't retrieve a backend: {err}");
            eprintln!("DEBUG dial error: {err}");
            frontend.close().await;
            return Err(());
        }
    };

    let (backend_stream, kill_switch, guard) = conn.into_parts();
    // The backend's kill switch parents the framed close signal, so a
    // pool-level fail tears this session down remotely.
    let mut backend = FramedConnection::with_token(
        backend_stream,
        Vocabulary::Backend,
        kill_switch.child_token(),
    );

    // Fast path when we were handed a CancelRequest.
    if let Message::CancelRequest { .. } = start {
        let forwarded = backend.send(start).await;
        if forwarded.is_ok() {
            let _ = backend.recv().await;
        }
        frontend.close().await;
        backend.close().await;
        return Ok(None);
    }

    let startup = match start {
        Message::Startup(startup) => startup,
        _ => {
            frontend.close().await;
            backend.close().await;
            return Err(());
        }
    };

    if let Err(err) = authenticate(&mut frontend, &mut backend, &startup).await {
        eprintln!("DEBUG auth error: {err}");
        if !err.is_eof() {
            log::error!("client {peer}: error in authentication phase: {err}");
        }
        frontend.close().await;
        backend.close().await;
        return Err(());
    }

    Ok(Some(Established {
        frontend,
        backend,
        handle,
        _guard: guard,
    }))
}

/// Read the tagless startup exchange from a fresh client socket.
///
/// The only transitions are INIT -> return and INIT -> SSL refusal ->
/// INIT -> return; anything longer is a protocol violation.
async fn handle_startup<S>(stream: &mut S) -> PorteraResult<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ssl_refused = false;

    for _ in 0..2 {
        match read_start_frame(stream).await? {
            Message::Startup(startup) => {
                if startup.major_version() == 3 && startup.minor_version() == 0 {
                    return Ok(Message::Startup(startup));
                }
                return Err(PorteraError::UnsupportedProtocol);
            }
            cancel @ Message::CancelRequest { .. } => return Ok(cancel),
            Message::SslRequest => {
                if ssl_refused {
                    break;
                }
                // SSL is not supported; decline and expect a plain Startup.
                stream.write_all(b"N").await?;
                ssl_refused = true;
            }
            _ => return Err(PorteraError::ProtocolViolation),
        }
    }

    // Too many state transitions.
    Err(PorteraError::ProtocolViolation)
}

/// MITM the authentication exchange between client and backend.
///
/// If the server requests MD5 we lie to the client and ask for a cleartext
/// password, then salt it ourselves. If the server trusts us, we extend
/// that trust to the client.
async fn authenticate(
    frontend: &mut FramedConnection,
    backend: &mut FramedConnection,
    startup: &Startup,
) -> PorteraResult<()> {
    enum AuthState {
        Init,
        AuthReq,
        Password,
        Md5Password,
        Authenticated,
    }

    let mut state = AuthState::Init;
    let mut salt = [0u8; 4];

    loop {
        match state {
            AuthState::Init => {
                backend.send(Message::Startup(startup.clone())).await?;
                state = AuthState::AuthReq;
            }

            AuthState::AuthReq => {
                let msg = match backend.recv().await {
                    Some(msg) => msg,
                    None => return first_fault(frontend, backend),
                };
                let request = match msg {
                    Message::Authentication(request) => request,
                    _ => return Err(PorteraError::ProtocolViolation),
                };

                match request {
                    AuthenticationRequest::Ok => {
                        frontend.send(Message::Authentication(request)).await?;
                        state = AuthState::Authenticated;
                    }
                    AuthenticationRequest::CleartextPassword => {
                        frontend.send(Message::Authentication(request)).await?;
                        state = AuthState::Password;
                    }
                    AuthenticationRequest::Md5Password { salt: server_salt } => {
                        salt = server_salt;
                        frontend
                            .send(Message::Authentication(
                                AuthenticationRequest::CleartextPassword,
                            ))
                            .await?;
                        state = AuthState::Md5Password;
                    }
                }
            }

            AuthState::Password => {
                let msg = match frontend.recv().await {
                    Some(msg) => msg,
                    None => return first_fault(frontend, backend),
                };
                match msg {
                    password @ Message::Password(_) => backend.send(password).await?,
                    _ => return Err(PorteraError::ProtocolViolation),
                }
                state = AuthState::Authenticated;
            }

            AuthState::Md5Password => {
                let msg = match frontend.recv().await {
                    Some(msg) => msg,
                    None => return first_fault(frontend, backend),
                };
                let mut password = match msg {
                    Message::Password(password) => password,
                    _ => return Err(PorteraError::ProtocolViolation),
                };

                // The client sent cleartext but the server expects
                // md5(md5(password + user) + salt).
                let user = startup.user().unwrap_or_default();
                let salted = salt_password(user.as_bytes(), password.password(), &salt);
                password.set_password(&salted);

                backend.send(Message::Password(password)).await?;
                state = AuthState::Authenticated;
            }

            AuthState::Authenticated => {
                let msg = match backend.recv().await {
                    Some(msg) => msg,
                    None => return first_fault(frontend, backend),
                };
                return match msg {
                    Message::Authentication(AuthenticationRequest::Ok) => {
                        frontend.send(msg).await?;
                        Ok(())
                    }
                    Message::Authentication(_) => Err(PorteraError::ProtocolViolation),
                    Message::Error(ref response) => {
                        let failure = if response.code() == Some("28P01") {
                            PorteraError::InvalidPassword
                        } else {
                            PorteraError::AuthenticationFailure
                        };
                        frontend.send(msg).await?;
                        Err(failure)
                    }
                    _ => Err(PorteraError::ProtocolViolation),
                };
            }
        }
    }
}

/// Salt a cleartext password the way postgres expects for MD5 auth:
/// "md5" + hex(md5(hex(md5(password + username)) + salt)).
fn salt_password(username: &[u8], password: &[u8], salt: &[u8; 4]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(password.len() + username.len());
    inner.extend_from_slice(password);
    inner.extend_from_slice(username);
    let inner_hex = format!("{:x}", md5::compute(&inner));

    let mut outer = inner_hex.into_bytes();
    outer.extend_from_slice(salt);
    let outer_hex = format!("{:x}", md5::compute(&outer));

    let mut salted = b"md5".to_vec();
    salted.extend_from_slice(outer_hex.as_bytes());
    salted
}

/// The first error either side recorded, or a clean EOF.
fn first_fault(frontend: &FramedConnection, backend: &FramedConnection) -> PorteraResult<()> {
    if frontend.error().is_some() {
        return Err(frontend.fault());
    }
    if backend.error().is_some() {
        return Err(backend.fault());
    }
    Ok(())
}

/// Full-duplex forwarding until either side closes or errors.
async fn proxy(mut session: Established, stats: &ServerStats) {
    loop {
        tokio::select! {
            maybe = session.frontend.recv() => match maybe {
                Some(msg) => {
                    stats.add_transferred(msg.encoded_len());
                    if session.backend.send(msg).await.is_err() {
                        report_backend(&session);
                        break;
                    }
                }
                None => {
                    let err = session.frontend.fault();
                    if !err.is_eof() {
                        log::error!("frontend error in proxy phase: {err}");
                    }
                    break;
                }
            },

            maybe = session.backend.recv() => match maybe {
                Some(msg) => {
                    if let Message::Error(response) = &msg {
                        log::warn!("error message from backend: {response:?}");
                    }
                    stats.add_transferred(msg.encoded_len());
                    if session.frontend.send(msg).await.is_err() {
                        let err = session.frontend.fault();
                        if !err.is_eof() {
                            log::error!("frontend error in proxy phase: {err}");
                        }
                        break;
                    }
                }
                None => {
                    report_backend(&session);
                    break;
                }
            },
        }
    }

    session.frontend.close().await;
    session.backend.close().await;
}

/// Log a backend-side termination and evict the backend's connections on a
/// real fault, so sibling sessions reconnect elsewhere.
fn report_backend(session: &Established) {
    let err = session.backend.fault();
    if err.is_eof() {
        log::info!("backend closed connection");
    } else {
        log::error!("backend error in proxy phase: {err}");
        session.handle.fail();
    }
}
