pub mod config;
pub mod core;
/// Portera - connection-routing proxy for PostgreSQL streaming-replication
/// deployments
///
/// Portera exposes two TCP listeners. The primary endpoint always routes to
/// the one backend currently serving as the replication primary; when no
/// primary is known it refuses service so applications fail fast instead of
/// silently landing on a read-only replica. The follower endpoint routes to
/// an available replica, preferring the one with the lowest measured
/// health-check latency.
///
/// Two proxy variants are built in:
/// 1. Protocol-aware (default): frames the PostgreSQL v3 protocol and
///    man-in-the-middles the authentication handshake, rewriting MD5
///    challenges into cleartext requests.
/// 2. Byte-splice (`splice` feature): plain bidirectional TCP forwarding.
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
