/// Core connection plumbing shared by both proxy variants
pub mod connection;
pub mod relay;
pub mod session;

pub use connection::FramedConnection;
