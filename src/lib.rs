//! A reliable, ordered, flow-controlled session protocol on top of plain UDP.
//!
//! A connection is negotiated with a three-way handshake and then carries
//! application data in sequenced segments with an 8-bit wrapping sequence
//! number. Lost segments are retransmitted on a timer or on the peer's
//! explicit request, out-of-order arrivals are reordered before delivery, and
//! a sliding window plus a binary busy flag keep a fast sender from
//! overrunning a slow receiver. Keepalive segments and a silence deadline
//! detect a dead peer.
//!
//! The [`Server`] listens for handshake proposals; the [`Client`] connects to
//! one. Both sides end up with a [`Session`], which is the application-facing
//! surface: `send`, `recv`, `close`, and the connection health counters.
//!
//! ```no_run
//! # use rssi::{Client, RssiConfig, Server};
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::listen(RssiConfig::default(), "0.0.0.0:8198".parse()?).await?;
//! let client = Client::connect(RssiConfig::default(), "127.0.0.1:8198".parse()?).await?;
//! let session = server.accept().await?;
//!
//! client.send(b"hello").await?;
//! let received = session.recv().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod datagram;
pub mod error;
pub mod reorder;
pub mod segment;
pub mod send_window;
pub mod seq;
pub mod session;
pub mod timer;

pub use config::{RssiConfig, SessionParams};
pub use controller::{ConnState, SessionStats};
pub use error::RssiError;
pub use session::{Client, Server, Session};

#[cfg(test)]
mod tests {
    use ctor::ctor;

    #[ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    }
}
