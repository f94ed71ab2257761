//! adb-bridge: host side of an authenticated device session and its reverse tunnels
//!
//! ## Architecture
//!
//! ```text
//! CredentialStore ──> AuthenticationParticipant ──> (device transport / session)
//!                                                          │ channel per connection
//! local listener ──> ForwardServer ──> RelayEndpoint <─────┘
//! ```
//!
//! - **credentials**: RSA identity generation, persistence (`~/.android/adbkey`)
//!   and challenge signing
//! - **auth**: the host's half of the challenge/response handshake
//! - **relay**: back-pressured byte pumps between a local connection and a
//!   device channel
//! - **forward**: `<local> -> <service>` rules and the accept loop
//!
//! The USB transport and the packet-level session multiplexer are not part of
//! this crate; they plug in through [`auth::AuthTransport`] and
//! [`forward::ChannelOpener`].

pub mod auth;
pub mod config;
pub mod credentials;
pub mod forward;
pub mod relay;

pub use auth::{AuthError, AuthTransport, Authenticated, AuthenticationParticipant, Verdict};
pub use config::Config;
pub use credentials::{Challenge, CredentialError, CredentialStore, KeyMaterial, Keyring, Signature};
pub use forward::{ChannelOpener, ForwardRule, ForwardServer, TcpChannelOpener};
pub use relay::{relay, ChannelHandler, RelayEndpoint, RelayError, RelayStats};
