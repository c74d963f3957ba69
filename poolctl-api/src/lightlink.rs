//! The network link to the LUMIPLUS light controller. `spec.md` §4.12
//! and §6: a 6-byte command is sent over TCP and the link is
//! considered successful iff the controller echoes the same 6 bytes.

use async_trait::async_trait;

pub const LUMIPLUS_HOST: &str = "192.168.2.1";
pub const LUMIPLUS_PORT: u16 = 123;

#[async_trait]
pub trait LightLink: Send + Sync {
    /// Sends a 6-byte LUMIPLUS command and returns `true` iff the
    /// controller echoed it back before the socket timed out.
    async fn send(&self, command: [u8; 6]) -> bool;
}
