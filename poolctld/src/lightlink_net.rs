//! The real `LightLink`: one short-lived TCP connection to the
//! LUMIPLUS controller per command. Grounded on the connect/read-loop
//! shape in `drv_sump.rs`.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::warn;

use poolctl_api::lightlink::{LUMIPLUS_HOST, LUMIPLUS_PORT};
use poolctl_api::LightLink;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpLightLink {
    addr: String,
}

impl TcpLightLink {
    pub fn new() -> Self {
        TcpLightLink {
            addr: format!("{}:{}", LUMIPLUS_HOST, LUMIPLUS_PORT),
        }
    }
}

impl Default for TcpLightLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LightLink for TcpLightLink {
    async fn send(&self, command: [u8; 6]) -> bool {
        let attempt = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.write_all(&command).await?;

            let mut echo = [0u8; 6];
            stream.read_exact(&mut echo).await?;
            Ok::<[u8; 6], std::io::Error>(echo)
        };

        match timeout(IO_TIMEOUT, attempt).await {
            Ok(Ok(echo)) => echo == command,
            Ok(Err(e)) => {
                warn!(error = %e, "lumiplus link error");
                false
            }
            Err(_) => {
                warn!("lumiplus link timed out");
                false
            }
        }
    }
}
