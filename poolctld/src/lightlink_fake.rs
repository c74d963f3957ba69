//! An in-memory `LightLink` that always echoes the command it's given,
//! so `LightsAlgorithm` can be exercised without a real LUMIPLUS
//! controller on the network.

use std::sync::Mutex;

use async_trait::async_trait;

use poolctl_api::LightLink;

#[derive(Default)]
pub struct FakeLightLink {
    sent: Mutex<Vec<[u8; 6]>>,
    fail_next: Mutex<bool>,
}

impl FakeLightLink {
    pub fn new() -> Self {
        FakeLightLink::default()
    }

    pub fn sent_commands(&self) -> Vec<[u8; 6]> {
        self.sent.lock().unwrap().clone()
    }

    /// Makes the next `send` report failure, as if the echo hadn't
    /// matched.
    pub fn fail_next_send(&self) {
        *self.fail_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl LightLink for FakeLightLink {
    async fn send(&self, command: [u8; 6]) -> bool {
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            return false;
        }
        drop(fail);
        self.sent.lock().unwrap().push(command);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_every_successfully_sent_command() {
        let link = FakeLightLink::new();
        assert!(link.send([3, 0, 0, 0, 0, 0]).await);
        assert_eq!(link.sent_commands(), vec![[3, 0, 0, 0, 0, 0]]);
    }

    #[tokio::test]
    async fn fail_next_send_reports_failure_once() {
        let link = FakeLightLink::new();
        link.fail_next_send();
        assert!(!link.send([1, 0, 0, 0, 0, 0]).await);
        assert!(link.send([1, 0, 0, 0, 0, 0]).await);
        assert_eq!(link.sent_commands().len(), 1);
    }
}
