//! In-memory endpoint pair over tokio channels

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::PacketEndpoint;
use crate::error::{Error, Result};

/// One end of an in-memory link. Whatever one end sends, the other receives.
#[derive(Debug)]
pub struct ChannelEndpoint {
    name: String,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create two linked endpoints. Dropping either makes the other report
/// [`Error::EndpointClosed`] once its queue is drained.
pub fn channel_pair(a: &str, b: &str, capacity: usize) -> (ChannelEndpoint, ChannelEndpoint) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        ChannelEndpoint {
            name: a.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        ChannelEndpoint {
            name: b.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

#[async_trait]
impl PacketEndpoint for ChannelEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::closed(&self.name, "peer end dropped"))
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| Error::closed(&self.name, "peer end dropped"))
    }
}
