use chorus_proto::ClientMessage;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Outbound half of the signaling relay. Delivery is fire-and-forget; the
/// relay channel is ordered, so messages to one target arrive in send order.
pub trait RelaySink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError>;
}

impl RelaySink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| TransportError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: &dyn RelaySink = &tx;
        sink.send(ClientMessage::Join {
            display_name: "Alice".into(),
        })
        .unwrap();

        drop(rx);
        let err = sink
            .send(ClientMessage::Chat {
                sender_name: "Alice".into(),
                text: "hi".into(),
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelClosed));
    }
}
