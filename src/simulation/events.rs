use std::sync::Mutex;

use log::{error, trace, warn};
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;

use crate::api::central_event::CentralEvent;
use crate::lock;

/// Outbound side of the engine: every asynchronous event ends up on the
/// channel of the attached client, if there is one.
#[derive(Debug, Default)]
pub(crate) struct EventSink {
    sender: Mutex<Option<Sender<CentralEvent>>>,
}

impl EventSink {
    pub(crate) fn attach(&self, sender: Sender<CentralEvent>) {
        *lock(&self.sender) = Some(sender);
    }

    pub(crate) fn detach(&self) {
        lock(&self.sender).take();
    }

    /// Never waits: events that do not fit are dropped with a warning.
    pub(crate) fn publish(&self, event: CentralEvent) {
        let Some(sender) = lock(&self.sender).clone() else {
            trace!("No client attached, dropping {:?}", event);
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Client event channel is full, dropping {:?}", event)
            }
            Err(TrySendError::Closed(event)) => {
                error!("Error sending central event {:?}: channel closed", event)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::central_event::AdapterState;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publishes_only_while_attached() {
        let sink = EventSink::default();
        let (tx, mut rx) = mpsc::channel(4);

        sink.publish(CentralEvent::StateUpdate {
            state: AdapterState::PoweredOff,
        });
        sink.attach(tx);
        sink.publish(CentralEvent::StateUpdate {
            state: AdapterState::PoweredOn,
        });
        sink.detach();
        sink.publish(CentralEvent::StateUpdate {
            state: AdapterState::Resetting,
        });

        assert!(matches!(
            rx.recv().await,
            Some(CentralEvent::StateUpdate {
                state: AdapterState::PoweredOn
            })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let sink = EventSink::default();
        let (tx, mut rx) = mpsc::channel(1);
        sink.attach(tx);
        for _ in 0..3 {
            sink.publish(CentralEvent::StateUpdate {
                state: AdapterState::PoweredOn,
            });
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
