//! Connection lifecycle events emitted by the server.

use bytes::Bytes;

use crate::stats::ConnectionStats;

#[derive(Debug, Clone)]
pub struct RequestFailedEvent {
    pub connection_id: u64,
    pub method: String,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionClosedEvent {
    pub connection_id: u64,
    pub stats: ConnectionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelConnectOutcome {
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TunnelConnectEvent {
    pub proxy_chain_id: u64,
    pub outcome: TunnelConnectOutcome,
    pub status_code: u16,
    pub head: Bytes,
    pub custom_tag: Option<String>,
}

/// A single channel over every event kind the server emits. Subscribers
/// that only care about one kind filter in their own receive loop.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ConnectionClosed(ConnectionClosedEvent),
    RequestFailed(RequestFailedEvent),
    TunnelConnect(TunnelConnectEvent),
}

pub type EventSender = tokio::sync::broadcast::Sender<ProxyEvent>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<ProxyEvent>;

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_closed_is_observable_by_a_subscriber() {
        let (tx, mut rx) = channel(8);
        tx.send(ProxyEvent::ConnectionClosed(ConnectionClosedEvent {
            connection_id: 7,
            stats: ConnectionStats::default(),
        }))
        .unwrap();

        match rx.recv().await.unwrap() {
            ProxyEvent::ConnectionClosed(e) => assert_eq!(e.connection_id, 7),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
