//! Request correlation and stream demultiplexing.
//!
//! One [`Router`] per connection, fed exclusively by the background reader.
//! Calls are matched to replies purely by id, so reply arrival order is
//! irrelevant. Stream events are forwarded per operation id in arrival
//! order; a terminal event auto-unregisters its consumer.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use sandbox_proto::{Response, StreamEvent};

use crate::error::Error;

pub(crate) type ReplyResult = Result<Response, Error>;

pub(crate) struct Router {
    pending: HashMap<u32, oneshot::Sender<ReplyResult>>,
    streams: HashMap<u32, mpsc::UnboundedSender<StreamEvent>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Register a pending call and return the receiver its reply resolves.
    pub(crate) fn register_call(&mut self, id: u32) -> oneshot::Receiver<ReplyResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    /// Drop a pending call (deadline expiry, failed write). A reply arriving
    /// later for this id is dropped silently by [`resolve`](Self::resolve).
    pub(crate) fn discard_call(&mut self, id: u32) {
        self.pending.remove(&id);
    }

    /// Resolve a pending call. Returns `false` if no call is registered under
    /// this id (late reply after expiry or discard); the frame is dropped.
    pub(crate) fn resolve(&mut self, id: u32, result: ReplyResult) -> bool {
        match self.pending.remove(&id) {
            Some(tx) => {
                // A dropped receiver means the caller gave up between expiry
                // and removal; nothing left to do.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Register a stream consumer for an operation id.
    pub(crate) fn register_stream(&mut self, id: u32) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id, tx);
        rx
    }

    pub(crate) fn unregister_stream(&mut self, id: u32) {
        self.streams.remove(&id);
    }

    /// Forward a stream event to its consumer. A terminal event removes the
    /// registration after delivery. Returns `false` for unknown operation ids
    /// (e.g. a detached consumer); such events are dropped, not errors.
    pub(crate) fn route_event(&mut self, id: u32, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        match self.streams.get(&id) {
            Some(tx) => {
                let delivered = tx.send(event).is_ok();
                if terminal || !delivered {
                    self.streams.remove(&id);
                }
                delivered
            }
            None => false,
        }
    }

    /// Fail every pending call with a fresh error and terminate every stream.
    /// Used on connection loss, explicit close, and daemon `bye`.
    pub(crate) fn fail_all(&mut self, mut make_err: impl FnMut() -> Error) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(make_err()));
        }
        // Dropping the senders ends each consumer's stream.
        self.streams.clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn stream_len(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_by_id_regardless_of_order() {
        let mut router = Router::new();
        let rx1 = router.register_call(1);
        let rx2 = router.register_call(2);
        let rx3 = router.register_call(3);

        // Replies arrive in reverse order.
        assert!(router.resolve(3, Ok(Response::Bool(true))));
        assert!(router.resolve(1, Ok(Response::Ok)));
        assert!(router.resolve(2, Ok(Response::Data(b"x".to_vec()))));

        assert!(matches!(rx1.await.unwrap(), Ok(Response::Ok)));
        assert!(matches!(rx2.await.unwrap(), Ok(Response::Data(_))));
        assert!(matches!(rx3.await.unwrap(), Ok(Response::Bool(true))));
    }

    #[tokio::test]
    async fn late_reply_is_dropped() {
        let mut router = Router::new();
        let rx = router.register_call(7);
        router.discard_call(7);
        assert!(!router.resolve(7, Ok(Response::Ok)));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn exactly_one_resolution() {
        let mut router = Router::new();
        let rx = router.register_call(1);
        assert!(router.resolve(1, Ok(Response::Ok)));
        // Second resolution finds nothing to resolve.
        assert!(!router.resolve(1, Ok(Response::Bool(false))));
        assert!(matches!(rx.await.unwrap(), Ok(Response::Ok)));
    }

    #[tokio::test]
    async fn stream_events_in_order_until_terminal() {
        let mut router = Router::new();
        let mut rx = router.register_stream(5);

        assert!(router.route_event(5, StreamEvent::Started { pid: 9 }));
        assert!(router.route_event(5, StreamEvent::Stdout(b"a".to_vec())));
        assert!(router.route_event(
            5,
            StreamEvent::End {
                exit_code: Some(0),
                error: None,
            }
        ));
        // Terminal event auto-unregistered the consumer.
        assert_eq!(router.stream_len(), 0);
        assert!(!router.route_event(5, StreamEvent::Stdout(b"late".to_vec())));

        assert!(matches!(rx.recv().await, Some(StreamEvent::Started { pid: 9 })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Stdout(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::End { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_operation_id_dropped() {
        let mut router = Router::new();
        assert!(!router.route_event(99, StreamEvent::Stdout(b"x".to_vec())));
    }

    #[tokio::test]
    async fn dropped_consumer_is_pruned() {
        let mut router = Router::new();
        let rx = router.register_stream(4);
        drop(rx);
        assert!(!router.route_event(4, StreamEvent::Stdout(b"x".to_vec())));
        assert_eq!(router.stream_len(), 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_pending_and_ends_streams() {
        let mut router = Router::new();
        let rx_call = router.register_call(1);
        let mut rx_stream = router.register_stream(2);

        router.fail_all(|| Error::ConnectionClosed);

        assert!(matches!(rx_call.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(rx_stream.recv().await.is_none());
        assert_eq!(router.pending_len(), 0);
        assert_eq!(router.stream_len(), 0);
    }
}
