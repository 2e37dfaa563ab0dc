//! Observe relations (RFC 7641).
//!
//! A relation is a long-lived exchange: the matcher keeps delivering
//! notifications for its token instead of completing it. Ordering uses the
//! RFC 7641 §3.4 freshness rule; anything stale is dropped before it
//! reaches the subscriber.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::exchange::Response;
use crate::message::uri::CoapUri;

/// Sequence numbers are 24 bits; half the space is the reorder window.
const SEQUENCE_WINDOW: u32 = 1 << 23;

/// The RFC 7641 §3.4 freshness predicate: is the notification `(v2, t2)`
/// newer than the one last accepted at `(v1, t1)`?
pub fn is_fresher(v1: u32, t1: Instant, v2: u32, t2: Instant, max_age: Duration) -> bool {
    (v1 < v2 && v2 - v1 < SEQUENCE_WINDOW)
        || (v1 > v2 && v1 - v2 > SEQUENCE_WINDOW)
        || t2 > t1 + max_age
}

/// Per-relation ordering and reregistration bookkeeping, updated by the
/// matcher as notifications arrive.
#[derive(Debug, Clone)]
pub(crate) struct ObserveState {
    last_sequence: Option<u32>,
    last_arrival: Instant,
    /// Notifications delivered since the last (re)registration.
    pub delivered: u32,
    max_age: Duration,
}

impl ObserveState {
    pub fn new(max_age: Duration) -> ObserveState {
        ObserveState {
            last_sequence: None,
            last_arrival: Instant::now(),
            delivered: 0,
            max_age,
        }
    }

    /// Applies the freshness filter to an arriving sequence number and,
    /// when it passes, adopts it as the newest seen.
    pub fn accept(&mut self, sequence: u32) -> bool {
        let now = Instant::now();
        let fresh = match self.last_sequence {
            None => true,
            Some(last) => is_fresher(last, self.last_arrival, sequence, now, self.max_age),
        };

        if fresh {
            self.last_sequence = Some(sequence);
            self.last_arrival = now;
            self.delivered += 1;
        }
        fresh
    }

    /// How long since the last accepted notification (or registration).
    pub fn idle_for(&self) -> Duration {
        self.last_arrival.elapsed()
    }

    /// Resets the delivery counter after a reregistration.
    pub fn reregistered(&mut self) {
        self.delivered = 0;
        self.last_arrival = Instant::now();
    }
}

/// A live observation, yielding notifications as a stream.
///
/// Dropping the relation is the reactive cancel: delivery stops, the
/// exchange is reclaimed, and the server's next notification is answered
/// with RST by the matcher. [`crate::CoAPClient::cancel_observe`] is the
/// proactive variant.
pub struct ObserveRelation {
    token: Vec<u8>,
    uri: CoapUri,
    rx: mpsc::Receiver<crate::error::Result<Response>>,
}

impl ObserveRelation {
    pub(crate) fn new(
        token: Vec<u8>,
        uri: CoapUri,
        rx: mpsc::Receiver<crate::error::Result<Response>>,
    ) -> ObserveRelation {
        ObserveRelation { token, uri, rx }
    }

    /// The token correlating every notification of this relation.
    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// The observed resource.
    pub fn uri(&self) -> &CoapUri {
        &self.uri
    }

    /// Waits for the next notification.
    pub async fn next_notification(&mut self) -> Option<Result<Response, Error>> {
        self.rx.recv().await
    }
}

impl Stream for ObserveRelation {
    type Item = Result<Response, Error>;

    fn poll_next(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(ctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    const MAX_AGE: Duration = Duration::from_secs(128);

    #[test]
    fn test_increasing_sequence_is_fresh() {
        let t = now();
        assert!(is_fresher(5, t, 6, t, MAX_AGE));
        assert!(is_fresher(0, t, 1, t, MAX_AGE));
    }

    #[test]
    fn test_stale_sequence_is_dropped() {
        let t = now();
        assert!(!is_fresher(6, t, 4, t, MAX_AGE));
        assert!(!is_fresher(5, t, 5, t, MAX_AGE));
    }

    #[test]
    fn test_wraparound_is_fresh() {
        let t = now();
        // A small value right after the 24-bit space wrapped.
        let near_top = (1 << 24) - 10;
        assert!(is_fresher(near_top, t, 3, t, MAX_AGE));
        // But a jump further than half the space is reordering, not wrap.
        assert!(!is_fresher(0, t, SEQUENCE_WINDOW, t, MAX_AGE));
    }

    #[test]
    fn test_age_overrides_sequence() {
        let t1 = now() - Duration::from_secs(200);
        // Sequence went backwards, but the previous value aged out.
        assert!(is_fresher(10, t1, 2, now(), MAX_AGE));
    }

    #[test]
    fn test_state_filters_reordered_notifications() {
        let mut state = ObserveState::new(MAX_AGE);
        assert!(state.accept(5));
        assert!(state.accept(6));
        assert!(!state.accept(4));
        assert_eq!(state.delivered, 2);
    }

    #[test]
    fn test_state_counts_reset_on_reregistration() {
        let mut state = ObserveState::new(MAX_AGE);
        state.accept(1);
        state.accept(2);
        assert_eq!(state.delivered, 2);
        state.reregistered();
        assert_eq!(state.delivered, 0);
        assert!(state.accept(3));
    }

    #[test]
    fn test_first_notification_always_accepted() {
        let mut state = ObserveState::new(MAX_AGE);
        assert!(state.accept(0));
    }
}
