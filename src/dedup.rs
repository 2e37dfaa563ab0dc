//! Duplicate suppression for inbound messages.
//!
//! Mark-and-Sweep: every inbound CON/NON is recorded under `(peer, mid)`
//! together with whatever reply we sent for it. A second arrival inside
//! `exchangeLifetime` replays the cached reply instead of reaching the
//! matcher. The endpoint driver calls [`Deduplicator::sweep`] every
//! `markAndSweepInterval`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use crate::message::Message;

struct DedupEntry {
    /// The ACK or response previously sent for this message; a tombstone
    /// (`None`) still suppresses delivery.
    reply: Option<Message>,
    inserted: Instant,
}

/// Verdict for one inbound confirmable or non-confirmable message.
pub enum DedupStatus {
    /// First sighting inside the window; deliver to the matcher.
    New,
    /// Seen before; replay the cached reply (if any) and drop.
    Duplicate(Option<Message>),
}

pub struct Deduplicator {
    entries: HashMap<(SocketAddr, u16), DedupEntry>,
    lifetime: Duration,
}

impl Deduplicator {
    pub fn new(lifetime: Duration) -> Deduplicator {
        Deduplicator {
            entries: HashMap::new(),
            lifetime,
        }
    }

    /// Records a sighting of `(peer, mid)` and says whether it is new.
    pub fn witness(&mut self, peer: SocketAddr, mid: u16) -> DedupStatus {
        let now = Instant::now();
        match self.entries.get(&(peer, mid)) {
            Some(entry) if now.duration_since(entry.inserted) < self.lifetime => {
                debug!("duplicate message {} from {}", mid, peer);
                DedupStatus::Duplicate(entry.reply.clone())
            }
            _ => {
                self.entries.insert(
                    (peer, mid),
                    DedupEntry {
                        reply: None,
                        inserted: now,
                    },
                );
                DedupStatus::New
            }
        }
    }

    /// Attaches the reply sent for `(peer, mid)` so duplicates can replay it.
    pub fn record_reply(&mut self, peer: SocketAddr, mid: u16, reply: Message) {
        if let Some(entry) = self.entries.get_mut(&(peer, mid)) {
            entry.reply = Some(reply);
        }
    }

    /// Discards entries older than the exchange lifetime.
    pub fn sweep(&mut self) {
        let lifetime = self.lifetime;
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted) < lifetime);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("deduplicator swept {} stale entries", evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
