use std::{cmp::Ordering, fmt};

/// Reciprocity score of a peer, built from the bytes exchanged with it.
///
/// A higher `received / sent` ratio ranks higher. A peer we have not sent
/// anything to yet ranks above every peer we have sent data to, and among
/// themselves such peers are ordered by `received`. Ratios are compared by
/// cross multiplication, equal ratios by total volume, so no division or
/// floating point is involved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rating {
    received: u64,
    sent: u64,
}

impl Rating {
    pub fn new(received: u64, sent: u64) -> Self {
        Self { received, sent }
    }

    /// Bytes received from the peer.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes sent to the peer.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn record_received(&mut self, bytes: u64) {
        self.received = self.received.saturating_add(bytes);
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.sent = self.sent.saturating_add(bytes);
    }

    fn volume(&self) -> u128 {
        self.received as u128 + self.sent as u128
    }
}

impl Ord for Rating {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.sent, other.sent) {
            (0, 0) => self.received.cmp(&other.received),
            (0, _) => Ordering::Greater,
            (_, 0) => Ordering::Less,
            (sent, other_sent) => {
                let lhs = self.received as u128 * other_sent as u128;
                let rhs = other.received as u128 * sent as u128;
                lhs.cmp(&rhs)
                    .then_with(|| self.volume().cmp(&other.volume()))
            }
        }
    }
}

impl PartialOrd for Rating {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rating(received={}, sent={})", self.received, self.sent)
    }
}

/// Picks the `slots` best rated peers to unchoke, best first.
///
/// Peers with equal ratings keep the order in which they were given.
pub fn select_unchoked<K: Clone>(candidates: &[(K, Rating)], slots: usize) -> Vec<K> {
    let mut ranked: Vec<&(K, Rating)> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(slots)
        .map(|(key, _)| key.clone())
        .collect()
}
