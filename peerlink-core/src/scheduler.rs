//! Chunk scheduler: pick which chunks to request next within the concurrency window, detect timeouts.

use std::collections::HashMap;

use crate::chunk::ChunkSet;

/// Outstanding chunk request (or unacknowledged chunk send on the upload side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Clock value (ms) when the request or send was last issued.
    pub issued_at: u64,
    /// Number of times this chunk has been issued.
    pub attempts: u32,
}

/// Next missing chunks to request, lowest index first, so that at most `max_concurrent` are in flight.
pub fn next_requests(
    chunks: &ChunkSet,
    in_flight: &HashMap<u32, InFlight>,
    max_concurrent: usize,
) -> Vec<u32> {
    let slots = max_concurrent.max(1).saturating_sub(in_flight.len());
    chunks
        .missing()
        .filter(|i| !in_flight.contains_key(i))
        .take(slots)
        .collect()
}

/// Chunks whose last issue is at least `timeout_ms` old, ascending.
pub fn timed_out(in_flight: &HashMap<u32, InFlight>, now_ms: u64, timeout_ms: u64) -> Vec<u32> {
    let mut out: Vec<u32> = in_flight
        .iter()
        .filter(|(_, f)| now_ms.saturating_sub(f.issued_at) >= timeout_ms)
        .map(|(&i, _)| i)
        .collect();
    out.sort_unstable();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued(at: u64) -> InFlight {
        InFlight {
            issued_at: at,
            attempts: 1,
        }
    }

    #[test]
    fn fills_window_with_lowest_missing() {
        let mut set = ChunkSet::new(10);
        set.insert(0);
        set.insert(2);
        let in_flight = HashMap::new();
        assert_eq!(next_requests(&set, &in_flight, 3), vec![1, 3, 4]);
    }

    #[test]
    fn respects_in_flight() {
        let set = ChunkSet::new(10);
        let mut in_flight = HashMap::new();
        in_flight.insert(0, issued(0));
        in_flight.insert(1, issued(0));
        assert_eq!(next_requests(&set, &in_flight, 3), vec![2]);
        in_flight.insert(2, issued(0));
        assert!(next_requests(&set, &in_flight, 3).is_empty());
    }

    #[test]
    fn zero_window_still_makes_progress() {
        let set = ChunkSet::new(2);
        assert_eq!(next_requests(&set, &HashMap::new(), 0), vec![0]);
    }

    #[test]
    fn complete_set_requests_nothing() {
        let set = ChunkSet::from_completed(2, [0, 1]);
        assert!(next_requests(&set, &HashMap::new(), 4).is_empty());
    }

    #[test]
    fn timeouts() {
        let mut in_flight = HashMap::new();
        in_flight.insert(4, issued(100));
        in_flight.insert(1, issued(0));
        in_flight.insert(2, issued(500));
        assert_eq!(timed_out(&in_flight, 1_000, 900), vec![1, 4]);
        assert!(timed_out(&in_flight, 1_000, 5_000).is_empty());
    }
}
