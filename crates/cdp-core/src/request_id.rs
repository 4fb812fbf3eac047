use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues the request identifiers that join the proxy, bus, and body store.
/// Ids are the wall-clock nanosecond reading forced strictly increasing, so
/// concurrent allocations within one process can never collide.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last_issued: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let now = unix_nanos_now();
        let previous = self
            .last_issued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|value| value);
        let issued = now.max(previous.saturating_add(1));
        format!("ID-{issued}")
    }
}

fn unix_nanos_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::RequestIdGenerator;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_carry_the_stable_prefix() {
        let ids = RequestIdGenerator::new();
        let id = ids.next_id();
        assert!(id.starts_with("ID-"), "unexpected id form: {id}");
        id[3..].parse::<u64>().expect("numeric suffix");
    }

    #[test]
    fn ids_increase_monotonically() {
        let ids = RequestIdGenerator::new();
        let mut previous = 0_u64;
        for _ in 0..1000 {
            let id = ids.next_id();
            let value = id[3..].parse::<u64>().expect("numeric suffix");
            assert!(value > previous, "{value} did not advance past {previous}");
            previous = value;
        }
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let ids = Arc::new(RequestIdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| ids.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("allocator thread join") {
                assert!(seen.insert(id.clone()), "duplicate request id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
