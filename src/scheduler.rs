//! Priority scheduler: picks the queue a worker polls next
//!
//! Classes are served by smooth weighted round robin over their weights, so
//! under saturation the poll share converges to the weight ratio while low
//! classes are still visited every cycle. Queues inside a class are served
//! round robin.

use crate::config::PriorityWeights;
use crate::envelope::PriorityClass;

#[derive(Debug, Clone)]
struct ClassRing {
    class: PriorityClass,
    weight: i64,
    current: i64,
    queues: Vec<String>,
    cursor: usize,
}

impl ClassRing {
    fn advance(&mut self) -> usize {
        let index = self.cursor % self.queues.len();
        self.cursor = (index + 1) % self.queues.len();
        index
    }
}

/// Weighted poll order across priority classes
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    rings: Vec<ClassRing>,
}

impl PriorityScheduler {
    /// Create a scheduler over `(queue, class)` pairs; duplicates are ignored
    pub fn new(
        weights: PriorityWeights,
        queues: impl IntoIterator<Item = (String, PriorityClass)>,
    ) -> Self {
        let mut rings: Vec<ClassRing> = PriorityClass::ALL
            .iter()
            .map(|class| ClassRing {
                class: *class,
                weight: i64::from(weights.weight(*class).max(1)),
                current: 0,
                queues: Vec::new(),
                cursor: 0,
            })
            .collect();

        for (queue, class) in queues {
            if let Some(ring) = rings.iter_mut().find(|r| r.class == class) {
                if !ring.queues.contains(&queue) {
                    ring.queues.push(queue);
                }
            }
        }
        rings.retain(|r| !r.queues.is_empty());

        Self { rings }
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    /// Every queue known to the scheduler
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.rings
            .iter()
            .flat_map(|r| r.queues.iter().map(String::as_str))
    }

    /// Next queue to poll
    pub fn next_queue(&mut self) -> Option<String> {
        let ring = self.next_ring()?;
        let index = self.rings[ring].advance();
        Some(self.rings[ring].queues[index].clone())
    }

    /// Poll order for one lease attempt: the scheduled queue first, then the
    /// remaining queues highest class first, so an empty scheduled queue never
    /// idles a slot while other queues hold work
    pub fn next_cycle(&mut self) -> Vec<String> {
        let Some(first) = self.next_queue() else {
            return Vec::new();
        };

        let mut order = Vec::with_capacity(self.queues().count());
        order.push(first);
        for ring in &self.rings {
            let len = ring.queues.len();
            for offset in 0..len {
                let queue = &ring.queues[(ring.cursor + offset) % len];
                if !order.contains(queue) {
                    order.push(queue.clone());
                }
            }
        }
        order
    }

    // Smooth weighted round robin: every ring gains its weight, the leader is
    // picked and pays back the total. Ties go to the higher class.
    fn next_ring(&mut self) -> Option<usize> {
        if self.rings.is_empty() {
            return None;
        }

        let total: i64 = self.rings.iter().map(|r| r.weight).sum();
        for ring in self.rings.iter_mut() {
            ring.current += ring.weight;
        }
        let mut best = 0;
        for i in 1..self.rings.len() {
            if self.rings[i].current > self.rings[best].current {
                best = i;
            }
        }
        self.rings[best].current -= total;
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn three_classes() -> PriorityScheduler {
        PriorityScheduler::new(
            PriorityWeights::default(),
            [
                ("h".to_string(), PriorityClass::High),
                ("d".to_string(), PriorityClass::Default),
                ("l".to_string(), PriorityClass::Low),
            ],
        )
    }

    #[test]
    fn test_weighted_round_robin_converges_to_ratio() {
        let mut scheduler = three_classes();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..7_000 {
            *counts.entry(scheduler.next_queue().unwrap()).or_default() += 1;
        }
        assert_eq!(counts["h"], 4_000);
        assert_eq!(counts["d"], 2_000);
        assert_eq!(counts["l"], 1_000);
    }

    #[test]
    fn test_low_class_served_every_cycle() {
        let mut scheduler = three_classes();
        for _ in 0..100 {
            let cycle: Vec<String> = (0..7).map(|_| scheduler.next_queue().unwrap()).collect();
            assert_eq!(cycle.iter().filter(|q| *q == "l").count(), 1);
            assert_eq!(cycle.iter().filter(|q| *q == "h").count(), 4);
        }
    }

    #[test]
    fn test_round_robin_within_class() {
        let mut scheduler = PriorityScheduler::new(
            PriorityWeights::default(),
            [
                ("a".to_string(), PriorityClass::High),
                ("b".to_string(), PriorityClass::High),
                ("c".to_string(), PriorityClass::High),
            ],
        );
        let picks: Vec<String> = (0..6).map(|_| scheduler.next_queue().unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_missing_classes_are_skipped() {
        let mut scheduler = PriorityScheduler::new(
            PriorityWeights::default(),
            [("l".to_string(), PriorityClass::Low)],
        );
        for _ in 0..10 {
            assert_eq!(scheduler.next_queue().as_deref(), Some("l"));
        }
    }

    #[test]
    fn test_empty_scheduler() {
        let mut scheduler = PriorityScheduler::new(PriorityWeights::default(), []);
        assert!(scheduler.is_empty());
        assert!(scheduler.next_queue().is_none());
        assert!(scheduler.next_cycle().is_empty());
    }

    #[test]
    fn test_duplicate_queues_ignored() {
        let scheduler = PriorityScheduler::new(
            PriorityWeights::default(),
            [
                ("a".to_string(), PriorityClass::Default),
                ("a".to_string(), PriorityClass::Default),
            ],
        );
        assert_eq!(scheduler.queues().count(), 1);
    }

    #[test]
    fn test_next_cycle_covers_every_queue_once() {
        let mut scheduler = three_classes();
        for _ in 0..14 {
            let cycle = scheduler.next_cycle();
            assert_eq!(cycle.len(), 3);
            let mut sorted = cycle.clone();
            sorted.sort();
            assert_eq!(sorted, vec!["d", "h", "l"]);
        }
    }

    #[test]
    fn test_custom_weights() {
        let mut scheduler = PriorityScheduler::new(
            PriorityWeights {
                high: 1,
                default: 1,
                low: 1,
            },
            [
                ("h".to_string(), PriorityClass::High),
                ("l".to_string(), PriorityClass::Low),
            ],
        );
        let picks: Vec<String> = (0..4).map(|_| scheduler.next_queue().unwrap()).collect();
        assert_eq!(picks, vec!["h", "l", "h", "l"]);
    }

    proptest! {
        #[test]
        fn prop_every_period_matches_weights(
            high in 1u32..10,
            default in 1u32..10,
            low in 1u32..10,
            periods in 1usize..20,
        ) {
            let mut scheduler = PriorityScheduler::new(
                PriorityWeights { high, default, low },
                [
                    ("h".to_string(), PriorityClass::High),
                    ("d".to_string(), PriorityClass::Default),
                    ("l".to_string(), PriorityClass::Low),
                ],
            );
            let period = (high + default + low) as usize;
            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..period * periods {
                *counts.entry(scheduler.next_queue().unwrap()).or_default() += 1;
            }
            prop_assert_eq!(counts["h"], high as usize * periods);
            prop_assert_eq!(counts["d"], default as usize * periods);
            prop_assert_eq!(counts["l"], low as usize * periods);
        }
    }
}
