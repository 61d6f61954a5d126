//! Dispatch policies for assigning jobs to workers.

use rand::Rng;

/// Anything a balancer can pick from.
pub trait Dispatchable {
    fn weight(&self) -> u32;
}

/// Job-to-worker dispatch policy.
///
/// Choosing from an empty candidate list is a programming error and
/// panics rather than producing a runtime error.
#[derive(Debug, Clone)]
pub enum Balancer {
    /// Uniformly random pick.
    Random,
    /// Cycles through the candidates with a monotonic position counter.
    RoundRobin { pos: usize },
    /// Round-robin over candidates repeated `weight()` times each.
    WeightedRoundRobin { pos: usize },
}

impl Balancer {
    pub fn random() -> Self {
        Balancer::Random
    }

    pub fn round_robin() -> Self {
        Balancer::RoundRobin { pos: 0 }
    }

    pub fn weighted_round_robin() -> Self {
        Balancer::WeightedRoundRobin { pos: 0 }
    }

    /// Returns the index of the chosen candidate.
    pub fn choose<T: Dispatchable>(&mut self, items: &[T]) -> usize {
        assert!(!items.is_empty(), "balancer needs at least one candidate");
        match self {
            Balancer::Random => rand::thread_rng().gen_range(0..items.len()),
            Balancer::RoundRobin { pos } => {
                *pos += 1;
                *pos % items.len()
            }
            Balancer::WeightedRoundRobin { pos } => {
                let expanded: Vec<usize> = items
                    .iter()
                    .enumerate()
                    .flat_map(|(index, item)| {
                        std::iter::repeat(index).take(item.weight() as usize)
                    })
                    .collect();
                assert!(
                    !expanded.is_empty(),
                    "weighted balancer needs at least one nonzero weight"
                );
                *pos += 1;
                expanded[*pos % expanded.len()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item(u32);

    impl Dispatchable for Item {
        fn weight(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn round_robin_is_fair_over_full_cycles() {
        let items = vec![Item(1), Item(1), Item(1)];
        let mut balancer = Balancer::round_robin();
        let mut counts = [0usize; 3];
        for _ in 0..12 {
            counts[balancer.choose(&items)] += 1;
        }
        assert_eq!(counts, [4, 4, 4]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let items = vec![Item(1), Item(1)];
        let mut balancer = Balancer::random();
        for _ in 0..100 {
            assert!(balancer.choose(&items) < items.len());
        }
    }

    #[test]
    fn weighted_round_robin_respects_weights() {
        let items = vec![Item(3), Item(1)];
        let mut balancer = Balancer::weighted_round_robin();
        let mut counts = [0usize; 2];
        for _ in 0..8 {
            counts[balancer.choose(&items)] += 1;
        }
        assert_eq!(counts, [6, 2]);
    }

    #[test]
    #[should_panic(expected = "at least one candidate")]
    fn empty_candidates_panic() {
        let items: Vec<Item> = Vec::new();
        Balancer::round_robin().choose(&items);
    }
}
