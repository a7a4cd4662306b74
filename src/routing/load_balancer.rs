use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    NoAvailableCredential,
    NoAvailableAgent,
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceError::NoAvailableCredential => write!(f, "No available API key"),
            BalanceError::NoAvailableAgent => write!(f, "No available model agent"),
        }
    }
}

impl std::error::Error for BalanceError {}

// 权重为 0 时按 1 计，未配置权重即均匀随机
fn effective_weight(weight: u32) -> u64 {
    u64::from(weight.max(1))
}

/// 加权随机选择，候选为空时返回 None
pub fn pick_weighted<'a, T, R>(
    candidates: &'a [T],
    weight_of: impl Fn(&T) -> u32,
    rng: &mut R,
) -> Option<&'a T>
where
    R: Rng + ?Sized,
{
    if candidates.is_empty() {
        return None;
    }
    let total: u64 = candidates.iter().map(|c| effective_weight(weight_of(c))).sum();
    let mut point = rng.random_range(0..total);
    for candidate in candidates {
        let w = effective_weight(weight_of(candidate));
        if point < w {
            return Some(candidate);
        }
        point -= w;
    }
    candidates.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn empty_candidates_yield_none() {
        let mut rng = StdRng::seed_from_u64(7);
        let empty: [u32; 0] = [];
        assert!(pick_weighted(&empty, |w| *w, &mut rng).is_none());
    }

    #[test]
    fn single_candidate_always_selected() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(pick_weighted(&[("only", 3u32)], |c| c.1, &mut rng).unwrap().0, "only");
        }
    }

    #[test]
    fn selection_follows_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let items = [("heavy", 9u32), ("light", 1u32)];
        let mut heavy = 0;
        for _ in 0..10_000 {
            if pick_weighted(&items, |c| c.1, &mut rng).unwrap().0 == "heavy" {
                heavy += 1;
            }
        }
        // 期望约 9000
        assert!((8500..=9500).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn zero_weights_behave_uniformly() {
        let mut rng = StdRng::seed_from_u64(1);
        let items = [("a", 0u32), ("b", 0u32)];
        let mut a = 0;
        for _ in 0..10_000 {
            if pick_weighted(&items, |c| c.1, &mut rng).unwrap().0 == "a" {
                a += 1;
            }
        }
        assert!((4500..=5500).contains(&a), "a picked {a} times");
    }
}
