// Reward policy: pure functions only, no database access.
// Everything here is deterministic given its inputs so it can be unit tested
// without a ReducerContext. All QOINZ amounts are integer minor units.

/// Platform fee charged on top of the entry fee when a table does not set one
pub const DEFAULT_PLATFORM_FEE: i64 = 10;

/// Number of paid tiers in the challenge: tiers 2 through 6 pay out.
/// Each payout is reward_amount / PAID_TIER_COUNT, so a member who climbs
/// every paid tier collects the full reward_amount.
pub const PAID_TIER_COUNT: i64 = 5;

/// Highest tier that pays a split reward (tiers 2..=MAX_REWARD_TIER)
pub const MAX_REWARD_TIER: u32 = 6;

/// Entry cost for joining a table: (entry_fee, platform_fee).
/// A non-positive platform fee on the table falls back to the default.
pub fn entry_cost(entry_fee: i64, platform_fee: i64) -> (i64, i64) {
    let platform = if platform_fee > 0 {
        platform_fee
    } else {
        DEFAULT_PLATFORM_FEE
    };
    (entry_fee, platform)
}

/// Per-member payout when a member advances into a paid tier.
/// Zero when the table has no configured reward.
pub fn tier_reward(reward_amount: i64) -> i64 {
    if reward_amount <= 0 {
        return 0;
    }
    reward_amount / PAID_TIER_COUNT
}

/// Whether a tier pays out at all
pub fn tier_is_paid(tier: u32) -> bool {
    (2..=MAX_REWARD_TIER).contains(&tier)
}

/// Per-seat experience share of a table's exp pool.
/// Granted once on join and once more when the table fills.
pub fn exp_share(exp_pool: u64, max_members: u32) -> u64 {
    if max_members == 0 {
        return 0;
    }
    exp_pool / max_members as u64
}

/// EXP needed to advance from `current_level` to the next level.
/// Base of 100 for level 1 -> 2, growing 50% per level.
pub fn exp_required_for_next(current_level: u32) -> u64 {
    (100.0 * 1.5f64.powi(current_level as i32 - 1)).floor() as u64
}

/// Table slots granted on reaching `level` (replaces the previous value)
pub fn slots_for_level(level: u32) -> u32 {
    level
}

/// Flat QOINZ bonus credited on every level-up
pub const LEVEL_UP_BONUS: i64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_cost_defaults_platform_fee() {
        assert_eq!(entry_cost(100, 25), (100, 25));
        assert_eq!(entry_cost(100, 0), (100, DEFAULT_PLATFORM_FEE));
        assert_eq!(entry_cost(100, -5), (100, DEFAULT_PLATFORM_FEE));
    }

    #[test]
    fn tier_reward_splits_across_paid_tiers() {
        // reward_amount 10 pays 2 per tier
        assert_eq!(tier_reward(10), 2);
        assert_eq!(tier_reward(100), 20);
        // Integer division drops the remainder
        assert_eq!(tier_reward(7), 1);
        // Unset or nonsense rewards pay nothing
        assert_eq!(tier_reward(0), 0);
        assert_eq!(tier_reward(-50), 0);
    }

    #[test]
    fn paid_tier_window() {
        assert!(!tier_is_paid(1)); // roots never pay
        assert!(tier_is_paid(2));
        assert!(tier_is_paid(MAX_REWARD_TIER));
        assert!(!tier_is_paid(MAX_REWARD_TIER + 1));
        // Exactly PAID_TIER_COUNT tiers pay
        let paid = (1..=20).filter(|t| tier_is_paid(*t)).count() as i64;
        assert_eq!(paid, PAID_TIER_COUNT);
    }

    #[test]
    fn exp_share_is_per_seat() {
        assert_eq!(exp_share(800, 8), 100);
        assert_eq!(exp_share(100, 8), 12);
        assert_eq!(exp_share(0, 8), 0);
        assert_eq!(exp_share(100, 0), 0);
    }

    #[test]
    fn exp_curve_grows_fifty_percent_per_level() {
        // floor(100 * 1.5^(level-1))
        assert_eq!(exp_required_for_next(1), 100);
        assert_eq!(exp_required_for_next(2), 150);
        assert_eq!(exp_required_for_next(3), 225);
        assert_eq!(exp_required_for_next(4), 337);
        // Strictly increasing across the whole seeded range
        for level in 1..50 {
            assert!(exp_required_for_next(level + 1) > exp_required_for_next(level));
        }
    }
}
