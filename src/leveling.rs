// Leveling engine: experience accumulation with cascading level-ups.
// The cascade itself is a pure function over the level_reward catalog so the
// boundary math is testable without a ReducerContext; grant_experience applies
// the outcome to the account and routes every side effect through the ledger.

use spacetimedb::{reducer, ReducerContext, Table};

use crate::{
    achievement, authorized_worker, level_reward, user_account, user_achievement,
};
use crate::{credit_qoinz, record_exp, ExpSource, TxKind, UserAchievement};

/// Hard bound on level-ups resolved by a single grant. The catalog's
/// exp_required is strictly increasing so a well-formed catalog terminates on
/// its own; the bound keeps a corrupted catalog (exp_required 0) from spinning.
pub const MAX_LEVEL_CASCADE: u32 = 64;

/// What it costs and what it pays to reach one level
#[derive(Debug, Clone, PartialEq)]
pub struct LevelStep {
    pub exp_required: u64,
    pub table_slots: u32,
    pub qoinz_reward: i64,
}

/// One level gained during a cascade
#[derive(Debug, Clone, PartialEq)]
pub struct LevelGain {
    pub level: u32,
    pub table_slots: u32,
    pub qoinz_reward: i64,
}

/// Final state after applying an experience grant
#[derive(Debug, Clone, PartialEq)]
pub struct Cascade {
    pub level: u32,
    pub exp: u64,
    pub gains: Vec<LevelGain>,
}

/// Outcome returned to the facade for logging
#[derive(Debug, Clone)]
pub struct LevelResult {
    pub leveled_up: bool,
    pub level: u32,
    pub exp: u64,
    pub levels_gained: u32,
    pub qoinz_bonus: i64,
}

/// Resolve level-ups for an experience grant.
///
/// Crossing a level consumes exactly the remaining gap and resets exp to 0;
/// the remainder carries into the next gap, so one grant can cascade several
/// levels. Past the last defined level exp accumulates uncapped.
pub fn resolve_level_ups<F>(start_level: u32, start_exp: u64, amount: u64, next_step: F) -> Cascade
where
    F: Fn(u32) -> Option<LevelStep>,
{
    let mut level = start_level;
    let mut exp = start_exp;
    let mut remaining = amount;
    let mut gains = Vec::new();

    for _ in 0..MAX_LEVEL_CASCADE {
        let step = match next_step(level + 1) {
            Some(s) => s,
            None => break, // level table exhausted
        };
        let needed = step.exp_required.saturating_sub(exp);
        if remaining < needed {
            break;
        }
        remaining -= needed;
        exp = 0;
        level += 1;
        gains.push(LevelGain {
            level,
            table_slots: step.table_slots,
            qoinz_reward: step.qoinz_reward,
        });
    }

    exp += remaining;
    Cascade { level, exp, gains }
}

/// Apply an experience grant to an account.
///
/// Mutates level, exp, table_slots and (via the ledger) qoinz_balance, records
/// the full amount once in exp_log tagged with its source, and grants level
/// milestone achievements. Runs inside the caller's transaction: if any ledger
/// write fails the whole grant rolls back.
pub(crate) fn grant_experience(
    ctx: &ReducerContext,
    user_id: &str,
    amount: i64,
    source: ExpSource,
    source_id: Option<u64>,
) -> Result<LevelResult, String> {
    if amount <= 0 {
        return Err(format!(
            "InvalidAmount: experience amount must be positive, got {}",
            amount
        ));
    }

    let mut account = ctx
        .db
        .user_account()
        .id()
        .find(&user_id.to_string())
        .ok_or_else(|| format!("UserNotFound: no account for {}", user_id))?;

    let cascade = resolve_level_ups(account.level, account.exp, amount as u64, |next| {
        ctx.db.level_reward().level().find(&next).map(|row| LevelStep {
            exp_required: row.exp_required,
            table_slots: row.table_slots,
            qoinz_reward: row.qoinz_reward,
        })
    });

    account.level = cascade.level;
    account.exp = cascade.exp;
    account.total_exp_earned = account.total_exp_earned.saturating_add(amount as u64);
    if let Some(last) = cascade.gains.last() {
        // Slot counts are replaced, not accumulated: the catalog row for the
        // highest level reached is authoritative
        account.table_slots = last.table_slots;
        account.last_level_up = Some(ctx.timestamp);
    }
    let account_name = account.name.clone();
    ctx.db.user_account().id().update(account);

    // Perks after the account row is saved: credit_qoinz re-reads the account
    let mut qoinz_bonus = 0i64;
    for gain in &cascade.gains {
        if gain.qoinz_reward > 0 {
            credit_qoinz(
                ctx,
                user_id,
                gain.qoinz_reward,
                TxKind::LevelUp,
                Some(gain.level as u64),
            )?;
            qoinz_bonus += gain.qoinz_reward;
        }
        grant_level_achievement(ctx, user_id, gain.level);
    }

    record_exp(ctx, user_id, amount, source, source_id);

    if !cascade.gains.is_empty() {
        log::info!(
            "[LEVEL] up user:{} name:{} level:{} gained:{} bonus:{} exp:{}",
            &user_id[..8.min(user_id.len())],
            account_name,
            cascade.level,
            cascade.gains.len(),
            qoinz_bonus,
            cascade.exp
        );
    }

    Ok(LevelResult {
        leveled_up: !cascade.gains.is_empty(),
        level: cascade.level,
        exp: cascade.exp,
        levels_gained: cascade.gains.len() as u32,
        qoinz_bonus,
    })
}

/// Grant the milestone achievement for a level, if one exists and the user
/// does not already hold it. Missing catalog rows are skipped silently: the
/// catalog is external input, not something the engine owns.
fn grant_level_achievement(ctx: &ReducerContext, user_id: &str, level: u32) {
    let name = match crate::LEVEL_MILESTONE_LABELS.iter().find(|(l, _)| *l == level) {
        Some((_, name)) => *name,
        None => return,
    };

    let ach = match ctx.db.achievement().iter().find(|a| a.name == name) {
        Some(a) => a,
        None => {
            log::warn!("[ACHIEVEMENT] catalog missing '{}' for level {}", name, level);
            return;
        }
    };

    // Existence check keeps the grant idempotent across repeated level grants
    let already_granted = ctx
        .db
        .user_achievement()
        .user_id()
        .filter(&user_id.to_string())
        .any(|ua| ua.achievement_id == ach.id);
    if already_granted {
        return;
    }

    ctx.db.user_achievement().insert(UserAchievement {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        achievement_id: ach.id,
        unlocked_at: ctx.timestamp,
    });
    log::info!(
        "[ACHIEVEMENT] granted user:{} name:\"{}\" level:{}",
        &user_id[..8.min(user_id.len())],
        name,
        level
    );
}

/// Credit experience to a user on behalf of an external system.
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn add_experience(
    ctx: &ReducerContext,
    user_id: String,
    amount: i64,
    source: ExpSource,
    source_id: Option<u64>,
) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized add_experience attempt by {}", ctx.sender);
        return Err("Unauthorized: only workers can grant experience".to_string());
    }

    let result = grant_experience(ctx, &user_id, amount, source, source_id)?;
    log::info!(
        "[EXP] granted user:{} amount:{} level:{} exp:{} leveled_up:{}",
        &user_id[..8.min(user_id.len())],
        amount,
        result.level,
        result.exp,
        result.leveled_up
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewards;

    /// Catalog lookup matching the seeded rows: exp_required for level n
    /// is floor(100 * 1.5^(n-2)), slots replace with n, flat 5 QOINZ bonus
    fn curve(next: u32) -> Option<LevelStep> {
        if next < 2 || next > 50 {
            return None;
        }
        Some(LevelStep {
            exp_required: rewards::exp_required_for_next(next - 1),
            table_slots: rewards::slots_for_level(next),
            qoinz_reward: rewards::LEVEL_UP_BONUS,
        })
    }

    #[test]
    fn grant_below_threshold_accumulates() {
        let out = resolve_level_ups(1, 0, 99, curve);
        assert_eq!(out.level, 1);
        assert_eq!(out.exp, 99);
        assert!(out.gains.is_empty());
    }

    #[test]
    fn boundary_grant_levels_up_with_remainder() {
        // Level 1, exp 90, gap to level 2 is 100: +30 closes the gap with 10
        // and carries 20 into level 2
        let out = resolve_level_ups(1, 90, 30, curve);
        assert_eq!(out.level, 2);
        assert_eq!(out.exp, 20);
        assert_eq!(out.gains.len(), 1);
        assert_eq!(out.gains[0].level, 2);
        assert_eq!(out.gains[0].table_slots, 2);
        assert_eq!(out.gains[0].qoinz_reward, 5);
    }

    #[test]
    fn exact_gap_lands_at_zero_exp() {
        let out = resolve_level_ups(1, 90, 10, curve);
        assert_eq!(out.level, 2);
        assert_eq!(out.exp, 0);
        assert_eq!(out.gains.len(), 1);
    }

    #[test]
    fn single_grant_cascades_multiple_levels() {
        // 100 + 150 + 225 = 475 crosses three levels exactly, plus 25 over
        let out = resolve_level_ups(1, 0, 500, curve);
        assert_eq!(out.level, 4);
        assert_eq!(out.exp, 25);
        let gained: Vec<u32> = out.gains.iter().map(|g| g.level).collect();
        assert_eq!(gained, vec![2, 3, 4]);
    }

    #[test]
    fn exp_accumulates_past_last_defined_level() {
        let out = resolve_level_ups(50, 10, 1_000_000, curve);
        assert_eq!(out.level, 50);
        assert_eq!(out.exp, 1_000_010);
        assert!(out.gains.is_empty());
    }

    #[test]
    fn split_grants_equal_single_grant() {
        // Associativity in total effect: a then b lands where a+b lands,
        // across non-cascading and multi-cascading boundaries
        for (a, b) in [(10, 20), (99, 1), (100, 0), (250, 250), (5, 495), (474, 1)] {
            let combined = resolve_level_ups(1, 90, a + b, curve);
            let first = resolve_level_ups(1, 90, a, curve);
            let second = resolve_level_ups(first.level, first.exp, b, curve);
            assert_eq!(
                (second.level, second.exp),
                (combined.level, combined.exp),
                "split {}+{} diverged",
                a,
                b
            );
        }
    }

    #[test]
    fn zero_cost_catalog_is_bounded() {
        // A corrupted catalog with exp_required 0 would cascade forever
        // without the guard; it must stop at MAX_LEVEL_CASCADE
        let out = resolve_level_ups(1, 0, 10, |_| {
            Some(LevelStep {
                exp_required: 0,
                table_slots: 1,
                qoinz_reward: 0,
            })
        });
        assert_eq!(out.gains.len(), MAX_LEVEL_CASCADE as usize);
        assert_eq!(out.level, 1 + MAX_LEVEL_CASCADE);
        assert_eq!(out.exp, 10);
    }
}
