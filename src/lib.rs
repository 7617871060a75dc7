use spacetimedb::{
    ReducerContext, Identity, Table, Timestamp,
    table, reducer, view, SpacetimeType,
    client_visibility_filter, Filter,
};

// Pure reward/fee policy (no database access)
mod rewards;

// Experience accumulation and cascading level-ups
mod leveling;

// Bulk restore reducers for disaster recovery
mod restore;

pub use leveling::{resolve_level_ups, Cascade, LevelGain, LevelResult, LevelStep, MAX_LEVEL_CASCADE};
pub use rewards::{
    entry_cost, exp_required_for_next, exp_share, slots_for_level, tier_is_paid, tier_reward,
    DEFAULT_PLATFORM_FEE, LEVEL_UP_BONUS, MAX_REWARD_TIER, PAID_TIER_COUNT,
};

// ==================== CONSTANTS ====================

/// QOINZ balance granted to a brand-new account (minor units)
const STARTING_BALANCE: i64 = 1_000;

/// Table slots a brand-new account starts with
const STARTING_SLOTS: u32 = 1;

/// Smallest capacity a table can be created with.
/// Below 2 the split has nothing to partition.
const MIN_TABLE_CAPACITY: u32 = 2;

/// Largest capacity a table can be created with
const MAX_TABLE_CAPACITY: u32 = 32;

/// Highest level seeded into the level_reward catalog.
/// Experience accumulates uncapped past this level.
const MAX_DEFINED_LEVEL: u32 = 50;

/// Levels that carry a named milestone achievement
const LEVEL_MILESTONE_LABELS: &[(u32, &str)] = &[
    (5, "Rising Star"),
    (10, "Branch Master"),
    (20, "Qoinz Veteran"),
    (50, "Qoinz Legend"),
];

// ==================== HELPER FUNCTIONS ====================

/// Get the account for the sender's verified session
/// This abstracts the session lookup pattern used throughout reducers
fn get_account(ctx: &ReducerContext) -> Result<UserAccount, String> {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("NoSession: verify with gateway first".to_string())?;

    ctx.db.user_account()
        .id()
        .find(&session.user_id)
        .ok_or("UserNotFound: session points at a missing account".to_string())
}

/// Members currently seated at a table (left_at unset)
fn active_members(ctx: &ReducerContext, table_id: u64) -> Vec<TableMember> {
    ctx.db.table_member()
        .table_id()
        .filter(&table_id)
        .filter(|m| m.left_at.is_none())
        .collect()
}

/// Find the user's active membership anywhere in the table tree, if any.
///
/// A membership counts as active while its row has no left_at AND its table is
/// still open. Rows in completed tables are historical: the split duplicates
/// members into open successors, and those successor rows are the active ones.
/// This check is what enforces one active seat per user across the whole tree.
fn find_active_membership(ctx: &ReducerContext, user_id: &str) -> Option<TableMember> {
    ctx.db.table_member()
        .user_id()
        .filter(&user_id.to_string())
        .filter(|m| m.left_at.is_none())
        .find(|m| {
            ctx.db.challenge_table()
                .id()
                .find(&m.table_id)
                .map(|t| t.status == TableStatus::Open)
                .unwrap_or(false)
        })
}

/// Minimal unused position in [1, capacity], or None when every seat is taken.
/// Linear scan is fine: capacities are capped at MAX_TABLE_CAPACITY.
fn next_free_position(occupied: &[u32], capacity: u32) -> Option<u32> {
    (1..=capacity).find(|p| !occupied.contains(p))
}

/// Which successor a position migrates to, and at what position there.
/// The partition point is capacity / 2 (floor): positions 1..=half keep their
/// position in successor A, the rest land in successor B at position - half.
/// Odd capacities give A the smaller half.
fn partition_target(position: u32, capacity: u32) -> (SplitSide, u32) {
    let half = capacity / 2;
    if position <= half {
        (SplitSide::A, position)
    } else {
        (SplitSide::B, position - half)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SplitSide {
    A,
    B,
}

// ==================== TABLES ====================

/// Session links ephemeral connection to stable account
/// PRIVATE: Links connection identity to user ID (no PII)
#[table(name = session)]
pub struct Session {
    #[primary_key]
    pub connection_id: Identity,

    /// Stable user ID - verified by gateway
    pub user_id: String,

    /// When this session was created
    pub connected_at: Timestamp,
}

/// User account: balance, experience and slot state.
/// qoinz_balance and exp are mutated only through the ledger helpers so the
/// wallet_transaction / exp_log trails stay reconcilable.
/// PRIVATE: Clients access via my_account view for RLS
#[table(name = user_account)]
#[derive(Clone)]
pub struct UserAccount {
    #[primary_key]
    pub id: String,

    /// Display name
    pub name: String,

    /// QOINZ balance in integer minor units (never floating point)
    pub qoinz_balance: i64,

    /// Experience toward the next level (resets to 0 on level-up)
    pub exp: u64,

    /// Current level (starts at 1)
    pub level: u32,

    /// Tables this account may still create; replaced on level-up
    pub table_slots: u32,

    /// Lifetime QOINZ credited (debits excluded)
    pub total_qoinz_earned: i64,

    /// Lifetime experience credited
    pub total_exp_earned: u64,

    /// When this account was created
    pub created_at: Timestamp,

    /// Last level-up, if any
    pub last_level_up: Option<Timestamp>,
}

/// A challenge table: one fixed-capacity tier instance in the tree
#[table(name = challenge_table, public)]
#[derive(Clone)]
pub struct ChallengeTable {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    /// Account that created the root of this tree
    #[index(btree)]
    pub owner_id: String,

    /// Display name; successors inherit it with an " A"/" B" suffix
    pub name: String,

    /// Lifecycle state; transitions are monotonic Open -> Completed -> Archived
    pub status: TableStatus,

    /// Capacity, fixed at creation
    pub max_members: u32,

    /// Entry fee in minor units
    pub entry_fee: i64,

    /// Platform fee in minor units (0 = use the default)
    pub platform_fee: i64,

    /// Sum of entry fees collected; only ever grows while open
    pub reward_pool: i64,

    /// Experience pool, shared per seat on join and on completion
    pub exp_pool: u64,

    /// Total reward a member collects by climbing every paid tier;
    /// each paid tier pays reward_amount / PAID_TIER_COUNT
    pub reward_amount: i64,

    /// Tier of this table in the tree (roots are 1)
    pub level: u32,

    /// Table this one was split from (None only for roots)
    #[index(btree)]
    pub parent_table_id: Option<u64>,

    /// When this table was created
    pub created_at: Timestamp,

    /// Set exactly once, when the table fills or is completed manually
    pub completed_at: Option<Timestamp>,

    /// Last mutation
    pub updated_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum TableStatus {
    Open,      // Accepting joins
    Full,      // Never durably set by the module: fill and completion coincide
               // because the fill check runs inside the join's transaction.
               // Kept so restored exports round-trip.
    Completed, // Filled and split, or closed by the owner
    Archived,  // Terminal, admin-only
}

/// One user's seat at one table
/// Note: No multi-column unique constraint on (table_id, position) - positions
/// are assigned under the serialized reducer transaction, which is what keeps
/// them unique among active rows.
#[table(name = table_member, public)]
#[derive(Clone)]
pub struct TableMember {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub table_id: u64,

    #[index(btree)]
    pub user_id: String,

    /// Seat in [1, max_members]; lowest unused seat at join time
    pub position: u32,

    /// Tier of the table at the moment this row was inserted
    pub current_level: u32,

    /// When the user took this seat
    pub joined_at: Timestamp,

    /// Set when the user leaves a still-open table; row kept as history
    pub left_at: Option<Timestamp>,

    /// True on parent rows whose member migrated through a split
    pub is_winner: bool,
}

/// Append-only QOINZ ledger; the reconciliation source of truth for balances
/// SECURITY: Public table with RLS protection - users only see their own rows
#[table(name = wallet_transaction, public)]
pub struct WalletTransaction {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    /// Signed amount in minor units (debits are negative)
    pub amount: i64,

    /// What produced this movement
    pub kind: TxKind,

    /// Table id, level, or external reference depending on kind
    pub source_id: Option<u64>,

    #[index(btree)]
    pub created_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum TxKind {
    TableEntry,  // Entry fee debit on create/join
    PlatformFee, // Platform cut debit on create/join
    TierReward,  // Per-member payout when a split advances them into a paid tier
    LevelUp,     // Flat bonus from the leveling engine
    Voucher,     // Credited by the voucher subsystem (worker-only)
    Referral,    // Credited by the referral subsystem (worker-only)
    Admin,       // Manual adjustment (worker-only)
}

/// Append-only experience ledger
/// SECURITY: Public table with RLS protection - users only see their own rows
#[table(name = exp_log, public)]
pub struct ExpLog {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    /// Experience credited by this event
    pub amount: i64,

    /// What produced this gain
    pub source: ExpSource,

    /// Table id or achievement id depending on source
    pub source_id: Option<u64>,

    #[index(btree)]
    pub created_at: Timestamp,
}

#[derive(SpacetimeType, Debug, Clone, PartialEq)]
pub enum ExpSource {
    TableJoin,
    TableComplete,
    Achievement,
    Admin,
    Other,
}

/// Level catalog: what reaching each level costs and grants.
/// Seeded in init; read-only afterwards.
#[table(name = level_reward, public)]
pub struct LevelReward {
    #[primary_key]
    pub level: u32,

    /// Display label for this level
    pub label: String,

    /// Experience needed to advance from level - 1; strictly increasing
    pub exp_required: u64,

    /// Table slots held at this level (replacement value, not a delta)
    pub table_slots: u32,

    /// QOINZ bonus credited on reaching this level
    pub qoinz_reward: i64,

    /// Badge shown next to the name, empty for plain levels
    pub badge: String,
}

/// Achievement catalog; read-only input to the leveling engine
#[table(name = achievement, public)]
pub struct Achievement {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    pub name: String,

    pub description: String,
}

/// Achievements unlocked per user; grants are idempotent
#[table(name = user_achievement, public)]
pub struct UserAchievement {
    #[primary_key]
    #[auto_inc]
    pub id: u64,

    #[index(btree)]
    pub user_id: String,

    pub achievement_id: u64,

    pub unlocked_at: Timestamp,
}

/// Authorized identities that can access protected tables and admin reducers
/// Used for RLS filtering and reducer authorization checks
#[table(name = authorized_worker)]
pub struct AuthorizedWorker {
    #[primary_key]
    pub identity: Identity,
}

// ==================== VIEWS & ROW LEVEL SECURITY ====================

/// View: Returns only the current user's account data
/// This is the secure way for clients to access their own account
#[view(name = my_account, public)]
fn my_account(ctx: &spacetimedb::ViewContext) -> Option<UserAccount> {
    let session = ctx.db.session().connection_id().find(ctx.sender)?;
    ctx.db.user_account().id().find(&session.user_id)
}

/// RLS Filter: Users only see their own wallet ledger rows
#[client_visibility_filter]
const WALLET_VISIBILITY: Filter = Filter::Sql(
    "SELECT wt.* FROM wallet_transaction wt
     JOIN session s WHERE s.connection_id = :sender AND wt.user_id = s.user_id"
);

/// RLS Filter: Users only see their own experience ledger rows
#[client_visibility_filter]
const EXP_LOG_VISIBILITY: Filter = Filter::Sql(
    "SELECT el.* FROM exp_log el
     JOIN session s WHERE s.connection_id = :sender AND el.user_id = s.user_id"
);

// ==================== LEDGER ACCESSOR ====================

/// Credit QOINZ to an account and record the matching ledger row.
/// Every balance increase in the module goes through here.
pub(crate) fn credit_qoinz(
    ctx: &ReducerContext,
    user_id: &str,
    amount: i64,
    kind: TxKind,
    source_id: Option<u64>,
) -> Result<(), String> {
    if amount <= 0 {
        return Err("InvalidAmount: credit must be positive".to_string());
    }

    let mut account = ctx.db.user_account()
        .id()
        .find(&user_id.to_string())
        .ok_or_else(|| format!("UserNotFound: no account for {}", user_id))?;

    account.qoinz_balance = account.qoinz_balance.saturating_add(amount);
    account.total_qoinz_earned = account.total_qoinz_earned.saturating_add(amount);
    ctx.db.user_account().id().update(account);

    ctx.db.wallet_transaction().insert(WalletTransaction {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        amount,
        kind,
        source_id,
        created_at: ctx.timestamp,
    });
    Ok(())
}

/// Debit QOINZ from an account and record the matching ledger row (negative
/// amount). Fails with InsufficientFunds instead of going negative.
pub(crate) fn debit_qoinz(
    ctx: &ReducerContext,
    user_id: &str,
    amount: i64,
    kind: TxKind,
    source_id: Option<u64>,
) -> Result<(), String> {
    if amount <= 0 {
        return Err("InvalidAmount: debit must be positive".to_string());
    }

    let mut account = ctx.db.user_account()
        .id()
        .find(&user_id.to_string())
        .ok_or_else(|| format!("UserNotFound: no account for {}", user_id))?;

    if account.qoinz_balance < amount {
        return Err("InsufficientFunds: QOINZ balance too low".to_string());
    }

    account.qoinz_balance -= amount;
    ctx.db.user_account().id().update(account);

    ctx.db.wallet_transaction().insert(WalletTransaction {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        amount: -amount,
        kind,
        source_id,
        created_at: ctx.timestamp,
    });
    Ok(())
}

/// Record an experience grant in the append-only exp ledger
pub(crate) fn record_exp(
    ctx: &ReducerContext,
    user_id: &str,
    amount: i64,
    source: ExpSource,
    source_id: Option<u64>,
) {
    ctx.db.exp_log().insert(ExpLog {
        id: 0, // auto_inc
        user_id: user_id.to_string(),
        amount,
        source,
        source_id,
        created_at: ctx.timestamp,
    });
}

// ==================== SESSION REDUCERS ====================

/// Create a verified session for a client identity
/// This is called by the gateway AFTER verifying the auth token
/// Only authorized workers (gateway with owner token) can call this
#[reducer]
pub fn create_session(ctx: &ReducerContext, client_identity: String, user_id: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized create_session attempt by {}", ctx.sender);
        return Err("Unauthorized: only gateway can create sessions".to_string());
    }

    let identity = Identity::from_hex(&client_identity)
        .map_err(|_| "InvalidIdentity: bad hex string".to_string())?;

    // Delete stale sessions: same user (unclean reconnect) OR same connection_id (prevents PK conflict)
    let stale_sessions: Vec<_> = ctx.db.session()
        .iter()
        .filter(|s| s.user_id == user_id || s.connection_id == identity)
        .map(|s| s.connection_id)
        .collect();
    for conn_id in stale_sessions {
        ctx.db.session().connection_id().delete(&conn_id);
    }

    ctx.db.session().insert(Session {
        connection_id: identity,
        user_id: user_id.clone(),
        connected_at: ctx.timestamp,
    });

    log::info!("[SESSION] created user:{} ws:{}",
        &user_id[..8.min(user_id.len())], &client_identity[..8.min(client_identity.len())]);
    Ok(())
}

/// User connects: get or create their account
/// The user_id is read from the verified session created by the gateway
#[reducer]
pub fn connect(ctx: &ReducerContext, name: String) -> Result<(), String> {
    let session = ctx.db.session()
        .connection_id()
        .find(&ctx.sender)
        .ok_or("NoSession: verify with gateway first".to_string())?;

    let user_id = session.user_id.clone();
    let uid = &user_id[..8.min(user_id.len())];

    if let Some(mut existing) = ctx.db.user_account().id().find(&user_id) {
        existing.name = name;
        let (level, balance, slots) = (existing.level, existing.qoinz_balance, existing.table_slots);
        ctx.db.user_account().id().update(existing);
        // Wide event: one canonical log with full account context
        log::info!("[CONNECT] user:{} type=returning level:{} balance:{} slots:{}",
            uid, level, balance, slots);
    } else {
        ctx.db.user_account().insert(UserAccount {
            id: user_id.clone(),
            name,
            qoinz_balance: STARTING_BALANCE,
            exp: 0,
            level: 1,
            table_slots: STARTING_SLOTS,
            total_qoinz_earned: 0,
            total_exp_earned: 0,
            created_at: ctx.timestamp,
            last_level_up: None,
        });
        log::info!("[CONNECT] user:{} type=new level:1 balance:{} slots:{}",
            uid, STARTING_BALANCE, STARTING_SLOTS);
    }
    Ok(())
}

/// Clean up session when user disconnects
#[reducer(client_disconnected)]
pub fn on_disconnect(ctx: &ReducerContext) {
    if let Some(session) = ctx.db.session().connection_id().find(&ctx.sender) {
        let session_secs = ctx.timestamp.duration_since(session.connected_at)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        log::info!("[DISCONNECT] user:{} session_min:{:.1}",
            &session.user_id[..8.min(session.user_id.len())], session_secs as f32 / 60.0);
        ctx.db.session().connection_id().delete(&ctx.sender);
    }
}

// ==================== TABLE LIFECYCLE REDUCERS ====================

/// Create a new root table (tier 1), spending one table slot and the entry
/// cost, and seat the creator at position 1
#[reducer]
pub fn create_table(
    ctx: &ReducerContext,
    name: String,
    max_members: u32,
    entry_fee: i64,
    exp_pool: u64,
) -> Result<(), String> {
    let account = get_account(ctx)?;

    if name.trim().is_empty() {
        return Err("InvalidName: table name is required".to_string());
    }
    if !(MIN_TABLE_CAPACITY..=MAX_TABLE_CAPACITY).contains(&max_members) {
        return Err("InvalidCapacity: capacity out of range".to_string());
    }
    if entry_fee <= 0 {
        return Err("InvalidAmount: entry fee must be positive".to_string());
    }
    if account.table_slots == 0 {
        return Err("NoSlotsAvailable: level up to earn more table slots".to_string());
    }
    if find_active_membership(ctx, &account.id).is_some() {
        return Err("AlreadyMember: user already holds an active seat".to_string());
    }

    let (fee, platform_fee) = rewards::entry_cost(entry_fee, 0);
    if account.qoinz_balance < fee + platform_fee {
        return Err("InsufficientFunds: QOINZ balance too low".to_string());
    }

    // The full amount a member can collect across all paid tiers: one entry
    // fee per seat, redistributed as they climb
    let reward_amount = entry_fee.saturating_mul(max_members as i64);

    let table = ctx.db.challenge_table().insert(ChallengeTable {
        id: 0, // auto_inc
        owner_id: account.id.clone(),
        name: name.clone(),
        status: TableStatus::Open,
        max_members,
        entry_fee,
        platform_fee,
        reward_pool: fee,
        exp_pool,
        reward_amount,
        level: 1,
        parent_table_id: None,
        created_at: ctx.timestamp,
        completed_at: None,
        updated_at: ctx.timestamp,
    });

    debit_qoinz(ctx, &account.id, fee, TxKind::TableEntry, Some(table.id))?;
    if platform_fee > 0 {
        debit_qoinz(ctx, &account.id, platform_fee, TxKind::PlatformFee, Some(table.id))?;
    }

    // Spend the slot (re-read: the debits above rewrote the account row)
    let mut account = ctx.db.user_account().id().find(&account.id)
        .ok_or("UserNotFound: account vanished mid-transaction".to_string())?;
    account.table_slots -= 1;
    let account_id = account.id.clone();
    ctx.db.user_account().id().update(account);

    ctx.db.table_member().insert(TableMember {
        id: 0, // auto_inc
        table_id: table.id,
        user_id: account_id.clone(),
        position: 1,
        current_level: 1,
        joined_at: ctx.timestamp,
        left_at: None,
        is_winner: false,
    });

    let share = rewards::exp_share(exp_pool, max_members);
    if share > 0 {
        leveling::grant_experience(ctx, &account_id, share as i64, ExpSource::TableJoin, Some(table.id))?;
    }

    log::info!("[TABLE] created table:{} name:\"{}\" owner:{} capacity:{} fee:{} exp_pool:{}",
        table.id, name, &account_id[..8.min(account_id.len())], max_members, fee, exp_pool);
    Ok(())
}

/// Join an open table at the lowest free position.
/// Runs the fill check afterwards: the join that fills the table also
/// completes and splits it, all in this one transaction.
#[reducer]
pub fn join_table(ctx: &ReducerContext, table_id: u64) -> Result<(), String> {
    let account = get_account(ctx)?;

    let table = ctx.db.challenge_table().id().find(&table_id)
        .ok_or("NotFound: table does not exist".to_string())?;
    if table.status != TableStatus::Open {
        return Err("GroupNotOpen: table is not accepting joins".to_string());
    }
    if find_active_membership(ctx, &account.id).is_some() {
        return Err("AlreadyMember: user already holds an active seat".to_string());
    }

    let members = active_members(ctx, table_id);
    if members.len() as u32 >= table.max_members {
        return Err("GroupFull: no seats left".to_string());
    }
    let occupied: Vec<u32> = members.iter().map(|m| m.position).collect();
    let position = next_free_position(&occupied, table.max_members)
        .ok_or("GroupFull: no seats left".to_string())?;

    let (fee, platform_fee) = rewards::entry_cost(table.entry_fee, table.platform_fee);
    if account.qoinz_balance < fee + platform_fee {
        return Err("InsufficientFunds: QOINZ balance too low".to_string());
    }
    debit_qoinz(ctx, &account.id, fee, TxKind::TableEntry, Some(table_id))?;
    if platform_fee > 0 {
        debit_qoinz(ctx, &account.id, platform_fee, TxKind::PlatformFee, Some(table_id))?;
    }

    ctx.db.table_member().insert(TableMember {
        id: 0, // auto_inc
        table_id,
        user_id: account.id.clone(),
        position,
        current_level: table.level,
        joined_at: ctx.timestamp,
        left_at: None,
        is_winner: false,
    });

    // Entry fee feeds the pool; the platform cut does not
    let mut table = table;
    table.reward_pool = table.reward_pool.saturating_add(fee);
    table.updated_at = ctx.timestamp;
    let (exp_pool, max_members) = (table.exp_pool, table.max_members);
    ctx.db.challenge_table().id().update(table);

    let share = rewards::exp_share(exp_pool, max_members);
    if share > 0 {
        leveling::grant_experience(ctx, &account.id, share as i64, ExpSource::TableJoin, Some(table_id))?;
    }

    let seated = members.len() as u32 + 1;
    log::info!("[TABLE] joined table:{} user:{} position:{} seated:{}/{}",
        table_id, &account.id[..8.min(account.id.len())], position, seated, max_members);

    complete_table_if_full(ctx, table_id)
}

/// Leave a still-open table. The seat is vacated for the next joiner; the
/// membership row is kept with left_at set. Entry fees are not refunded.
#[reducer]
pub fn leave_table(ctx: &ReducerContext, table_id: u64) -> Result<(), String> {
    let account = get_account(ctx)?;

    let table = ctx.db.challenge_table().id().find(&table_id)
        .ok_or("NotFound: table does not exist".to_string())?;
    if table.status != TableStatus::Open {
        return Err("GroupNotOpen: leaving is only possible before the table fills".to_string());
    }

    let mut membership = ctx.db.table_member()
        .table_id()
        .filter(&table_id)
        .find(|m| m.user_id == account.id && m.left_at.is_none())
        .ok_or("NotAMember: no active seat at this table".to_string())?;

    let position = membership.position;
    membership.left_at = Some(ctx.timestamp);
    ctx.db.table_member().id().update(membership);

    log::info!("[TABLE] left table:{} user:{} position:{}",
        table_id, &account.id[..8.min(account.id.len())], position);
    Ok(())
}

/// Owner manually closes a table without a split
#[reducer]
pub fn complete_table(ctx: &ReducerContext, table_id: u64) -> Result<(), String> {
    let account = get_account(ctx)?;

    let mut table = ctx.db.challenge_table().id().find(&table_id)
        .ok_or("NotFound: table does not exist".to_string())?;
    if table.owner_id != account.id {
        return Err("NotOwner: only the owner can complete the table".to_string());
    }
    if table.status != TableStatus::Open {
        return Err("GroupNotOpen: table is already closed".to_string());
    }

    table.status = TableStatus::Completed;
    table.completed_at = Some(ctx.timestamp);
    table.updated_at = ctx.timestamp;
    ctx.db.challenge_table().id().update(table);

    log::info!("[TABLE] completed manually table:{} owner:{}",
        table_id, &account.id[..8.min(account.id.len())]);
    Ok(())
}

/// Archive a completed table (terminal state)
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn archive_table(ctx: &ReducerContext, table_id: u64) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized archive_table attempt by {}", ctx.sender);
        return Err("Unauthorized: only workers can archive tables".to_string());
    }

    let mut table = ctx.db.challenge_table().id().find(&table_id)
        .ok_or("NotFound: table does not exist".to_string())?;
    if table.status != TableStatus::Completed {
        return Err("InvalidState: only completed tables can be archived".to_string());
    }

    table.status = TableStatus::Archived;
    table.updated_at = ctx.timestamp;
    ctx.db.challenge_table().id().update(table);

    log::info!("[ADMIN] archived table:{}", table_id);
    Ok(())
}

/// Credit QOINZ on behalf of an external subsystem (vouchers, referrals)
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn grant_qoinz(
    ctx: &ReducerContext,
    user_id: String,
    amount: i64,
    kind: TxKind,
    source_id: Option<u64>,
) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized grant_qoinz attempt by {}", ctx.sender);
        return Err("Unauthorized: only workers can grant QOINZ".to_string());
    }
    // Engine-internal kinds stay engine-internal
    if !matches!(kind, TxKind::Voucher | TxKind::Referral | TxKind::Admin) {
        return Err("InvalidKind: workers may only credit voucher, referral or admin amounts".to_string());
    }

    credit_qoinz(ctx, &user_id, amount, kind.clone(), source_id)?;
    log::info!("[WALLET] granted user:{} kind:{:?}", &user_id[..8.min(user_id.len())], kind);
    Ok(())
}

// ==================== FILL DETECTOR & SPLITTER ====================

/// Complete the table if its live member count reached capacity, then split.
/// The Open -> Completed transition is the fence: reducers are serialized, so
/// a second last-joiner observes Completed and never re-splits.
fn complete_table_if_full(ctx: &ReducerContext, table_id: u64) -> Result<(), String> {
    let mut table = ctx.db.challenge_table().id().find(&table_id)
        .ok_or("NotFound: table vanished mid-transaction".to_string())?;
    if table.status != TableStatus::Open {
        return Ok(());
    }
    let count = active_members(ctx, table_id).len() as u32;
    if count < table.max_members {
        return Ok(());
    }

    table.status = TableStatus::Completed;
    table.completed_at = Some(ctx.timestamp);
    table.updated_at = ctx.timestamp;
    ctx.db.challenge_table().id().update(table);

    split_table(ctx, table_id)
}

/// Split a completed table into two successors at the next tier.
///
/// Atomic with the completing join: successors, migrated memberships and
/// reward credits all commit together or not at all. A re-attempt on a table
/// that already has successors is a no-op.
fn split_table(ctx: &ReducerContext, parent_id: u64) -> Result<(), String> {
    let parent = ctx.db.challenge_table().id().find(&parent_id)
        .ok_or("NotFound: table vanished mid-transaction".to_string())?;

    // Idempotence precondition: never recreate successors
    let has_children = ctx.db.challenge_table()
        .iter()
        .any(|t| t.parent_table_id == Some(parent_id));
    if has_children {
        log::warn!("[TABLE] split skipped table:{} already has successors", parent_id);
        return Ok(());
    }

    let mut members = active_members(ctx, parent_id);
    members.sort_by_key(|m| m.position);

    let child_level = parent.level + 1;
    let child_a = spawn_successor(ctx, &parent, "A");
    let child_b = spawn_successor(ctx, &parent, "B");

    let reward = rewards::tier_reward(parent.reward_amount);
    let pay_tier = rewards::tier_is_paid(child_level) && reward > 0;
    let share = rewards::exp_share(parent.exp_pool, parent.max_members);

    for member in &members {
        let (side, position) = partition_target(member.position, parent.max_members);
        let target_id = match side {
            SplitSide::A => child_a.id,
            SplitSide::B => child_b.id,
        };

        ctx.db.table_member().insert(TableMember {
            id: 0, // auto_inc
            table_id: target_id,
            user_id: member.user_id.clone(),
            position,
            current_level: child_level,
            joined_at: ctx.timestamp,
            left_at: None,
            is_winner: false,
        });

        // Parent row stays as the historical record, flagged as a climber
        let mut parent_row = member.clone();
        parent_row.is_winner = true;
        ctx.db.table_member().id().update(parent_row);

        log::info!("[TABLE] migrated user:{} from:{} to:{} position:{} level:{}",
            &member.user_id[..8.min(member.user_id.len())],
            parent_id, target_id, position, child_level);

        if pay_tier {
            credit_qoinz(ctx, &member.user_id, reward, TxKind::TierReward, Some(target_id))?;
        }
        if share > 0 {
            leveling::grant_experience(
                ctx,
                &member.user_id,
                share as i64,
                ExpSource::TableComplete,
                Some(parent_id),
            )?;
        }
    }

    log::info!("[TABLE] split table:{} a:{} b:{} members:{} tier:{} reward_each:{}",
        parent_id, child_a.id, child_b.id, members.len(), child_level,
        if pay_tier { reward } else { 0 });
    Ok(())
}

/// Create one successor table inheriting the parent's economics
fn spawn_successor(ctx: &ReducerContext, parent: &ChallengeTable, suffix: &str) -> ChallengeTable {
    ctx.db.challenge_table().insert(ChallengeTable {
        id: 0, // auto_inc
        owner_id: parent.owner_id.clone(),
        name: format!("{} {}", parent.name, suffix),
        status: TableStatus::Open,
        max_members: parent.max_members,
        entry_fee: parent.entry_fee,
        platform_fee: parent.platform_fee,
        reward_pool: 0,
        exp_pool: parent.exp_pool,
        reward_amount: parent.reward_amount,
        level: parent.level + 1,
        parent_table_id: Some(parent.id),
        created_at: ctx.timestamp,
        completed_at: None,
        updated_at: ctx.timestamp,
    })
}

// ==================== MODULE INIT ====================

/// Initialize module - enroll the owner as worker and seed the catalogs
#[reducer(init)]
pub fn init(ctx: &ReducerContext) {
    // Add module owner to authorized workers for RLS and reducer access control
    // In init, ctx.sender is the module owner identity
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        ctx.db.authorized_worker().insert(AuthorizedWorker {
            identity: ctx.sender,
        });
    }

    // Seed the level catalog once (idempotent on hot-reload)
    if ctx.db.level_reward().iter().count() == 0 {
        for level in 2..=MAX_DEFINED_LEVEL {
            let milestone = LEVEL_MILESTONE_LABELS
                .iter()
                .find(|(l, _)| *l == level)
                .map(|(_, label)| *label);

            ctx.db.level_reward().insert(LevelReward {
                level,
                label: milestone
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| format!("Level {}", level)),
                exp_required: rewards::exp_required_for_next(level - 1),
                table_slots: rewards::slots_for_level(level),
                qoinz_reward: rewards::LEVEL_UP_BONUS,
                badge: milestone.map(|l| l.to_string()).unwrap_or_default(),
            });
        }
    }

    // Seed the achievement catalog once
    if ctx.db.achievement().iter().count() == 0 {
        for (level, name) in LEVEL_MILESTONE_LABELS {
            ctx.db.achievement().insert(Achievement {
                id: 0, // auto_inc
                name: name.to_string(),
                description: format!("Reached level {}", level),
            });
        }
    }

    log::info!("QOINZ table challenge module initialized successfully");
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_free_position_fills_lowest_gap() {
        assert_eq!(next_free_position(&[], 8), Some(1));
        assert_eq!(next_free_position(&[1, 2, 3], 8), Some(4));
        // A vacated seat is reused before any higher position
        assert_eq!(next_free_position(&[1, 3, 4], 8), Some(2));
        assert_eq!(next_free_position(&[2, 3], 8), Some(1));
    }

    #[test]
    fn next_free_position_none_when_full() {
        assert_eq!(next_free_position(&[1, 2, 3, 4], 4), None);
        // Order of the occupied set does not matter
        assert_eq!(next_free_position(&[4, 2, 1, 3], 4), None);
    }

    #[test]
    fn sequential_joins_assign_exact_position_set() {
        let capacity = 8u32;
        let mut occupied: Vec<u32> = Vec::new();
        for _ in 0..capacity {
            let p = next_free_position(&occupied, capacity).unwrap();
            assert!(!occupied.contains(&p));
            occupied.push(p);
        }
        occupied.sort();
        assert_eq!(occupied, (1..=capacity).collect::<Vec<_>>());
        assert_eq!(next_free_position(&occupied, capacity), None);
    }

    #[test]
    fn partition_splits_capacity_eight_in_halves() {
        // 8 seats -> two successors of 4
        for position in 1..=4u32 {
            assert_eq!(partition_target(position, 8), (SplitSide::A, position));
        }
        for position in 5..=8u32 {
            assert_eq!(partition_target(position, 8), (SplitSide::B, position - 4));
        }
    }

    #[test]
    fn partition_handles_odd_capacity() {
        // 7 seats -> A gets 3, B gets 4
        assert_eq!(partition_target(3, 7), (SplitSide::A, 3));
        assert_eq!(partition_target(4, 7), (SplitSide::B, 1));
        assert_eq!(partition_target(7, 7), (SplitSide::B, 4));
    }

    #[test]
    fn partition_loses_and_duplicates_nothing() {
        for capacity in [2u32, 4, 7, 8, 9, 16, 31, 32] {
            let mut a = Vec::new();
            let mut b = Vec::new();
            for position in 1..=capacity {
                match partition_target(position, capacity) {
                    (SplitSide::A, p) => a.push(p),
                    (SplitSide::B, p) => b.push(p),
                }
            }
            // Together the successors seat exactly the parent's capacity
            assert_eq!(a.len() + b.len(), capacity as usize);
            // Each successor's positions are contiguous from 1, no gaps
            assert_eq!(a, (1..=capacity / 2).collect::<Vec<_>>());
            assert_eq!(b, (1..=capacity - capacity / 2).collect::<Vec<_>>());
        }
    }
}
