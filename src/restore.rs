// Bulk restore reducers for disaster recovery
// Accept JSON arrays exported from admin panel (TypeScript SDK format)

use spacetimedb::{reducer, ReducerContext, Timestamp, log, Table};
use crate::{ChallengeTable, TableMember, TableStatus, UserAccount};
use crate::{authorized_worker, challenge_table, table_member, user_account};
use serde_json::Value;

/// Parse Timestamp from SDK JSON format:
/// {"__timestamp_micros_since_unix_epoch__": "123456"}
/// Older admin panel exports carry plain ISO-8601 strings instead.
fn parse_timestamp_json(val: &Value) -> Result<Timestamp, String> {
    if let Some(s) = val.as_str() {
        let dt = chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| format!("Invalid ISO-8601 timestamp: {}", e))?;
        return Ok(Timestamp::from_micros_since_unix_epoch(dt.timestamp_micros()));
    }

    let micros_str = val.get("__timestamp_micros_since_unix_epoch__")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp field")?;

    let micros: i64 = micros_str.parse()
        .map_err(|e| format!("Invalid timestamp micros: {}", e))?;

    Ok(Timestamp::from_micros_since_unix_epoch(micros))
}

/// Parse an optional timestamp field (absent or null = None)
fn parse_optional_timestamp(val: Option<&Value>) -> Result<Option<Timestamp>, String> {
    match val {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => parse_timestamp_json(v).map(Some),
    }
}

/// Parse a table status from its export string
fn parse_status(s: &str) -> Result<TableStatus, String> {
    match s {
        "open" => Ok(TableStatus::Open),
        "full" => Ok(TableStatus::Full),
        "completed" => Ok(TableStatus::Completed),
        "archived" => Ok(TableStatus::Archived),
        other => Err(format!("Unknown table status '{}'", other)),
    }
}

/// Bulk restore user_account table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_user_account(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_user_account attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let accounts = data.as_array()
        .ok_or("Expected JSON array of user accounts")?;

    let mut count = 0;
    for (i, a) in accounts.iter().enumerate() {
        let account = UserAccount {
            id: a.get("id").and_then(|v| v.as_str()).ok_or(format!("Account {}: missing id", i))?.to_string(),
            name: a.get("name").and_then(|v| v.as_str()).ok_or(format!("Account {}: missing name", i))?.to_string(),
            qoinz_balance: a.get("qoinzBalance").and_then(|v| v.as_i64()).ok_or(format!("Account {}: missing qoinzBalance", i))?,
            exp: a.get("exp").and_then(|v| v.as_u64()).ok_or(format!("Account {}: missing exp", i))?,
            level: a.get("level").and_then(|v| v.as_u64()).ok_or(format!("Account {}: missing level", i))? as u32,
            table_slots: a.get("tableSlots").and_then(|v| v.as_u64()).ok_or(format!("Account {}: missing tableSlots", i))? as u32,
            total_qoinz_earned: a.get("totalQoinzEarned").and_then(|v| v.as_i64()).unwrap_or(0),
            total_exp_earned: a.get("totalExpEarned").and_then(|v| v.as_u64()).unwrap_or(0),
            created_at: parse_timestamp_json(a.get("createdAt").ok_or(format!("Account {}: missing createdAt", i))?)?,
            last_level_up: parse_optional_timestamp(a.get("lastLevelUp"))?,
        };

        ctx.db.user_account().insert(account);
        count += 1;
    }

    log::info!("✅ Restored {} user_account records", count);
    Ok(())
}

/// Bulk restore challenge_table table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_challenge_table(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_challenge_table attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let tables = data.as_array()
        .ok_or("Expected JSON array of challenge tables")?;

    let mut count = 0;
    for (i, t) in tables.iter().enumerate() {
        let status = parse_status(
            t.get("status").and_then(|v| v.as_str()).ok_or(format!("Table {}: missing status", i))?,
        )?;

        let table = ChallengeTable {
            id: t.get("id").and_then(|v| v.as_u64()).ok_or(format!("Table {}: missing id", i))?,
            owner_id: t.get("ownerId").and_then(|v| v.as_str()).ok_or(format!("Table {}: missing ownerId", i))?.to_string(),
            name: t.get("name").and_then(|v| v.as_str()).ok_or(format!("Table {}: missing name", i))?.to_string(),
            status,
            max_members: t.get("maxMembers").and_then(|v| v.as_u64()).ok_or(format!("Table {}: missing maxMembers", i))? as u32,
            entry_fee: t.get("entryFee").and_then(|v| v.as_i64()).ok_or(format!("Table {}: missing entryFee", i))?,
            platform_fee: t.get("platformFee").and_then(|v| v.as_i64()).unwrap_or(0),
            reward_pool: t.get("rewardPool").and_then(|v| v.as_i64()).ok_or(format!("Table {}: missing rewardPool", i))?,
            exp_pool: t.get("expPool").and_then(|v| v.as_u64()).unwrap_or(0),
            reward_amount: t.get("rewardAmount").and_then(|v| v.as_i64()).unwrap_or(0),
            level: t.get("level").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
            parent_table_id: t.get("parentTableId").and_then(|v| v.as_u64()),
            created_at: parse_timestamp_json(t.get("createdAt").ok_or(format!("Table {}: missing createdAt", i))?)?,
            completed_at: parse_optional_timestamp(t.get("completedAt"))?,
            updated_at: parse_timestamp_json(
                t.get("updatedAt").or_else(|| t.get("createdAt")).ok_or(format!("Table {}: missing updatedAt", i))?,
            )?,
        };

        ctx.db.challenge_table().insert(table);
        count += 1;
    }

    log::info!("✅ Restored {} challenge_table records", count);
    Ok(())
}

/// Bulk restore table_member table from JSON array
/// Protected by authorization check - only authorized workers can call this
#[reducer]
pub fn bulk_restore_table_member(ctx: &ReducerContext, json_data: String) -> Result<(), String> {
    if ctx.db.authorized_worker().identity().find(&ctx.sender).is_none() {
        log::warn!("Unauthorized bulk_restore_table_member attempt by {}", ctx.sender);
        return Err("Unauthorized".to_string());
    }

    let data: Value = serde_json::from_str(&json_data)
        .map_err(|e| format!("Invalid JSON: {}", e))?;

    let members = data.as_array()
        .ok_or("Expected JSON array of table members")?;

    let mut count = 0;
    for (i, m) in members.iter().enumerate() {
        let member = TableMember {
            id: 0, // auto_inc
            table_id: m.get("tableId").and_then(|v| v.as_u64()).ok_or(format!("Member {}: missing tableId", i))?,
            user_id: m.get("userId").and_then(|v| v.as_str()).ok_or(format!("Member {}: missing userId", i))?.to_string(),
            position: m.get("position").and_then(|v| v.as_u64()).ok_or(format!("Member {}: missing position", i))? as u32,
            current_level: m.get("currentLevel").and_then(|v| v.as_u64()).unwrap_or(1) as u32,
            joined_at: parse_timestamp_json(m.get("joinedAt").ok_or(format!("Member {}: missing joinedAt", i))?)?,
            left_at: parse_optional_timestamp(m.get("leftAt"))?,
            is_winner: m.get("isWinner").and_then(|v| v.as_bool()).unwrap_or(false),
        };

        ctx.db.table_member().insert(member);
        count += 1;
    }

    log::info!("✅ Restored {} table_member records", count);
    Ok(())
}
