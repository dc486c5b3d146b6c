use redis::aio::{ConnectionLike, ConnectionManager};
use serde_json::Value;

use crate::{
    errors::FleetError,
    runtime::{
        commands::{GuardTag, IndexRange, TransactOutcome, TransactPlan},
        scripts::TRANSACT_SCRIPT,
    },
};

/// The three store primitives the engine is built on.
///
/// Implementations must apply a [`TransactPlan`] atomically: either every guard holds and every op is
/// applied, or nothing is written and the first failing guard is reported.
#[allow(async_fn_in_trait)]
pub trait StoreExecutor {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError>;

    /// Multi-get in one round trip. Output is positionally aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError>;

    /// One page of an ordered index.
    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError>;
}

pub async fn execute_plan<C>(conn: &mut C, plan: &TransactPlan) -> Result<TransactOutcome, FleetError>
where
    C: ConnectionLike + Send,
{
    let payload = serde_json::to_string(plan)?;
    log::debug!(
        "submitting plan with {} guard(s) and {} op(s)",
        plan.guards.len(),
        plan.ops.len()
    );
    let mut invocation = TRANSACT_SCRIPT.prepare_invoke();
    invocation.arg(payload);
    let raw: String = invocation.invoke_async(conn).await?;
    parse_script_response(&raw)
}

/// Decodes the JSON envelope returned by the transaction script.
pub fn parse_script_response(raw: &str) -> Result<TransactOutcome, FleetError> {
    let value: Value = serde_json::from_str(raw)?;

    if let Some(error) = value.get("error") {
        return match error.as_str() {
            Some("condition_failed") => {
                let tag: GuardTag = serde_json::from_value(value.get("tag").cloned().unwrap_or(Value::Null))?;
                let key = value
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default();
                let current = value.get("current").and_then(Value::as_str).map(str::to_string);
                Ok(TransactOutcome::Rejected { tag, key, current })
            }
            Some(other) => Err(FleetError::Other {
                message: other.to_string().into(),
            }),
            None => Err(FleetError::Other {
                message: "lua_error".into(),
            }),
        };
    }

    // cjson encodes an empty results table as an object.
    let results = match value.get("results") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) if map.is_empty() => Vec::new(),
        None => Vec::new(),
        Some(other) => {
            return Err(FleetError::Other {
                message: format!("unexpected script results: {other}").into(),
            });
        }
    };
    Ok(TransactOutcome::Committed(results))
}

/// Redis-backed store. Cloning is cheap; every call works on its own handle of the shared connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, FleetError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl StoreExecutor for RedisStore {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError> {
        let mut conn = self.conn.clone();
        execute_plan(&mut conn, plan).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = if range.descending {
            let start = range
                .after
                .as_ref()
                .map(|before| format!("({before}"))
                .unwrap_or_else(|| "+".to_string());
            redis::cmd("ZREVRANGEBYLEX")
                .arg(index_key)
                .arg(start)
                .arg("-")
                .arg("LIMIT")
                .arg(0)
                .arg(range.limit)
                .query_async(&mut conn)
                .await?
        } else {
            let start = range
                .after
                .as_ref()
                .map(|after| format!("({after}"))
                .unwrap_or_else(|| "-".to_string());
            redis::cmd("ZRANGEBYLEX")
                .arg(index_key)
                .arg(start)
                .arg("+")
                .arg("LIMIT")
                .arg(0)
                .arg(range.limit)
                .query_async(&mut conn)
                .await?
        };
        Ok(members)
    }
}
