//! Redis-backed `SharedStore`, used in any deployment with more than
//! one process sharing WAL-writer/billing-lock/credit state. Built on
//! `redis`'s `ConnectionManager`, which reconnects transparently and
//! lets every call be a simple `&self` method instead of needing a
//! `&mut` pooled connection threaded through the whole core.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script, Value};

use super::{EvalResult, SharedStore};
use crate::error::{CoreError, CoreResult};

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CoreError::SharedStoreUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::SharedStoreUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

fn map_err<T>(r: RedisResult<T>) -> CoreResult<T> {
    r.map_err(|e| CoreError::SharedStoreUnavailable(e.to_string()))
}

fn value_to_eval_result(value: Value) -> EvalResult {
    match value {
        Value::Nil => EvalResult::Nil,
        Value::Int(i) => EvalResult::Int(i),
        Value::Data(bytes) => EvalResult::Str(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Bulk(items) => EvalResult::Array(items.into_iter().map(value_to_eval_result).collect()),
        Value::Status(s) => EvalResult::Str(s),
        Value::Okay => EvalResult::Str("OK".to_string()),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        map_err(conn.get(key).await)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ex_secs: u64) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let result: RedisResult<bool> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ex_secs)
            .query_async(&mut conn)
            .await
            .map(|v: Option<String>| v.is_some());
        map_err(result)
    }

    async fn set(&self, key: &str, value: &str, ex_secs: Option<u64>) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        match ex_secs {
            Some(secs) => map_err(conn.set_ex(key, value, secs).await),
            None => map_err(conn.set(key, value).await),
        }
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        map_err(conn.del(key).await)
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        map_err(conn.exists(key).await)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        map_err(conn.incr(key, delta).await)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> CoreResult<f64> {
        let mut conn = self.conn.clone();
        let result: RedisResult<f64> = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await;
        map_err(result)
    }

    async fn expire(&self, key: &str, secs: u64) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        map_err(conn.expire(key, secs as i64).await)
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        map_err(conn.hgetall(key).await)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        map_err(conn.hincr(key, field, delta).await)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        map_err(conn.zadd(key, member, score).await)
    }

    async fn zpopmin(&self, key: &str) -> CoreResult<Option<(String, f64)>> {
        let mut conn = self.conn.clone();
        let result: Vec<(String, f64)> = map_err(conn.zpopmin(key, 1).await)?;
        Ok(result.into_iter().next())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        map_err(conn.zrembyscore(key, min, max).await)
    }

    async fn zcard(&self, key: &str) -> CoreResult<i64> {
        let mut conn = self.conn.clone();
        map_err(conn.zcard(key).await)
    }

    async fn eval(
        &self,
        script: &str,
        numkeys: usize,
        keys: &[String],
        args: &[String],
    ) -> CoreResult<EvalResult> {
        let mut conn = self.conn.clone();
        let mut invocation = Script::new(script).prepare_invoke();
        for key in &keys[..numkeys] {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let value: Value = map_err(invocation.invoke_async(&mut conn).await)?;
        Ok(value_to_eval_result(value))
    }
}
