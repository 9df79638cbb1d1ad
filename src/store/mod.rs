//! The shared-store abstraction: the only network interface this core
//! uses. Mirrors the Redis-class command surface the design requires —
//! `GET/SET NX EX/DEL/EXISTS/INCRBY/INCRBYFLOAT/EXPIRE/HGETALL/HINCRBY/
//! ZADD/ZPOPMIN/ZREMRANGEBYSCORE/ZCARD` plus a script-evaluation
//! primitive with the flat `(script, numkeys, keys, args)` convention a
//! real Lua-scripting store uses, not separate array parameters.

pub mod memory;
pub mod redis_store;
pub mod scripts;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CoreResult;

/// The return value of an `EVAL` call. A real Lua interpreter can return
/// any of these shapes; callers pattern-match on what their script is
/// known to return.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalResult {
    Nil,
    Int(i64),
    Str(String),
    Array(Vec<EvalResult>),
}

impl EvalResult {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EvalResult::Int(i) => Some(*i),
            EvalResult::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EvalResult::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[EvalResult]> {
        match self {
            EvalResult::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// `SET key value NX EX ex_secs`. Returns `true` if the key was set
    /// (i.e. it did not already exist), `false` otherwise.
    async fn set_nx_ex(&self, key: &str, value: &str, ex_secs: u64) -> CoreResult<bool>;

    /// Unconditional `SET key value [EX ex_secs]`.
    async fn set(&self, key: &str, value: &str, ex_secs: Option<u64>) -> CoreResult<()>;

    async fn del(&self, key: &str) -> CoreResult<()>;

    async fn exists(&self, key: &str) -> CoreResult<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> CoreResult<i64>;

    async fn incr_by_float(&self, key: &str, delta: f64) -> CoreResult<f64>;

    async fn expire(&self, key: &str, secs: u64) -> CoreResult<()>;

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()>;

    /// Pops and returns the lowest-scored member, if any.
    async fn zpopmin(&self, key: &str) -> CoreResult<Option<(String, f64)>>;

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<i64>;

    async fn zcard(&self, key: &str) -> CoreResult<i64>;

    /// `EVAL(script, numkeys, keys..., args...)` — flat-argument
    /// convention: `numkeys` comes first, then exactly `numkeys` key
    /// strings, then the remaining args.
    async fn eval(
        &self,
        script: &str,
        numkeys: usize,
        keys: &[String],
        args: &[String],
    ) -> CoreResult<EvalResult>;
}
