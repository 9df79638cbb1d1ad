//! In-process `SharedStore` used for tests and single-node deployments
//! that don't want a Redis dependency. Expiry is checked lazily on
//! access rather than via a background sweeper, matching the rest of
//! this crate's preference for explicit, synchronous-feeling state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{scripts, EvalResult, SharedStore};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
}

impl Inner {
    fn is_live(entry: &StringEntry) -> bool {
        entry.expires_at.map(|e| Instant::now() < e).unwrap_or(true)
    }

    fn get_string(&mut self, key: &str) -> Option<String> {
        let expired = match self.strings.get(key) {
            Some(e) if !Self::is_live(e) => true,
            _ => false,
        };
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key).map(|e| e.value.clone())
    }
}

pub struct InMemoryStore {
    inner: tokio::sync::Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.inner.lock().await.get_string(key))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ex_secs: u64) -> CoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.get_string(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ex_secs)),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ex_secs: Option<u64>) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ex_secs.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        Ok(self.inner.lock().await.get_string(key).is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> CoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let current: i64 = inner.get_string(key).and_then(|v| v.parse().ok()).unwrap_or(0);
        let updated = current + delta;
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: updated.to_string(),
                expires_at: None,
            },
        );
        Ok(updated)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> CoreResult<f64> {
        let mut inner = self.inner.lock().await;
        let current: f64 = inner.get_string(key).and_then(|v| v.parse().ok()).unwrap_or(0.0);
        let updated = current + delta;
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: updated.to_string(),
                expires_at: None,
            },
        );
        Ok(updated)
    }

    async fn expire(&self, key: &str, secs: u64) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(secs));
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> CoreResult<HashMap<String, String>> {
        Ok(self.inner.lock().await.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let map = inner.hashes.entry(key.to_string()).or_default();
        let current: i64 = map.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let updated = current + delta;
        map.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> CoreResult<Option<(String, f64)>> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        if set.is_empty() {
            return Ok(None);
        }
        let min_idx = set
            .iter()
            .enumerate()
            .min_by(|a, b| a.1 .1.partial_cmp(&b.1 .1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        Ok(Some(set.remove(min_idx)))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        let before = set.len();
        set.retain(|(_, score)| *score < min || *score > max);
        Ok((before - set.len()) as i64)
    }

    async fn zcard(&self, key: &str) -> CoreResult<i64> {
        Ok(self
            .inner
            .lock()
            .await
            .zsets
            .get(key)
            .map(|s| s.len())
            .unwrap_or(0) as i64)
    }

    async fn eval(
        &self,
        script: &str,
        _numkeys: usize,
        keys: &[String],
        args: &[String],
    ) -> CoreResult<EvalResult> {
        let mut inner = self.inner.lock().await;
        match script {
            scripts::WAL_LOCK_ACQUIRE => {
                let lock_key = &keys[0];
                let fence_key = &keys[1];
                let instance_id = &args[0];
                let ttl: u64 = args[1].parse().unwrap_or(30);
                let acquired = if inner.get_string(lock_key).is_none() {
                    inner.strings.insert(
                        lock_key.clone(),
                        StringEntry {
                            value: instance_id.clone(),
                            expires_at: Some(Instant::now() + Duration::from_secs(ttl)),
                        },
                    );
                    1
                } else {
                    0
                };
                let fence: i64 = inner.get_string(fence_key).and_then(|v| v.parse().ok()).unwrap_or(0) + 1;
                inner.strings.insert(
                    fence_key.clone(),
                    StringEntry {
                        value: fence.to_string(),
                        expires_at: None,
                    },
                );
                Ok(EvalResult::Array(vec![EvalResult::Int(acquired), EvalResult::Int(fence)]))
            }
            scripts::WAL_LOCK_RELEASE | scripts::BILLING_LOCK_ACQUIRE | scripts::BILLING_LOCK_RELEASE => {
                let lock_key = &keys[0];
                let arg0 = &args[0];
                if script == scripts::BILLING_LOCK_ACQUIRE {
                    let ttl: u64 = args[1].parse().unwrap_or(30);
                    if inner.get_string(lock_key).is_none() {
                        inner.strings.insert(
                            lock_key.clone(),
                            StringEntry {
                                value: arg0.clone(),
                                expires_at: Some(Instant::now() + Duration::from_secs(ttl)),
                            },
                        );
                        Ok(EvalResult::Int(1))
                    } else {
                        Ok(EvalResult::Int(0))
                    }
                } else {
                    let held_by = inner.get_string(lock_key);
                    if held_by.as_deref() == Some(arg0.as_str()) {
                        inner.strings.remove(lock_key);
                        Ok(EvalResult::Int(1))
                    } else {
                        Ok(EvalResult::Int(0))
                    }
                }
            }
            scripts::CREDIT_MOVE => {
                let key = &keys[0];
                let from_field = &args[0];
                let to_field = &args[1];
                let amount: i64 = args[2].parse().unwrap_or(0);
                let map = inner.hashes.entry(key.clone()).or_default();
                let have: i64 = map.get(from_field).and_then(|v| v.parse().ok()).unwrap_or(0);
                if have < amount {
                    return Ok(EvalResult::Int(0));
                }
                let new_from = have - amount;
                let new_to = map.get(to_field).and_then(|v| v.parse().ok()).unwrap_or(0) + amount;
                map.insert(from_field.clone(), new_from.to_string());
                map.insert(to_field.clone(), new_to.to_string());
                Ok(EvalResult::Int(1))
            }
            scripts::CREDIT_NOTE_CAP_CHECK => {
                let key = &keys[0];
                let amount: f64 = args[0].parse().unwrap_or(0.0);
                let cap: f64 = args[1].parse().unwrap_or(0.0);
                let current: f64 = inner.get_string(key).and_then(|v| v.parse().ok()).unwrap_or(0.0);
                let total = current + amount;
                if total > cap {
                    return Ok(EvalResult::Int(0));
                }
                let ttl: u64 = args.get(2).and_then(|v| v.parse().ok()).unwrap_or(86_400);
                inner.strings.insert(
                    key.clone(),
                    StringEntry {
                        value: total.to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl)),
                    },
                );
                Ok(EvalResult::Int(1))
            }
            other => Err(CoreError::SharedStoreUnavailable(format!(
                "in-memory store does not recognize script: {}",
                &other[..other.len().min(40)]
            ))),
        }
    }
}
