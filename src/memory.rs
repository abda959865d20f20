use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::script::Procedure;
use crate::store::{ScriptStore, ScriptValue};
use crate::StoreError;

struct RecordEntry {
    expires_at: i64,
    token: i64,
    recovery_data: Option<Vec<u8>>,
    // 所属するグループインデックスのキー
    group: Option<String>,
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, Procedure>,
    records: HashMap<String, RecordEntry>,
    groups: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
}

impl State {
    fn incr(&mut self, key: &str) -> i64 {
        let counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn zadd(&mut self, group: Option<&String>, member: &str, score: i64) {
        if let Some(group) = group {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(member.to_string(), score);
        }
    }

    fn zrem(&mut self, group: Option<&String>, member: &str) {
        if let Some(group) = group {
            if let Some(set) = self.groups.get_mut(group) {
                set.remove(member);
                if set.is_empty() {
                    self.groups.remove(group);
                }
            }
        }
    }

    /// スコア昇順・同スコアはメンバー名順（Redis のソート済みセットと同じ順序）。
    fn sorted_members(&self, group: &str) -> Vec<(String, i64)> {
        let mut members: Vec<(String, i64)> = self
            .groups
            .get(group)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// InMemoryScriptStore はプロセス内で動作する ScriptStore 実装。
///
/// Lua スクリプトを解釈する代わりに、ロードされたスクリプト本体に対応する手続きを
/// 単一の Mutex の下でネイティブに実行する。テスト・単一プロセス用途向け。
#[derive(Clone)]
pub struct InMemoryScriptStore {
    state: Arc<Mutex<State>>,
    clock_offset_ms: Arc<AtomicI64>,
}

impl InMemoryScriptStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock_offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// ロード済みスクリプトをすべて破棄する（SCRIPT FLUSH 相当）。
    pub async fn flush_scripts(&self) {
        self.state.lock().await.scripts.clear();
    }

    pub async fn is_script_loaded(&self, id: &str) -> bool {
        self.state.lock().await.scripts.contains_key(id)
    }

    /// ストア時刻を進める。
    pub fn advance_clock(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// ストア時刻（Unix エポックミリ秒）。
    pub fn now_millis(&self) -> i64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        wall + self.clock_offset_ms.load(Ordering::SeqCst)
    }

    fn run(
        &self,
        state: &mut State,
        procedure: Procedure,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptValue, StoreError> {
        let now = self.now_millis();
        match procedure {
            Procedure::Acquire => {
                let record = key_at(keys, 0)?;
                let counter = key_at(keys, 1)?;
                let group = keys.get(2);
                let member = arg_str(args, 0)?;
                let lease = arg_i64(args, 1)?;
                let has_data = arg_str(args, 2)? == "1";
                let data = arg_at(args, 3)?;
                let overwrite = arg_str(args, 4)? == "1";

                if let Some(expires_at) = state.records.get(record).map(|r| r.expires_at) {
                    if expires_at > now {
                        return Ok(ScriptValue::Array(vec![
                            ScriptValue::from("locked"),
                            ScriptValue::Int(expires_at),
                        ]));
                    }
                }

                let new_expires_at = expiry(now, lease)?;
                let token = state.incr(counter);
                let prior = state.records.remove(record);
                let status = if prior.is_some() { "recovered" } else { "acquired" };
                let (previous_data, previous_group) = match prior {
                    Some(entry) => (entry.recovery_data, entry.group),
                    None => (None, None),
                };
                let recovery_data = match previous_data {
                    Some(existing) if !overwrite => Some(existing),
                    existing => {
                        if has_data {
                            Some(data.to_vec())
                        } else {
                            existing
                        }
                    }
                };
                if previous_group.as_ref() != group {
                    state.zrem(previous_group.as_ref(), member);
                }
                state.records.insert(
                    record.clone(),
                    RecordEntry {
                        expires_at: new_expires_at,
                        token,
                        recovery_data: recovery_data.clone(),
                        group: group.cloned(),
                    },
                );
                state.zadd(group, member, new_expires_at);

                Ok(ScriptValue::Array(vec![
                    ScriptValue::from(status),
                    ScriptValue::Int(token),
                    ScriptValue::Int(new_expires_at),
                    recovery_data.map_or(ScriptValue::Nil, ScriptValue::Bytes),
                ]))
            }
            Procedure::Release => {
                let record = key_at(keys, 0)?;
                let member = arg_str(args, 0)?;
                let token = arg_i64(args, 1)?;

                if state.records.get(record).map(|r| r.token) != Some(token) {
                    return Ok(ScriptValue::Int(0));
                }
                if let Some(entry) = state.records.remove(record) {
                    state.zrem(entry.group.as_ref(), member);
                }
                Ok(ScriptValue::Int(1))
            }
            Procedure::Extend => {
                let record = key_at(keys, 0)?;
                let counter = key_at(keys, 1)?;
                let member = arg_str(args, 0)?;
                let token = arg_i64(args, 1)?;
                let lease = arg_i64(args, 2)?;

                if state.records.get(record).map(|r| r.token) != Some(token) {
                    return Ok(ScriptValue::Array(vec![ScriptValue::from("lost")]));
                }
                let expires_at = expiry(now, lease)?;
                let new_token = state.incr(counter);
                let (recovery_data, group) = match state.records.get_mut(record) {
                    Some(entry) => {
                        entry.token = new_token;
                        entry.expires_at = expires_at;
                        (entry.recovery_data.clone(), entry.group.clone())
                    }
                    None => (None, None),
                };
                state.zadd(group.as_ref(), member, expires_at);

                Ok(ScriptValue::Array(vec![
                    ScriptValue::from("extended"),
                    ScriptValue::Int(new_token),
                    ScriptValue::Int(expires_at),
                    recovery_data.map_or(ScriptValue::Nil, ScriptValue::Bytes),
                ]))
            }
            Procedure::Inspect => {
                let record = key_at(keys, 0)?;
                let fields = match state.records.get(record) {
                    Some(entry) => vec![
                        ScriptValue::from(entry.expires_at.to_string().as_str()),
                        ScriptValue::from(entry.token.to_string().as_str()),
                        entry
                            .recovery_data
                            .clone()
                            .map_or(ScriptValue::Nil, ScriptValue::Bytes),
                    ],
                    None => vec![ScriptValue::Nil, ScriptValue::Nil, ScriptValue::Nil],
                };
                let mut reply = fields;
                reply.push(ScriptValue::Int(now));
                Ok(ScriptValue::Array(reply))
            }
            Procedure::RangeExpired | Procedure::RangeAll => {
                let group = key_at(keys, 0)?;
                let prefix = arg_str(args, 0)?;
                let offset = usize::try_from(arg_i64(args, 1)?).unwrap_or(0);
                let count = usize::try_from(arg_i64(args, 2)?).unwrap_or(0);

                let reply = state
                    .sorted_members(group)
                    .into_iter()
                    .filter(|(_, score)| procedure == Procedure::RangeAll || *score <= now)
                    .skip(offset)
                    .take(count)
                    .flat_map(|(member, score)| {
                        let token = state
                            .records
                            .get(&format!("{}{}", prefix, member))
                            .map_or(ScriptValue::Nil, |r| ScriptValue::from(r.token.to_string().as_str()));
                        [ScriptValue::from(member.as_str()), token, ScriptValue::Int(score)]
                    })
                    .collect();
                Ok(ScriptValue::Array(reply))
            }
            Procedure::PeekToken => {
                let counter = key_at(keys, 0)?;
                Ok(state
                    .counters
                    .get(counter)
                    .map_or(ScriptValue::Nil, |n| ScriptValue::from(n.to_string().as_str())))
            }
        }
    }
}

impl Default for InMemoryScriptStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(now: i64, lease: i64) -> Result<i64, StoreError> {
    now.checked_add(lease)
        .ok_or_else(|| StoreError::Backend(format!("リース期間が大きすぎます: {}ms", lease)))
}

fn key_at(keys: &[String], index: usize) -> Result<&String, StoreError> {
    keys.get(index)
        .ok_or_else(|| StoreError::Backend(format!("KEYS[{}] がありません", index + 1)))
}

fn arg_at(args: &[Vec<u8>], index: usize) -> Result<&[u8], StoreError> {
    args.get(index)
        .map(Vec::as_slice)
        .ok_or_else(|| StoreError::Backend(format!("ARGV[{}] がありません", index + 1)))
}

fn arg_str(args: &[Vec<u8>], index: usize) -> Result<&str, StoreError> {
    std::str::from_utf8(arg_at(args, index)?)
        .map_err(|_| StoreError::Backend(format!("ARGV[{}] が UTF-8 ではありません", index + 1)))
}

fn arg_i64(args: &[Vec<u8>], index: usize) -> Result<i64, StoreError> {
    arg_str(args, index)?
        .parse()
        .map_err(|_| StoreError::Backend(format!("ARGV[{}] が整数ではありません", index + 1)))
}

#[async_trait]
impl ScriptStore for InMemoryScriptStore {
    fn script_id(&self, body: &str) -> String {
        hex::encode(Sha256::digest(body.as_bytes()))
    }

    async fn load_script(&self, body: &str) -> Result<String, StoreError> {
        let procedure = Procedure::from_body(body).ok_or_else(|| {
            StoreError::Backend("インメモリストアが対応していないスクリプトです".to_string())
        })?;
        let id = self.script_id(body);
        self.state.lock().await.scripts.insert(id.clone(), procedure);
        Ok(id)
    }

    async fn eval_script(
        &self,
        id: &str,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptValue, StoreError> {
        let mut state = self.state.lock().await;
        let procedure = *state
            .scripts
            .get(id)
            .ok_or_else(|| StoreError::NoScript(id.to_string()))?;
        self.run(&mut state, procedure, keys, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ACQUIRE_SCRIPT, PEEK_TOKEN_SCRIPT};

    #[tokio::test]
    async fn test_eval_unknown_script_returns_noscript() {
        let store = InMemoryScriptStore::new();
        let id = store.script_id(PEEK_TOKEN_SCRIPT);
        let result = store
            .eval_script(&id, &["ns:token".to_string()], &[])
            .await;
        assert_eq!(result, Err(StoreError::NoScript(id)));
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_body() {
        let store = InMemoryScriptStore::new();
        let result = store.load_script("return 1").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_flush_scripts_forgets_loaded_ids() {
        let store = InMemoryScriptStore::new();
        let id = store.load_script(ACQUIRE_SCRIPT).await.unwrap();
        assert_eq!(id, store.script_id(ACQUIRE_SCRIPT));
        assert!(store.is_script_loaded(&id).await);
        store.flush_scripts().await;
        assert!(!store.is_script_loaded(&id).await);
    }

    #[tokio::test]
    async fn test_acquire_then_locked() {
        let store = InMemoryScriptStore::new();
        let id = store.load_script(ACQUIRE_SCRIPT).await.unwrap();
        let keys = vec!["ns:a".to_string(), "ns:token".to_string()];
        let args = vec![
            b"a".to_vec(),
            b"1000".to_vec(),
            b"0".to_vec(),
            Vec::new(),
            b"0".to_vec(),
        ];

        let first = store.eval_script(&id, &keys, &args).await.unwrap();
        let first = first.into_array().unwrap();
        assert_eq!(first[0].as_str(), Some("acquired"));
        assert_eq!(first[1], ScriptValue::Int(1));
        assert!(first[3].is_nil());

        let second = store.eval_script(&id, &keys, &args).await.unwrap();
        let second = second.into_array().unwrap();
        assert_eq!(second[0].as_str(), Some("locked"));
    }

    #[test]
    fn test_advance_clock() {
        let store = InMemoryScriptStore::new();
        let before = store.now_millis();
        store.advance_clock(Duration::from_secs(60));
        assert!(store.now_millis() >= before + 60_000);
    }
}
