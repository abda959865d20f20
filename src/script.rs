use std::collections::HashMap;
use std::sync::Arc;

use crate::store::{ScriptStore, ScriptValue};
use crate::StoreError;

/// ACQUIRE_SCRIPT はロックの取得・回収をアトミックに行う。
///
/// レコードの `group` フィールドに所属するグループインデックスのキーを保存する。
/// 別グループのハンドルが回収した場合は旧グループのメンバーを削除する。
///
/// KEYS[1]: ロックレコード
/// KEYS[2]: トークンカウンター
/// KEYS[3]: グループインデックス（省略可）
/// ARGV[1]: グループメンバー名（呼び出し側のキー）
/// ARGV[2]: リース期間（ミリ秒）
/// ARGV[3]: 回収データ有無 ("1"/"0")
/// ARGV[4]: 回収データ
/// ARGV[5]: 既存の回収データを上書きするか ("1"/"0")
///
/// Returns: {'locked', expires_at} または {'acquired'|'recovered', token, expires_at, recovery_data}
pub const ACQUIRE_SCRIPT: &str = r#"
local record = KEYS[1]
local counter = KEYS[2]
local group = KEYS[3]
local member = ARGV[1]
local lease = tonumber(ARGV[2])
local has_data = ARGV[3] == '1'
local data = ARGV[4]
local overwrite = ARGV[5] == '1'

local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)

local expires_at = tonumber(redis.call('HGET', record, 'expiresAt'))
if expires_at and expires_at > now then
    return {'locked', expires_at}
end

local prior_group = redis.call('HGET', record, 'group')
local token = redis.call('INCR', counter)
local new_expires_at = now + lease
redis.call('HSET', record, 'expiresAt', new_expires_at, 'token', token)

local status = 'acquired'
if expires_at then
    status = 'recovered'
    if has_data and (overwrite or redis.call('HEXISTS', record, 'recoveryData') == 0) then
        redis.call('HSET', record, 'recoveryData', data)
    end
elseif has_data then
    redis.call('HSET', record, 'recoveryData', data)
end

if prior_group and prior_group ~= group then
    redis.call('ZREM', prior_group, member)
end
if group then
    redis.call('HSET', record, 'group', group)
    redis.call('ZADD', group, new_expires_at, member)
else
    redis.call('HDEL', record, 'group')
end

return {status, token, new_expires_at, redis.call('HGET', record, 'recoveryData')}
"#;

/// RELEASE_SCRIPT はトークンが一致する場合のみレコードと所属グループのメンバーを削除する。
///
/// KEYS[1]: ロックレコード
/// ARGV[1]: グループメンバー名
/// ARGV[2]: トークン
pub const RELEASE_SCRIPT: &str = r#"
local record = KEYS[1]

if redis.call('HGET', record, 'token') == ARGV[2] then
    local group = redis.call('HGET', record, 'group')
    redis.call('DEL', record)
    if group then
        redis.call('ZREM', group, ARGV[1])
    end
    return 1
end
return 0
"#;

/// EXTEND_SCRIPT はトークンが一致する場合に新しいトークンを発行してリースを延長する。
///
/// グループインデックスはレコードに保存された所属グループのものを更新する。
///
/// KEYS[1]: ロックレコード
/// KEYS[2]: トークンカウンター
/// ARGV[1]: グループメンバー名
/// ARGV[2]: トークン
/// ARGV[3]: リース期間（ミリ秒）
///
/// Returns: {'lost'} または {'extended', token, expires_at, recovery_data}
pub const EXTEND_SCRIPT: &str = r#"
local record = KEYS[1]
local counter = KEYS[2]

if redis.call('HGET', record, 'token') ~= ARGV[2] then
    return {'lost'}
end

local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)

local token = redis.call('INCR', counter)
local expires_at = now + tonumber(ARGV[3])
redis.call('HSET', record, 'expiresAt', expires_at, 'token', token)

local group = redis.call('HGET', record, 'group')
if group then
    redis.call('ZADD', group, expires_at, ARGV[1])
end

return {'extended', token, expires_at, redis.call('HGET', record, 'recoveryData')}
"#;

/// INSPECT_SCRIPT はレコードの現在値とストア時刻を読み取る。
///
/// KEYS[1]: ロックレコード
///
/// Returns: {expires_at, token, recovery_data, now}
pub const INSPECT_SCRIPT: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'expiresAt', 'token', 'recoveryData')
local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)
return {fields[1], fields[2], fields[3], now}
"#;

/// RANGE_EXPIRED_SCRIPT は期限切れのグループメンバーをページ単位で返す。
///
/// KEYS[1]: グループインデックス
/// ARGV[1]: レコードキーのプレフィックス
/// ARGV[2]: オフセット
/// ARGV[3]: 件数
///
/// Returns: {member, token, expires_at, ...}
pub const RANGE_EXPIRED_SCRIPT: &str = r#"
local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)

local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', ARGV[2], ARGV[3])
local result = {}
for i = 1, #members, 2 do
    table.insert(result, members[i])
    table.insert(result, redis.call('HGET', ARGV[1] .. members[i], 'token'))
    table.insert(result, tonumber(members[i + 1]))
end
return result
"#;

/// RANGE_ALL_SCRIPT はスコアに関係なくグループメンバーをページ単位で返す。
///
/// KEYS[1]: グループインデックス
/// ARGV[1]: レコードキーのプレフィックス
/// ARGV[2]: オフセット
/// ARGV[3]: 件数
pub const RANGE_ALL_SCRIPT: &str = r#"
local offset = tonumber(ARGV[2])
local stop = offset + tonumber(ARGV[3]) - 1

local members = redis.call('ZRANGE', KEYS[1], offset, stop, 'WITHSCORES')
local result = {}
for i = 1, #members, 2 do
    table.insert(result, members[i])
    table.insert(result, redis.call('HGET', ARGV[1] .. members[i], 'token'))
    table.insert(result, tonumber(members[i + 1]))
end
return result
"#;

/// PEEK_TOKEN_SCRIPT はトークンカウンターの現在値を返す。
pub const PEEK_TOKEN_SCRIPT: &str = r#"
return redis.call('GET', KEYS[1])
"#;

/// Procedure はストア上で実行されるアトミック手続きの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Procedure {
    Acquire,
    Release,
    Extend,
    Inspect,
    RangeExpired,
    RangeAll,
    PeekToken,
}

impl Procedure {
    pub const ALL: [Procedure; 7] = [
        Procedure::Acquire,
        Procedure::Release,
        Procedure::Extend,
        Procedure::Inspect,
        Procedure::RangeExpired,
        Procedure::RangeAll,
        Procedure::PeekToken,
    ];

    pub fn body(self) -> &'static str {
        match self {
            Procedure::Acquire => ACQUIRE_SCRIPT,
            Procedure::Release => RELEASE_SCRIPT,
            Procedure::Extend => EXTEND_SCRIPT,
            Procedure::Inspect => INSPECT_SCRIPT,
            Procedure::RangeExpired => RANGE_EXPIRED_SCRIPT,
            Procedure::RangeAll => RANGE_ALL_SCRIPT,
            Procedure::PeekToken => PEEK_TOKEN_SCRIPT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Procedure::Acquire => "acquire",
            Procedure::Release => "release",
            Procedure::Extend => "extend",
            Procedure::Inspect => "inspect",
            Procedure::RangeExpired => "range_expired",
            Procedure::RangeAll => "range_all",
            Procedure::PeekToken => "peek_token",
        }
    }

    /// スクリプト本体から手続きを逆引きする。
    pub fn from_body(body: &str) -> Option<Procedure> {
        Self::ALL.into_iter().find(|p| p.body() == body)
    }
}

/// ScriptRegistry は手続きごとのストア上の識別子を保持する。構築後は不変。
#[derive(Debug, Clone)]
pub struct ScriptRegistry {
    ids: HashMap<Procedure, String>,
}

impl ScriptRegistry {
    pub fn new(store: &dyn ScriptStore) -> Self {
        let ids = Procedure::ALL
            .into_iter()
            .map(|p| (p, store.script_id(p.body())))
            .collect();
        Self { ids }
    }

    pub fn id(&self, procedure: Procedure) -> &str {
        // ALL の全要素を new で登録しているため必ず存在する
        self.ids.get(&procedure).map_or("", String::as_str)
    }
}

/// AtomicScriptRunner は手続きを 1 回の論理呼び出しとして実行する。
///
/// ストアがスクリプトを忘れていた場合（NOSCRIPT）のみ再ロードして 1 回だけ再実行する。
/// それ以外のエラーはそのまま返す。
#[derive(Clone)]
pub struct AtomicScriptRunner {
    store: Arc<dyn ScriptStore>,
    registry: Arc<ScriptRegistry>,
}

impl AtomicScriptRunner {
    pub fn new(store: Arc<dyn ScriptStore>) -> Self {
        let registry = Arc::new(ScriptRegistry::new(store.as_ref()));
        Self { store, registry }
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        procedure: Procedure,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptValue, StoreError> {
        let id = self.registry.id(procedure);
        match self.store.eval_script(id, keys, args).await {
            Err(StoreError::NoScript(_)) => {
                tracing::debug!(
                    procedure = procedure.name(),
                    "スクリプトが未ロードのため再ロードして再実行します"
                );
                let loaded = self.store.load_script(procedure.body()).await?;
                if loaded != id {
                    tracing::warn!(
                        procedure = procedure.name(),
                        expected = id,
                        loaded = %loaded,
                        "ロードされたスクリプト識別子が一致しません"
                    );
                }
                self.store.eval_script(&loaded, keys, args).await
            }
            other => other,
        }
    }
}
