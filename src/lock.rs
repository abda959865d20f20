use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::LockClient;
use crate::config::LockOptions;
use crate::record::{LockRecord, Snapshot};
use crate::script::Procedure;
use crate::store::ScriptValue;
use crate::LockError;

/// try_lock の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// 空いていたロックを取得した。
    Acquired,
    /// 期限切れのロックを回収して取得した。前の保持者の処理は未完了の可能性がある。
    Recovered,
    /// 他の保持者が有効なリースを持っている。
    Locked,
}

impl LockOutcome {
    pub fn is_acquired(self) -> bool {
        !matches!(self, LockOutcome::Locked)
    }
}

/// 取得・延長手続きの応答。
#[derive(Debug)]
enum GrantReply {
    Granted {
        status: String,
        token: i64,
        expires_at: i64,
        recovery_data: Option<Vec<u8>>,
    },
    Denied {
        status: String,
    },
}

impl GrantReply {
    fn decode(procedure: Procedure, reply: ScriptValue) -> Result<Self, LockError> {
        let unexpected = |detail: &str| {
            LockError::UnexpectedReply(format!("{}: {}", procedure.name(), detail))
        };
        let mut items = reply
            .into_array()
            .ok_or_else(|| unexpected("配列ではありません"))?
            .into_iter();
        let status = items
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| unexpected("ステータスがありません"))?;

        if status == "locked" || status == "lost" {
            return Ok(GrantReply::Denied { status });
        }
        let token = items
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| unexpected("トークンが不正です"))?;
        let expires_at = items
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| unexpected("期限が不正です"))?;
        let recovery_data = items.next().and_then(ScriptValue::into_bytes);
        Ok(GrantReply::Granted {
            status,
            token,
            expires_at,
            recovery_data,
        })
    }
}

/// Lock は 1 つのキーに対するロックハンドル。
///
/// 作成時点ではストアに副作用はなく、取得に成功したときだけトークンを持つ。
/// ストア上のトークンと一致しなくなったハンドルは古いハンドルであり、
/// unlock / extend は何も変更せずに失敗する。
#[derive(Debug)]
pub struct Lock {
    client: LockClient,
    key: String,
    group: String,
    options: LockOptions,
    token: Option<i64>,
    expires_at: Option<i64>,
    recovery_data: Option<Vec<u8>>,
    overwrite_recovery_data: bool,
    holder_id: Uuid,
}

impl Lock {
    pub(crate) fn new(client: LockClient, key: String) -> Self {
        let group = client.config().default_group.clone();
        let options = client.config().lock_options();
        Self {
            client,
            key,
            group,
            options,
            token: None,
            expires_at: None,
            recovery_data: None,
            overwrite_recovery_data: false,
            holder_id: Uuid::new_v4(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Result<Self, LockError> {
        let group = group.into();
        if group.is_empty() {
            return Err(LockError::InvalidArgument(
                "グループ名は空にできません".to_string(),
            ));
        }
        self.group = group;
        Ok(self)
    }

    pub fn with_options(mut self, options: LockOptions) -> Result<Self, LockError> {
        options.validate()?;
        self.options = options;
        Ok(self)
    }

    /// 初回取得時に保存する回収データを設定する。
    pub fn with_recovery_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.recovery_data = Some(data.into());
        self
    }

    /// 回収データを JSON にシリアライズして設定する。
    pub fn with_recovery_value<T: Serialize>(self, value: &T) -> Result<Self, LockError> {
        let data = serde_json::to_vec(value).map_err(|e| {
            LockError::InvalidArgument(format!("回収データをシリアライズできません: {}", e))
        })?;
        Ok(self.with_recovery_data(data))
    }

    /// 期限切れロックを回収するときに既存の回収データを上書きするか。既定は保持。
    pub fn overwrite_recovery_data(mut self, overwrite: bool) -> Self {
        self.overwrite_recovery_data = overwrite;
        self
    }

    pub(crate) fn with_held_token(mut self, token: Option<i64>, expires_at: i64) -> Self {
        self.token = token;
        self.expires_at = token.map(|_| expires_at);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// このハンドルが保持していると認識しているトークン。
    pub fn token(&self) -> Option<i64> {
        self.token
    }

    /// 最後の取得・延長で設定された期限（ストア時刻のエポックミリ秒）。
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }

    pub fn recovery_data(&self) -> Option<&[u8]> {
        self.recovery_data.as_deref()
    }

    /// 回収データを JSON としてデシリアライズする。
    pub fn recovery_value<T: DeserializeOwned>(&self) -> Result<Option<T>, LockError> {
        self.recovery_data
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()
            .map_err(|e| {
                LockError::InvalidArgument(format!("回収データをデシリアライズできません: {}", e))
            })
    }

    fn record_key(&self) -> String {
        self.client.keyspace().record_key(&self.key)
    }

    fn group_key(&self) -> Option<String> {
        self.client
            .config()
            .group_index
            .then(|| self.client.keyspace().group_key(&self.group))
    }

    fn flag(value: bool) -> Vec<u8> {
        if value { b"1".to_vec() } else { b"0".to_vec() }
    }

    /// ロックの取得を 1 回だけ試みる。
    pub async fn try_lock(&mut self) -> Result<LockOutcome, LockError> {
        let mut keys = vec![self.record_key(), self.client.keyspace().token_key()];
        keys.extend(self.group_key());
        let args = vec![
            self.key.clone().into_bytes(),
            self.options.lease_ms().to_string().into_bytes(),
            Self::flag(self.recovery_data.is_some()),
            self.recovery_data.clone().unwrap_or_default(),
            Self::flag(self.overwrite_recovery_data),
        ];

        let reply = self
            .client
            .runner()
            .execute(Procedure::Acquire, &keys, &args)
            .await?;

        match GrantReply::decode(Procedure::Acquire, reply)? {
            GrantReply::Denied { .. } => {
                tracing::debug!(key = %self.key, holder_id = %self.holder_id, "ロックは他の保持者が取得済みです");
                Ok(LockOutcome::Locked)
            }
            GrantReply::Granted {
                status,
                token,
                expires_at,
                recovery_data,
            } => {
                let outcome = match status.as_str() {
                    "acquired" => LockOutcome::Acquired,
                    "recovered" => LockOutcome::Recovered,
                    other => {
                        return Err(LockError::UnexpectedReply(format!(
                            "acquire: 不明なステータスです: {}",
                            other
                        )))
                    }
                };
                self.token = Some(token);
                self.expires_at = Some(expires_at);
                self.recovery_data = recovery_data;
                if outcome == LockOutcome::Recovered {
                    tracing::info!(
                        key = %self.key,
                        group = %self.group,
                        token,
                        holder_id = %self.holder_id,
                        "期限切れのロックを回収しました"
                    );
                } else {
                    tracing::debug!(key = %self.key, token, holder_id = %self.holder_id, "ロックを取得しました");
                }
                Ok(outcome)
            }
        }
    }

    /// timeout に達するまで poll_interval 間隔で取得を試みる。
    ///
    /// 期限切れロックを回収した場合はロックを保持したまま `LockError::Recovered` を返す。
    pub async fn lock(&mut self) -> Result<(), LockError> {
        let started = Instant::now();
        loop {
            match self.try_lock().await? {
                LockOutcome::Acquired => return Ok(()),
                LockOutcome::Recovered => {
                    return Err(LockError::Recovered {
                        key: self.key.clone(),
                        recovery_data: self.recovery_data.clone(),
                    })
                }
                LockOutcome::Locked => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.options.timeout {
                tracing::debug!(key = %self.key, holder_id = %self.holder_id, "ロック取得がタイムアウトしました");
                return Err(LockError::Timeout {
                    key: self.key.clone(),
                });
            }
            let remaining = self.options.timeout - elapsed;
            tokio::time::sleep(self.options.poll_interval.min(remaining)).await;
        }
    }

    /// ロックを取得できた場合だけ `f` を実行し、終了経路に関係なく解放する。
    ///
    /// 回収取得（Recovered）の場合は `f` を実行せずに解放してエラーを返す。
    /// `f` がパニックした場合も解放してからパニックを再送出する。
    /// 返された Future 自体を途中で破棄した場合は解放されず、リース満了を待つことになる。
    pub async fn with_lock<F, Fut, T>(&mut self, f: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.lock().await {
            Ok(()) => {}
            Err(err @ LockError::Recovered { .. }) => {
                self.release_after_block().await;
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let result = AssertUnwindSafe(f()).catch_unwind().await;
        self.release_after_block().await;
        match result {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn release_after_block(&mut self) {
        match self.try_unlock().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %self.key, holder_id = %self.holder_id, "クリティカルセクション中にロックを失いました");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, holder_id = %self.holder_id, error = %e, "ロックの解放に失敗しました");
            }
        }
    }

    /// ロックを解放する。トークンが一致しなければ何も変更せずに false を返す。
    pub async fn try_unlock(&mut self) -> Result<bool, LockError> {
        let Some(token) = self.token else {
            return Ok(false);
        };
        let keys = vec![self.record_key()];
        let args = vec![
            self.key.clone().into_bytes(),
            token.to_string().into_bytes(),
        ];

        let reply = self
            .client
            .runner()
            .execute(Procedure::Release, &keys, &args)
            .await?;
        let released = reply.as_i64() == Some(1);

        self.token = None;
        self.expires_at = None;
        if released {
            tracing::debug!(key = %self.key, token, holder_id = %self.holder_id, "ロックを解放しました");
        } else {
            tracing::warn!(key = %self.key, token, holder_id = %self.holder_id, "トークンが一致しないためロックを解放できません");
        }
        Ok(released)
    }

    /// ロックを解放する。トークン不一致は `LostLock`、未取得は `NotLocked`。
    pub async fn unlock(&mut self) -> Result<(), LockError> {
        if self.token.is_none() {
            return Err(LockError::NotLocked {
                key: self.key.clone(),
            });
        }
        if self.try_unlock().await? {
            Ok(())
        } else {
            Err(LockError::LostLock {
                key: self.key.clone(),
            })
        }
    }

    /// リースを延長する。成功時は新しいトークンを発行し直す。
    pub async fn try_extend(&mut self) -> Result<bool, LockError> {
        let Some(token) = self.token else {
            return Ok(false);
        };
        let keys = vec![self.record_key(), self.client.keyspace().token_key()];
        let args = vec![
            self.key.clone().into_bytes(),
            token.to_string().into_bytes(),
            self.options.lease_ms().to_string().into_bytes(),
        ];

        let reply = self
            .client
            .runner()
            .execute(Procedure::Extend, &keys, &args)
            .await?;

        match GrantReply::decode(Procedure::Extend, reply)? {
            GrantReply::Granted {
                token: new_token,
                expires_at,
                recovery_data,
                ..
            } => {
                self.token = Some(new_token);
                self.expires_at = Some(expires_at);
                self.recovery_data = recovery_data;
                tracing::debug!(key = %self.key, token = new_token, holder_id = %self.holder_id, "ロックを延長しました");
                Ok(true)
            }
            GrantReply::Denied { status } => {
                self.token = None;
                self.expires_at = None;
                tracing::warn!(key = %self.key, token, status = %status, holder_id = %self.holder_id, "ロックを延長できません");
                Ok(false)
            }
        }
    }

    pub async fn extend(&mut self) -> Result<(), LockError> {
        if self.token.is_none() {
            return Err(LockError::NotLocked {
                key: self.key.clone(),
            });
        }
        if self.try_extend().await? {
            Ok(())
        } else {
            Err(LockError::LostLock {
                key: self.key.clone(),
            })
        }
    }

    async fn inspect(&self) -> Result<Snapshot, LockError> {
        let reply = self
            .client
            .runner()
            .execute(Procedure::Inspect, &[self.record_key()], &[])
            .await?;
        Snapshot::from_reply(reply)
    }

    /// 所有者に関係なくストア上の現在のレコードを読み取る。
    pub async fn fetch_record(&self) -> Result<Option<LockRecord>, LockError> {
        Ok(self.inspect().await?.record)
    }

    /// このハンドルのトークンが現在のトークンであり、リースが有効かどうか。
    pub async fn is_held(&self) -> Result<bool, LockError> {
        let Some(token) = self.token else {
            return Ok(false);
        };
        let Snapshot { record, now } = self.inspect().await?;
        Ok(record.is_some_and(|r| r.token == token && !r.is_expired_at(now)))
    }
}
