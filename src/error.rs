use thiserror::Error;

/// StoreError はバックエンドストアが返すエラーを表す。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// 指定されたスクリプトがストアにロードされていない（Redis の NOSCRIPT に相当）。
    #[error("スクリプトがロードされていません: {0}")]
    NoScript(String),
    #[error("ストアエラー: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("不正な引数です: {0}")]
    InvalidArgument(String),
    #[error("ロック取得がタイムアウトしました: {key}")]
    Timeout { key: String },
    /// 期限切れロックを回収して取得した。ハンドルはロックを保持している。
    #[error("期限切れのロックを回収しました: {key}")]
    Recovered {
        key: String,
        recovery_data: Option<Vec<u8>>,
    },
    #[error("ロックを失いました: {key}")]
    LostLock { key: String },
    #[error("ロックを保持していません: {key}")]
    NotLocked { key: String },
    #[error("予期しないスクリプト応答です: {0}")]
    UnexpectedReply(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// 取得自体は成功しているエラー（Recovered）かどうかを返す。
    pub fn is_recovered(&self) -> bool {
        matches!(self, LockError::Recovered { .. })
    }
}
