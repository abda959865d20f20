use async_trait::async_trait;

use crate::StoreError;

/// ScriptValue は Lua スクリプトの戻り値を表す。
///
/// Lua から Redis への変換規則と同じ形をとる:
/// false/nil は `Nil`、数値は `Int`、文字列は `Bytes`、テーブルは `Array`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Bytes(Vec<u8>),
    Status(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// 整数として解釈する。数値文字列も受け付ける。
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(n) => Some(*n),
            ScriptValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            ScriptValue::Status(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::Bytes(b) => std::str::from_utf8(b).ok(),
            ScriptValue::Status(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            ScriptValue::Bytes(b) => Some(b),
            ScriptValue::Status(s) => Some(s.into_bytes()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<ScriptValue>> {
        match self {
            ScriptValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Int(value)
    }
}

/// ScriptStore はアトミックなスクリプト実行をサポートするキーバリューストアの抽象。
///
/// 実装は 1 回の `eval_script` 呼び出しを他クライアントの操作と交錯させずに
/// 実行しなければならない。
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// スクリプト本体に対してストアが使用する識別子を返す。
    fn script_id(&self, body: &str) -> String;

    /// スクリプトをストアに登録し、識別子を返す。
    async fn load_script(&self, body: &str) -> Result<String, StoreError>;

    /// 登録済みスクリプトを実行する。未登録なら `StoreError::NoScript` を返す。
    async fn eval_script(
        &self,
        id: &str,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptValue, StoreError>;
}
