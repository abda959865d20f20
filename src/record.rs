use crate::store::ScriptValue;
use crate::LockError;

/// LockRecord はストア上のロック所有状態を表す。
///
/// `expires_at` はストア時刻基準の Unix エポックミリ秒。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub expires_at: i64,
    pub token: i64,
    pub recovery_data: Option<Vec<u8>>,
}

impl LockRecord {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Snapshot は INSPECT 手続きの結果（レコードと読み取り時のストア時刻）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub record: Option<LockRecord>,
    pub now: i64,
}

impl Snapshot {
    pub fn from_reply(reply: ScriptValue) -> Result<Self, LockError> {
        let items = reply
            .into_array()
            .ok_or_else(|| LockError::UnexpectedReply("inspect: 配列ではありません".to_string()))?;
        let mut items = items.into_iter();
        let (Some(expires_at), Some(token), Some(data), Some(now)) =
            (items.next(), items.next(), items.next(), items.next())
        else {
            return Err(LockError::UnexpectedReply(
                "inspect: 要素数が不足しています".to_string(),
            ));
        };
        let now = now
            .as_i64()
            .ok_or_else(|| LockError::UnexpectedReply("inspect: 時刻が不正です".to_string()))?;

        let record = match (expires_at.as_i64(), token.as_i64()) {
            (Some(expires_at), Some(token)) => Some(LockRecord {
                expires_at,
                token,
                recovery_data: data.into_bytes(),
            }),
            _ => None,
        };
        Ok(Self { record, now })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_from_present_record() {
        let reply = ScriptValue::Array(vec![
            ScriptValue::from("1500"),
            ScriptValue::from("7"),
            ScriptValue::from("payload"),
            ScriptValue::Int(1000),
        ]);
        let snapshot = Snapshot::from_reply(reply).unwrap();
        assert_eq!(snapshot.now, 1000);
        let record = snapshot.record.unwrap();
        assert_eq!(record.expires_at, 1500);
        assert_eq!(record.token, 7);
        assert_eq!(record.recovery_data.as_deref(), Some(&b"payload"[..]));
        assert!(!record.is_expired_at(1000));
        assert!(record.is_expired_at(1500));
    }

    #[test]
    fn test_snapshot_from_missing_record() {
        let reply = ScriptValue::Array(vec![
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::Nil,
            ScriptValue::Int(1000),
        ]);
        let snapshot = Snapshot::from_reply(reply).unwrap();
        assert!(snapshot.record.is_none());
    }

    #[test]
    fn test_snapshot_rejects_short_reply() {
        let reply = ScriptValue::Array(vec![ScriptValue::Nil]);
        assert!(matches!(
            Snapshot::from_reply(reply),
            Err(LockError::UnexpectedReply(_))
        ));
    }
}
