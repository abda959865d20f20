use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::keyspace::KeySpace;
use crate::script::{AtomicScriptRunner, Procedure};
use crate::store::ScriptValue;
use crate::LockError;

/// IndexedLock はグループインデックスの 1 エントリ。
///
/// `token` は範囲取得と同じ手続き内で読んだレコードの現在トークン。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedLock {
    pub key: String,
    pub token: Option<i64>,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Range {
    Expired,
    All,
}

impl Range {
    fn procedure(self) -> Procedure {
        match self {
            Range::Expired => Procedure::RangeExpired,
            Range::All => Procedure::RangeAll,
        }
    }
}

/// GroupIndex は名前空間内のグループ別に、未解放ロックを期限でソートして保持する索引。
///
/// 追加・削除は取得・延長・解放の各手続き内でのみ行われる。ここでは読み取りだけを提供する。
#[derive(Clone)]
pub struct GroupIndex {
    runner: AtomicScriptRunner,
    keyspace: KeySpace,
    batch_size: usize,
}

impl GroupIndex {
    pub(crate) fn new(runner: AtomicScriptRunner, keyspace: KeySpace, batch_size: usize) -> Self {
        Self {
            runner,
            keyspace,
            batch_size: batch_size.max(1),
        }
    }

    pub fn group_key(&self, group: &str) -> String {
        self.keyspace.group_key(group)
    }

    /// ストア時刻で期限切れ（expires_at <= now）のエントリをすべて返す。
    pub async fn expired(&self, group: &str) -> Result<Vec<IndexedLock>, LockError> {
        self.expired_stream(group).try_collect().await
    }

    /// 期限に関係なくグループ内の全エントリを返す。
    pub async fn all(&self, group: &str) -> Result<Vec<IndexedLock>, LockError> {
        self.all_stream(group).try_collect().await
    }

    /// 期限切れエントリを `batch_size` 件ずつ遅延取得するストリーム。
    ///
    /// 呼び出すたびに先頭から走査し直す。走査中に他クライアントが解放・延長すると
    /// ページ境界のエントリが欠落または重複することがある。
    pub fn expired_stream(&self, group: &str) -> BoxStream<'static, Result<IndexedLock, LockError>> {
        self.scan(group, Range::Expired)
    }

    pub fn all_stream(&self, group: &str) -> BoxStream<'static, Result<IndexedLock, LockError>> {
        self.scan(group, Range::All)
    }

    fn scan(&self, group: &str, range: Range) -> BoxStream<'static, Result<IndexedLock, LockError>> {
        let runner = self.runner.clone();
        let group_key = self.keyspace.group_key(group);
        let prefix = self.keyspace.record_prefix();
        let batch_size = self.batch_size;

        stream::try_unfold(Some(0usize), move |offset| {
            let runner = runner.clone();
            let group_key = group_key.clone();
            let prefix = prefix.clone();
            async move {
                let Some(offset) = offset else {
                    return Ok::<_, LockError>(None);
                };
                let args = vec![
                    prefix.into_bytes(),
                    offset.to_string().into_bytes(),
                    batch_size.to_string().into_bytes(),
                ];
                let reply = runner.execute(range.procedure(), &[group_key], &args).await?;
                let page = decode_page(reply)?;
                let next = (page.len() == batch_size).then_some(offset + batch_size);
                Ok::<_, LockError>(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, LockError>)))
        .try_flatten()
        .boxed()
    }
}

fn decode_page(reply: ScriptValue) -> Result<Vec<IndexedLock>, LockError> {
    let items = match reply {
        ScriptValue::Array(items) => items,
        ScriptValue::Nil => Vec::new(),
        other => {
            return Err(LockError::UnexpectedReply(format!(
                "range: 配列ではありません: {:?}",
                other
            )))
        }
    };
    if items.len() % 3 != 0 {
        return Err(LockError::UnexpectedReply(format!(
            "range: 要素数が 3 の倍数ではありません: {}",
            items.len()
        )));
    }

    let mut page = Vec::with_capacity(items.len() / 3);
    let mut items = items.into_iter();
    while let (Some(member), Some(token), Some(expires_at)) =
        (items.next(), items.next(), items.next())
    {
        let key = member
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LockError::UnexpectedReply("range: メンバー名が不正です".to_string()))?;
        let expires_at = expires_at
            .as_i64()
            .ok_or_else(|| LockError::UnexpectedReply("range: スコアが不正です".to_string()))?;
        page.push(IndexedLock {
            key,
            token: token.as_i64(),
            expires_at,
        });
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_page() {
        let reply = ScriptValue::Array(vec![
            ScriptValue::from("a"),
            ScriptValue::Int(3),
            ScriptValue::Int(100),
            ScriptValue::from("b"),
            ScriptValue::Nil,
            ScriptValue::Int(200),
        ]);
        let page = decode_page(reply).unwrap();
        assert_eq!(
            page,
            vec![
                IndexedLock {
                    key: "a".to_string(),
                    token: Some(3),
                    expires_at: 100,
                },
                IndexedLock {
                    key: "b".to_string(),
                    token: None,
                    expires_at: 200,
                },
            ]
        );
    }

    #[test]
    fn test_decode_page_rejects_partial_triplet() {
        let reply = ScriptValue::Array(vec![ScriptValue::from("a"), ScriptValue::Int(3)]);
        assert!(matches!(
            decode_page(reply),
            Err(LockError::UnexpectedReply(_))
        ));
    }

    #[test]
    fn test_decode_empty_page() {
        assert!(decode_page(ScriptValue::Array(vec![])).unwrap().is_empty());
        assert!(decode_page(ScriptValue::Nil).unwrap().is_empty());
    }
}
