use crate::client::LockClient;
use crate::group::IndexedLock;
use crate::lock::Lock;
use crate::LockError;

/// LockRegistry は名前空間単位でロックを列挙する。
///
/// 返されるハンドルは索引から読んだ現在のトークンを保持しているため、
/// 取得し直さずに extend / unlock できる。別プロセスが放棄したロックを
/// 回収・解放する用途を想定している。
#[derive(Debug, Clone)]
pub struct LockRegistry {
    client: LockClient,
}

impl LockRegistry {
    pub(crate) fn new(client: LockClient) -> Self {
        Self { client }
    }

    /// 期限切れのロック。`group` が None の場合は既定グループ。
    pub async fn expired(&self, group: Option<&str>) -> Result<Vec<Lock>, LockError> {
        let group = self.resolve_group(group)?;
        let entries = self.client.group_index().expired(&group).await?;
        self.to_locks(&group, entries)
    }

    /// 期限に関係なくグループ内のすべてのロック。
    pub async fn all(&self, group: Option<&str>) -> Result<Vec<Lock>, LockError> {
        let group = self.resolve_group(group)?;
        let entries = self.client.group_index().all(&group).await?;
        self.to_locks(&group, entries)
    }

    fn resolve_group(&self, group: Option<&str>) -> Result<String, LockError> {
        match group {
            Some("") => Err(LockError::InvalidArgument(
                "グループ名は空にできません".to_string(),
            )),
            Some(group) => Ok(group.to_string()),
            None => Ok(self.client.config().default_group.clone()),
        }
    }

    fn to_locks(&self, group: &str, entries: Vec<IndexedLock>) -> Result<Vec<Lock>, LockError> {
        entries
            .into_iter()
            .map(|entry| {
                Ok(self
                    .client
                    .new_lock(&entry.key)?
                    .with_group(group)?
                    .with_held_token(entry.token, entry.expires_at))
            })
            .collect()
    }
}
