use std::fmt;
use std::sync::Arc;

use crate::config::LockConfig;
use crate::group::GroupIndex;
use crate::keyspace::KeySpace;
use crate::lock::Lock;
use crate::registry::LockRegistry;
use crate::script::AtomicScriptRunner;
use crate::store::ScriptStore;
use crate::token::TokenSequence;
use crate::LockError;

/// LockClient は 1 つのロック名前空間への入口。
///
/// ストアとスクリプトレジストリを共有所有し、ロックハンドル・レジストリ・
/// トークン列・グループインデックスを生成する。
#[derive(Clone)]
pub struct LockClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    runner: AtomicScriptRunner,
    keyspace: KeySpace,
    config: LockConfig,
}

impl LockClient {
    pub fn new(store: Arc<dyn ScriptStore>, config: LockConfig) -> Result<Self, LockError> {
        config.validate()?;
        let keyspace = KeySpace::new(config.namespace.clone());
        Ok(Self {
            inner: Arc::new(ClientInner {
                runner: AtomicScriptRunner::new(store),
                keyspace,
                config,
            }),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.inner.keyspace
    }

    pub(crate) fn runner(&self) -> &AtomicScriptRunner {
        &self.inner.runner
    }

    /// キーに対するロックハンドルを作成する。ストアには何も書き込まない。
    pub fn new_lock(&self, key: &str) -> Result<Lock, LockError> {
        validate_key(key)?;
        Ok(Lock::new(self.clone(), key.to_string()))
    }

    pub fn registry(&self) -> LockRegistry {
        LockRegistry::new(self.clone())
    }

    pub fn token_sequence(&self) -> TokenSequence {
        TokenSequence::new(self.inner.runner.clone(), self.inner.keyspace.clone())
    }

    pub fn group_index(&self) -> GroupIndex {
        GroupIndex::new(
            self.inner.runner.clone(),
            self.inner.keyspace.clone(),
            self.inner.config.scan_batch_size,
        )
    }
}

impl fmt::Debug for LockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("namespace", &self.inner.keyspace.namespace())
            .finish()
    }
}

/// レコードキーがトークンカウンターやグループインデックスのキーと衝突しないことを検証する。
fn validate_key(key: &str) -> Result<(), LockError> {
    if key.is_empty() {
        return Err(LockError::InvalidArgument(
            "キーは空にできません".to_string(),
        ));
    }
    if key == "token" || key.ends_with(":group") {
        return Err(LockError::InvalidArgument(format!(
            "予約済みのキー名です: {}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryScriptStore;

    fn client() -> LockClient {
        LockClient::new(
            Arc::new(InMemoryScriptStore::new()),
            LockConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_lock_rejects_empty_key() {
        let result = client().new_lock("");
        assert!(matches!(result, Err(LockError::InvalidArgument(_))));
    }

    #[test]
    fn test_new_lock_rejects_reserved_keys() {
        assert!(client().new_lock("token").is_err());
        assert!(client().new_lock("default:group").is_err());
        assert!(client().new_lock("job:42").is_ok());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = LockClient::new(
            Arc::new(InMemoryScriptStore::new()),
            LockConfig::new(""),
        );
        assert!(matches!(result, Err(LockError::InvalidArgument(_))));
    }

    #[test]
    fn test_token_sequence_uses_namespace_counter() {
        assert_eq!(client().token_sequence().counter_key(), "redislock:token");
        assert_eq!(
            client().group_index().group_key("default"),
            "redislock:default:group"
        );
    }
}
