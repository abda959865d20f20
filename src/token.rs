use crate::keyspace::KeySpace;
use crate::script::{AtomicScriptRunner, Procedure};
use crate::LockError;

/// TokenSequence は名前空間ごとのフェンシングトークン列。
///
/// 発行（INCR）は取得・延長手続きの内部でのみ行われる。ここでは現在値の参照だけを提供する。
#[derive(Clone)]
pub struct TokenSequence {
    runner: AtomicScriptRunner,
    keyspace: KeySpace,
}

impl TokenSequence {
    pub(crate) fn new(runner: AtomicScriptRunner, keyspace: KeySpace) -> Self {
        Self { runner, keyspace }
    }

    pub fn counter_key(&self) -> String {
        self.keyspace.token_key()
    }

    /// 最後に発行されたトークンを返す。一度も発行されていなければ 0。
    pub async fn current(&self) -> Result<i64, LockError> {
        let reply = self
            .runner
            .execute(Procedure::PeekToken, &[self.counter_key()], &[])
            .await?;
        if reply.is_nil() {
            return Ok(0);
        }
        reply
            .as_i64()
            .ok_or_else(|| LockError::UnexpectedReply(format!("peek_token: {:?}", reply)))
    }
}
