use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError, Script, Value};

use crate::store::{ScriptStore, ScriptValue};
use crate::StoreError;

/// Redis-backed script store.
///
/// Procedures are executed with EVALSHA. A NOSCRIPT reply is surfaced as
/// `StoreError::NoScript` so the runner can reload the body with SCRIPT LOAD.
///
/// Requires Redis 5.0 or later: the procedures read `TIME` before writing,
/// which relies on script effects replication.
#[derive(Clone)]
pub struct RedisScriptStore {
    conn: MultiplexedConnection,
}

/// Minimum supported Redis server version.
pub const MIN_REDIS_VERSION: (u64, u64, u64) = (5, 0, 0);

impl RedisScriptStore {
    /// Create a new RedisScriptStore from a Redis URL and verify the server version.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        let store = Self { conn };
        store.ensure_redis_version().await?;
        Ok(store)
    }

    /// Create a new RedisScriptStore from an existing multiplexed connection.
    ///
    /// The server version is not checked; call `ensure_redis_version` if needed.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Fail with `StoreError::Backend` when the server is older than `MIN_REDIS_VERSION`.
    pub async fn ensure_redis_version(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        check_redis_version(&info)
    }
}

fn check_redis_version(info: &str) -> Result<(), StoreError> {
    let version = parse_redis_version(info).ok_or_else(|| {
        StoreError::Backend("redis_version not found in INFO reply".to_string())
    })?;
    if version < MIN_REDIS_VERSION {
        let (major, minor, patch) = version;
        return Err(StoreError::Backend(format!(
            "Redis {}.{}.{} is not supported; use Redis 5.0.0 or later",
            major, minor, patch
        )));
    }
    Ok(())
}

fn parse_redis_version(info: &str) -> Option<(u64, u64, u64)> {
    let version = info
        .lines()
        .find_map(|line| line.trim().strip_prefix("redis_version:"))?;
    let mut parts = version.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

#[async_trait]
impl ScriptStore for RedisScriptStore {
    fn script_id(&self, body: &str) -> String {
        Script::new(body).get_hash().to_string()
    }

    async fn load_script(&self, body: &str) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(body)
            .query_async::<String>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn eval_script(
        &self,
        id: &str,
        keys: &[String],
        args: &[Vec<u8>],
    ) -> Result<ScriptValue, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(id).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg.as_slice());
        }
        let value: Value = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
        convert_value(value)
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::NoScriptError {
        StoreError::NoScript(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

/// Convert a Lua script reply into the backend-neutral representation.
fn convert_value(value: Value) -> Result<ScriptValue, StoreError> {
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Int(n) => Ok(ScriptValue::Int(n)),
        Value::BulkString(bytes) => Ok(ScriptValue::Bytes(bytes)),
        Value::SimpleString(s) => Ok(ScriptValue::Status(s)),
        Value::Okay => Ok(ScriptValue::Status("OK".to_string())),
        Value::Array(items) => items
            .into_iter()
            .map(convert_value)
            .collect::<Result<Vec<_>, _>>()
            .map(ScriptValue::Array),
        other => Err(StoreError::Backend(format!(
            "unsupported script reply: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_noscript_error() {
        let err = map_redis_error(RedisError::from((
            ErrorKind::NoScriptError,
            "NOSCRIPT No matching script",
        )));
        assert!(matches!(err, StoreError::NoScript(_)));
    }

    #[test]
    fn test_map_redis_error_to_backend() {
        let err = map_redis_error(RedisError::from((
            ErrorKind::IoError,
            "connection refused",
        )));
        match err {
            StoreError::Backend(msg) => {
                assert!(msg.contains("connection refused"));
            }
            _ => panic!("Expected Backend error"),
        }
    }

    #[test]
    fn test_convert_nested_reply() {
        let value = Value::Array(vec![
            Value::BulkString(b"acquired".to_vec()),
            Value::Int(3),
            Value::Nil,
        ]);
        assert_eq!(
            convert_value(value).unwrap(),
            ScriptValue::Array(vec![
                ScriptValue::from("acquired"),
                ScriptValue::Int(3),
                ScriptValue::Nil,
            ])
        );
    }

    #[test]
    fn test_convert_rejects_double() {
        assert!(convert_value(Value::Double(1.5)).is_err());
    }

    #[test]
    fn test_script_id_is_sha1_hex() {
        let id = Script::new("return 1").get_hash().to_string();
        assert_eq!(id.len(), 40);
    }

    #[test]
    fn test_parse_redis_version_from_info() {
        let info = "# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n";
        assert_eq!(parse_redis_version(info), Some((7, 2, 4)));
        assert_eq!(parse_redis_version("# Server\r\n"), None);
    }

    #[test]
    fn test_check_redis_version_rejects_old_servers() {
        assert!(check_redis_version("redis_version:5.0.0\r\n").is_ok());
        assert!(check_redis_version("redis_version:6.2.14\r\n").is_ok());
        match check_redis_version("redis_version:4.0.14\r\n") {
            Err(StoreError::Backend(msg)) => assert!(msg.contains("4.0.14")),
            other => panic!("Expected Backend error, got {:?}", other),
        }
        assert!(check_redis_version("redis_mode:standalone\r\n").is_err());
    }
}
