use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::LockError;

/// LockConfig はロック名前空間の設定を表す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// 永続キーのプレフィックス（例: "redislock" → "redislock:<key>"）
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// グループ未指定時に使うグループ名
    #[serde(default = "default_group")]
    pub default_group: String,
    /// false の場合、手続きはグループインデックスを一切更新しない
    #[serde(default = "default_group_index")]
    pub group_index: bool,
    /// lock() がブロックする最大時間（ミリ秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 取得・延長 1 回あたりのリース期間（ミリ秒）
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// lock() の再試行間隔（ミリ秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// グループインデックス走査 1 回あたりの取得件数
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
}

fn default_namespace() -> String {
    "redislock".to_string()
}

fn default_group() -> String {
    "default".to_string()
}

fn default_group_index() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_lease_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_scan_batch_size() -> usize {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            default_group: default_group(),
            group_index: default_group_index(),
            timeout_ms: default_timeout_ms(),
            lease_ms: default_lease_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

impl LockConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// YAML 文字列から設定を読み込み、検証する。
    pub fn from_yaml(yaml: &str) -> Result<Self, LockError> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| LockError::InvalidArgument(format!("設定の読み込みに失敗しました: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = group.into();
        self
    }

    pub fn with_group_index(mut self, enabled: bool) -> Self {
        self.group_index = enabled;
        self
    }

    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.namespace.is_empty() {
            return Err(LockError::InvalidArgument(
                "namespace は空にできません".to_string(),
            ));
        }
        if self.default_group.is_empty() {
            return Err(LockError::InvalidArgument(
                "default_group は空にできません".to_string(),
            ));
        }
        if self.scan_batch_size == 0 {
            return Err(LockError::InvalidArgument(
                "scan_batch_size は 1 以上である必要があります".to_string(),
            ));
        }
        self.lock_options().validate()
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            lease: Duration::from_millis(self.lease_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// LockOptions はロックハンドル単位の時間設定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockConfig::default().lock_options()
    }
}

impl LockOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        // ストア側はミリ秒単位で期限を管理する
        if self.lease.as_millis() == 0 {
            return Err(LockError::InvalidArgument(
                "lease は 1ms 以上である必要があります".to_string(),
            ));
        }
        if self.lease.as_millis() > i64::MAX as u128 {
            return Err(LockError::InvalidArgument(
                "lease が大きすぎます".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidArgument(
                "poll_interval は 0 にできません".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn lease_ms(&self) -> u64 {
        u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LockConfig::default();
        assert_eq!(cfg.namespace, "redislock");
        assert_eq!(cfg.default_group, "default");
        assert!(cfg.group_index);
        assert_eq!(cfg.timeout_ms, 10_000);
        assert_eq!(cfg.lease_ms, 10_000);
        assert_eq!(cfg.poll_interval_ms, 100);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"namespace": "jobs"}"#;
        let cfg: LockConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.namespace, "jobs");
        assert_eq!(cfg.default_group, "default");
        assert_eq!(cfg.scan_batch_size, 100);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = "namespace: jobs\nlease_ms: 1500\ntimeout_ms: 1000\ngroup_index: false\n";
        let cfg = LockConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.namespace, "jobs");
        assert!(!cfg.group_index);
        let options = cfg.lock_options();
        assert_eq!(options.lease, Duration::from_millis(1500));
        assert_eq!(options.timeout, Duration::from_secs(1));
        assert_eq!(options.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_from_yaml_rejects_zero_lease() {
        let yaml = "lease_ms: 0\n";
        assert!(matches!(
            LockConfig::from_yaml(yaml),
            Err(LockError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_namespace() {
        let cfg = LockConfig::new("");
        assert!(matches!(cfg.validate(), Err(LockError::InvalidArgument(_))));
    }

    #[test]
    fn test_options_reject_sub_millisecond_lease() {
        let options = LockOptions::default().with_lease(Duration::from_micros(500));
        assert!(options.validate().is_err());
        let options = LockOptions::default().with_poll_interval(Duration::ZERO);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_reject_lease_beyond_millisecond_range() {
        let options = LockOptions::default().with_lease(Duration::MAX);
        assert!(matches!(
            options.validate(),
            Err(LockError::InvalidArgument(_))
        ));
        let options = LockOptions::default().with_lease(Duration::from_millis(i64::MAX as u64));
        assert!(options.validate().is_ok());
    }
}
