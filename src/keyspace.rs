/// KeySpace はロック名前空間の永続キー配置を決める。
///
/// - ロックレコード: `<namespace>:<key>`
/// - グループインデックス: `<namespace>:<group>:group`
/// - トークンカウンター: `<namespace>:token`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn record_key(&self, key: &str) -> String {
        format_lock_key(&self.namespace, key)
    }

    pub fn group_key(&self, group: &str) -> String {
        format!("{}:{}:group", self.namespace, group)
    }

    pub fn token_key(&self) -> String {
        format!("{}:token", self.namespace)
    }

    /// スクリプト内でメンバー名からレコードキーを組み立てるためのプレフィックス。
    pub fn record_prefix(&self) -> String {
        format!("{}:", self.namespace)
    }
}

pub fn format_lock_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}
