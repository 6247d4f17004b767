//! 契约摘要与结构比较

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 注册中心返回的契约概要
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSummary {
    pub schema_id: String,

    /// 契约内容的摘要，旧版本注册中心可能不返回
    #[serde(default)]
    pub summary: Option<String>,
}

/// 计算契约摘要（SHA-256 十六进制）
pub fn calc_schema_summary(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// 契约结构比较
///
/// 摘要不同时用来判断两份契约是否只是文本差异。
pub trait SchemaComparator: Send + Sync {
    fn is_equivalent(&self, remote: &str, local: &str) -> bool;
}

/// 按 YAML（JSON 的超集）解析后比较结构
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralSchemaComparator;

impl SchemaComparator for StructuralSchemaComparator {
    fn is_equivalent(&self, remote: &str, local: &str) -> bool {
        if remote.trim().is_empty() || local.trim().is_empty() {
            return false;
        }

        let parsed_remote = serde_yaml::from_str::<serde_yaml::Value>(remote);
        let parsed_local = serde_yaml::from_str::<serde_yaml::Value>(local);
        match (parsed_remote, parsed_local) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// 本地与远端文本的差异部分，用于日志
pub(crate) fn difference<'a>(remote: &str, local: &'a str) -> &'a str {
    let common = remote
        .char_indices()
        .zip(local.chars())
        .take_while(|((_, a), b)| a == b)
        .count();
    let start = local
        .char_indices()
        .nth(common)
        .map(|(idx, _)| idx)
        .unwrap_or(local.len());
    &local[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_stable_sha256() {
        assert_eq!(
            calc_schema_summary("x"),
            "2d711642b726b04401627ca9fbac32f5c8530fb1903cc4db02258717921a4881"
        );
        assert_ne!(calc_schema_summary("x"), calc_schema_summary("y"));
    }

    #[test]
    fn structural_comparison_ignores_formatting() {
        let cmp = StructuralSchemaComparator;
        let a = "swagger: '2.0'\npaths:\n  /hello:\n    get: {}\n";
        let b = "{\"paths\": {\"/hello\": {\"get\": {}}}, \"swagger\": \"2.0\"}";
        assert!(cmp.is_equivalent(a, b));
        assert!(!cmp.is_equivalent(a, "swagger: '2.0'\npaths: {}\n"));
        assert!(!cmp.is_equivalent("", b));
    }

    #[test]
    fn difference_returns_local_suffix() {
        assert_eq!(difference("abcX", "abcY"), "Y");
        assert_eq!(difference("abc", "abc"), "");
    }
}
