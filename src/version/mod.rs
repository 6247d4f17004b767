//! 版本号与版本规则
//!
//! 版本号最多四段（major.minor.patch.build），缺省的尾段补 0；
//! 版本规则支持 `latest`、精确版本、`X+` 开区间以及 `X-Y` 半开区间。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RegistryError, Result};

/// 匹配任意版本的规则
pub const VERSION_RULE_ALL: &str = "0.0.0.0+";

/// 只匹配最新版本的规则
pub const VERSION_RULE_LATEST: &str = "latest";

const PART_NAMES: [&str; 4] = ["major", "minor", "patch", "build"];

/// 规范化后的版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    parts: [i16; 4],
}

impl Version {
    /// 由四段数值构造版本号
    pub const fn new(major: i16, minor: i16, patch: i16, build: i16) -> Self {
        Self {
            parts: [major, minor, patch, build],
        }
    }

    /// 解析点分版本字符串
    pub fn parse(version: &str) -> Result<Self> {
        let segments: Vec<&str> = version.split('.').collect();
        if segments.len() > PART_NAMES.len() {
            return Err(RegistryError::InvalidVersion(format!(
                "Invalid version \"{}\".",
                version
            )));
        }

        let mut parts = [0i16; 4];
        for (idx, segment) in segments.iter().enumerate() {
            let name = PART_NAMES[idx];
            let invalid = || {
                RegistryError::InvalidVersion(format!(
                    "Invalid {} \"{}\", version \"{}\".",
                    name, segment, version
                ))
            };
            let digits = segment.trim();
            // i16::from_str 接受前导 '+'
            if digits.starts_with('+') {
                return Err(invalid());
            }
            let value: i16 = digits.parse().map_err(|_| invalid())?;
            if value < 0 {
                return Err(RegistryError::InvalidVersion(format!(
                    "{} \"{}\" can not be negative, version \"{}\".",
                    name, segment, version
                )));
            }
            parts[idx] = value;
        }

        Ok(Self { parts })
    }

    pub fn major(&self) -> i16 {
        self.parts[0]
    }

    pub fn minor(&self) -> i16 {
        self.parts[1]
    }

    pub fn patch(&self) -> i16 {
        self.parts[2]
    }

    pub fn build(&self) -> i16 {
        self.parts[3]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.parts;
        write!(f, "{}.{}.{}.{}", major, minor, patch, build)
    }
}

impl FromStr for Version {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// 版本规则的匹配方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionMatch {
    /// 只接受当前已知的最高版本
    Latest,
    /// 精确匹配
    Fixed(Version),
    /// `version >= from`
    StartFrom(Version),
    /// `from <= version < to`
    Range { from: Version, to: Version },
}

/// 消费者指定的版本规则
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRule {
    spec: String,
    matcher: VersionMatch,
}

impl VersionRule {
    /// 解析版本规则字符串
    pub fn parse(spec: &str) -> Result<Self> {
        let trimmed = spec.trim();
        let matcher = if trimmed.eq_ignore_ascii_case(VERSION_RULE_LATEST) {
            VersionMatch::Latest
        } else if let Some(from) = trimmed.strip_suffix('+') {
            VersionMatch::StartFrom(Version::parse(from)?)
        } else if let Some((from, to)) = trimmed.split_once('-') {
            VersionMatch::Range {
                from: Version::parse(from)?,
                to: Version::parse(to)?,
            }
        } else {
            VersionMatch::Fixed(Version::parse(trimmed)?)
        };

        Ok(Self {
            spec: normalized_spec(&matcher),
            matcher,
        })
    }

    /// 匹配任意版本的规则
    pub fn all() -> Self {
        Self {
            spec: VERSION_RULE_ALL.to_string(),
            matcher: VersionMatch::StartFrom(Version::new(0, 0, 0, 0)),
        }
    }

    /// 规范化后的规则字符串，版本号补齐四段，写法不同但含义相同的规则得到相同结果
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn matcher(&self) -> VersionMatch {
        self.matcher
    }

    pub fn is_latest(&self) -> bool {
        matches!(self.matcher, VersionMatch::Latest)
    }

    /// 判断版本是否落在规则范围内
    ///
    /// `latest` 规则需要知道全部版本才能判断，单独调用时总是返回 `true`，
    /// 由调用方再按最高版本过滤。
    pub fn is_accept(&self, version: &Version) -> bool {
        match self.matcher {
            VersionMatch::Latest => true,
            VersionMatch::Fixed(expected) => *version == expected,
            VersionMatch::StartFrom(from) => *version >= from,
            VersionMatch::Range { from, to } => *version >= from && *version < to,
        }
    }

    /// 在已知最高版本 `latest` 的前提下判断是否匹配
    pub fn is_match(&self, version: &Version, latest: &Version) -> bool {
        match self.matcher {
            VersionMatch::Latest => version == latest,
            _ => self.is_accept(version),
        }
    }
}

fn normalized_spec(matcher: &VersionMatch) -> String {
    match matcher {
        VersionMatch::Latest => VERSION_RULE_LATEST.to_string(),
        VersionMatch::Fixed(version) => version.to_string(),
        VersionMatch::StartFrom(from) => format!("{}+", from),
        VersionMatch::Range { from, to } => format!("{}-{}", from, to),
    }
}

impl fmt::Display for VersionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

impl FromStr for VersionRule {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        VersionRule::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_missing_components() {
        assert_eq!(Version::parse("1").unwrap().to_string(), "1.0.0.0");
        assert_eq!(Version::parse("1.1").unwrap().to_string(), "1.1.0.0");
        assert_eq!(Version::parse("1.1.1").unwrap().to_string(), "1.1.1.0");
        assert_eq!(Version::parse("1.1.1.1").unwrap().build(), 1);
    }

    #[test]
    fn rejects_malformed_versions() {
        let err = Version::parse("").unwrap_err();
        assert_eq!(err.to_string(), "版本格式错误: Invalid major \"\", version \"\".");

        assert!(Version::parse("a.1").is_err());
        assert!(Version::parse("1.").is_err());
        assert!(Version::parse("-1").is_err());
        assert!(Version::parse("1.1.1.1.").is_err());
        assert!(Version::parse("40000").is_err());
        assert!(Version::parse("1.+2").is_err());
        assert!(Version::parse("+1").is_err());
        assert!(VersionRule::parse("1.+2+").is_err());
    }

    #[test]
    fn equivalent_rules_share_spec() {
        let short = VersionRule::parse("1+").unwrap();
        let long = VersionRule::parse(" 1.0.0.0+").unwrap();
        assert_eq!(short.spec(), "1.0.0.0+");
        assert_eq!(short, long);

        assert_eq!(VersionRule::parse("Latest").unwrap().spec(), "latest");
        assert_eq!(VersionRule::parse("1-2.1").unwrap().spec(), "1.0.0.0-2.1.0.0");
        assert_eq!(VersionRule::parse("0+").unwrap(), VersionRule::all());
    }

    #[test]
    fn compares_component_wise() {
        let v = Version::new(1, 1, 1, 1);
        assert!(v < Version::new(1, 1, 2, 1));
        assert!(v < Version::new(1, 2, 1, 1));
        assert!(v < Version::new(2, 1, 1, 1));
        assert!(v > Version::new(0, i16::MAX, i16::MAX, i16::MAX));
    }

    #[test]
    fn start_from_rule_is_lower_bound() {
        let rule = VersionRule::parse("1.2+").unwrap();
        assert!(rule.is_accept(&Version::parse("1.2.0.0").unwrap()));
        assert!(rule.is_accept(&Version::parse("1.10").unwrap()));
        assert!(rule.is_accept(&Version::parse("2").unwrap()));
        assert!(!rule.is_accept(&Version::parse("1.1.9.9").unwrap()));
    }

    #[test]
    fn all_rule_accepts_everything() {
        let rule = VersionRule::parse(VERSION_RULE_ALL).unwrap();
        assert_eq!(rule, VersionRule::all());
        assert!(rule.is_accept(&Version::new(0, 0, 0, 0)));
        assert!(rule.is_accept(&Version::new(9, 9, 9, 9)));
    }

    #[test]
    fn range_and_fixed_rules() {
        let range = VersionRule::parse("1.0.0-2.0.0").unwrap();
        assert!(range.is_accept(&Version::parse("1.5").unwrap()));
        assert!(!range.is_accept(&Version::parse("2.0").unwrap()));

        let fixed = VersionRule::parse("1.0.0").unwrap();
        assert!(fixed.is_accept(&Version::parse("1").unwrap()));
        assert!(!fixed.is_accept(&Version::parse("1.0.0.1").unwrap()));

        let latest = VersionRule::parse("LATEST").unwrap();
        assert!(latest.is_latest());
        let top = Version::new(2, 0, 0, 0);
        assert!(latest.is_match(&top, &top));
        assert!(!latest.is_match(&Version::new(1, 0, 0, 0), &top));
        assert!(range.is_match(&Version::new(1, 0, 0, 0), &top));
    }
}
