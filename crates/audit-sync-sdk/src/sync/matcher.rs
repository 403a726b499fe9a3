//! 本地记录与服务端记录的匹配
//!
//! 服务端创建接口不一定返回新记录 ID，只能在返回的列表里按标题猜。
//! 规则按顺序尝试，先命中者胜：
//!
//! 1. `Confirmed(id)` 直接采用
//! 2. Exact：去首尾空白后完全相同
//! 3. Prefix：小写后一方是另一方的前缀
//! 4. SharedPrefix：两者都至少 10 个字符且前 10 个字符相同（忽略大小写）
//! 5. MostRecent：列表非空时取创建时间最新的一条
//!
//! 同一规则命中多条时取最新的一条。规则 3-5 可能把本地记录错配到标题相近的其他记录上。
//!
//! 评估和文档不走标题规则：服务端列表包含所有稽核的子记录，
//! 只在父级稽核的服务端 ID 之下找评估点 ID 或文件名完全一致的那一条。

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use crate::remote::{CreateResult, RemoteRecord};
use crate::storage::entities::RecordPayload;

/// 共享前缀规则比较的字符数
pub const SHARED_PREFIX_CHARS: usize = 10;

const AUDIT_ID_KEYS: [&str; 3] = ["audit_id", "auditId", "id_audit"];
const POINT_ID_KEYS: [&str; 3] = ["point_id", "audit_point_id", "pointId"];
const FILENAME_KEYS: [&str; 4] = ["filename", "file_name", "name", "title"];

/// 命中的匹配规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchRule {
    Confirmed,
    Exact,
    Prefix,
    SharedPrefix,
    MostRecent,
}

impl MatchRule {
    /// 是否属于启发式猜测（可能错配）
    pub fn is_heuristic(&self) -> bool {
        !matches!(self, MatchRule::Confirmed | MatchRule::Exact)
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchRule::Confirmed => "confirmed",
            MatchRule::Exact => "exact",
            MatchRule::Prefix => "prefix",
            MatchRule::SharedPrefix => "shared-prefix",
            MatchRule::MostRecent => "most-recent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub server_id: i64,
    pub rule: MatchRule,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationMatcher;

impl ReconciliationMatcher {
    pub fn new() -> Self {
        Self
    }

    /// 对创建结果做匹配；失败或未知结果返回 None
    pub fn match_result(&self, local_key: &str, result: &CreateResult) -> Option<MatchOutcome> {
        match result {
            CreateResult::Confirmed(id) => Some(MatchOutcome { server_id: *id, rule: MatchRule::Confirmed }),
            CreateResult::AmbiguousList(records) => self.match_list(local_key, records),
            CreateResult::Failure(_) | CreateResult::UnknownOutcome => None,
        }
    }

    /// 按本地载荷对创建结果做匹配
    pub fn match_record(&self, payload: &RecordPayload, result: &CreateResult) -> Option<MatchOutcome> {
        match result {
            CreateResult::AmbiguousList(records) => self.match_record_list(payload, records, true),
            _ => self.match_result(&payload.match_key(), result),
        }
    }

    /// 在服务端列表中找本地载荷对应的记录
    ///
    /// 文章和稽核走标题规则链，`recency` 为 false 时不做“取最新”兜底。
    /// 评估和文档只接受同一稽核下评估点 ID / 文件名完全一致的记录，父级还没有服务端 ID 时一律不匹配。
    pub fn match_record_list(
        &self,
        payload: &RecordPayload,
        records: &[RemoteRecord],
        recency: bool,
    ) -> Option<MatchOutcome> {
        match payload {
            RecordPayload::Evaluation { audit, point_id, .. } => {
                let audit_id = audit.server_id()?;
                let hit = most_recent(records.iter().filter(|r| {
                    r.int_field(&AUDIT_ID_KEYS) == Some(audit_id) && r.int_field(&POINT_ID_KEYS) == Some(*point_id)
                }));
                exact_child(payload, hit)
            }
            RecordPayload::Document { audit, point_id, filename, .. } => {
                let audit_id = audit.server_id()?;
                let filename = filename.trim();
                let hit = most_recent(records.iter().filter(|r| {
                    let same_point = match (point_id, r.int_field(&POINT_ID_KEYS)) {
                        (Some(local), Some(remote)) => *local == remote,
                        _ => true,
                    };
                    r.int_field(&AUDIT_ID_KEYS) == Some(audit_id)
                        && same_point
                        && r.str_field(&FILENAME_KEYS).is_some_and(|name| name.trim() == filename)
                }));
                exact_child(payload, hit)
            }
            _ if recency => self.match_list(&payload.match_key(), records),
            _ => self.match_by_title(&payload.match_key(), records),
        }
    }

    /// 在服务端列表中找本地记录对应的那一条；列表为空返回 None
    pub fn match_list(&self, local_key: &str, records: &[RemoteRecord]) -> Option<MatchOutcome> {
        if let Some(outcome) = self.match_by_title(local_key, records) {
            return Some(outcome);
        }

        let record = most_recent(records.iter())?;
        warn!(
            "⚠️ {:?} 没有标题匹配的服务端记录，退而取最新的一条 server_id={} ({:?})",
            local_key, record.id, record.title
        );
        Some(MatchOutcome { server_id: record.id, rule: MatchRule::MostRecent })
    }

    /// 只按标题规则（Exact / Prefix / SharedPrefix）匹配，不做“取最新”兜底
    pub fn match_by_title(&self, local_key: &str, records: &[RemoteRecord]) -> Option<MatchOutcome> {
        let local_trimmed = local_key.trim();
        let local_lower = local_trimmed.to_lowercase();

        let rules: [(MatchRule, &dyn Fn(&str) -> bool); 3] = [
            (MatchRule::Exact, &|remote: &str| remote.trim() == local_trimmed),
            (MatchRule::Prefix, &|remote: &str| is_prefix_match(&local_lower, &remote.trim().to_lowercase())),
            (MatchRule::SharedPrefix, &|remote: &str| shares_prefix(&local_lower, &remote.trim().to_lowercase())),
        ];

        for (rule, predicate) in rules {
            let hit = most_recent(
                records
                    .iter()
                    .filter(|r| r.title.as_deref().is_some_and(|t| predicate(t))),
            );
            if let Some(record) = hit {
                debug!("匹配 {:?} → server_id={} ({})", local_key, record.id, rule);
                return Some(MatchOutcome { server_id: record.id, rule });
            }
        }
        None
    }
}

fn exact_child(payload: &RecordPayload, hit: Option<&RemoteRecord>) -> Option<MatchOutcome> {
    let record = hit?;
    debug!("{} 在父级稽核下匹配到 server_id={}", payload.kind(), record.id);
    Some(MatchOutcome { server_id: record.id, rule: MatchRule::Exact })
}

fn is_prefix_match(local: &str, remote: &str) -> bool {
    if local.is_empty() || remote.is_empty() {
        return false;
    }
    local.starts_with(remote) || remote.starts_with(local)
}

fn shares_prefix(local: &str, remote: &str) -> bool {
    let mut local_chars = local.chars();
    let mut remote_chars = remote.chars();
    for _ in 0..SHARED_PREFIX_CHARS {
        match (local_chars.next(), remote_chars.next()) {
            (Some(a), Some(b)) if a == b => {}
            _ => return false,
        }
    }
    true
}

/// 创建时间最新的记录；没有时间的排在最后，时间相同取 id 最大
fn most_recent<'a>(records: impl Iterator<Item = &'a RemoteRecord>) -> Option<&'a RemoteRecord> {
    records.max_by_key(|r| (r.created_at.is_some(), r.created_at.unwrap_or(i64::MIN), r.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::storage::entities::ParentRef;
    use bytes::Bytes;
    use serde_json::json;

    fn rec(id: i64, title: &str, created_at: Option<i64>) -> RemoteRecord {
        RemoteRecord::new(id, title, created_at)
    }

    #[test]
    fn test_confirmed_is_definitive() {
        let matcher = ReconciliationMatcher::new();
        let outcome = matcher.match_result("T1", &CreateResult::Confirmed(7)).unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 7, rule: MatchRule::Confirmed });
        assert!(matcher
            .match_result("T1", &CreateResult::Failure(FailureReason::Http(500)))
            .is_none());
        assert!(matcher.match_result("T1", &CreateResult::UnknownOutcome).is_none());
    }

    #[test]
    fn test_exact_title() {
        let list = vec![
            rec(1, "Other audit", Some(300)),
            rec(2, "Safety check A", Some(100)),
            rec(3, "Safety check A - annex", Some(200)),
        ];
        let outcome = ReconciliationMatcher::new().match_list("Safety check A", &list).unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 2, rule: MatchRule::Exact });
    }

    #[test]
    fn test_exact_ignores_surrounding_whitespace() {
        let list = vec![rec(5, "  Safety check A ", None)];
        let outcome = ReconciliationMatcher::new().match_list("Safety check A", &list).unwrap();
        assert_eq!(outcome.rule, MatchRule::Exact);
    }

    #[test]
    fn test_prefix_fallback() {
        let list = vec![rec(8, "Unrelated", Some(999)), rec(9, "Safety check A", Some(1))];
        let outcome = ReconciliationMatcher::new()
            .match_list("Safety check A - site 12", &list)
            .unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 9, rule: MatchRule::Prefix });

        // 反方向、忽略大小写
        let list = vec![rec(4, "SAFETY CHECK A - SITE 12", None)];
        let outcome = ReconciliationMatcher::new().match_list("safety check a", &list).unwrap();
        assert_eq!(outcome.rule, MatchRule::Prefix);
    }

    #[test]
    fn test_shared_prefix() {
        let list = vec![rec(1, "Inspection cuisine B", Some(5)), rec(2, "Zzz", Some(10))];
        let outcome = ReconciliationMatcher::new()
            .match_list("Inspection cuisine A", &list)
            .unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 1, rule: MatchRule::SharedPrefix });

        // 少于 10 个字符不适用
        let list = vec![rec(1, "Audit B", Some(5)), rec(2, "Zzz", Some(10))];
        let outcome = ReconciliationMatcher::new().match_list("Audit A", &list).unwrap();
        assert_eq!(outcome.rule, MatchRule::MostRecent);
    }

    #[test]
    fn test_shared_prefix_counts_chars_not_bytes() {
        assert!(shares_prefix("évaluation 1", "évaluation 2"));
        assert!(!shares_prefix("évaluatio", "évaluatio"));
    }

    #[test]
    fn test_most_recent_fallback() {
        let list = vec![
            rec(1, "Alpha", Some(100)),
            rec(2, "Beta", Some(300)),
            rec(3, "Gamma", None),
            rec(4, "Delta", Some(200)),
        ];
        let outcome = ReconciliationMatcher::new().match_list("Omega", &list).unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 2, rule: MatchRule::MostRecent });
        assert!(outcome.rule.is_heuristic());
    }

    #[test]
    fn test_most_recent_without_timestamps_takes_highest_id() {
        let list = vec![rec(10, "A", None), rec(12, "B", None), rec(11, "C", None)];
        let outcome = ReconciliationMatcher::new().match_list("Z", &list).unwrap();
        assert_eq!(outcome.server_id, 12);
    }

    #[test]
    fn test_empty_list_is_no_match() {
        let matcher = ReconciliationMatcher::new();
        assert!(matcher.match_list("T1", &[]).is_none());
        assert!(matcher.match_result("T1", &CreateResult::AmbiguousList(vec![])).is_none());
    }

    #[test]
    fn test_match_by_title_has_no_recency_fallback() {
        let list = vec![rec(1, "Alpha", Some(100)), rec(2, "Beta", Some(300))];
        let matcher = ReconciliationMatcher::new();
        assert!(matcher.match_by_title("Omega", &list).is_none());
        assert_eq!(matcher.match_by_title("alpha", &list).unwrap().rule, MatchRule::Prefix);
    }

    fn evaluation(audit: i64, point_id: i64) -> RecordPayload {
        RecordPayload::Evaluation {
            audit: ParentRef::Server(audit),
            point_id,
            answer: "ok".into(),
            score: None,
            comment: None,
        }
    }

    #[test]
    fn test_evaluation_scoped_to_parent_audit() {
        let matcher = ReconciliationMatcher::new();
        let other_audit = vec![
            RemoteRecord::from_json(&json!({ "id": 77, "audit_id": 12, "point_id": 42 })).unwrap(),
            RemoteRecord::from_json(&json!({ "id": 78, "audit_id": 12, "point_id": 4 })).unwrap(),
        ];
        // 其他稽核的同号评估点、以及 "4" 与 "42" 的前缀关系都不算
        assert!(matcher.match_record_list(&evaluation(300, 4), &other_audit, true).is_none());
        assert!(matcher
            .match_record(&evaluation(300, 4), &CreateResult::AmbiguousList(other_audit.clone()))
            .is_none());

        let mut list = other_audit;
        list.push(RemoteRecord::from_json(&json!({ "id": 90, "auditId": "300", "point_id": 4 })).unwrap());
        let outcome = matcher.match_record_list(&evaluation(300, 4), &list, true).unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 90, rule: MatchRule::Exact });
    }

    #[test]
    fn test_child_with_local_parent_never_matches() {
        let payload = RecordPayload::Evaluation {
            audit: ParentRef::Local(1),
            point_id: 4,
            answer: "ok".into(),
            score: None,
            comment: None,
        };
        let list = vec![RemoteRecord::from_json(&json!({ "id": 5, "audit_id": 1, "point_id": 4 })).unwrap()];
        assert!(ReconciliationMatcher::new().match_record_list(&payload, &list, true).is_none());
    }

    #[test]
    fn test_document_needs_exact_filename_in_same_audit() {
        let payload = RecordPayload::document(
            ParentRef::Server(300),
            Some(4),
            "extincteur.jpg",
            "image/jpeg",
            Bytes::from_static(b"x"),
        );
        let matcher = ReconciliationMatcher::new();
        let list = vec![
            RemoteRecord::from_json(&json!({ "id": 1, "audit_id": 12, "filename": "extincteur.jpg" })).unwrap(),
            RemoteRecord::from_json(&json!({ "id": 2, "audit_id": 300, "filename": "extincteur.jpg.bak" })).unwrap(),
            RemoteRecord::from_json(&json!({ "id": 3, "audit_id": 300, "point_id": 5, "filename": "extincteur.jpg" }))
                .unwrap(),
        ];
        assert!(matcher.match_record_list(&payload, &list, true).is_none());

        let mut list = list;
        list.push(RemoteRecord::from_json(&json!({ "id": 4, "audit_id": 300, "name": "extincteur.jpg" })).unwrap());
        assert_eq!(matcher.match_record_list(&payload, &list, true).unwrap().server_id, 4);
    }

    #[test]
    fn test_record_list_recency_switch() {
        let payload = RecordPayload::Article { title: "Omega".into(), content: String::new() };
        let list = vec![rec(1, "Alpha", Some(100)), rec(2, "Beta", Some(300))];
        let matcher = ReconciliationMatcher::new();
        assert_eq!(matcher.match_record_list(&payload, &list, true).unwrap().rule, MatchRule::MostRecent);
        assert!(matcher.match_record_list(&payload, &list, false).is_none());
    }

    #[test]
    fn test_empty_local_key_never_prefix_matches() {
        let list = vec![rec(1, "Anything", Some(1)), rec(2, "Else", Some(2))];
        let outcome = ReconciliationMatcher::new().match_list("", &list).unwrap();
        assert_eq!(outcome, MatchOutcome { server_id: 2, rule: MatchRule::MostRecent });
    }
}
