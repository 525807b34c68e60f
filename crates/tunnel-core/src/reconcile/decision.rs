//! Pure classification of existing records against the desired record

use std::fmt;

use crate::traits::{DnsRecord, RecordSpec};

/// Why the engine refuses to act
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReason {
    /// Several address records share the hostname; an operator must pick one
    AmbiguousRecords { count: usize },
    /// The record points under the tunnel suffix but not at a single tunnel ID
    UnrecognizedTunnelTarget { content: String },
    /// The provider reported the target as owned by another account
    CrossAccountConflict { message: String },
}

impl fmt::Display for UnresolvableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvableReason::AmbiguousRecords { count } => {
                write!(f, "{} conflicting records exist for the hostname", count)
            }
            UnresolvableReason::UnrecognizedTunnelTarget { content } => {
                write!(f, "existing record points at unrecognized tunnel target '{}'", content)
            }
            UnresolvableReason::CrossAccountConflict { message } => {
                write!(f, "target is owned by another account: {}", message)
            }
        }
    }
}

/// The classified relationship between existing and desired state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationDecision {
    NoopAlreadyCorrect,
    UpdateInPlace { record_id: String },
    DeleteThenCreate { stale_record_id: String },
    CreateNew,
    Unresolvable { reason: UnresolvableReason },
}

impl ReconciliationDecision {
    /// Whether executing the decision mutates the zone
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ReconciliationDecision::UpdateInPlace { .. }
                | ReconciliationDecision::DeleteThenCreate { .. }
                | ReconciliationDecision::CreateNew
        )
    }

    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            ReconciliationDecision::NoopAlreadyCorrect => "noop",
            ReconciliationDecision::UpdateInPlace { .. } => "update_in_place",
            ReconciliationDecision::DeleteThenCreate { .. } => "delete_then_create",
            ReconciliationDecision::CreateNew => "create_new",
            ReconciliationDecision::Unresolvable { .. } => "unresolvable",
        }
    }
}

/// Normalize a DNS name or CNAME target for comparison
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Records that compete with the desired record: address types at exactly that name
pub fn competing_records<'a>(existing: &'a [DnsRecord], desired: &RecordSpec) -> Vec<&'a DnsRecord> {
    let name = normalize_name(&desired.name);
    existing
        .iter()
        .filter(|r| r.record_type.is_address() && normalize_name(&r.name) == name)
        .collect()
}

/// Where a record's content sits relative to the tunnel target suffix
#[derive(Debug, PartialEq, Eq)]
enum TunnelTarget<'a> {
    /// `<single-label>.<suffix>`
    Tunnel(&'a str),
    /// Under the suffix, but not a single label
    Unrecognized,
    /// Outside the suffix
    Foreign,
}

fn tunnel_target<'a>(content: &'a str, suffix: &str) -> TunnelTarget<'a> {
    let suffix = normalize_name(suffix);
    if suffix.is_empty() {
        return TunnelTarget::Foreign;
    }

    let content = content.trim().trim_end_matches('.');
    let lower = content.to_ascii_lowercase();
    if lower == suffix {
        return TunnelTarget::Unrecognized;
    }
    let Some(prefix_len) = lower
        .strip_suffix(suffix.as_str())
        .and_then(|rest| rest.strip_suffix('.'))
        .map(str::len)
    else {
        return TunnelTarget::Foreign;
    };

    let label = &content[..prefix_len];
    let single_label = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if single_label {
        TunnelTarget::Tunnel(label)
    } else {
        TunnelTarget::Unrecognized
    }
}

/// Classify the existing record set against the desired record
///
/// `tunnel_suffix` is the host suffix named tunnel targets live under. A record
/// of the desired type pointing at `<other-id>.<suffix>` is a leftover from a
/// previous tunnel and gets replaced rather than edited.
pub fn classify(
    existing: &[DnsRecord],
    desired: &RecordSpec,
    tunnel_suffix: &str,
) -> ReconciliationDecision {
    let competing = competing_records(existing, desired);

    let record = match competing.as_slice() {
        [] => return ReconciliationDecision::CreateNew,
        [record] => *record,
        many => {
            return ReconciliationDecision::Unresolvable {
                reason: UnresolvableReason::AmbiguousRecords { count: many.len() },
            };
        }
    };

    if record.record_type != desired.record_type {
        return ReconciliationDecision::DeleteThenCreate {
            stale_record_id: record.id.clone(),
        };
    }

    if normalize_name(&record.content) == normalize_name(&desired.content) {
        if record.proxied == desired.proxied {
            return ReconciliationDecision::NoopAlreadyCorrect;
        }
        return ReconciliationDecision::UpdateInPlace {
            record_id: record.id.clone(),
        };
    }

    match tunnel_target(&record.content, tunnel_suffix) {
        TunnelTarget::Tunnel(_) => ReconciliationDecision::DeleteThenCreate {
            stale_record_id: record.id.clone(),
        },
        TunnelTarget::Unrecognized => ReconciliationDecision::Unresolvable {
            reason: UnresolvableReason::UnrecognizedTunnelTarget {
                content: record.content.clone(),
            },
        },
        TunnelTarget::Foreign => ReconciliationDecision::UpdateInPlace {
            record_id: record.id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::RecordType;

    const SUFFIX: &str = "cfargotunnel.com";

    fn record(id: &str, record_type: RecordType, name: &str, content: &str) -> DnsRecord {
        DnsRecord {
            id: id.to_string(),
            record_type,
            name: name.to_string(),
            content: content.to_string(),
            ttl: 1,
            proxied: true,
        }
    }

    fn desired(content: &str) -> RecordSpec {
        RecordSpec::new(RecordType::Cname, "app.example.com", content)
    }

    #[test]
    fn test_empty_zone_creates() {
        assert_eq!(
            classify(&[], &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::CreateNew
        );
    }

    #[test]
    fn test_matching_record_is_noop_ignoring_case_and_dot() {
        let existing = [record("r1", RecordType::Cname, "App.Example.com.", "B.cfargotunnel.com.")];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::NoopAlreadyCorrect
        );
    }

    #[test]
    fn test_proxied_mismatch_updates() {
        let mut existing = record("r1", RecordType::Cname, "app.example.com", "b.cfargotunnel.com");
        existing.proxied = false;
        assert_eq!(
            classify(&[existing], &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::UpdateInPlace {
                record_id: "r1".into()
            }
        );
    }

    #[test]
    fn test_stale_tunnel_is_replaced() {
        let existing = [record("r1", RecordType::Cname, "app.example.com", "a.cfargotunnel.com")];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::DeleteThenCreate {
                stale_record_id: "r1".into()
            }
        );
    }

    #[test]
    fn test_foreign_cname_is_updated_in_place() {
        let existing = [record("r1", RecordType::Cname, "app.example.com", "lb.example.net")];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::UpdateInPlace {
                record_id: "r1".into()
            }
        );
    }

    #[test]
    fn test_type_change_is_replaced() {
        let existing = [record("r1", RecordType::A, "app.example.com", "192.0.2.10")];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::DeleteThenCreate {
                stale_record_id: "r1".into()
            }
        );
    }

    #[test]
    fn test_unrecognized_target_under_suffix() {
        let existing = [record("r1", RecordType::Cname, "app.example.com", "x.y.cfargotunnel.com")];
        assert!(matches!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::Unresolvable {
                reason: UnresolvableReason::UnrecognizedTunnelTarget { .. }
            }
        ));
    }

    #[test]
    fn test_two_records_are_ambiguous() {
        let existing = [
            record("r1", RecordType::A, "app.example.com", "192.0.2.10"),
            record("r2", RecordType::A, "app.example.com", "192.0.2.11"),
        ];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::Unresolvable {
                reason: UnresolvableReason::AmbiguousRecords { count: 2 }
            }
        );
    }

    #[test]
    fn test_unrelated_records_are_ignored() {
        let existing = [
            record("r1", RecordType::Other("TXT".into()), "app.example.com", "v=spf1 -all"),
            record("r2", RecordType::Cname, "www.app.example.com", "a.cfargotunnel.com"),
            record("r3", RecordType::Cname, "pp.example.com", "a.cfargotunnel.com"),
        ];
        assert_eq!(
            classify(&existing, &desired("b.cfargotunnel.com"), SUFFIX),
            ReconciliationDecision::CreateNew
        );
    }

    #[test]
    fn test_tunnel_target_shapes() {
        assert_eq!(tunnel_target("abc-1.cfargotunnel.com", SUFFIX), TunnelTarget::Tunnel("abc-1"));
        assert_eq!(tunnel_target("cfargotunnel.com", SUFFIX), TunnelTarget::Unrecognized);
        assert_eq!(tunnel_target("a_b.cfargotunnel.com", SUFFIX), TunnelTarget::Unrecognized);
        assert_eq!(tunnel_target("evilcfargotunnel.com", SUFFIX), TunnelTarget::Foreign);
        assert_eq!(tunnel_target("example.org", SUFFIX), TunnelTarget::Foreign);
    }
}
