use serde::{Deserialize, Serialize};

/// Lifecycle status of a split as assigned by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitStatus {
    Active,
    Archived,
}

/// A single feature-flag definition as it travels on the wire.
///
/// `conditions` is carried opaquely: the proxy never evaluates targeting
/// rules, it only mirrors them for the SDKs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: String,
    pub status: SplitStatus,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub default_treatment: String,
    pub change_number: i64,
    #[serde(default)]
    pub conditions: serde_json::Value,
}

impl Split {
    /// Tombstone for a split that was removed from the mirror but still has
    /// to be reported as archived to SDKs catching up from an older change
    /// number.
    pub fn archived_tombstone(name: &str, till: i64) -> Split {
        Split {
            name: name.to_string(),
            traffic_type_name: String::new(),
            status: SplitStatus::Archived,
            killed: false,
            default_treatment: "control".to_string(),
            change_number: till,
            conditions: serde_json::Value::Null,
        }
    }

    /// Names of all segments referenced by this split's targeting rules.
    ///
    /// Walks the opaque condition tree looking for
    /// `userDefinedSegmentMatcherData.segmentName` entries, which is how the
    /// authority encodes IN_SEGMENT matchers.
    pub fn referenced_segments(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_segment_names(&self.conditions, &mut names);
        names
    }
}

fn collect_segment_names(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(data) = map.get("userDefinedSegmentMatcherData") {
                if let Some(name) = data.get("segmentName").and_then(|n| n.as_str()) {
                    if !out.iter().any(|existing| existing == name) {
                        out.push(name.to_string());
                    }
                }
            }
            for nested in map.values() {
                collect_segment_names(nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_segment_names(item, out);
            }
        }
        _ => {}
    }
}

/// Payload for `GET /splitChanges?since=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitChanges {
    pub splits: Vec<Split>,
    pub since: i64,
    pub till: i64,
}

/// Payload for `GET /segmentChanges/:name?since=N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentChanges {
    pub name: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub since: i64,
    pub till: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MySegment {
    pub name: String,
}

/// A single impression as recorded by an SDK evaluating a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub time: i64,
    pub change_number: i64,
    #[serde(default)]
    pub label: String,
    /// Time of the previous identical impression, assigned by the observer.
    #[serde(rename = "pt", default, skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

/// Impressions for one feature, the unit of the upstream bulk schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestImpressions {
    pub test_name: String,
    pub key_impressions: Vec<Impression>,
}

/// Per-(feature, hour-bucket) deduplicated impression counts, posted to
/// `/testImpressions/count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpressionCounts {
    #[serde(rename = "pf")]
    pub per_feature: Vec<FeatureCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCount {
    #[serde(rename = "f")]
    pub feature: String,
    #[serde(rename = "m")]
    pub time_frame: i64,
    #[serde(rename = "rc")]
    pub count: i64,
}

/// An SDK-emitted event, forwarded verbatim in bulk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type_id: String,
    pub traffic_type_name: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

/// Origin identity of an SDK instance, used verbatim as the grouping key
/// for bulk submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub sdk_version: String,
    pub machine_ip: String,
    pub machine_name: String,
}

impl Metadata {
    /// Machine name to report upstream: `"unknown"` when the SDK sent none.
    pub fn machine_name_or_unknown(&self) -> &str {
        if self.machine_name.is_empty() {
            "unknown"
        } else {
            &self.machine_name
        }
    }

    /// Machine name for impression posts: `ip-<dashed-ip>` when empty.
    pub fn machine_name_or_ip(&self) -> String {
        if self.machine_name.is_empty() {
            format!("ip-{}", self.machine_ip.replace('.', "-"))
        } else {
            self.machine_name.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_roundtrips_through_json() {
        let split = Split {
            name: "checkout-v2".to_string(),
            traffic_type_name: "user".to_string(),
            status: SplitStatus::Active,
            killed: false,
            default_treatment: "off".to_string(),
            change_number: 1234,
            conditions: serde_json::json!([{"matcherGroup": {"matchers": []}}]),
        };
        let encoded = serde_json::to_string(&split).unwrap();
        assert!(encoded.contains("\"status\":\"ACTIVE\""));
        assert!(encoded.contains("\"changeNumber\":1234"));
        let decoded: Split = serde_json::from_str(&encoded).unwrap();
        assert_eq!(split, decoded);
    }

    #[test]
    fn archived_split_roundtrips() {
        let split = Split::archived_tombstone("legacy-banner", 99);
        let decoded: Split =
            serde_json::from_str(&serde_json::to_string(&split).unwrap()).unwrap();
        assert_eq!(decoded.status, SplitStatus::Archived);
        assert_eq!(decoded.change_number, 99);
        assert_eq!(decoded.conditions, serde_json::Value::Null);
    }

    #[test]
    fn referenced_segments_found_in_condition_tree() {
        let split = Split {
            name: "with-segments".to_string(),
            traffic_type_name: "user".to_string(),
            status: SplitStatus::Active,
            killed: false,
            default_treatment: "off".to_string(),
            change_number: 1,
            conditions: serde_json::json!([
                {"matcherGroup": {"matchers": [
                    {"matcherType": "IN_SEGMENT",
                     "userDefinedSegmentMatcherData": {"segmentName": "beta-users"}}
                ]}},
                {"matcherGroup": {"matchers": [
                    {"matcherType": "IN_SEGMENT",
                     "userDefinedSegmentMatcherData": {"segmentName": "employees"}},
                    {"matcherType": "IN_SEGMENT",
                     "userDefinedSegmentMatcherData": {"segmentName": "beta-users"}}
                ]}}
            ]),
        };
        assert_eq!(split.referenced_segments(), vec!["beta-users", "employees"]);
    }

    #[test]
    fn impression_pt_field_is_optional() {
        let decoded: Impression = serde_json::from_str(
            r#"{"keyName":"u1","treatment":"on","time":1000,"changeNumber":5,"label":"rule"}"#,
        )
        .unwrap();
        assert_eq!(decoded.previous_time, None);

        let with_pt = Impression {
            previous_time: Some(900),
            ..decoded
        };
        let encoded = serde_json::to_string(&with_pt).unwrap();
        assert!(encoded.contains("\"pt\":900"));
    }

    #[test]
    fn metadata_machine_name_defaults() {
        let meta = Metadata {
            sdk_version: "rust-1.0.0".to_string(),
            machine_ip: "10.0.0.7".to_string(),
            machine_name: String::new(),
        };
        assert_eq!(meta.machine_name_or_unknown(), "unknown");
        assert_eq!(meta.machine_name_or_ip(), "ip-10-0-0-7");
    }
}
