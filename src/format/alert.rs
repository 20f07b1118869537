//! Notifications as Alertmanager-style alerts.

use serde_json::{json, Map, Value as JsonValue};

use super::FormatError;
use crate::meta::{MetaEntry, MetaValue};
use crate::types::Notification;

/// `collectd_<plugin>_<type>`, or `collectd_<type>` when both are equal.
pub fn alert_name(notification: &Notification) -> String {
    let id = &notification.identifier;
    if id.plugin == id.type_name {
        format!("collectd_{}", id.type_name)
    } else {
        format!("collectd_{}_{}", id.plugin, id.type_name)
    }
}

/// Metadata values become strings; nested lists become objects.
fn meta_to_json(value: &MetaValue) -> JsonValue {
    match value {
        MetaValue::String(s) => JsonValue::String(s.clone()),
        MetaValue::SignedInt(v) => JsonValue::String(v.to_string()),
        MetaValue::UnsignedInt(v) => JsonValue::String(v.to_string()),
        MetaValue::Double(v) => JsonValue::String(super::format_gauge(*v)),
        MetaValue::Boolean(v) => JsonValue::String(v.to_string()),
        MetaValue::Nested(entries) => JsonValue::Object(entries_to_map(entries)),
    }
}

fn entries_to_map(entries: &[MetaEntry]) -> Map<String, JsonValue> {
    entries
        .iter()
        .map(|e| (e.key.clone(), meta_to_json(&e.value)))
        .collect()
}

/// Render a notification as a one-element JSON array of alerts.
pub fn format_alert(notification: &Notification) -> Result<String, FormatError> {
    let id = &notification.identifier;

    let mut labels = Map::new();
    labels.insert("alertname".into(), alert_name(notification).into());
    labels.insert("instance".into(), id.host.as_str().into());
    // Instance mangling follows the Prometheus collectd exporter.
    if !id.plugin_instance.is_empty() {
        labels.insert(id.plugin.to_string(), id.plugin_instance.as_str().into());
    }
    if !id.type_instance.is_empty() {
        let key = if id.plugin_instance.is_empty() {
            id.plugin.to_string()
        } else {
            "type".to_string()
        };
        labels.insert(key, id.type_instance.as_str().into());
    }
    labels.insert("severity".into(), notification.severity.as_str().into());
    labels.insert("service".into(), "collectd".into());

    let mut annotations = Map::new();
    annotations.insert("summary".into(), notification.message.as_str().into());
    annotations.extend(entries_to_map(&notification.meta));

    let alert = json!([{
        "labels": labels,
        "annotations": annotations,
        "startsAt": notification.time.to_rfc3339_nanos(),
    }]);
    Ok(serde_json::to_string(&alert)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use crate::time::CdTime;
    use crate::types::Severity;
    use pretty_assertions::assert_eq;

    fn parse(n: &Notification) -> JsonValue {
        serde_json::from_str(&format_alert(n).unwrap()).unwrap()
    }

    #[test]
    fn test_labels_and_annotations() {
        let mut n = Notification::new(
            Severity::Failure,
            Identifier::new("db1", "df", "root", "percent_bytes", "used"),
            "Disk almost full",
        )
        .with_time(CdTime::from_secs(1_700_000_000));
        n.add_meta_double("current", 97.5).add_meta_string("unit", "%");

        let alert = &parse(&n)[0];
        assert_eq!(alert["labels"]["alertname"], "collectd_df_percent_bytes");
        assert_eq!(alert["labels"]["instance"], "db1");
        assert_eq!(alert["labels"]["df"], "root");
        assert_eq!(alert["labels"]["type"], "used");
        assert_eq!(alert["labels"]["severity"], "FAILURE");
        assert_eq!(alert["labels"]["service"], "collectd");
        assert_eq!(alert["annotations"]["summary"], "Disk almost full");
        assert_eq!(alert["annotations"]["current"], "97.5");
        assert_eq!(alert["annotations"]["unit"], "%");
        assert!(alert["startsAt"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn test_type_instance_without_plugin_instance() {
        let n = Notification::new(Severity::Okay, Identifier::new("h", "load", "", "load", "relative"), "ok");
        let alert = &parse(&n)[0];
        assert_eq!(alert["labels"]["alertname"], "collectd_load");
        assert_eq!(alert["labels"]["load"], "relative");
        assert!(alert["labels"].get("type").is_none());
    }

    #[test]
    fn test_nested_meta_is_walked() {
        let mut n = Notification::new(Severity::Warning, Identifier::new("h", "cpu", "", "cpu", ""), "busy");
        n.add_meta(
            "thresholds",
            MetaValue::Nested(vec![
                MetaEntry::new("warning", MetaValue::SignedInt(80)),
                MetaEntry::new("inner", MetaValue::Nested(vec![MetaEntry::new("on", MetaValue::Boolean(true))])),
            ]),
        );
        let alert = &parse(&n)[0];
        assert_eq!(alert["annotations"]["thresholds"]["warning"], "80");
        assert_eq!(alert["annotations"]["thresholds"]["inner"]["on"], "true");
    }
}
