use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{Proxy, ProxyKey};

/// The overall outcome of translating a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProxyState {
    Accepted,
    Warning,
    Rejected,
}

impl ProxyState {
    fn from_counts(errors: usize, warnings: usize) -> Self {
        match (errors, warnings) {
            (0, 0) => ProxyState::Accepted,
            (0, _) => ProxyState::Warning,
            _ => ProxyState::Rejected,
        }
    }
}

/// Errors and warnings produced while translating a proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ProxyReport {
    pub fn state(&self) -> ProxyState {
        ProxyState::from_counts(self.errors.len(), self.warnings.len())
    }
}

/// A reference to a Kubernetes object that contributed to a proxy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: SmolStr,
    pub namespace: SmolStr,
    pub name: SmolStr,
}

/// Errors and warnings attributed to a single input resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub resource: ResourceRef,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResourceReport {
    pub fn state(&self) -> ProxyState {
        ProxyState::from_counts(self.errors.len(), self.warnings.len())
    }
}

/// Everything translation had to say about one proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationReports {
    pub proxy_report: ProxyReport,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_reports: Vec<ResourceReport>,
}

impl TranslationReports {
    /// The worst state across the proxy and every resource report.
    pub fn state(&self) -> ProxyState {
        self.resource_reports
            .iter()
            .map(ResourceReport::state)
            .fold(self.proxy_report.state(), std::cmp::max)
    }
}

/// A proxy paired with the reports from the translation pass that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyWithReports {
    pub proxy: Proxy,
    pub reports: TranslationReports,
}

impl ProxyWithReports {
    pub fn new(proxy: Proxy, reports: TranslationReports) -> Self {
        Self { proxy, reports }
    }

    pub fn key(&self) -> ProxyKey {
        self.proxy.key()
    }

    pub fn generation(&self) -> u64 {
        self.proxy.translation_generation()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn resource(kind: &str, name: &str) -> ResourceRef {
        ResourceRef {
            kind: kind.into(),
            namespace: "default".into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_report_state() {
        let mut reports = TranslationReports::default();
        assert_eq!(reports.state(), ProxyState::Accepted);

        reports.resource_reports.push(ResourceReport {
            resource: resource("HTTPRoute", "web"),
            errors: vec![],
            warnings: vec!["backend web/8080 has no endpoints".to_string()],
        });
        assert_eq!(reports.state(), ProxyState::Warning);

        reports.proxy_report.errors.push("listener http has no routes".to_string());
        assert_eq!(reports.proxy_report.state(), ProxyState::Rejected);
        assert_eq!(reports.state(), ProxyState::Rejected);
    }

    #[test]
    fn test_reports_serialize_compactly() {
        let report = ProxyWithReports::new(
            Proxy::new("default", "edge").with_generation(3),
            TranslationReports {
                proxy_report: ProxyReport::default(),
                resource_reports: vec![ResourceReport {
                    resource: resource("Gateway", "edge"),
                    errors: vec!["no listeners".to_string()],
                    warnings: vec![],
                }],
            },
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["reports"]["proxy_report"], serde_json::json!({}));
        assert_eq!(
            json["reports"]["resource_reports"][0],
            serde_json::json!({
                "resource": {"kind": "Gateway", "namespace": "default", "name": "edge"},
                "errors": ["no listeners"],
            })
        );

        let roundtrip: ProxyWithReports = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip, report);
        assert_eq!(roundtrip.generation(), 3);
    }
}
