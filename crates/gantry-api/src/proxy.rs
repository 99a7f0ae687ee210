use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{CREATED_BY_LABEL, GENERATION_ANNOTATION};

/// The `(namespace, name)` identity of a translated proxy.
///
/// A `ProxyKey` is cheap to clone and orders by namespace, then name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyKey {
    pub namespace: SmolStr,
    pub name: SmolStr,
}

impl ProxyKey {
    pub fn new(namespace: impl Into<SmolStr>, name: impl Into<SmolStr>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ProxyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid proxy key {key:?}: {reason}")]
pub struct InvalidProxyKey {
    key: String,
    reason: &'static str,
}

impl FromStr for ProxyKey {
    type Err = InvalidProxyKey;

    /// Parse a key from its `namespace/name` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidProxyKey {
            key: s.to_string(),
            reason,
        };

        let (namespace, name) = s.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        if namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if name.contains('/') {
            return Err(invalid("name may not contain '/'"));
        }

        Ok(ProxyKey::new(namespace, name))
    }
}

/// A translated proxy configuration artifact.
///
/// Only the object metadata matters to the control plane core: it carries the
/// proxy's identity, the controller that produced it, and the translation
/// generation it was produced in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub metadata: ObjectMeta,
}

impl Proxy {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
        }
    }

    /// Set the controller label on this proxy.
    pub fn with_controller(mut self, controller: &str) -> Self {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(CREATED_BY_LABEL.to_string(), controller.to_string());
        self
    }

    /// Set the translation generation annotation on this proxy.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(GENERATION_ANNOTATION.to_string(), generation.to_string());
        self
    }

    pub fn key(&self) -> ProxyKey {
        ProxyKey::new(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// The name of the controller that produced this proxy, if it has one.
    pub fn created_by(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(CREATED_BY_LABEL))
            .map(String::as_str)
    }

    /// The translation generation this proxy was produced in.
    ///
    /// A missing or malformed annotation is generation `0`.
    pub fn translation_generation(&self) -> u64 {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(GENERATION_ANNOTATION))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_proxy_key_from_str() {
        assert_eq!(
            ProxyKey::from_str("gantry-system/gateway-proxy").unwrap(),
            ProxyKey::new("gantry-system", "gateway-proxy"),
        );

        for invalid in ["", "no-slash", "/name", "namespace/", "a/b/c"] {
            assert!(
                ProxyKey::from_str(invalid).is_err(),
                "{invalid:?} should not parse"
            );
        }
    }

    #[test]
    fn test_proxy_key_display_roundtrips() {
        let key = ProxyKey::new("default", "edge");
        assert_eq!(key.to_string(), "default/edge");
        assert_eq!(ProxyKey::from_str(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_translation_generation() {
        let proxy = Proxy::new("default", "edge");
        assert_eq!(proxy.translation_generation(), 0);

        let proxy = proxy.with_generation(123);
        assert_eq!(proxy.translation_generation(), 123);

        let mut proxy = Proxy::new("default", "edge");
        proxy.metadata.annotations = Some(BTreeMap::from([(
            GENERATION_ANNOTATION.to_string(),
            "not-a-number".to_string(),
        )]));
        assert_eq!(proxy.translation_generation(), 0);

        proxy.metadata.annotations = Some(BTreeMap::from([(
            GENERATION_ANNOTATION.to_string(),
            "-4".to_string(),
        )]));
        assert_eq!(proxy.translation_generation(), 0);
    }

    #[test]
    fn test_created_by() {
        let proxy = Proxy::new("default", "edge");
        assert_eq!(proxy.created_by(), None);

        let proxy = proxy.with_controller("gantry-kube-gateway");
        assert_eq!(proxy.created_by(), Some("gantry-kube-gateway"));
        assert_eq!(proxy.key(), ProxyKey::new("default", "edge"));
    }

    #[test]
    fn test_proxy_from_yaml() {
        let proxy: Proxy = serde_yml::from_str(
            r#"
metadata:
  namespace: gantry-system
  name: gateway-proxy
  labels:
    created_by: gantry-kube-gateway
  annotations:
    gantry.dev/translation-generation: "17"
"#,
        )
        .unwrap();

        assert_eq!(proxy.key(), ProxyKey::new("gantry-system", "gateway-proxy"));
        assert_eq!(proxy.created_by(), Some("gantry-kube-gateway"));
        assert_eq!(proxy.translation_generation(), 17);
    }
}
