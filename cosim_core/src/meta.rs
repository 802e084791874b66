//! Simulator metadata returned by `init`, and the entity descriptors
//! returned by `create`.
//!
//! Simulators written against [`MetaBuilder`] describe their models
//! declaratively; the coordinator only ever sees the resulting [`SimMeta`].

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Protocol version both sides must agree on (plain string compare).
pub const API_VERSION: &str = "3.0";

/// Declared capabilities of one model type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Whether scenarios may instantiate this model directly
    pub public: bool,

    /// Constructor parameter names
    #[serde(default)]
    pub params: Vec<String>,

    /// Attribute names (no read/write distinction at this layer)
    #[serde(default)]
    pub attrs: Vec<String>,

    /// Accept connections to attributes not listed in `attrs`
    #[serde(default)]
    pub any_inputs: bool,
}

impl ModelMeta {
    /// A model scenarios may instantiate.
    pub fn public() -> Self {
        Self {
            public: true,
            params: Vec::new(),
            attrs: Vec::new(),
            any_inputs: false,
        }
    }

    /// A model only created as a child of another entity.
    pub fn hidden() -> Self {
        Self {
            public: false,
            ..Self::public()
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attrs<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs = attrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepting_any_inputs(mut self) -> Self {
        self.any_inputs = true;
        self
    }

    /// True if `attr` can be read from entities of this model.
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// True if `attr` can be written by an incoming connection.
    pub fn accepts_input(&self, attr: &str) -> bool {
        self.any_inputs || self.has_attr(attr)
    }
}

/// Metadata a simulator returns from `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimMeta {
    pub api_version: String,

    pub models: BTreeMap<String, ModelMeta>,

    /// Additional methods the simulator exposes beyond the core protocol
    #[serde(default)]
    pub extra_methods: Vec<String>,
}

impl SimMeta {
    /// Starts a declarative metadata description.
    pub fn builder() -> MetaBuilder {
        MetaBuilder::default()
    }

    /// Looks up a model by name.
    pub fn model(&self, name: &str) -> Option<&ModelMeta> {
        self.models.get(name)
    }

    /// Rejects any API version other than [`API_VERSION`].
    pub fn check_version(&self, sid: &str) -> Result<(), ConfigurationError> {
        if self.api_version == API_VERSION {
            Ok(())
        } else {
            Err(ConfigurationError::ApiVersion {
                sid: sid.to_string(),
                expected: API_VERSION.to_string(),
                found: self.api_version.clone(),
            })
        }
    }
}

/// Builder producing a [`SimMeta`].
///
/// # Example
///
/// ```
/// use cosim_core::{ModelMeta, SimMeta};
///
/// let meta = SimMeta::builder()
///     .model("Battery", ModelMeta::public().with_params(["capacity"]).with_attrs(["soc", "p"]))
///     .model("Cell", ModelMeta::hidden().with_attrs(["v"]))
///     .build();
///
/// assert!(meta.model("Battery").unwrap().public);
/// ```
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    meta: SimMeta,
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self {
            meta: SimMeta {
                api_version: API_VERSION.to_string(),
                models: BTreeMap::new(),
                extra_methods: Vec::new(),
            },
        }
    }
}

impl MetaBuilder {
    /// Overrides the advertised API version.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.meta.api_version = version.into();
        self
    }

    /// Declares a model.
    pub fn model(mut self, name: impl Into<String>, model: ModelMeta) -> Self {
        self.meta.models.insert(name.into(), model);
        self
    }

    /// Declares an extra method.
    pub fn extra_method(mut self, name: impl Into<String>) -> Self {
        self.meta.extra_methods.push(name.into());
        self
    }

    pub fn build(self) -> SimMeta {
        self.meta
    }
}

/// One entity as reported by `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub eid: String,

    #[serde(rename = "type")]
    pub model: String,

    /// Related entities: eids of the same simulator or full ids
    #[serde(default)]
    pub rel: Vec<String>,

    #[serde(default)]
    pub children: Vec<EntityDescriptor>,
}

impl EntityDescriptor {
    pub fn new(eid: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            eid: eid.into(),
            model: model.into(),
            rel: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<EntityDescriptor>) -> Self {
        self.children = children;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_wire_shape() {
        let meta = SimMeta::builder()
            .model("Probe", ModelMeta::public().with_attrs(["out"]).accepting_any_inputs())
            .build();

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["api_version"], json!(API_VERSION));
        assert_eq!(value["models"]["Probe"]["public"], json!(true));
        assert_eq!(value["models"]["Probe"]["any_inputs"], json!(true));
    }

    #[test]
    fn test_meta_defaults_when_fields_omitted() {
        let meta: SimMeta = serde_json::from_value(json!({
            "api_version": "3.0",
            "models": {"M": {"public": false}}
        }))
        .unwrap();

        let model = meta.model("M").unwrap();
        assert!(model.params.is_empty());
        assert!(!model.accepts_input("x"));
        assert!(meta.extra_methods.is_empty());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let meta = SimMeta::builder().api_version("2.2").build();
        let err = meta.check_version("Old-0").unwrap_err();
        assert!(matches!(err, ConfigurationError::ApiVersion { .. }));
        assert!(SimMeta::builder().build().check_version("New-0").is_ok());
    }

    #[test]
    fn test_descriptor_uses_type_key() {
        let desc: EntityDescriptor = serde_json::from_value(json!({
            "eid": "grid",
            "type": "Grid",
            "children": [{"eid": "bus_1", "type": "Bus"}]
        }))
        .unwrap();

        assert_eq!(desc.model, "Grid");
        assert_eq!(desc.children[0].eid, "bus_1");
        assert!(desc.rel.is_empty());
    }
}
