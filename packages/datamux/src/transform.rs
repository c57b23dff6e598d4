// Record transforms
//
// Transforms are unary functions applied to every outgoing message,
// including the end-of-stream sentinel. Transforms that must cross the RPC
// boundary are referenced by name and parameters and resolved from a
// registry on the receiving side.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DataMuxError, Result};
use crate::message::{Envelope, Message};

pub type TransformFn = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Serializable reference to a registered transform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TransformSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn identity() -> Self {
        Self::new("identity")
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Wraps an inner transform with routing bytes around its output
#[derive(Clone)]
pub struct Enveloper {
    pub prefix: Option<Vec<u8>>,
    pub transform: Box<Transform>,
    pub suffix: Option<Vec<u8>>,
}

impl Enveloper {
    pub fn new(transform: Transform) -> Self {
        Self {
            prefix: None,
            transform: Box::new(transform),
            suffix: None,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<Vec<u8>>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn apply(&self, msg: Message) -> Message {
        let msg = self.transform.apply(msg);
        if self.prefix.is_none() && self.suffix.is_none() {
            return msg;
        }
        Message::Envelope(Envelope {
            prefix: self.prefix.clone(),
            message: Box::new(msg),
            suffix: self.suffix.clone(),
        })
    }
}

#[derive(Clone, Default)]
pub enum Transform {
    #[default]
    Identity,
    Named {
        spec: TransformSpec,
        func: TransformFn,
    },
    Custom(TransformFn),
    Envelope(Enveloper),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => f.write_str("Identity"),
            Transform::Named { spec, .. } => write!(f, "Named({})", spec.name),
            Transform::Custom(_) => f.write_str("Custom"),
            Transform::Envelope(env) => f
                .debug_struct("Envelope")
                .field("prefix", &env.prefix.as_ref().map(|p| String::from_utf8_lossy(p)))
                .field("transform", &env.transform)
                .field("suffix", &env.suffix.as_ref().map(|s| String::from_utf8_lossy(s)))
                .finish(),
        }
    }
}

impl Transform {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Message) -> Message + Send + Sync + 'static,
    {
        Transform::Custom(Arc::new(f))
    }

    pub fn apply(&self, msg: Message) -> Message {
        match self {
            Transform::Identity => msg,
            Transform::Named { func, .. } | Transform::Custom(func) => func(msg),
            Transform::Envelope(env) => env.apply(msg),
        }
    }

    /// Wire reference for this transform, if it has one.
    ///
    /// Envelopes are local routing and are dropped; custom closures cannot
    /// be shipped.
    pub fn spec(&self) -> Option<TransformSpec> {
        match self {
            Transform::Identity => Some(TransformSpec::identity()),
            Transform::Named { spec, .. } => Some(spec.clone()),
            Transform::Custom(_) => None,
            Transform::Envelope(env) => env.transform.spec(),
        }
    }

    /// Set the enveloper prefix when this transform is an envelope.
    pub fn set_prefix(&mut self, prefix: &[u8]) -> bool {
        match self {
            Transform::Envelope(env) => {
                env.prefix = Some(prefix.to_vec());
                true
            }
            _ => false,
        }
    }
}

type Factory = Arc<dyn Fn(&Map<String, Value>) -> Result<TransformFn> + Send + Sync>;

/// Named transform factories, resolved on the server side
#[derive(Clone)]
pub struct TransformRegistry {
    factories: Arc<RwLock<HashMap<String, Factory>>>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self {
            factories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `identity`, `select`, `scale` and `round`
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register("identity", |_| Ok(Arc::new(|m: Message| m) as TransformFn));
        registry.register("select", select_factory);
        registry.register("scale", scale_factory);
        registry.register("round", round_factory);
        registry
    }

    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> Result<TransformFn> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(&self, spec: &TransformSpec) -> Result<Transform> {
        if spec.name == "identity" && spec.params.is_empty() {
            return Ok(Transform::Identity);
        }
        let factory = self
            .factories
            .read()
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| DataMuxError::NotFound(format!("transform '{}'", spec.name)))?;
        Ok(Transform::Named {
            spec: spec.clone(),
            func: factory(&spec.params)?,
        })
    }
}

fn string_list(params: &Map<String, Value>, key: &str) -> Result<Option<Vec<String>>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    DataMuxError::Parse(format!("'{}' must be a list of strings", key))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(DataMuxError::Parse(format!(
            "'{}' must be a list of strings",
            key
        ))),
    }
}

fn map_values(msg: Message, f: impl Fn(&str, &mut Value)) -> Message {
    match msg {
        Message::Data(mut record) => {
            for (k, v) in record.value.iter_mut() {
                f(k, v);
            }
            Message::Data(record)
        }
        other => other,
    }
}

fn select_factory(params: &Map<String, Value>) -> Result<TransformFn> {
    let fields = string_list(params, "fields")?
        .ok_or_else(|| DataMuxError::Parse("select requires 'fields'".to_string()))?;
    Ok(Arc::new(move |msg: Message| match msg {
        Message::Data(mut record) => {
            record.value.retain(|k, _| fields.iter().any(|f| f == k));
            Message::Data(record)
        }
        other => other,
    }))
}

fn scale_factory(params: &Map<String, Value>) -> Result<TransformFn> {
    let factor = params
        .get("factor")
        .and_then(Value::as_f64)
        .ok_or_else(|| DataMuxError::Parse("scale requires a numeric 'factor'".to_string()))?;
    let fields = string_list(params, "fields")?;
    Ok(Arc::new(move |msg: Message| {
        map_values(msg, |k, v| {
            let selected = fields.as_ref().map(|f| f.iter().any(|x| x == k)).unwrap_or(true);
            if let (true, Some(x)) = (selected, v.as_f64()) {
                *v = serde_json::Number::from_f64(x * factor)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
            }
        })
    }))
}

fn round_factory(params: &Map<String, Value>) -> Result<TransformFn> {
    let digits = params.get("digits").and_then(Value::as_i64).unwrap_or(0);
    let scale = 10f64.powi(digits.clamp(0, 12) as i32);
    Ok(Arc::new(move |msg: Message| {
        map_values(msg, |_, v| {
            if let Some(x) = v.as_f64() {
                *v = serde_json::Number::from_f64((x * scale).round() / scale)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
            }
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Message {
        Message::from_content(json!({"index": {"t": 1.0}, "value": {"x": 1.25, "y": 2.0, "l": "a"}}))
    }

    #[test]
    fn test_enveloper_frames_messages() {
        let mut t = Transform::Envelope(Enveloper::new(Transform::Identity).with_suffix("conn-1"));
        assert!(t.set_prefix(b"d_abcde"));
        match t.apply(Message::Eof) {
            Message::Envelope(env) => {
                assert_eq!(env.prefix.as_deref(), Some(&b"d_abcde"[..]));
                assert_eq!(*env.message, Message::Eof);
                assert_eq!(env.suffix.as_deref(), Some(&b"conn-1"[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_enveloper_without_framing_is_transparent() {
        let env = Enveloper::new(Transform::Identity);
        assert_eq!(env.apply(Message::Eof), Message::Eof);
    }

    #[test]
    fn test_builtin_transforms() {
        let registry = TransformRegistry::with_builtins();

        let select = registry
            .resolve(&TransformSpec::new("select").with_param("fields", json!(["x"])))
            .unwrap();
        let out = select.apply(record());
        assert_eq!(out.record().unwrap().value.keys().collect::<Vec<_>>(), vec!["x"]);

        let scale = registry
            .resolve(&TransformSpec::new("scale").with_param("factor", 2.0))
            .unwrap();
        let out = scale.apply(record());
        assert_eq!(out.record().unwrap().value["y"], json!(4.0));
        assert_eq!(out.record().unwrap().value["l"], json!("a"));

        let round = registry
            .resolve(&TransformSpec::new("round").with_param("digits", 1))
            .unwrap();
        let out = round.apply(record());
        assert_eq!(out.record().unwrap().value["x"], json!(1.3));

        // the sentinel passes through every builtin unchanged
        assert_eq!(scale.apply(Message::Eof), Message::Eof);
    }

    #[test]
    fn test_unknown_and_invalid_specs() {
        let registry = TransformRegistry::with_builtins();
        assert!(matches!(
            registry.resolve(&TransformSpec::new("pickle")),
            Err(DataMuxError::NotFound(_))
        ));
        assert!(registry.resolve(&TransformSpec::new("select")).is_err());
    }

    #[test]
    fn test_spec_of_transforms() {
        assert_eq!(Transform::Identity.spec(), Some(TransformSpec::identity()));
        assert_eq!(Transform::custom(|m| m).spec(), None);
        let env = Transform::Envelope(Enveloper::new(Transform::Identity));
        assert_eq!(env.spec(), Some(TransformSpec::identity()));
    }
}
