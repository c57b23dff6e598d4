use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use lru::LruCache;
use serde_json::{json, Map, Number, Value};
use std::num::NonZeroUsize;

use super::json::{is_empty_map, JsonCodec};
use crate::rpc::{join_frame, split_frame, CodecError, RpcCodec};
use crate::util::DATA_PREFIX;

pub const DEFAULT_CACHE_SIZE: usize = 1000;

const SCHEMA_PREFIX: &str = "schema_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Boolean,
    Long,
    Double,
    Str,
}

impl Kind {
    /// Column type for a first value; a missing reading is taken as a double.
    fn of(value: &Value) -> Option<Kind> {
        match value {
            Value::Bool(_) => Some(Kind::Boolean),
            Value::Number(n) if n.is_i64() => Some(Kind::Long),
            Value::Number(_) | Value::Null => Some(Kind::Double),
            Value::String(_) => Some(Kind::Str),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn avro_name(self) -> &'static str {
        match self {
            Kind::Boolean => "boolean",
            Kind::Long => "long",
            Kind::Double => "double",
            Kind::Str => "string",
        }
    }

    fn from_avro_name(name: &str) -> Option<Kind> {
        match name {
            "boolean" => Some(Kind::Boolean),
            "long" => Some(Kind::Long),
            "double" => Some(Kind::Double),
            "string" => Some(Kind::Str),
            _ => None,
        }
    }

    /// Kind of a `["null", <type>]` field type.
    fn from_avro_type(ty: &Value) -> Option<Kind> {
        match ty.as_array().map(Vec::as_slice) {
            Some([null, inner]) if null.as_str() == Some("null") => inner.as_str().and_then(Kind::from_avro_name),
            _ => None,
        }
    }

    fn avro_type(self) -> Value {
        json!(["null", self.avro_name()])
    }

    /// Union value: branch 0 for a missing reading, branch 1 otherwise.
    fn to_avro(self, value: &Value) -> Option<AvroValue> {
        let inner = match (self, value) {
            (_, Value::Null) => return Some(AvroValue::Union(0, Box::new(AvroValue::Null))),
            (Kind::Boolean, Value::Bool(b)) => AvroValue::Boolean(*b),
            (Kind::Long, Value::Number(n)) => AvroValue::Long(n.as_i64()?),
            (Kind::Double, Value::Number(n)) => AvroValue::Double(n.as_f64()?),
            (Kind::Str, Value::String(s)) => AvroValue::String(s.clone()),
            _ => return None,
        };
        Some(AvroValue::Union(1, Box::new(inner)))
    }
}

fn from_avro(value: AvroValue) -> Option<Value> {
    match value {
        AvroValue::Boolean(b) => Some(Value::Bool(b)),
        AvroValue::Long(i) => Some(json!(i)),
        AvroValue::Int(i) => Some(json!(i)),
        AvroValue::Double(f) => Some(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
        AvroValue::Float(f) => Some(Number::from_f64(f as f64).map(Value::Number).unwrap_or(Value::Null)),
        AvroValue::String(s) => Some(Value::String(s)),
        AvroValue::Null => Some(Value::Null),
        AvroValue::Union(_, inner) => from_avro(*inner),
        _ => None,
    }
}

/// One flattened `root.key` column of a registered schema
#[derive(Debug, Clone)]
struct Column {
    root: String,
    key: String,
    kind: Kind,
}

/// Schema learned or announced for one subtopic
struct Registered {
    json: Value,
    schema: Schema,
    roots: Vec<String>,
    columns: Vec<Column>,
}

impl Registered {
    /// Derive a record schema from the shape of `content`.
    ///
    /// Fields are named positionally (`f0`, `f1`, ..) with the flattened key
    /// in their `doc`; the record `doc` lists the roots so that empty roots
    /// survive the round trip.
    fn infer(topic: &str, content: &Value) -> Result<Self, CodecError> {
        let not_flat = |reason: &str| CodecError::Encode {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };
        let map = content
            .as_object()
            .ok_or_else(|| not_flat("content is not a map of maps"))?;
        let mut roots = Vec::with_capacity(map.len());
        let mut columns = Vec::new();
        for (root, inner) in map {
            if root.contains('.') {
                return Err(not_flat(&format!("key '{}' contains '.'", root)));
            }
            let inner = inner
                .as_object()
                .ok_or_else(|| not_flat(&format!("'{}' is not a map", root)))?;
            roots.push(root.clone());
            for (key, value) in inner {
                let kind = Kind::of(value)
                    .ok_or_else(|| not_flat(&format!("'{}.{}' is not a scalar", root, key)))?;
                columns.push(Column {
                    root: root.clone(),
                    key: key.clone(),
                    kind,
                });
            }
        }

        let fields: Vec<Value> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                json!({
                    "name": format!("f{}", i),
                    "type": c.kind.avro_type(),
                    "doc": format!("{}.{}", c.root, c.key),
                })
            })
            .collect();
        let roots_doc = serde_json::to_string(&roots).map_err(|e| not_flat(&e.to_string()))?;
        let schema_json = json!({
            "type": "record",
            "namespace": "streaminghub",
            "name": "data",
            "doc": roots_doc,
            "fields": fields,
        });
        let schema = Schema::parse(&schema_json).map_err(|e| not_flat(&e.to_string()))?;
        Ok(Self {
            json: schema_json,
            schema,
            roots,
            columns,
        })
    }

    /// Rebuild a registration from an announced schema.
    fn parse(topic: &str, schema_json: Value) -> Result<Self, CodecError> {
        let invalid = |reason: String| CodecError::Decode {
            topic: topic.to_string(),
            reason,
        };
        let schema = Schema::parse(&schema_json).map_err(|e| invalid(e.to_string()))?;
        let roots: Vec<String> = schema_json
            .get("doc")
            .and_then(Value::as_str)
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()
            .map_err(|e| invalid(e.to_string()))?
            .unwrap_or_default();
        let fields = schema_json
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("schema has no fields".to_string()))?;
        let mut columns = Vec::with_capacity(fields.len());
        for field in fields {
            let doc = field.get("doc").and_then(Value::as_str).unwrap_or_default();
            let (root, key) = doc
                .split_once('.')
                .ok_or_else(|| invalid(format!("field doc '{}' is not a flattened key", doc)))?;
            let kind = field
                .get("type")
                .and_then(Kind::from_avro_type)
                .ok_or_else(|| invalid(format!("unsupported type of '{}'", doc)))?;
            columns.push(Column {
                root: root.to_string(),
                key: key.to_string(),
                kind,
            });
        }
        Ok(Self {
            json: schema_json,
            schema,
            roots,
            columns,
        })
    }

    fn encode(&self, topic: &str, content: &Value) -> Result<Vec<u8>, CodecError> {
        let mismatch = |reason: String| CodecError::Encode {
            topic: topic.to_string(),
            reason,
        };
        let size: usize = content
            .as_object()
            .map(|m| m.values().filter_map(Value::as_object).map(Map::len).sum())
            .unwrap_or(0);
        if size != self.columns.len() {
            return Err(mismatch(format!(
                "{} values for a schema of {} fields",
                size,
                self.columns.len()
            )));
        }
        let mut fields = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let value = content
                .get(&column.root)
                .and_then(|inner| inner.get(&column.key))
                .ok_or_else(|| mismatch(format!("missing '{}.{}'", column.root, column.key)))?;
            let avro = column.kind.to_avro(value).ok_or_else(|| {
                mismatch(format!(
                    "'{}.{}' is not a {}",
                    column.root,
                    column.key,
                    column.kind.avro_name()
                ))
            })?;
            fields.push((format!("f{}", i), avro));
        }
        apache_avro::to_avro_datum(&self.schema, AvroValue::Record(fields)).map_err(|e| mismatch(e.to_string()))
    }

    fn decode(&self, topic: &str, body: &[u8]) -> Result<Value, CodecError> {
        let invalid = |reason: String| CodecError::Decode {
            topic: topic.to_string(),
            reason,
        };
        let mut reader = body;
        let datum = apache_avro::from_avro_datum(&self.schema, &mut reader, None)
            .map_err(|e| invalid(e.to_string()))?;
        let fields = match datum {
            AvroValue::Record(fields) => fields,
            other => return Err(invalid(format!("expected a record, got {:?}", other))),
        };
        if fields.len() != self.columns.len() {
            return Err(invalid(format!("{} fields for {} columns", fields.len(), self.columns.len())));
        }

        let mut nested = Map::new();
        for root in &self.roots {
            nested.insert(root.clone(), Value::Object(Map::new()));
        }
        for (column, (_, value)) in self.columns.iter().zip(fields) {
            let value = from_avro(value).ok_or_else(|| invalid(format!("unsupported value in '{}'", column.key)))?;
            if let Value::Object(inner) = nested
                .entry(column.root.clone())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                inner.insert(column.key.clone(), value);
            }
        }
        Ok(Value::Object(nested))
    }
}

/// Avro bodies for streaming topics, JSON otherwise
pub struct AvroCodec {
    registry: LruCache<String, Registered>,
}

impl Default for AvroCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl AvroCodec {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry: LruCache::new(capacity),
        }
    }

    /// Number of schemas currently cached
    pub fn cached(&self) -> usize {
        self.registry.len()
    }

    fn learn(&mut self, subtopic: &str, topic: &str, body: &[u8]) -> Result<(), CodecError> {
        let schema_json = JsonCodec::decode_body(topic, body)?;
        if let Some(known) = self.registry.get(subtopic) {
            if known.json != schema_json {
                return Err(CodecError::SchemaConflict(subtopic.to_string()));
            }
            return Ok(());
        }
        let registered = Registered::parse(topic, schema_json)?;
        tracing::debug!("Learned schema of '{}' ({} fields)", subtopic, registered.columns.len());
        self.registry.put(subtopic.to_string(), registered);
        Ok(())
    }
}

impl RpcCodec for AvroCodec {
    fn name(&self) -> &'static str {
        "avro"
    }

    fn encode(&mut self, topic: &str, content: &Value) -> Result<Vec<Vec<u8>>, CodecError> {
        let subtopic = match topic.strip_prefix(DATA_PREFIX) {
            Some(sub) if !is_empty_map(content) => sub,
            _ => {
                let body = JsonCodec::encode_body(topic, content)?;
                return Ok(vec![join_frame(topic, &body)]);
            }
        };

        let mut frames = Vec::with_capacity(2);
        if !self.registry.contains(subtopic) {
            let registered = Registered::infer(topic, content)?;
            let schema_topic = format!("{}{}", SCHEMA_PREFIX, subtopic);
            let body = JsonCodec::encode_body(&schema_topic, &registered.json)?;
            frames.push(join_frame(&schema_topic, &body));
            self.registry.put(subtopic.to_string(), registered);
        }
        let registered = self
            .registry
            .get(subtopic)
            .ok_or_else(|| CodecError::MissingSchema(topic.to_string()))?;
        let body = registered.encode(topic, content)?;
        frames.push(join_frame(topic, &body));
        Ok(frames)
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Option<(String, Value)>, CodecError> {
        let (topic, body) = split_frame(payload)?;
        if let Some(subtopic) = topic.strip_prefix(SCHEMA_PREFIX) {
            self.learn(subtopic, topic, body)?;
            return Ok(None);
        }
        let content = match topic.strip_prefix(DATA_PREFIX) {
            Some(_) if body.is_empty() => Value::Object(Map::new()),
            Some(subtopic) => self
                .registry
                .get(subtopic)
                .ok_or_else(|| CodecError::MissingSchema(topic.to_string()))?
                .decode(topic, body)?,
            None => JsonCodec::decode_body(topic, body)?,
        };
        Ok(Some((topic.to_string(), content)))
    }
}
