use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{DfdsError, Result};
use crate::loader::Loader;
use crate::types::{Collection, Node, Stream};
use crate::url::PathOrUrl;

/// Reference chains deeper than this are treated as cycles.
const MAX_REF_DEPTH: usize = 32;

/// Parser for DFDS metadata
///
/// Fetches a descriptor, validates it against its `$schema` when one is
/// declared, then replaces every `{"@ref": ...}` object with the content it
/// points to.
#[derive(Default)]
pub struct Parser {
    loader: Loader,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_stream_metadata(&self, meta_ptr: &str) -> Result<Stream> {
        tracing::debug!("getting stream metadata: {}", meta_ptr);
        self.typed(meta_ptr)
    }

    pub fn get_node_metadata(&self, meta_ptr: &str) -> Result<Node> {
        tracing::debug!("getting node metadata: {}", meta_ptr);
        self.typed(meta_ptr)
    }

    pub fn get_collection_metadata(&self, meta_ptr: &str) -> Result<Collection> {
        tracing::debug!("getting collection metadata: {}", meta_ptr);
        self.typed(meta_ptr)
    }

    fn typed<T: DeserializeOwned>(&self, meta_ptr: &str) -> Result<T> {
        let metadata = self.fetch_metadata(meta_ptr)?;
        serde_json::from_value(metadata)
            .map_err(|e| DfdsError::Parse(format!("{}: {}", meta_ptr, e)))
    }

    /// Fetch, validate and dereference the metadata at `meta_ptr`.
    pub fn fetch_metadata(&self, meta_ptr: &str) -> Result<Value> {
        self.fetch_at_depth(meta_ptr, 0)
    }

    fn fetch_at_depth(&self, meta_ptr: &str, depth: usize) -> Result<Value> {
        if depth > MAX_REF_DEPTH {
            return Err(DfdsError::Parse(format!(
                "reference chain too deep at {}",
                meta_ptr
            )));
        }
        let ptr = PathOrUrl::parse(meta_ptr)?;
        let base = ptr.without_fragment();
        tracing::debug!("resolved url (metadata): {}", ptr);

        let metadata = self.loader.get(&ptr)?;

        if let Some(schema_ptr) = metadata.get("$schema").and_then(Value::as_str) {
            let schema_url = base.join(&PathOrUrl::parse(schema_ptr)?)?;
            tracing::debug!("resolved url (schema): {}", schema_url);
            let schema = self.loader.get(&schema_url)?;
            validate(&metadata, &schema, &schema_url.to_url(false))?;
        }

        self.dereference(metadata, &base, depth)
    }

    fn dereference(&self, metadata: Value, base: &PathOrUrl, depth: usize) -> Result<Value> {
        let Value::Object(map) = metadata else {
            return Ok(metadata);
        };

        if map.len() == 1 {
            if let Some(Value::String(reference)) = map.get("@ref") {
                tracing::debug!("dereferencing {} with base={}", reference, base);
                let target = base.join(&PathOrUrl::parse(reference)?)?;
                let fetched = self.fetch_at_depth(&target.to_url(false), depth + 1)?;
                if let Some(device) = fetched.get("device") {
                    let mut only = Map::new();
                    only.insert("device".to_string(), device.clone());
                    return Ok(Value::Object(only));
                }
                return Ok(fetched);
            }
        }

        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            // back-references are never followed
            let value = if key != "node" && key != "@ref" && value.is_object() {
                self.dereference(value, base, depth)?
            } else {
                value
            };
            out.insert(key, value);
        }
        Ok(Value::Object(out))
    }
}

/// Validate `metadata` against `schema`, collecting every violation.
pub fn validate(metadata: &Value, schema: &Value, schema_uri: &str) -> Result<()> {
    tracing::debug!("validating metadata against schema: {}", schema_uri);
    let validator = jsonschema::validator_for(schema).map_err(|e| DfdsError::Validation {
        schema: schema_uri.to_string(),
        reason: format!("invalid schema: {}", e),
    })?;

    let errors: Vec<String> = validator
        .iter_errors(metadata)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DfdsError::Validation {
            schema: schema_uri.to_string(),
            reason: errors.join("; "),
        })
    }
}
