use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{DfdsError, Result};
use crate::url::PathOrUrl;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Modification time and length of a cached file
type Stamp = Option<(SystemTime, u64)>;

fn stamp(path: &Path) -> Stamp {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Fetches JSON documents from the file system or over HTTP(S).
///
/// Whole documents are cached by location; fragments are navigated on every
/// call so that each caller gets its own copy to mutate. Cached files are
/// reloaded once their modification time or length changes.
#[derive(Default)]
pub struct Loader {
    cache: Mutex<HashMap<String, (Stamp, Arc<Value>)>>,
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `ptr` and navigate to its fragment, if any.
    ///
    /// A navigated fragment gets a `node: {"@ref": <document>}` back-pointer
    /// so nested definitions can be hydrated later.
    pub fn get(&self, ptr: &PathOrUrl) -> Result<Value> {
        let location = ptr.to_url(true);
        let document = self.document(ptr, &location)?;

        let Some(fragment) = ptr.fragment() else {
            return Ok((*document).clone());
        };

        let mut cursor: &Value = &document;
        for part in fragment.split('/').filter(|p| !p.is_empty()) {
            cursor = match cursor {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| DfdsError::NotFound(format!("{}#{}", location, fragment)))?;
        }

        let mut out = cursor.clone();
        if let Value::Object(map) = &mut out {
            map.insert("node".to_string(), json!({ "@ref": location }));
        }
        Ok(out)
    }

    fn document(&self, ptr: &PathOrUrl, location: &str) -> Result<Arc<Value>> {
        let current = ptr.fspath().and_then(stamp);
        if let Some((cached, doc)) = self.cache.lock().get(location) {
            if *cached == current {
                return Ok(doc.clone());
            }
        }

        let text = if let Some(path) = ptr.fspath() {
            std::fs::read_to_string(path).map_err(|e| {
                DfdsError::NotFound(format!("{}: {}", path.display(), e))
            })?
        } else {
            fetch_url(location)?
        };

        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| DfdsError::Parse(format!("{}: {}", location, e)))?;
        tracing::debug!("Fetched: {}", location);

        let doc = Arc::new(doc);
        self.cache
            .lock()
            .insert(location.to_string(), (current, doc.clone()));
        Ok(doc)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

fn fetch_url(url: &str) -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| DfdsError::NotFound(format!("{}: {}", url, e)))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| DfdsError::NotFound(format!("{}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(DfdsError::NotFound(format!(
            "{}: HTTP {}",
            url,
            response.status()
        )));
    }
    response
        .text()
        .map_err(|e| DfdsError::NotFound(format!("{}: {}", url, e)))
}
