use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{DfdsError, Result};
use crate::readers::create_reader;
use crate::table::Table;
use crate::types::{Attrs, Collection};

/// Physical container type named by a collection pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    H5,
    Parquet,
    Csv,
}

impl Protocol {
    pub fn parse(proto: &str) -> Result<Self> {
        match proto {
            "h5" => Ok(Protocol::H5),
            "parquet" => Ok(Protocol::Parquet),
            "csv" => Ok(Protocol::Csv),
            other => Err(DfdsError::UnsupportedFormat(format!(
                "unsupported protocol: {}",
                other
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Protocol::H5 => "h5",
            Protocol::Parquet => "parquet",
            Protocol::Csv => "csv",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A record-key template such as `{subject}_{task}`
///
/// Placeholders match lazily, so adjacent placeholders split as early as
/// possible.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    names: Vec<String>,
    regex: Regex,
}

impl Template {
    pub fn new(raw: &str) -> Result<Self> {
        let placeholder = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .map_err(|e| DfdsError::Parse(e.to_string()))?;
        let mut names = Vec::new();
        let mut pattern = String::from("^");
        let mut last = 0;
        for caps in placeholder.captures_iter(raw) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            pattern.push_str(&regex::escape(&raw[last..whole.start()]));
            if names.iter().any(|n| n == name.as_str()) {
                // repeated placeholders must match the same text
                pattern.push_str(".+?");
            } else {
                pattern.push_str(&format!("(?P<{}>.+?)", name.as_str()));
                names.push(name.as_str().to_string());
            }
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&raw[last..]));
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| DfdsError::Parse(format!("invalid template '{}': {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            names,
            regex,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Extract placeholder values from a record key.
    pub fn parse(&self, key: &str) -> Option<Attrs> {
        let caps = self.regex.captures(key)?;
        Some(
            self.names
                .iter()
                .filter_map(|n| caps.name(n).map(|m| (n.clone(), m.as_str().to_string())))
                .collect(),
        )
    }

    /// Substitute placeholders with values from `attrs`.
    pub fn format(&self, attrs: &Attrs) -> Result<String> {
        let mut out = self.raw.clone();
        for name in &self.names {
            let value = attrs.get(name).ok_or_else(|| {
                DfdsError::NotFound(format!("attribute '{}' required by '{}'", name, self.raw))
            })?;
            out = out.replace(&format!("{{{}}}", name), value);
        }
        Ok(out)
    }
}

/// Lists and reads the records of a recorded collection.
pub struct DataLoader {
    collection: String,
    protocol: Protocol,
    template: Template,
    root: PathBuf,
}

impl DataLoader {
    pub fn new(collection: &Collection, config: &Config) -> Result<Self> {
        let (proto, template) = collection.pattern.split_once("://").ok_or_else(|| {
            DfdsError::Parse(format!("invalid collection pattern: {}", collection.pattern))
        })?;
        Ok(Self {
            collection: collection.name.clone(),
            protocol: Protocol::parse(proto)?,
            template: Template::new(template)?,
            root: config.data_dir.join(&collection.name),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn h5_path(&self) -> PathBuf {
        self.root.join("data.h5")
    }

    /// Attributes of every record present on disk.
    pub fn ls(&self) -> Result<Vec<Attrs>> {
        let mut available = Vec::new();
        match self.protocol {
            Protocol::H5 => {
                let path = self.h5_path();
                if !path.is_file() {
                    return Err(DfdsError::NotFound(path.display().to_string()));
                }
                for (key, attrs) in create_reader(&path)?.lsinfo()? {
                    if let Some(parsed) = self.template.parse(&key) {
                        let mut attrs = attrs;
                        attrs.extend(parsed);
                        available.push(attrs);
                    }
                }
            }
            Protocol::Parquet | Protocol::Csv => {
                let pattern = self
                    .root
                    .join(format!("*.{}", self.protocol.extension()))
                    .to_string_lossy()
                    .into_owned();
                let entries =
                    glob::glob(&pattern).map_err(|e| DfdsError::Parse(e.to_string()))?;
                let mut stems: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .collect();
                stems.sort();
                for stem in stems {
                    if let Some(parsed) = self.template.parse(&stem) {
                        available.push(parsed);
                    }
                }
            }
        }

        for attrs in &mut available {
            attrs.insert("collection".to_string(), self.collection.clone());
        }
        Ok(available)
    }

    /// Read the record addressed by `attributes`.
    pub fn read(&self, attributes: &Attrs) -> Result<(Attrs, Table)> {
        let template_attrs: Attrs = attributes
            .iter()
            .filter(|(k, _)| self.template.names().contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rec_path = self.template.format(&template_attrs)?;

        let path = match self.protocol {
            Protocol::H5 => self.h5_path(),
            Protocol::Parquet | Protocol::Csv => self
                .root
                .join(format!("{}.{}", rec_path, self.protocol.extension())),
        };
        if !path.is_file() {
            return Err(DfdsError::NotFound(path.display().to_string()));
        }

        tracing::debug!("reading record {} from {}", rec_path, path.display());
        let (mut meta, data) = create_reader(&path)?.read(&rec_path)?;
        meta.insert("collection".to_string(), self.collection.clone());
        meta.extend(template_attrs);
        Ok((meta, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parse_and_format() {
        let t = Template::new("{subject}_{task}-run").unwrap();
        assert_eq!(t.names(), &["subject".to_string(), "task".to_string()]);

        let attrs = t.parse("012_reading-run").unwrap();
        assert_eq!(attrs["subject"], "012");
        assert_eq!(attrs["task"], "reading");
        assert!(t.parse("012_reading").is_none());

        assert_eq!(t.format(&attrs).unwrap(), "012_reading-run");
        assert!(t.format(&Attrs::new()).is_err());
    }

    #[test]
    fn test_template_escapes_literals() {
        let t = Template::new("rec.{id}").unwrap();
        assert!(t.parse("recX1").is_none());
        assert_eq!(t.parse("rec.1").unwrap()["id"], "1");
    }

    #[test]
    fn test_protocols() {
        assert_eq!(Protocol::parse("csv").unwrap(), Protocol::Csv);
        assert!(Protocol::parse("xls").is_err());
    }
}
