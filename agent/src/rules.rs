//! # Rule Table
//!
//! Static mapping routing key → backend URL, loaded once at startup from
//! a TOML rules file and never mutated at runtime (§3).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::AgentError;

#[derive(Debug, Clone, Deserialize)]
pub struct Rules {
    #[serde(flatten)]
    pub routes: HashMap<String, String>,
}

impl Rules {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Rules(format!("reading {}: {}", path.display(), e)))?;
        let rules: Rules = toml::from_str(&text)
            .map_err(|e| AgentError::Rules(format!("parsing {}: {}", path.display(), e)))?;
        Ok(rules)
    }

    pub fn keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn backend_for(&self, key: &str) -> Option<&str> {
        self.routes.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_flat_key_to_url_table() {
        let mut file = tempfile_with(b"\"/hello\" = \"http://127.0.0.1:9000\"\n\"/x\" = \"http://127.0.0.1:9001/base\"\n");
        let rules = Rules::load(file.path()).unwrap();
        assert_eq!(rules.backend_for("/hello"), Some("http://127.0.0.1:9000"));
        assert_eq!(rules.backend_for("/x"), Some("http://127.0.0.1:9001/base"));
        assert_eq!(rules.backend_for("/missing"), None);
        file.flush().ok();
    }

    fn tempfile_with(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f
    }
}
