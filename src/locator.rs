use super::*;

use percent_encoding::percent_decode_str;

/// Archive container access, supplied by the host. A zip reader in practice.
pub trait ArchiveReader {
    fn entry(&self, path: &str) -> Option<Vec<u8>>;
    fn paths(&self) -> Vec<String>;
}

/// Extension-to-MIME lookup, supplied by the host.
pub trait MimeLookup {
    fn mime_for_extension(&self, extension: &str) -> String;
}

/// A playable local resource: the archived bytes plus the stable local URL
/// rewritten content points at.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub path: String,
    pub local_url: String,
    pub mime: String,
    pub bytes: Rc<Vec<u8>>,
}

/// Immutable path-to-resource map built once per loaded archive.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap {
    entries: HashMap<String, ResourceHandle>,
}

impl ResourceMap {
    /// Loads every file entry of the archive. Directory entries and entries
    /// that fail to read are skipped; read failures are logged, not fatal.
    pub fn build(reader: &dyn ArchiveReader, mime: &dyn MimeLookup) -> Self {
        let mut entries = HashMap::new();
        let mut next_id = 1usize;
        for path in reader.paths() {
            if path.ends_with('/') {
                continue;
            }
            let Some(bytes) = reader.entry(&path) else {
                let err = Error::ArchiveRead {
                    path: path.clone(),
                    reason: "listed but unreadable".to_string(),
                };
                tracing::warn!(error = %err, "skipping archive entry");
                continue;
            };
            let handle = ResourceHandle {
                path: path.clone(),
                local_url: format!("local:{next_id}"),
                mime: mime.mime_for_extension(url_extension(&path)),
                bytes: Rc::new(bytes),
            };
            next_id += 1;
            entries.insert(path, handle);
        }
        Self { entries }
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut entries = HashMap::new();
        for (index, (path, body)) in pairs.iter().enumerate() {
            entries.insert(
                path.to_string(),
                ResourceHandle {
                    path: path.to_string(),
                    local_url: format!("local:{}", index + 1),
                    mime: "application/octet-stream".to_string(),
                    bytes: Rc::new(body.as_bytes().to_vec()),
                },
            );
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup ladder: exact path, `.html` suffix, `.json` suffix, then the
    /// URI-decoded variants of all three. First hit wins; a miss is `None`,
    /// never an error. The leading slash is stripped before lookup.
    pub fn locate(&self, path: &str) -> Option<&ResourceHandle> {
        let path = path.trim_start_matches('/');
        if let Some(handle) = self.locate_exact(path) {
            return Some(handle);
        }
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        if decoded != path {
            return self.locate_exact(&decoded);
        }
        None
    }

    fn locate_exact(&self, path: &str) -> Option<&ResourceHandle> {
        self.entries
            .get(path)
            .or_else(|| self.entries.get(&format!("{path}.html")))
            .or_else(|| self.entries.get(&format!("{path}.json")))
    }

    /// Like `locate`, for directory-style references where trailing slashes
    /// are not meaningful.
    pub fn locate_reference(&self, path: &str) -> Option<&ResourceHandle> {
        self.locate(path.trim_end_matches('/'))
    }
}

/// Extension segment of a path or URL, ignoring query and fragment.
pub(crate) fn url_extension(path: &str) -> &str {
    let stem = path
        .split(['#', '?'])
        .next()
        .unwrap_or(path);
    stem.rsplit('.').next().unwrap_or("").trim()
}
