use std::path::PathBuf;

/// Storage layout of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPaths {
    recipient: String,
    session_id: String,
}

impl FlowPaths {
    pub fn new(recipient: &str, session_id: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn collection_dir(&self) -> PathBuf {
        PathBuf::from("clients")
            .join(sanitize_component(&self.recipient))
            .join("collections")
            .join(sanitize_component(&self.session_id))
    }

    pub fn context(&self) -> PathBuf {
        self.collection_dir().join("context.json")
    }

    pub fn log(&self) -> PathBuf {
        self.collection_dir().join("logs.jsonl")
    }

    pub fn uploads(&self) -> PathBuf {
        self.collection_dir().join("uploads")
    }

    /// `Artifact/Source` names nest one directory per segment. Distinct
    /// names always map to distinct files.
    pub fn result_set(&self, name: &str) -> PathBuf {
        let mut path = PathBuf::from("clients")
            .join(sanitize_component(&self.recipient))
            .join("artifacts");
        for segment in name.split('/') {
            path.push(sanitize_component(segment));
        }
        path.join(format!("{}.jsonl", sanitize_component(&self.session_id)))
    }

    pub fn upload(&self, name: &str) -> PathBuf {
        let mut path = self.uploads();
        for segment in name.split(['/', '\\']).filter(|s| !s.is_empty()) {
            path.push(sanitize_component(segment));
        }
        path
    }
}

pub fn queue_dir(recipient: &str) -> PathBuf {
    PathBuf::from("queues").join(sanitize_component(recipient))
}

pub fn queue_entry(recipient: &str, task_id: u64) -> PathBuf {
    queue_dir(recipient).join(format!("{:020}.json", task_id))
}

/// Encode a single path component so it is safe to store on disk.
///
/// The encoding is reversible: bytes outside `[A-Za-z0-9.- ]` become `%XX`,
/// and the empty string becomes `_` (a literal `_` is always escaped).
pub fn sanitize_component(raw: &str) -> String {
    use std::fmt::Write as _;

    match raw {
        "" => return "_".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }

    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b' ') {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{:02X}", byte);
        }
    }
    encoded
}
