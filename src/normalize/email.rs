use std::collections::HashSet;

/// An address split at its last `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRecord {
    pub email: String,
    pub local_part: String,
    pub domain: String,
}

impl EmailRecord {
    /// Lowercases and trims; `None` unless both sides of the `@` are non-empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let email = raw.trim().to_lowercase();
        let (local, domain) = email.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self {
            local_part: local.to_string(),
            domain: domain.to_string(),
            email,
        })
    }
}

/// Drops repeated addresses, first seen wins.
pub fn dedupe_by_email(records: Vec<EmailRecord>) -> Vec<EmailRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.email.clone()))
        .collect()
}
