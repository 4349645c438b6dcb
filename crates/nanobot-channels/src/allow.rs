//! Sender allowlisting shared by all channel adapters.

/// An empty list allows everyone; otherwise only exact sender-id matches
/// (or the `"*"` wildcard entry) pass.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }

    pub fn is_allowed(&self, sender_id: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries
            .iter()
            .any(|e| e == "*" || e == sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everyone() {
        assert!(AllowList::default().is_allowed("anyone"));
    }

    #[test]
    fn nonempty_list_is_exact_match() {
        let allow = AllowList::new(vec!["12345".to_string()]);
        assert!(allow.is_allowed("12345"));
        assert!(!allow.is_allowed("99999"));
    }

    #[test]
    fn wildcard_opens_the_gate() {
        let allow = AllowList::new(vec!["*".to_string()]);
        assert!(allow.is_allowed("anyone"));
    }
}
