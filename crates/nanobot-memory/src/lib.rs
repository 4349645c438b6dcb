//! `nanobot-memory` — file-backed agent memory.
//!
//! Daily notes live in `memory/YYYY-MM-DD.md`; durable knowledge lives in a
//! single `memory/MEMORY.md`. Retrieval is hybrid lexical: BM25 over
//! `#`-heading chunks plus a char-trigram jaccard term that keeps paraphrased
//! queries from scoring zero.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Local;
use regex::Regex;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const TRIGRAM_WEIGHT: f64 = 0.6;
const TRIGRAM_DOC_CAP: usize = 2000;

const STOP_EN: &[&str] = &[
    "the", "is", "at", "which", "on", "a", "an", "and", "or", "but", "to", "for", "in", "with",
    "that", "this", "from", "are", "was", "were", "be", "as", "by", "it", "of",
];
const STOP_ZH: &[&str] = &[
    "这个", "那个", "我们", "你们", "他们", "以及", "然后", "就是", "可以", "需要", "一下", "一个",
];

pub struct MemoryStore {
    memory_dir: PathBuf,
    memory_file: PathBuf,
    en_token: Regex,
    cjk_run: Regex,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        let memory_dir = nanobot_core::paths::memory_dir(workspace);
        let memory_file = memory_dir.join("MEMORY.md");
        Self {
            memory_dir,
            memory_file,
            en_token: Regex::new(r"[a-z0-9_+-]{2,}").expect("static regex"),
            cjk_run: Regex::new(r"[\u{4e00}-\u{9fff}]{2,}").expect("static regex"),
        }
    }

    pub fn today_file(&self) -> PathBuf {
        let date = Local::now().format("%Y-%m-%d");
        self.memory_dir.join(format!("{date}.md"))
    }

    pub fn read_today(&self) -> String {
        std::fs::read_to_string(self.today_file()).unwrap_or_default()
    }

    /// Append to today's note, adding the date header for a new day.
    pub fn append_today(&self, content: &str) -> std::io::Result<()> {
        let path = self.today_file();
        let body = if path.exists() {
            let existing = std::fs::read_to_string(&path)?;
            format!("{existing}\n{content}")
        } else {
            let date = Local::now().format("%Y-%m-%d");
            format!("# {date}\n\n{content}")
        };
        std::fs::write(path, body)
    }

    /// Read `MEMORY.md`, optionally truncated to `limit` characters.
    pub fn read_long_term(&self, limit: Option<usize>) -> String {
        let text = std::fs::read_to_string(&self.memory_file).unwrap_or_default();
        match limit {
            Some(cap) if text.chars().count() > cap => text.chars().take(cap).collect(),
            _ => text,
        }
    }

    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        std::fs::write(&self.memory_file, content)
    }

    /// Combined notes from the last `days` daily files, newest first.
    pub fn recent_memories(&self, days: i64) -> String {
        let today = Local::now().date_naive();
        let mut parts = Vec::new();
        for i in 0..days {
            let date = today - chrono::Duration::days(i);
            let path = self.memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")));
            if let Ok(content) = std::fs::read_to_string(path) {
                parts.push(content);
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// Search `MEMORY.md` and return the top-k chunks with positive score.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<String> {
        let content = self.read_long_term(None);
        if content.is_empty() {
            return Vec::new();
        }
        let chunks = split_chunks(&content);
        if chunks.is_empty() {
            return Vec::new();
        }
        let query_tokens: HashSet<String> = self.tokenize(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let chunk_tokens: Vec<Vec<String>> = chunks.iter().map(|c| self.tokenize(c)).collect();
        let token_counts: Vec<HashMap<&str, usize>> = chunk_tokens
            .iter()
            .map(|toks| {
                let mut counts = HashMap::new();
                for t in toks {
                    *counts.entry(t.as_str()).or_insert(0) += 1;
                }
                counts
            })
            .collect();
        let doc_lens: Vec<f64> = token_counts
            .iter()
            .map(|c| c.values().sum::<usize>() as f64)
            .collect();
        let avg_len = doc_lens.iter().sum::<f64>() / doc_lens.len().max(1) as f64;

        let mut df: HashMap<&str, usize> = HashMap::new();
        for counts in &token_counts {
            for t in counts.keys() {
                *df.entry(t).or_insert(0) += 1;
            }
        }

        let n_docs = chunks.len() as f64;
        let mut scored: Vec<(f64, &String)> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut bm25 = 0.0;
            for t in &query_tokens {
                let f = *token_counts[i].get(t.as_str()).unwrap_or(&0) as f64;
                if f <= 0.0 {
                    continue;
                }
                let dft = *df.get(t.as_str()).unwrap_or(&0) as f64;
                let idf = (1.0 + (n_docs - dft + 0.5) / (dft + 0.5)).ln();
                let denom = f + BM25_K1 * (1.0 - BM25_B + BM25_B * (doc_lens[i] / avg_len.max(1.0)));
                bm25 += idf * (f * (BM25_K1 + 1.0)) / denom.max(1e-9);
            }
            let fuzzy = trigram_jaccard(query, chunk);
            let score = bm25 + TRIGRAM_WEIGHT * fuzzy;
            if score > 0.0 {
                scored.push((score, chunk));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(top_k).map(|(_, c)| c.clone()).collect()
    }

    /// Memory section for the system prompt: retrieved chunks when a query is
    /// given (with a teaser fallback), otherwise a long-term teaser, plus
    /// today's notes.
    pub fn memory_context(&self, query: Option<&str>) -> String {
        let mut parts = Vec::new();

        match query {
            Some(q) => {
                let hits = self.search(q, 3);
                if !hits.is_empty() {
                    parts.push(format!(
                        "## Relevant Memories (retrieved)\n{}",
                        hits.join("\n---\n")
                    ));
                } else {
                    let teaser = self.read_long_term(Some(1000));
                    if !teaser.is_empty() {
                        parts.push(format!("## Long-term Memory (summary)\n{teaser}"));
                    }
                }
            }
            None => {
                let teaser = self.read_long_term(Some(2000));
                if !teaser.is_empty() {
                    parts.push(format!("## Long-term Memory\n{teaser}"));
                }
            }
        }

        let today = self.read_today();
        if !today.is_empty() {
            parts.push(format!("## Today's Notes\n{today}"));
        }
        parts.join("\n\n")
    }

    /// Lowercased EN tokens plus CJK runs and their bigrams, stopwords dropped.
    fn tokenize(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut tokens: Vec<String> = self
            .en_token
            .find_iter(&lower)
            .map(|m| m.as_str().to_string())
            .collect();
        for run in self.cjk_run.find_iter(&lower) {
            let chars: Vec<char> = run.as_str().chars().collect();
            tokens.push(run.as_str().to_string());
            if chars.len() > 2 {
                for window in chars.windows(2) {
                    tokens.push(window.iter().collect());
                }
            }
        }
        tokens
            .into_iter()
            .filter(|t| !STOP_EN.contains(&t.as_str()) && !STOP_ZH.contains(&t.as_str()))
            .collect()
    }
}

/// Split on `#` headings; each chunk starts with its heading line.
fn split_chunks(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.lines() {
        if line.starts_with('#') && !current.is_empty() {
            chunks.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    chunks
}

/// Char-trigram jaccard between the query and the doc head.
fn trigram_jaccard(query: &str, doc: &str) -> f64 {
    fn grams(s: &str, cap: Option<usize>) -> HashSet<String> {
        let stripped: String = s
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let chars: Vec<char> = match cap {
            Some(n) => stripped.chars().take(n).collect(),
            None => stripped.chars().collect(),
        };
        if chars.is_empty() {
            return HashSet::new();
        }
        if chars.len() < 3 {
            return HashSet::from([chars.iter().collect()]);
        }
        chars.windows(3).map(|w| w.iter().collect()).collect()
    }

    let gq = grams(query, None);
    let gd = grams(doc, Some(TRIGRAM_DOC_CAP));
    if gq.is_empty() || gd.is_empty() {
        return 0.0;
    }
    let inter = gq.intersection(&gd).count() as f64;
    let union = gq.union(&gd).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(content: &str) -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.write_long_term(content).unwrap();
        (dir, store)
    }

    #[test]
    fn chunks_split_on_headings() {
        let chunks = split_chunks("# A\none\n# B\ntwo\nthree");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# A"));
        assert!(chunks[1].contains("three"));
    }

    #[test]
    fn search_ranks_matching_chunk_first() {
        let (_dir, store) = store_with(
            "# 服务器配置\n生产服务器 IP 是 10.0.0.8，ssh 端口 2222。\n\n# 宠物\n猫叫咪咪。\n",
        );
        let hits = store.search("服务器 ssh 端口", 3);
        assert!(!hits.is_empty());
        assert!(hits[0].contains("2222"));
    }

    #[test]
    fn search_handles_english_queries() {
        let (_dir, store) = store_with("# deploy notes\nuse rsync to deploy the blog\n# misc\nnothing\n");
        let hits = store.search("how do we deploy", 2);
        assert!(!hits.is_empty());
        assert!(hits[0].contains("rsync"));
    }

    #[test]
    fn no_positive_score_means_no_hits() {
        let (_dir, store) = store_with("# notes\nalpha beta gamma\n");
        let hits = store.search("запрос", 3);
        assert!(hits.is_empty());
    }

    #[test]
    fn memory_context_prefers_retrieved_chunks() {
        let (_dir, store) = store_with("# keys\napi key lives in vault\n");
        let ctx = store.memory_context(Some("where is the api key"));
        assert!(ctx.contains("Relevant Memories"));
        assert!(ctx.contains("vault"));
    }

    #[test]
    fn long_term_limit_counts_characters_not_bytes() {
        let (_dir, store) = store_with(&"记".repeat(100));
        let teaser = store.read_long_term(Some(40));
        assert_eq!(teaser.chars().count(), 40);

        // Under the cap, the content comes back whole.
        let all = store.read_long_term(Some(1000));
        assert_eq!(all.chars().count(), 100);
    }

    #[test]
    fn append_today_adds_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append_today("first line").unwrap();
        store.append_today("second line").unwrap();
        let text = store.read_today();
        assert_eq!(text.matches("# 2").count(), 1);
        assert!(text.contains("first line"));
        assert!(text.contains("second line"));
    }
}
