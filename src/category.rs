use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::env;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Weighting between direct keyword hits and fuzzy display-name similarity.
const KEYWORD_WEIGHT: f64 = 0.55;
const FUZZY_WEIGHT: f64 = 0.45;

pub static MIN_CATEGORY_SCORE: Lazy<f64> = Lazy::new(|| {
    env::var("MIN_CATEGORY_SCORE")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| (0.0..=1.0).contains(v))
        .unwrap_or(0.35)
});

pub static CATEGORY_LIMIT: Lazy<usize> = Lazy::new(|| {
    env::var("CATEGORY_LIMIT")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(5)
});

const EMBEDDED_TAXONOMY: &str = include_str!("../data/categories.json");

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryDefinition {
    pub id: String,
    pub display_path: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl CategoryDefinition {
    /// Depth in the category tree, from the `>`-separated display path.
    pub fn depth(&self) -> usize {
        self.display_path.split('>').count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryCandidate {
    pub category_id: String,
    pub display_path: String,
    pub score: f64,
}

/// Process-wide category taxonomy. Loaded once at construction, replaced
/// only through an explicit `reload`.
pub struct CategoryIndex {
    categories: RwLock<Arc<Vec<CategoryDefinition>>>,
}

impl CategoryIndex {
    pub fn load() -> Self {
        let categories = load_definitions();
        info!(
            target = "magpie.category",
            count = categories.len(),
            "taxonomy loaded"
        );
        Self {
            categories: RwLock::new(Arc::new(categories)),
        }
    }

    pub fn from_definitions(definitions: Vec<CategoryDefinition>) -> Self {
        Self {
            categories: RwLock::new(Arc::new(definitions)),
        }
    }

    pub fn reload(&self) -> usize {
        let fresh = load_definitions();
        let count = fresh.len();
        if let Ok(mut guard) = self.categories.write() {
            *guard = Arc::new(fresh);
        }
        info!(target = "magpie.category", count, "taxonomy reloaded");
        count
    }

    fn snapshot(&self) -> Arc<Vec<CategoryDefinition>> {
        self.categories
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Rank the taxonomy against the supplied text fields. Never errors;
    /// returns an empty list when nothing clears the relevance floor.
    pub fn rank(
        &self,
        hint_text: Option<&str>,
        extracted_text: Option<&str>,
        filename: Option<&str>,
    ) -> Vec<CategoryCandidate> {
        let blob = [hint_text, extracted_text, filename]
            .iter()
            .flatten()
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let blob = blob.trim().to_string();
        if blob.is_empty() {
            return Vec::new();
        }
        let blob_tokens: Vec<&str> = blob
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let categories = self.snapshot();
        let mut scored: Vec<(CategoryCandidate, usize)> = Vec::new();
        for category in categories.iter() {
            let keyword_hit = category
                .keywords
                .iter()
                .any(|kw| !kw.is_empty() && blob.contains(&kw.to_lowercase()));
            let fuzzy = name_similarity(&blob_tokens, &category.display_path);
            let score = (KEYWORD_WEIGHT * if keyword_hit { 1.0 } else { 0.0 }
                + FUZZY_WEIGHT * fuzzy)
                .clamp(0.0, 1.0);
            if score < *MIN_CATEGORY_SCORE {
                continue;
            }
            scored.push((
                CategoryCandidate {
                    category_id: category.id.clone(),
                    display_path: category.display_path.clone(),
                    score,
                },
                category.depth(),
            ));
        }

        scored.sort_by(|(a, depth_a), (b, depth_b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| depth_a.cmp(depth_b))
                .then_with(|| a.category_id.cmp(&b.category_id))
        });

        scored
            .into_iter()
            .take(*CATEGORY_LIMIT)
            .map(|(candidate, _)| candidate)
            .collect()
    }
}

/// Best fuzzy similarity between any input token and any display-name token.
fn name_similarity(blob_tokens: &[&str], display_path: &str) -> f64 {
    let name_tokens: Vec<String> = display_path
        .to_lowercase()
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();
    let mut best = 0.0f64;
    for token in blob_tokens {
        for name in &name_tokens {
            let score = strsim::jaro_winkler(token, name);
            if score > best {
                best = score;
            }
        }
    }
    best
}

fn load_definitions() -> Vec<CategoryDefinition> {
    let raw = match env::var("CATEGORY_DATA_PATH") {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(
                    target = "magpie.category",
                    path = %path,
                    error = %err,
                    "taxonomy file unreadable, using embedded data"
                );
                EMBEDDED_TAXONOMY.to_string()
            }
        },
        Err(_) => EMBEDDED_TAXONOMY.to_string(),
    };
    match serde_json::from_str::<Vec<CategoryDefinition>>(&raw) {
        Ok(definitions) => definitions,
        Err(err) => {
            warn!(
                target = "magpie.category",
                error = %err,
                "taxonomy parse failed, ranking disabled"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, path: &str, keywords: &[&str]) -> CategoryDefinition {
        CategoryDefinition {
            id: id.to_string(),
            display_path: path.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn sample_index() -> CategoryIndex {
        CategoryIndex::from_definitions(vec![
            def("1904", "Men > Tops > Hoodies", &["hoodie", "sweatshirt"]),
            def("2050", "Men > Trousers > Jeans", &["jeans", "denim"]),
            def("1100", "Women > Dresses", &["dress", "gown"]),
            def("3310", "Kids > Shoes > Trainers", &["trainers", "sneakers"]),
        ])
    }

    #[test]
    fn keyword_hit_ranks_first() {
        let index = sample_index();
        let ranked = index.rank(None, Some("nike hoodie size l"), None);
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].category_id, "1904");
        assert!(ranked[0].score > 0.5);
        assert!(ranked[0].score <= 1.0);
    }

    #[test]
    fn scores_descend_and_stay_normalised() {
        let index = sample_index();
        let ranked = index.rank(Some("blue denim jeans"), None, Some("levis-jeans.jpg"));
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        for candidate in &ranked {
            assert!((0.0..=1.0).contains(&candidate.score));
        }
        assert_eq!(ranked[0].category_id, "2050");
    }

    #[test]
    fn empty_input_gives_empty_list() {
        let index = sample_index();
        assert!(index.rank(None, None, None).is_empty());
        assert!(index.rank(Some("   "), Some(""), None).is_empty());
    }

    #[test]
    fn nothing_above_floor_gives_empty_list() {
        let index = sample_index();
        let ranked = index.rank(Some("xqzzv"), None, None);
        assert!(ranked.is_empty());
    }

    #[test]
    fn ties_break_on_depth_then_id() {
        let index = CategoryIndex::from_definitions(vec![
            def("9003", "Men > Tops > Hoodies", &["hoodie"]),
            def("9001", "Men > Hoodies", &["hoodie"]),
            def("9002", "Men > Tops > Hoodies", &["hoodie"]),
        ]);
        let ranked = index.rank(None, Some("hoodie"), None);
        // All three score identically; the shallower path wins, then the
        // lexicographically smaller id.
        assert_eq!(ranked[0].category_id, "9001");
        assert_eq!(ranked[1].category_id, "9002");
        assert_eq!(ranked[2].category_id, "9003");
    }

    #[test]
    fn respects_result_limit() {
        let definitions: Vec<CategoryDefinition> = (0..12)
            .map(|i| def(&format!("7{i:03}"), &format!("Men > Item{i}"), &["shirt"]))
            .collect();
        let index = CategoryIndex::from_definitions(definitions);
        let ranked = index.rank(None, Some("shirt"), None);
        assert_eq!(ranked.len(), *CATEGORY_LIMIT);
    }
}
