use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::models::{AttributeGuess, AttributeSource, Hints};
use crate::ocr::TextRecognizer;
use crate::photo::Photo;

const OCR_MAX_ATTEMPTS: u32 = 3;
const OCR_RETRY_DELAY_MS: u64 = 200;

/// Minimum fuzzy similarity (normalized Levenshtein) for a brand token hit.
const BRAND_MIN_SIMILARITY: f64 = 0.80;

/// Canonical brand names alongside the lowercase form used for matching.
const KNOWN_BRANDS: &[(&str, &str)] = &[
    ("Nike", "nike"),
    ("Adidas", "adidas"),
    ("Zara", "zara"),
    ("H&M", "h&m"),
    ("Next", "next"),
    ("Levi's", "levis"),
    ("Puma", "puma"),
    ("The North Face", "north face"),
    ("Uniqlo", "uniqlo"),
    ("Primark", "primark"),
    ("M&S", "m&s"),
    ("Hollister", "hollister"),
    ("Tommy Hilfiger", "tommy hilfiger"),
    ("Ralph Lauren", "ralph lauren"),
    ("Lacoste", "lacoste"),
    ("New Look", "new look"),
    ("ASOS", "asos"),
    ("River Island", "river island"),
    ("Gap", "gap"),
    ("Mango", "mango"),
];

const ITEM_TYPE_KEYWORDS: &[&str] = &[
    "hoodie", "dress", "jeans", "tshirt", "tee", "shirt", "jacket", "coat", "jumper", "skirt",
    "shorts", "leggings", "trainers", "shoes", "boots",
];

const LETTER_SIZES: &[&str] = &["XXS", "XS", "S", "M", "L", "XL", "XXL"];

/// Attribute names used as keys in the resolved map.
pub const ATTR_BRAND: &str = "brand";
pub const ATTR_SIZE: &str = "size";
pub const ATTR_COLOUR: &str = "colour";
pub const ATTR_ITEM_TYPE: &str = "item_type";

#[derive(Debug, Clone)]
struct Candidate {
    attribute: &'static str,
    value: String,
    confidence: f32,
    source: AttributeSource,
    photo_index: usize,
}

pub struct Extractor {
    recognizer: Arc<dyn TextRecognizer>,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub attributes: BTreeMap<String, AttributeGuess>,
    /// Best recognized text across photos, kept for category ranking.
    pub recognized_text: String,
}

impl Extractor {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }

    /// Derive brand/size/colour/item_type from the accepted photos plus any
    /// caller hints. Deterministic for identical pixels and hints; the only
    /// I/O is text recognition, which degrades to empty text on failure.
    pub async fn extract(&self, photos: &[Photo], hints: &Hints) -> Extraction {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut best_text = String::new();
        let mut best_text_score = 0usize;

        for (index, photo) in photos.iter().enumerate() {
            let text = self.read_text_with_retry(photo).await;
            let alnum = text.chars().filter(|ch| ch.is_alphanumeric()).count();
            if alnum > best_text_score {
                best_text_score = alnum;
                best_text = text.clone();
            }

            if !text.trim().is_empty() {
                collect_text_candidates(
                    &mut candidates,
                    &text,
                    AttributeSource::RecognizedText,
                    index,
                );
            } else {
                // Nothing usable on the garment label; fall back to the
                // listing-slug tokens in the filename.
                let slug = slug_to_text(&photo.filename);
                collect_text_candidates(&mut candidates, &slug, AttributeSource::SlugMatch, index);
            }

            if let Some(item) = item_type_from_name(&photo.filename) {
                candidates.push(Candidate {
                    attribute: ATTR_ITEM_TYPE,
                    value: item.to_string(),
                    confidence: 0.6,
                    source: AttributeSource::SlugMatch,
                    photo_index: index,
                });
            }
        }

        // Colour comes from the cover photo only. It is derived from pixels,
        // not read off a label, so it carries the lowest-precedence source
        // and any explicit caller hint wins over it.
        if let Some(cover) = photos.first() {
            candidates.push(Candidate {
                attribute: ATTR_COLOUR,
                value: dominant_colour(cover).to_string(),
                confidence: 0.6,
                source: AttributeSource::Default,
                photo_index: 0,
            });
        }

        collect_hint_candidates(&mut candidates, hints);

        Extraction {
            attributes: resolve(candidates),
            recognized_text: best_text,
        }
    }

    async fn read_text_with_retry(&self, photo: &Photo) -> String {
        let mut last_error = String::new();
        for attempt in 1..=OCR_MAX_ATTEMPTS {
            match self.recognizer.read_text(photo).await {
                Ok(text) => return text,
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        target = "magpie.extract",
                        photo = %photo.filename,
                        attempt,
                        error = %last_error,
                        "ocr attempt failed"
                    );
                    if attempt < OCR_MAX_ATTEMPTS {
                        sleep(Duration::from_millis(OCR_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        warn!(
            target = "magpie.extract",
            photo = %photo.filename,
            error = %last_error,
            "ocr unrecoverable, degrading to empty text"
        );
        String::new()
    }
}

fn collect_text_candidates(
    candidates: &mut Vec<Candidate>,
    text: &str,
    source: AttributeSource,
    photo_index: usize,
) {
    if let Some((brand, score)) = match_brand(text) {
        candidates.push(Candidate {
            attribute: ATTR_BRAND,
            value: brand.to_string(),
            confidence: score as f32,
            source,
            photo_index,
        });
    }
    if let Some(size) = match_size(text) {
        candidates.push(Candidate {
            attribute: ATTR_SIZE,
            value: size,
            confidence: 0.8,
            source,
            photo_index,
        });
    }
    if let Some(item) = item_type_from_name(text) {
        candidates.push(Candidate {
            attribute: ATTR_ITEM_TYPE,
            value: item.to_string(),
            confidence: 0.6,
            source,
            photo_index,
        });
    }
}

fn collect_hint_candidates(candidates: &mut Vec<Candidate>, hints: &Hints) {
    let pairs = [
        (ATTR_BRAND, hints.brand.as_deref()),
        (ATTR_SIZE, hints.size.as_deref()),
        (ATTR_COLOUR, hints.colour.as_deref()),
    ];
    for (attribute, value) in pairs {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            candidates.push(Candidate {
                attribute,
                value: value.to_string(),
                confidence: 0.5,
                source: AttributeSource::CallerHint,
                photo_index: usize::MAX,
            });
        }
    }
}

/// Resolve transient candidates to one guess per attribute. Precedence is by
/// source first (recognized text beats slug beats hint), then confidence;
/// remaining ties go to the cover photo.
fn resolve(candidates: Vec<Candidate>) -> BTreeMap<String, AttributeGuess> {
    let mut resolved: BTreeMap<String, (Candidate, AttributeGuess)> = BTreeMap::new();
    for candidate in candidates {
        let replace = match resolved.get(candidate.attribute) {
            None => true,
            Some((current, _)) => {
                let (cr, nr) = (current.source.rank(), candidate.source.rank());
                nr > cr
                    || (nr == cr && candidate.confidence > current.confidence)
                    || (nr == cr
                        && candidate.confidence == current.confidence
                        && candidate.photo_index < current.photo_index)
            }
        };
        if replace {
            let guess = AttributeGuess {
                value: candidate.value.clone(),
                confidence: candidate.confidence,
                source: candidate.source,
            };
            resolved.insert(candidate.attribute.to_string(), (candidate, guess));
        }
    }
    resolved
        .into_iter()
        .map(|(key, (_, guess))| (key, guess))
        .collect()
}

fn normalise(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|ch: char| !(ch.is_alphanumeric() || ch == '&' || ch == '-'))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

pub fn slug_to_text(filename: &str) -> String {
    let stem = filename.rsplit('/').next().unwrap_or(filename);
    let stem = stem.split('.').next().unwrap_or(stem);
    stem.replace(['-', '_'], " ")
}

/// Fuzzy brand match: exact containment scores 1.0, otherwise the best
/// per-token edit-distance similarity above the acceptance floor.
pub fn match_brand(text: &str) -> Option<(&'static str, f64)> {
    let normalised = normalise(text);
    if normalised.is_empty() {
        return None;
    }
    let toks = tokens(&normalised);

    let mut best: Option<(&'static str, f64)> = None;
    for (canonical, pattern) in KNOWN_BRANDS {
        let score = if pattern.contains(' ') {
            if normalised.contains(pattern) { 1.0 } else { 0.0 }
        } else if toks.iter().any(|t| t == pattern) {
            1.0
        } else {
            toks.iter()
                .map(|t| strsim::normalized_levenshtein(t, pattern))
                .fold(0.0, f64::max)
        };
        if score >= BRAND_MIN_SIMILARITY
            && best.map(|(_, current)| score > current).unwrap_or(true)
        {
            best = Some((canonical, score));
        }
    }
    best
}

/// Token patterns for garment sizes: letter sizes, waist/leg (`W32L30`),
/// UK shoe/dress sizes, child age ranges, bare two-digit numerics.
pub fn match_size(text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    let toks = tokens(&upper);

    for (i, token) in toks.iter().enumerate() {
        if LETTER_SIZES.contains(&token.as_str()) {
            return Some(token.clone());
        }
        if is_waist_leg(token) {
            return Some(token.clone());
        }
        if let Some(rest) = token.strip_prefix("UK") {
            if !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()) {
                return Some(format!("UK {rest}"));
            }
            if rest.is_empty()
                && let Some(next) = toks.get(i + 1)
                && next.chars().all(|ch| ch.is_ascii_digit())
                && !next.is_empty()
            {
                return Some(format!("UK {next}"));
            }
        }
        if is_age_range(token)
            && matches!(toks.get(i + 1).map(String::as_str), Some("YEARS") | Some("YRS"))
        {
            return Some(format!("{token} years"));
        }
    }

    // Bare two-digit token, weakest pattern, checked last.
    toks.iter()
        .find(|t| t.len() == 2 && t.chars().all(|ch| ch.is_ascii_digit()))
        .cloned()
}

fn is_waist_leg(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 6
        && bytes[0] == b'W'
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b'L'
        && bytes[4].is_ascii_digit()
        && bytes[5].is_ascii_digit()
}

fn is_age_range(token: &str) -> bool {
    let mut parts = token.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => {
            !a.is_empty()
                && !b.is_empty()
                && a.chars().all(|ch| ch.is_ascii_digit())
                && b.chars().all(|ch| ch.is_ascii_digit())
        }
        _ => false,
    }
}

pub fn item_type_from_name(name: &str) -> Option<&'static str> {
    let lowered = name.to_lowercase();
    ITEM_TYPE_KEYWORDS
        .iter()
        .find(|keyword| lowered.contains(*keyword))
        .copied()
}

const NAMED_COLOURS: &[(&str, (u8, u8, u8))] = &[
    ("Black", (20, 20, 20)),
    ("White", (240, 240, 240)),
    ("Grey", (128, 128, 128)),
    ("Red", (200, 40, 40)),
    ("Green", (40, 160, 60)),
    ("Blue", (40, 70, 190)),
    ("Yellow", (230, 210, 60)),
    ("Brown", (120, 80, 50)),
    ("Beige", (225, 210, 180)),
    ("Pink", (240, 150, 180)),
    ("Purple", (130, 60, 170)),
    ("Orange", (240, 140, 40)),
];

/// Histogram-style dominant colour: average the frame (with coarse sampling
/// on large photos) and snap to the nearest named colour.
pub fn dominant_colour(photo: &Photo) -> &'static str {
    if !photo.buffer_consistent() || photo.pixels.is_empty() {
        return "Unknown";
    }
    let total = (photo.width as u64 * photo.height as u64).max(1);
    let step = ((total / 4096).max(1)) as usize;

    let (mut r_sum, mut g_sum, mut b_sum, mut count) = (0u64, 0u64, 0u64, 0u64);
    let mut i = 0usize;
    while i + 2 < photo.pixels.len() {
        r_sum += photo.pixels[i] as u64;
        g_sum += photo.pixels[i + 1] as u64;
        b_sum += photo.pixels[i + 2] as u64;
        count += 1;
        i += 3 * step;
    }
    if count == 0 {
        return "Unknown";
    }
    let (r, g, b) = (
        (r_sum / count) as i32,
        (g_sum / count) as i32,
        (b_sum / count) as i32,
    );

    NAMED_COLOURS
        .iter()
        .min_by_key(|(_, (nr, ng, nb))| {
            let dr = r - *nr as i32;
            let dg = g - *ng as i32;
            let db = b - *nb as i32;
            dr * dr + dg * dg + db * db
        })
        .map(|(name, _)| *name)
        .unwrap_or("Unknown")
}

/// Compose a listing title from the resolved attributes, skipping whatever
/// is missing: "Nike Hoodie Blue Size L".
pub fn make_listing_title(
    brand: Option<&str>,
    item_type: Option<&str>,
    colour: Option<&str>,
    size: Option<&str>,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(brand) = brand {
        parts.push(brand.to_string());
    }
    let item = item_type.unwrap_or("clothing");
    let mut chars = item.chars();
    let capitalised = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    parts.push(capitalised);
    if let Some(colour) = colour {
        parts.push(colour.to_string());
    }
    if let Some(size) = size {
        parts.push(format!("Size {size}"));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{NullRecognizer, OcrError};
    use crate::photo::Photo;
    use crate::photo::testutil::{checkerboard, flat, named};
    use async_trait::async_trait;

    struct FixedText(String);

    #[async_trait]
    impl TextRecognizer for FixedText {
        async fn read_text(&self, _photo: &Photo) -> Result<String, OcrError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn brand_exact_token_hit() {
        let (brand, score) = match_brand("NIKE sportswear label").expect("brand");
        assert_eq!(brand, "Nike");
        assert!(score >= 0.99);
    }

    #[test]
    fn brand_fuzzy_hit_survives_typos() {
        let (brand, score) = match_brand("adidos originals").expect("brand");
        assert_eq!(brand, "Adidas");
        assert!(score >= 0.80 && score < 1.0);
    }

    #[test]
    fn brand_requires_acceptance_floor() {
        assert!(match_brand("plain unbranded garment").is_none());
    }

    #[test]
    fn multi_word_brand_needs_containment() {
        let (brand, _) = match_brand("the north face puffer").expect("brand");
        assert_eq!(brand, "The North Face");
    }

    #[test]
    fn size_patterns() {
        assert_eq!(match_size("label says L cotton"), Some("L".to_string()));
        assert_eq!(match_size("jeans W32L30 dark"), Some("W32L30".to_string()));
        assert_eq!(match_size("trainers UK 9"), Some("UK 9".to_string()));
        assert_eq!(match_size("kids 3-4 years top"), Some("3-4 years".to_string()));
        assert_eq!(match_size("waist 32 relaxed"), Some("32".to_string()));
        assert_eq!(match_size("no sizing here"), None);
    }

    #[test]
    fn slug_tokens_feed_the_same_matchers() {
        let slug = slug_to_text("nike-hoodie-l.jpg");
        assert_eq!(match_brand(&slug).map(|(b, _)| b), Some("Nike"));
        assert_eq!(match_size(&slug), Some("L".to_string()));
        assert_eq!(item_type_from_name(&slug), Some("hoodie"));
    }

    #[test]
    fn dominant_colour_snaps_to_named() {
        let blue = crate::photo::testutil::flat(64, 64, (40, 70, 190));
        assert_eq!(dominant_colour(&blue), "Blue");
        let black = crate::photo::testutil::flat(64, 64, (10, 12, 9));
        assert_eq!(dominant_colour(&black), "Black");
    }

    #[test]
    fn title_composition() {
        assert_eq!(
            make_listing_title(Some("Nike"), Some("hoodie"), Some("Blue"), Some("L")),
            "Nike Hoodie Blue Size L"
        );
        assert_eq!(make_listing_title(None, None, None, None), "Clothing");
    }

    #[tokio::test]
    async fn slug_match_beats_caller_hint() {
        // Recognized text is empty, so the filename slug resolves the brand
        // ahead of the caller hint carrying the same value.
        let extractor = Extractor::new(Arc::new(NullRecognizer));
        let photo = named(checkerboard(320, 320, (0, 0, 0), (255, 255, 255)), "nike-hoodie-l.jpg");
        let hints = Hints {
            brand: Some("Nike".into()),
            ..Hints::default()
        };
        let out = extractor.extract(&[photo], &hints).await;
        let brand = out.attributes.get(ATTR_BRAND).expect("brand");
        assert_eq!(brand.value, "Nike");
        assert_eq!(brand.source, AttributeSource::SlugMatch);
        let size = out.attributes.get(ATTR_SIZE).expect("size");
        assert_eq!(size.value, "L");
    }

    #[tokio::test]
    async fn recognized_text_beats_slug() {
        let extractor = Extractor::new(Arc::new(FixedText("ZARA label size M".into())));
        let photo = named(checkerboard(320, 320, (0, 0, 0), (255, 255, 255)), "nike-top.jpg");
        let out = extractor.extract(&[photo], &Hints::default()).await;
        let brand = out.attributes.get(ATTR_BRAND).expect("brand");
        assert_eq!(brand.value, "Zara");
        assert_eq!(brand.source, AttributeSource::RecognizedText);
        assert_eq!(out.recognized_text, "ZARA label size M");
    }

    #[tokio::test]
    async fn conflicting_guesses_tie_break_to_cover_photo() {
        // Both photos yield a full-confidence brand; the cover photo wins.
        let extractor = Extractor::new(Arc::new(NullRecognizer));
        let cover = named(checkerboard(320, 320, (0, 0, 0), (255, 255, 255)), "puma-tee.jpg");
        let second = named(checkerboard(320, 320, (0, 0, 0), (255, 255, 255)), "zara-tee.jpg");
        let out = extractor.extract(&[cover, second], &Hints::default()).await;
        assert_eq!(out.attributes.get(ATTR_BRAND).map(|g| g.value.as_str()), Some("Puma"));
    }

    #[tokio::test]
    async fn derived_colour_is_lowest_precedence() {
        // The cover-photo colour is pixel-derived, so it reports the lowest
        // source rank and an explicit caller hint replaces it.
        let extractor = Extractor::new(Arc::new(NullRecognizer));
        let photo = named(flat(64, 64, (40, 70, 190)), "photo-0001.jpg");
        let out = extractor.extract(&[photo], &Hints::default()).await;
        let colour = out.attributes.get(ATTR_COLOUR).expect("colour");
        assert_eq!(colour.value, "Blue");
        assert_eq!(colour.source, AttributeSource::Default);

        let photo = named(flat(64, 64, (40, 70, 190)), "photo-0001.jpg");
        let hints = Hints {
            colour: Some("Navy".into()),
            ..Hints::default()
        };
        let out = extractor.extract(&[photo], &hints).await;
        let colour = out.attributes.get(ATTR_COLOUR).expect("colour");
        assert_eq!(colour.value, "Navy");
        assert_eq!(colour.source, AttributeSource::CallerHint);
    }

    #[tokio::test]
    async fn hints_fill_gaps_without_overwriting() {
        let extractor = Extractor::new(Arc::new(NullRecognizer));
        let photo = named(checkerboard(320, 320, (0, 0, 0), (255, 255, 255)), "photo-0001.jpg");
        let hints = Hints {
            brand: Some("Lacoste".into()),
            size: Some("M".into()),
            ..Hints::default()
        };
        let out = extractor.extract(&[photo], &hints).await;
        let brand = out.attributes.get(ATTR_BRAND).expect("brand");
        assert_eq!(brand.value, "Lacoste");
        assert_eq!(brand.source, AttributeSource::CallerHint);
        assert_eq!(out.attributes.get(ATTR_SIZE).map(|g| g.value.as_str()), Some("M"));
    }
}
