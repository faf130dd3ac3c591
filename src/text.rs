//! Text normalization used wherever user input is compared semantically.
//!
//! Matching against the catalog, city synonyms, greetings and reset
//! keywords all go through [`normalize`] so that accents, case and stray
//! punctuation never break a comparison.

/// Normalize text for flexible matching.
///
/// - Lowercases.
/// - Folds Latin diacritics to their ASCII base letter.
/// - Replaces anything outside `[a-z0-9\s]` with a single space.
/// - Collapses repeated whitespace and trims.
///
/// The result is stable: `normalize(normalize(s)) == normalize(s)`.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;

    for ch in text.chars().flat_map(|c| c.to_lowercase()) {
        let folded = fold_diacritic(ch);
        let mapped = match folded {
            'a'..='z' | '0'..='9' => Some(folded),
            _ => None,
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_was_space = false;
            }
            None => {
                if !last_was_space {
                    out.push(' ');
                    last_was_space = true;
                }
            }
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Normalize a single token (word or short phrase).
///
/// Lighter than [`normalize`]: lowercases, folds diacritics and strips the
/// common trailing punctuation (`!`, `?`, `,`) without touching anything
/// else. Used for greeting and keyword checks where inner punctuation is
/// meaningful.
pub fn normalize_token(text: &str) -> String {
    text.trim()
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(fold_diacritic)
        .filter(|c| !matches!(c, '!' | '?' | ','))
        .collect()
}

/// Strip a messaging-channel suffix (`@c.us`, `@lid`, `@s.whatsapp.net`)
/// from a phone identifier, leaving the bare number or handle.
pub fn squash_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once('@') {
        Some((bare, _)) => bare.to_owned(),
        None => trimmed.to_owned(),
    }
}

/// Fold a lowercase Latin character with diacritics to its ASCII base.
///
/// Covers Latin-1 Supplement and Latin Extended-A, which is the full range
/// the Spanish-language catalog and Ecuadorian city names use. Characters
/// outside the table pass through unchanged.
fn fold_diacritic(ch: char) -> char {
    match ch {
        'á' | 'à' | 'ä' | 'â' | 'ã' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'é' | 'è' | 'ë' | 'ê' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'í' | 'ì' | 'ï' | 'î' | 'ī' | 'ĭ' | 'į' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' | 'õ' | 'ō' | 'ŏ' | 'ő' => 'o',
        'ú' | 'ù' | 'ü' | 'û' | 'ū' | 'ŭ' | 'ů' => 'u',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ç' | 'ć' | 'ĉ' | 'č' => 'c',
        'ý' | 'ÿ' => 'y',
        'š' | 'ś' => 's',
        'ž' | 'ź' | 'ż' => 'z',
        other => other,
    }
}
