//! Mission-query scoring policies for Skysweep perception.
//!
//! Two policies evolved in the field and both remain supported: a bilingual
//! keyword matcher over the categorical wardrobe encoding, and a `key:value`
//! token matcher over the integer-index encoding. A deployment wires exactly
//! one of them into its [`skysweep_core::WorldState`]; scoring an entity
//! whose encoding does not belong to the wired policy yields 0.

use serde::{Deserialize, Serialize};
use skysweep_core::{AttributeSet, HelmetColor, JacketColor, MatchPolicy};

/// Selects which scoring policy a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    Keyword,
    Index,
}

/// Build the matcher for the requested policy.
#[must_use]
pub fn matcher(kind: PolicyKind) -> Box<dyn MatchPolicy> {
    match kind {
        PolicyKind::Keyword => Box::new(KeywordPolicy),
        PolicyKind::Index => Box::new(IndexPolicy),
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

const PERSON_TERMS: [&str; 3] = ["person", "persona", "humano"];
const HELMET_TERMS: [&str; 2] = ["helmet", "casco"];
const NO_HELMET_TERMS: [&str; 2] = ["no helmet", "sin casco"];
const JACKET_TERMS: [&str; 4] = ["jacket", "chaqueta", "chamarra", "chaleco"];

/// Jacket color vocabulary, checked in this fixed order; only the first
/// color named in the query contributes.
const JACKET_COLORS: [(JacketColor, [&str; 2]); 6] = [
    (JacketColor::Orange, ["orange", "naranja"]),
    (JacketColor::Red, ["red", "rojo"]),
    (JacketColor::Blue, ["blue", "azul"]),
    (JacketColor::Green, ["green", "verde"]),
    (JacketColor::Yellow, ["yellow", "amarill"]),
    (JacketColor::Black, ["black", "negro"]),
];

/// Bilingual keyword scoring over the categorical encoding.
///
/// Base "person" term contributes 0.3, a matching jacket color 0.7, helmet
/// clauses 0.3-0.4; contributions sum and clamp to `[0, 1]`. A helmet-only
/// query suppresses jacket scoring, and an explicit "no helmet" request is
/// not treated as asking for one.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordPolicy;

impl MatchPolicy for KeywordPolicy {
    fn kind(&self) -> &'static str {
        "score.keyword"
    }

    fn score(&self, query: &str, attrs: &AttributeSet) -> f32 {
        let AttributeSet::Categorical { jacket, helmet } = attrs else {
            return 0.0;
        };
        let q = query.to_lowercase();
        let mut score = 0.0_f32;

        if contains_any(&q, &PERSON_TERMS) {
            score += 0.3;
        }

        let negates_helmet = contains_any(&q, &NO_HELMET_TERMS);
        let wants_helmet = !negates_helmet && contains_any(&q, &HELMET_TERMS);
        let mentions_jacket = contains_any(&q, &JACKET_TERMS);

        if !wants_helmet || mentions_jacket {
            let named = JACKET_COLORS
                .iter()
                .find(|(_, terms)| contains_any(&q, terms));
            if let Some((color, _)) = named
                && color == jacket
            {
                score += 0.7;
            }
        }

        if wants_helmet {
            let wants_yellow = contains_any(&q, &["yellow", "amarill"]);
            let wants_white = contains_any(&q, &["white", "blanco"]);
            let wants_orange = contains_any(&q, &["orange", "naranja"]);
            if wants_yellow && *helmet == HelmetColor::Yellow {
                score += 0.4;
            } else if wants_white && *helmet == HelmetColor::White {
                score += 0.4;
            } else if wants_orange && *helmet == HelmetColor::Orange {
                score += 0.4;
            } else if !wants_yellow && !wants_white && !wants_orange && *helmet != HelmetColor::None
            {
                score += 0.3;
            }
        } else if negates_helmet && *helmet == HelmetColor::None {
            score += 0.4;
        }

        score.clamp(0.0, 1.0)
    }
}

/// `key:value` token scoring over the integer-index encoding.
///
/// The query is parsed for `material`, `hat`, and `accessory` tokens with
/// numeric values; absent or malformed tokens are unconstrained. The score
/// depends only on how many present tokens match the entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexPolicy;

impl MatchPolicy for IndexPolicy {
    fn kind(&self) -> &'static str {
        "score.index"
    }

    fn score(&self, query: &str, attrs: &AttributeSet) -> f32 {
        let AttributeSet::Indexed(wardrobe) = attrs else {
            return 0.0;
        };
        let q = query.to_lowercase();

        let mut material = None;
        let mut hat = None;
        let mut accessory = None;
        for token in q.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            let Ok(value) = value.parse::<u8>() else {
                continue;
            };
            match key {
                "material" => material = Some(value),
                "hat" => hat = Some(value),
                "accessory" => accessory = Some(value),
                _ => {}
            }
        }

        let matched = [
            (material, wardrobe.material),
            (hat, wardrobe.hat),
            (accessory, wardrobe.accessory),
        ]
        .iter()
        .filter(|(requested, actual)| *requested == Some(*actual))
        .count();

        match matched {
            3 => 1.0,
            2 => 0.7,
            1 => 0.4,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysweep_core::WardrobeIndices;

    fn categorical(jacket: JacketColor, helmet: HelmetColor) -> AttributeSet {
        AttributeSet::Categorical { jacket, helmet }
    }

    fn indexed(material: u8, hat: u8, accessory: u8) -> AttributeSet {
        AttributeSet::Indexed(WardrobeIndices {
            material,
            hat,
            accessory,
        })
    }

    #[test]
    fn person_with_matching_jacket_scores_full() {
        let policy = KeywordPolicy;
        assert_eq!(
            policy.score(
                "person with orange jacket",
                &categorical(JacketColor::Orange, HelmetColor::None),
            ),
            1.0
        );
        assert!(
            (policy.score(
                "person with orange jacket",
                &categorical(JacketColor::Blue, HelmetColor::None),
            ) - 0.3)
                .abs()
                < 1e-6
        );
    }

    #[test]
    fn no_helmet_request_rewards_bare_heads_only() {
        let policy = KeywordPolicy;
        let bare = policy.score(
            "person, no helmet",
            &categorical(JacketColor::Black, HelmetColor::None),
        );
        assert!((bare - 0.7).abs() < 1e-6);

        let helmeted = policy.score(
            "person, no helmet",
            &categorical(JacketColor::Black, HelmetColor::Yellow),
        );
        assert!((helmeted - 0.3).abs() < 1e-6);
    }

    #[test]
    fn helmet_only_query_suppresses_jacket_scoring() {
        let policy = KeywordPolicy;
        // "yellow helmet" names a color that also exists as a jacket color;
        // without a jacket mention the jacket clause must stay silent.
        let score = policy.score(
            "person with yellow helmet",
            &categorical(JacketColor::Yellow, HelmetColor::Yellow),
        );
        assert!((score - 0.7).abs() < 1e-6);

        // Mentioning the jacket re-enables jacket scoring alongside the
        // helmet clause.
        let score = policy.score(
            "person with yellow jacket and yellow helmet",
            &categorical(JacketColor::Yellow, HelmetColor::Yellow),
        );
        assert_eq!(score, 1.0);
    }

    #[test]
    fn generic_helmet_request_matches_any_helmet() {
        let policy = KeywordPolicy;
        let score = policy.score(
            "person wearing a helmet",
            &categorical(JacketColor::Blue, HelmetColor::White),
        );
        assert!((score - 0.6).abs() < 1e-6);

        let bare = policy.score(
            "person wearing a helmet",
            &categorical(JacketColor::Blue, HelmetColor::None),
        );
        assert!((bare - 0.3).abs() < 1e-6);
    }

    #[test]
    fn first_named_jacket_color_wins() {
        let policy = KeywordPolicy;
        // Orange precedes blue in the vocabulary order, so a blue jacket
        // earns nothing from a query naming both.
        let score = policy.score(
            "person with orange or blue jacket",
            &categorical(JacketColor::Blue, HelmetColor::None),
        );
        assert!((score - 0.3).abs() < 1e-6);
    }

    #[test]
    fn spanish_terms_score_like_english() {
        let policy = KeywordPolicy;
        let score = policy.score(
            "humano con chaqueta naranja",
            &categorical(JacketColor::Orange, HelmetColor::None),
        );
        assert_eq!(score, 1.0);

        let score = policy.score(
            "persona sin casco",
            &categorical(JacketColor::Green, HelmetColor::None),
        );
        assert!((score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn empty_query_matches_nothing() {
        let policy = KeywordPolicy;
        assert_eq!(
            policy.score("", &categorical(JacketColor::Orange, HelmetColor::Yellow)),
            0.0
        );
    }

    #[test]
    fn keyword_policy_ignores_indexed_entities() {
        let policy = KeywordPolicy;
        assert_eq!(policy.score("person with orange jacket", &indexed(0, 0, 0)), 0.0);
    }

    #[test]
    fn index_policy_counts_present_token_matches() {
        let policy = IndexPolicy;
        // Two present tokens, both matching: the absent key never counts.
        assert!((policy.score("material:2 hat:1", &indexed(2, 1, 7)) - 0.7).abs() < 1e-6);
        assert_eq!(
            policy.score("material:2 hat:1 accessory:0", &indexed(2, 1, 0)),
            1.0
        );
        assert!((policy.score("material:2 hat:1", &indexed(2, 5, 7)) - 0.4).abs() < 1e-6);
        assert_eq!(policy.score("material:2 hat:1", &indexed(0, 5, 7)), 0.0);
    }

    #[test]
    fn index_policy_token_order_is_irrelevant() {
        let policy = IndexPolicy;
        let attrs = indexed(1, 2, 3);
        let forward = policy.score("material:1 hat:2 accessory:3", &attrs);
        let reversed = policy.score("accessory:3 hat:2 material:1", &attrs);
        assert_eq!(forward, reversed);
        assert_eq!(forward, 1.0);
    }

    #[test]
    fn index_policy_skips_malformed_tokens() {
        let policy = IndexPolicy;
        let attrs = indexed(2, 1, 0);
        // A non-numeric value leaves that key unconstrained.
        assert!((policy.score("material:x hat:1", &attrs) - 0.4).abs() < 1e-6);
        assert_eq!(policy.score("", &attrs), 0.0);
        assert_eq!(policy.score("hats:1 color:orange", &attrs), 0.0);
    }

    #[test]
    fn index_policy_ignores_categorical_entities() {
        let policy = IndexPolicy;
        assert_eq!(
            policy.score(
                "material:1",
                &categorical(JacketColor::Orange, HelmetColor::None),
            ),
            0.0
        );
    }

    #[test]
    fn matcher_factory_exposes_both_policies() {
        assert_eq!(matcher(PolicyKind::Keyword).kind(), "score.keyword");
        assert_eq!(matcher(PolicyKind::Index).kind(), "score.index");
    }
}
