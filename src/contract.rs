use crate::error::PipelineError;
use crate::state::{Chapter, Character, StoryElements};
use serde::Deserialize;

pub const MIN_CHAPTERS: usize = 6;
pub const MAX_CHAPTERS: usize = 10;

/// Removes a single fenced-code-block wrapper, if present. Models frequently
/// wrap JSON in fences despite instructions not to.
pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

/// Drops commas whose next non-whitespace character closes an object or
/// array, a common small-model JSON mistake. String literals pass through
/// untouched.
pub fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Full decoration cleanup applied before any structural parse.
pub fn clean(raw: &str) -> String {
    strip_trailing_commas(&strip_code_blocks(raw))
}

fn contract_error(shape: &'static str, message: String, raw: String) -> PipelineError {
    PipelineError::Contract {
        shape,
        message,
        raw,
    }
}

#[derive(Deserialize)]
struct RawCharacter {
    name: String,
    #[serde(default)]
    gender: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    traits: String,
    #[serde(default)]
    affiliation: Option<String>,
}

#[derive(Deserialize)]
struct RawElements {
    characters: Vec<RawCharacter>,
    #[serde(default, alias = "keyEvents")]
    key_events: Vec<String>,
    #[serde(default)]
    timeline: Vec<String>,
    #[serde(default, alias = "uniqueDetails")]
    unique_details: Vec<String>,
    #[serde(default, alias = "mainStoryLines")]
    main_story_lines: Vec<String>,
}

/// Parses and validates a StoryElements payload. Character entries with
/// duplicate names collapse to the first occurrence.
pub fn parse_story_elements(raw: &str) -> Result<StoryElements, PipelineError> {
    let cleaned = clean(raw);
    let parsed: RawElements = serde_json::from_str(&cleaned)
        .map_err(|e| contract_error("StoryElements", e.to_string(), cleaned.clone()))?;

    if parsed.characters.is_empty() {
        return Err(contract_error(
            "StoryElements",
            "characters array is empty".to_string(),
            cleaned,
        ));
    }

    Ok(build_elements(parsed))
}

/// Like `parse_story_elements`, but an empty characters array is acceptable.
/// Used by auxiliary extraction passes whose schema legitimately allows every
/// collection to come back empty.
pub fn parse_story_elements_lenient(raw: &str) -> Result<StoryElements, PipelineError> {
    let cleaned = clean(raw);
    let parsed: RawElements = serde_json::from_str(&cleaned)
        .map_err(|e| contract_error("StoryElements", e.to_string(), cleaned))?;
    Ok(build_elements(parsed))
}

fn build_elements(parsed: RawElements) -> StoryElements {
    let mut elements = StoryElements::default();
    for c in parsed.characters {
        if elements.characters.iter().any(|e| e.name == c.name) {
            continue;
        }
        elements.characters.push(Character {
            name: c.name,
            gender: c.gender,
            role: c.role,
            traits: c.traits,
            affiliation: c.affiliation,
        });
    }
    elements.key_events = parsed.key_events;
    elements.timeline = parsed.timeline;
    elements.unique_details = parsed.unique_details;
    elements.main_story_lines = parsed.main_story_lines;
    elements
}

#[derive(Deserialize)]
struct RawChapter {
    #[serde(default)]
    title: Option<String>,
    summary: String,
    #[serde(default, alias = "keyEvents")]
    key_events: Vec<String>,
    #[serde(default, alias = "characterTraits")]
    character_traits: Vec<String>,
    #[serde(default)]
    timeline: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOutline {
    Bare(Vec<RawChapter>),
    Wrapped { chapters: Vec<RawChapter> },
}

/// Parses a chapter outline and enforces the 6..=10 cardinality. A missing
/// title backfills as "Chapter N"; a missing summary is a hard failure.
pub fn parse_outline(raw: &str) -> Result<Vec<Chapter>, PipelineError> {
    parse_chapter_list(raw, MIN_CHAPTERS, MAX_CHAPTERS, 0)
}

/// Like `parse_outline` but for partial regeneration: the result must hold
/// exactly `expected` chapters, and backfilled titles are numbered starting
/// at `offset + 1`.
pub fn parse_partial_outline(raw: &str, expected: usize, offset: usize) -> Result<Vec<Chapter>, PipelineError> {
    parse_chapter_list(raw, expected, expected, offset)
}

fn parse_chapter_list(
    raw: &str,
    min: usize,
    max: usize,
    offset: usize,
) -> Result<Vec<Chapter>, PipelineError> {
    let cleaned = clean(raw);
    let parsed: RawOutline = serde_json::from_str(&cleaned)
        .map_err(|e| contract_error("ChapterOutline", e.to_string(), cleaned.clone()))?;
    let raw_chapters = match parsed {
        RawOutline::Bare(chapters) => chapters,
        RawOutline::Wrapped { chapters } => chapters,
    };

    if raw_chapters.len() < min || raw_chapters.len() > max {
        return Err(contract_error(
            "ChapterOutline",
            format!(
                "expected {}..={} chapters, got {}",
                min,
                max,
                raw_chapters.len()
            ),
            cleaned,
        ));
    }

    let mut chapters = Vec::with_capacity(raw_chapters.len());
    for (i, c) in raw_chapters.into_iter().enumerate() {
        if c.summary.trim().is_empty() {
            return Err(contract_error(
                "ChapterOutline",
                format!("chapter {} has an empty summary", offset + i + 1),
                cleaned,
            ));
        }
        chapters.push(Chapter {
            title: c
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Chapter {}", offset + i + 1)),
            summary: c.summary,
            key_events: c.key_events,
            character_traits: c.character_traits,
            timeline: c.timeline,
            instruction: None,
            expanded_text: None,
            expansion_count: 0,
            image_prompt: None,
            image_url: None,
        });
    }
    Ok(chapters)
}
