use crate::contract::{MAX_CHAPTERS, MIN_CHAPTERS};
use crate::state::{Chapter, StoryElements};

pub const JSON_SYSTEM: &str =
    "You are a literary assistant. Return only valid JSON, with no prose, no markdown and no code fences.";

pub const PROSE_SYSTEM: &str =
    "You are a novelist. Write polished narrative prose. Return only the prose itself.";

const DIGEST_BASE_BYTES: usize = 600;
const DIGEST_PER_CHAPTER_BYTES: usize = 300;
const DIGEST_CAP_BYTES: usize = 3000;

fn steering_block(instruction: Option<&str>) -> String {
    match instruction {
        Some(s) if !s.trim().is_empty() => format!("\n\nAdditional guidance from the author:\n{}", s),
        _ => String::new(),
    }
}

pub fn summarize_prompt(chunk: &str, instruction: Option<&str>) -> String {
    format!(
        "Condense the following draft excerpt into a 200-400 word summary. \
        Preserve every named character, event and plot-relevant detail; drop filler and repetition. \
        Keep the original chronological order.{}\n\nExcerpt:\n{}",
        steering_block(instruction),
        chunk
    )
}

const ELEMENTS_SCHEMA: &str = r#"{
  "characters": [ { "name": "...", "gender": "...", "role": "...", "traits": "...", "affiliation": "..." } ],
  "keyEvents": [ "..." ],
  "timeline": [ "..." ],
  "uniqueDetails": [ "..." ],
  "mainStoryLines": [ "...", "...", "..." ]
}"#;

pub fn extract_elements_prompt(condensed: &str, instruction: Option<&str>) -> String {
    format!(
        "Extract the story elements from the condensed draft below. \
        Return one JSON object with this shape:\n{}\n\
        keyEvents and timeline are in story order. mainStoryLines holds 3-5 entries.{}\n\nCondensed draft:\n{}",
        ELEMENTS_SCHEMA,
        steering_block(instruction),
        condensed
    )
}

pub fn extract_elements_strict_prompt(condensed: &str, instruction: Option<&str>) -> String {
    format!(
        "Your previous answer was not valid JSON. Output strictly JSON, no prose, no markdown. \
        The object must match this schema exactly, with all five top-level keys present:\n{}\n\
        Every array entry is a string, except characters which holds objects.{}\n\nCondensed draft:\n{}",
        ELEMENTS_SCHEMA,
        steering_block(instruction),
        condensed
    )
}

const CHAPTER_SCHEMA: &str = r#"[
  { "title": "...", "summary": "3-7 sentences", "keyEvents": [ "..." ], "characterTraits": [ "Name: traits" ], "timeline": "position marker" }
]"#;

fn outline_rules() -> String {
    format!(
        "Rules:\n\
        1. Produce between {} and {} chapters, as a JSON array.\n\
        2. Chapters are chronologically disjoint: each covers distinct, non-repeated events and moves the timeline strictly forward.\n\
        3. Every chapter has a title, a 3-7 sentence summary, its own keyEvents, characterTraits entries of the form \"Name: traits\", and a timeline position marker.",
        MIN_CHAPTERS, MAX_CHAPTERS
    )
}

pub fn outline_prompt(condensed: &str, elements: &StoryElements, instruction: Option<&str>) -> String {
    let elements_json = serde_json::to_string(elements).unwrap_or_default();
    format!(
        "Plan a chapter outline for this story.\n\n{}\n\nShape:\n{}{}\n\n\
        Story elements:\n{}\n\nCondensed draft:\n{}",
        outline_rules(),
        CHAPTER_SCHEMA,
        steering_block(instruction),
        elements_json,
        condensed
    )
}

pub fn outline_strict_prompt(condensed: &str, elements: &StoryElements, instruction: Option<&str>) -> String {
    let elements_json = serde_json::to_string(elements).unwrap_or_default();
    format!(
        "Your previous answer was rejected. Output strictly a JSON array, no prose, no markdown.\n\n{}\n\
        Re-read rule 2: no chapter may repeat events from another chapter; the timeline only advances.\n\
        Shape:\n{}{}\n\nStory elements:\n{}\n\nCondensed draft:\n{}",
        outline_rules(),
        CHAPTER_SCHEMA,
        steering_block(instruction),
        elements_json,
        condensed
    )
}

/// Bounded summary of already-outlined prior chapters fed into later-chapter
/// generation. Budget grows with chapter index but is capped, so prompts do
/// not grow without bound.
pub fn continuity_digest(prior: &[Chapter]) -> String {
    if prior.is_empty() {
        return String::new();
    }
    let budget =
        (DIGEST_BASE_BYTES + DIGEST_PER_CHAPTER_BYTES * prior.len()).min(DIGEST_CAP_BYTES);

    let mut digest = String::new();
    for (i, chapter) in prior.iter().enumerate() {
        digest.push_str(&digest_entry(i, chapter));
    }
    truncate_to_char_boundary(&digest, budget)
}

/// Digest of every chapter except `skip`, keeping absolute chapter numbers.
/// Used when re-planning one chapter against the rest of the outline.
pub fn neighbors_digest(chapters: &[Chapter], skip: usize) -> String {
    let count = chapters.len().saturating_sub(1);
    if count == 0 {
        return String::new();
    }
    let budget = (DIGEST_BASE_BYTES + DIGEST_PER_CHAPTER_BYTES * count).min(DIGEST_CAP_BYTES);

    let mut digest = String::new();
    for (i, chapter) in chapters.iter().enumerate() {
        if i == skip {
            continue;
        }
        digest.push_str(&digest_entry(i, chapter));
    }
    truncate_to_char_boundary(&digest, budget)
}

fn digest_entry(i: usize, chapter: &Chapter) -> String {
    format!(
        "Chapter {} \"{}\" [{}]: {} Key events: {}.\n",
        i + 1,
        chapter.title,
        chapter.timeline,
        chapter.summary,
        chapter.key_events.join("; ")
    )
}

/// Cuts `s` to at most `max_bytes`, backing up to a char boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Superset-biased relevance filter: keeps the story elements this chapter's
/// metadata appears to reference. Characters match on whole-name containment;
/// key events and unique details match on their first word. Imprecise by
/// design — it may over- or under-match, and callers must treat the result as
/// a focus hint, not a guarantee of completeness.
pub fn relevant_elements(elements: &StoryElements, chapter: &Chapter) -> StoryElements {
    let haystack = format!(
        "{} {} {} {}",
        chapter.summary,
        chapter.key_events.join(" "),
        chapter.character_traits.join(" "),
        chapter.timeline
    );

    let first_word_matches = |entry: &String| {
        entry
            .split_whitespace()
            .next()
            .map(|w| haystack.contains(w))
            .unwrap_or(false)
    };

    StoryElements {
        characters: elements
            .characters
            .iter()
            .filter(|c| haystack.contains(c.name.as_str()))
            .cloned()
            .collect(),
        key_events: elements.key_events.iter().filter(|e| first_word_matches(e)).cloned().collect(),
        timeline: elements.timeline.clone(),
        unique_details: elements
            .unique_details
            .iter()
            .filter(|d| first_word_matches(d))
            .cloned()
            .collect(),
        main_story_lines: elements.main_story_lines.clone(),
    }
}

fn chapter_metadata_block(chapter: &Chapter) -> String {
    format!(
        "Title: {}\nTimeline: {}\nSummary: {}\nKey events: {}\nCharacter traits: {}",
        chapter.title,
        chapter.timeline,
        chapter.summary,
        chapter.key_events.join("; "),
        chapter.character_traits.join("; ")
    )
}

pub fn expand_chapter_prompt(
    chapter: &Chapter,
    prior: &[Chapter],
    elements: &StoryElements,
    is_last: bool,
) -> String {
    let relevant = relevant_elements(elements, chapter);
    let relevant_json = serde_json::to_string(&relevant).unwrap_or_default();
    let digest = continuity_digest(prior);
    let digest_block = if digest.is_empty() {
        String::new()
    } else {
        format!("\n\nWhat has already happened:\n{}", digest)
    };
    let finale = if is_last {
        "\n\nThis is the final chapter: resolve all open arcs and bring the story to a close."
    } else {
        ""
    };

    format!(
        "Write this chapter as 800-1500 words of narrative prose. \
        Cover exactly the events in its summary, nothing from later chapters.{}\n\n\
        Chapter to write:\n{}\n\nRelevant story elements:\n{}{}{}",
        digest_block,
        chapter_metadata_block(chapter),
        relevant_json,
        steering_block(chapter.instruction.as_deref()),
        finale
    )
}

pub fn expand_more_prompt(chapter: &Chapter, elements: &StoryElements) -> String {
    let relevant = relevant_elements(elements, chapter);
    let relevant_json = serde_json::to_string(&relevant).unwrap_or_default();
    let existing = chapter.expanded_text.as_deref().unwrap_or_default();
    // Only the tail is needed to continue the scene.
    let tail_start = existing.len().saturating_sub(2000);
    let mut boundary = tail_start;
    while boundary < existing.len() && !existing.is_char_boundary(boundary) {
        boundary += 1;
    }

    format!(
        "Continue this chapter with 500-1000 additional words. \
        Pick up exactly where the existing prose stops; do not restate or rewrite it. \
        Stay within the chapter's own events.\n\n\
        Chapter metadata:\n{}\n\nRelevant story elements:\n{}{}\n\n\
        Existing prose (ending):\n...{}",
        chapter_metadata_block(chapter),
        relevant_json,
        steering_block(chapter.instruction.as_deref()),
        &existing[boundary..]
    )
}

pub fn illustration_description_prompt(chapter: &Chapter, style: Option<&str>) -> String {
    let style_block = match style {
        Some(s) if !s.trim().is_empty() => format!(" Render it in this style: {}.", s),
        _ => String::new(),
    };
    let source = chapter
        .expanded_text
        .as_deref()
        .map(|t| truncate_to_char_boundary(t, 2000))
        .unwrap_or_else(|| chapter.summary.clone());
    format!(
        "Describe, in one paragraph suitable as an image-generation prompt, a single \
        illustration capturing the heart of this chapter.{} Avoid text in the image.\n\n\
        Chapter \"{}\":\n{}",
        style_block, chapter.title, source
    )
}

/// Generic fallback used after a content-safety rejection: mood only, no
/// specific content.
pub fn sanitized_image_prompt(title: &str, style: Option<&str>) -> String {
    let style_block = match style {
        Some(s) if !s.trim().is_empty() => format!(", in this style: {}", s),
        _ => String::new(),
    };
    format!(
        "A mood and atmosphere illustration for a book chapter titled \"{}\"{}; \
        abstract, evocative, no specific people or events, no text.",
        title, style_block
    )
}

pub fn cover_prompt(elements: &StoryElements, style: Option<&str>) -> String {
    let style_block = match style {
        Some(s) if !s.trim().is_empty() => format!(" Render it in this style: {}.", s),
        _ => String::new(),
    };
    format!(
        "A book cover illustration for a novel about: {}.{} No text on the cover.",
        elements.main_story_lines.join("; "),
        style_block
    )
}

/// Auxiliary extraction pass over an edited chapter's context, used before
/// partial outline regeneration so newly introduced persistent entities
/// survive into later chapters.
pub fn instruction_elements_prompt(chapter: &Chapter, instruction: &str) -> String {
    format!(
        "An author edited the guiding instruction for the chapter below. \
        Extract any NEW persistent story entities the instruction introduces \
        (characters, factions, recurring details). Return one JSON object with this shape:\n{}\n\
        Leave arrays empty when the instruction introduces nothing new of that kind.\n\n\
        Chapter:\n{}\n\nNew instruction:\n{}",
        ELEMENTS_SCHEMA,
        chapter_metadata_block(chapter),
        instruction
    )
}

/// Regenerates chapters `from..total` while earlier chapters stay fixed.
pub fn regenerate_tail_prompt(
    condensed: &str,
    elements: &StoryElements,
    kept: &[Chapter],
    from: usize,
    total: usize,
    edited_instruction: Option<&str>,
    global_instruction: Option<&str>,
) -> String {
    let elements_json = serde_json::to_string(elements).unwrap_or_default();
    let kept_digest = continuity_digest(kept);
    let kept_block = if kept_digest.is_empty() {
        String::new()
    } else {
        format!(
            "\n\nChapters 1-{} are FIXED and must not be re-told:\n{}",
            from, kept_digest
        )
    };
    let edited_block = match edited_instruction {
        Some(s) if !s.trim().is_empty() => format!(
            "\n\nChapter {} follows this author instruction, and every later chapter must \
            reference and continue its consequences:\n{}",
            from + 1,
            s
        ),
        _ => String::new(),
    };

    format!(
        "Re-plan chapters {}..{} of this story's outline as a JSON array of exactly {} chapters.\n\n{}\n\
        The regenerated chapters continue directly after the fixed ones: no repeated events, \
        the timeline only advances.{}{}{}\n\nShape:\n{}\n\n\
        Story elements:\n{}\n\nCondensed draft:\n{}",
        from + 1,
        total,
        total - from,
        outline_rules(),
        kept_block,
        edited_block,
        steering_block(global_instruction),
        CHAPTER_SCHEMA,
        elements_json,
        condensed
    )
}

/// One focused re-plan of a single chapter, used by the global-edit
/// refinement pass so chapter-level instructions survive outline-wide
/// regeneration.
pub fn refine_chapter_prompt(
    chapter: &Chapter,
    index: usize,
    total: usize,
    neighbors_digest: &str,
    instruction: &str,
) -> String {
    format!(
        "Re-plan chapter {} of {} as a single JSON object (not an array) with this shape:\n{}\n\
        The primary directive is this author instruction:\n{}\n\n\
        Keep the chapter consistent with its neighbors:\n{}\n\nCurrent chapter:\n{}",
        index + 1,
        total,
        CHAPTER_SCHEMA.trim_start_matches("[\n  ").trim_end_matches("\n]"),
        instruction,
        neighbors_digest,
        chapter_metadata_block(chapter)
    )
}
