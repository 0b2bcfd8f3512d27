use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a run currently stands. Strictly forward-moving; `Expanding` holds
/// the index of the next chapter to expand.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    NotStarted,
    Summarizing,
    ElementsExtracted,
    Outlined,
    Expanding,
    Complete,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub traits: String,
    #[serde(default)]
    pub affiliation: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StoryElements {
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub timeline: Vec<String>,
    #[serde(default)]
    pub unique_details: Vec<String>,
    #[serde(default)]
    pub main_story_lines: Vec<String>,
}

impl StoryElements {
    /// Union-merges `other` into `self`. Characters merge by name (the natural
    /// key; existing entries win), every other collection by exact string
    /// membership. Ordered collections keep their order, new entries appended.
    pub fn merge(&mut self, other: StoryElements) {
        for character in other.characters {
            if !self.characters.iter().any(|c| c.name == character.name) {
                self.characters.push(character);
            }
        }
        merge_strings(&mut self.key_events, other.key_events);
        merge_strings(&mut self.timeline, other.timeline);
        merge_strings(&mut self.unique_details, other.unique_details);
        merge_strings(&mut self.main_story_lines, other.main_story_lines);
    }
}

fn merge_strings(existing: &mut Vec<String>, incoming: Vec<String>) {
    for item in incoming {
        if !existing.contains(&item) {
            existing.push(item);
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chapter {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_events: Vec<String>,
    /// Strings of the form "Name: traits".
    #[serde(default)]
    pub character_traits: Vec<String>,
    #[serde(default)]
    pub timeline: String,
    /// User-authored steering text. Preserved across regeneration.
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default)]
    pub expanded_text: Option<String>,
    /// Supplementary expansion passes applied on top of the first expansion.
    #[serde(default)]
    pub expansion_count: u32,
    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl Chapter {
    /// Drops derived artifacts but keeps user intent (the instruction).
    pub fn clear_expansion(&mut self) {
        self.expanded_text = None;
        self.expansion_count = 0;
        self.image_prompt = None;
        self.image_url = None;
    }
}

/// The unit of persistence: everything a suspended run needs to resume.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PipelineState {
    pub stage: Stage,
    /// Meaningful only while `stage == Expanding`.
    #[serde(default)]
    pub current_chapter: usize,
    /// Fingerprint of the draft this state belongs to.
    pub draft_fingerprint: String,
    #[serde(default)]
    pub condensed_draft: Option<String>,
    #[serde(default)]
    pub elements: Option<StoryElements>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
    /// Global steering text supplied at `start()`.
    #[serde(default)]
    pub steering_instruction: Option<String>,
    /// Cover image, generated alongside per-chapter illustrations.
    #[serde(default)]
    pub cover_image_url: Option<String>,
}

impl PipelineState {
    pub fn new(draft: &str) -> Self {
        Self {
            draft_fingerprint: fingerprint(draft),
            ..Default::default()
        }
    }
}

/// Deterministic content hash used to detect stale saved progress.
pub fn fingerprint(draft: &str) -> String {
    let digest = Sha256::digest(draft.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
