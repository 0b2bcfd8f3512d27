use crate::config::ImageConfig;
use crate::contract;
use crate::error::PipelineError;
use crate::generation::{CancelToken, GenerationClient};
use crate::llm::{ImageClient, ImageOutcome};
use crate::prompts;
use crate::state::{Chapter, StoryElements};

/// Shared executor shape for structured stages: generate, parse, and on a
/// contract violation rebuild a stricter prompt and retry generation+parse
/// exactly once. The second failure surfaces with the raw text attached.
async fn structured<T, P>(
    generation: &GenerationClient,
    model: &str,
    prompt: &str,
    strict_prompt: &str,
    parse: P,
    cancel: &CancelToken,
) -> Result<T, PipelineError>
where
    P: Fn(&str) -> Result<T, PipelineError>,
{
    let output = generation
        .generate(prompts::JSON_SYSTEM, prompt, model, cancel)
        .await?;

    match parse(&output.text) {
        Ok(value) => Ok(value),
        Err(PipelineError::Contract { shape, message, .. }) => {
            log::warn!(
                "{} contract violated ({}); retrying with stricter prompt",
                shape,
                message
            );
            let output = generation
                .generate(prompts::JSON_SYSTEM, strict_prompt, model, cancel)
                .await?;
            parse(&output.text)
        }
        Err(other) => Err(other),
    }
}

/// Summarizes every chunk in order and joins the results with blank lines.
pub async fn run_summarize(
    generation: &GenerationClient,
    model: &str,
    chunks: &[String],
    instruction: Option<&str>,
    cancel: &CancelToken,
) -> Result<String, PipelineError> {
    let mut parts = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        log::info!("summarizing chunk {}/{}", i + 1, chunks.len());
        let output = generation
            .generate(
                prompts::PROSE_SYSTEM,
                &prompts::summarize_prompt(chunk, instruction),
                model,
                cancel,
            )
            .await?;
        parts.push(output.text.trim().to_string());
    }
    Ok(parts.join("\n\n"))
}

pub async fn run_extract_elements(
    generation: &GenerationClient,
    model: &str,
    condensed_prefix: &str,
    instruction: Option<&str>,
    cancel: &CancelToken,
) -> Result<StoryElements, PipelineError> {
    structured(
        generation,
        model,
        &prompts::extract_elements_prompt(condensed_prefix, instruction),
        &prompts::extract_elements_strict_prompt(condensed_prefix, instruction),
        contract::parse_story_elements,
        cancel,
    )
    .await
}

pub async fn run_outline(
    generation: &GenerationClient,
    model: &str,
    condensed_prefix: &str,
    elements: &StoryElements,
    instruction: Option<&str>,
    cancel: &CancelToken,
) -> Result<Vec<Chapter>, PipelineError> {
    structured(
        generation,
        model,
        &prompts::outline_prompt(condensed_prefix, elements, instruction),
        &prompts::outline_strict_prompt(condensed_prefix, elements, instruction),
        contract::parse_outline,
        cancel,
    )
    .await
}

/// Regenerates the outline tail starting at `from`, holding earlier chapters
/// fixed. The result must hold exactly the remaining chapter count.
pub async fn run_outline_tail(
    generation: &GenerationClient,
    model: &str,
    condensed_prefix: &str,
    elements: &StoryElements,
    kept: &[Chapter],
    from: usize,
    total: usize,
    edited_instruction: Option<&str>,
    global_instruction: Option<&str>,
    cancel: &CancelToken,
) -> Result<Vec<Chapter>, PipelineError> {
    let prompt = prompts::regenerate_tail_prompt(
        condensed_prefix,
        elements,
        kept,
        from,
        total,
        edited_instruction,
        global_instruction,
    );
    // The tail prompt already restates the rules; the strict retry prepends
    // the JSON-only reminder.
    let strict = format!(
        "Your previous answer was rejected. Output strictly a JSON array of exactly {} chapter objects, \
        no prose, no markdown.\n\n{}",
        total - from,
        prompt
    );
    structured(
        generation,
        model,
        &prompt,
        &strict,
        |raw| contract::parse_partial_outline(raw, total - from, from),
        cancel,
    )
    .await
}

/// One focused re-plan of a single chapter around its instruction.
pub async fn run_refine_chapter(
    generation: &GenerationClient,
    model: &str,
    chapter: &Chapter,
    index: usize,
    total: usize,
    neighbors_digest: &str,
    instruction: &str,
    cancel: &CancelToken,
) -> Result<Chapter, PipelineError> {
    let prompt =
        prompts::refine_chapter_prompt(chapter, index, total, neighbors_digest, instruction);
    let strict = format!(
        "Your previous answer was rejected. Output strictly one JSON object, no prose, no markdown.\n\n{}",
        prompt
    );
    let parse = |raw: &str| {
        // Tolerate a single-element array for a single-chapter answer.
        contract::parse_partial_outline(raw, 1, index)
            .or_else(|_| contract::parse_partial_outline(&format!("[{}]", contract::clean(raw)), 1, index))
            .map(|mut v| v.remove(0))
    };
    structured(generation, model, &prompt, &strict, parse, cancel).await
}

/// Auxiliary Extract-Elements-style pass over an edited chapter instruction.
/// Failure here is tolerable; the caller unions whatever comes back.
pub async fn run_instruction_elements(
    generation: &GenerationClient,
    model: &str,
    chapter: &Chapter,
    instruction: &str,
    cancel: &CancelToken,
) -> Result<StoryElements, PipelineError> {
    let prompt = prompts::instruction_elements_prompt(chapter, instruction);
    let output = generation
        .generate(prompts::JSON_SYSTEM, &prompt, model, cancel)
        .await?;
    // An instruction often introduces nothing; an empty characters array is
    // fine here, unlike the primary extraction stage.
    match contract::parse_story_elements_lenient(&output.text) {
        Ok(elements) => Ok(elements),
        Err(PipelineError::Contract { .. }) => Ok(StoryElements::default()),
        Err(other) => Err(other),
    }
}

/// Free-text stage: only a non-empty check, no contract parse.
pub async fn run_expand_chapter(
    generation: &GenerationClient,
    model: &str,
    chapter: &Chapter,
    prior: &[Chapter],
    elements: &StoryElements,
    is_last: bool,
    cancel: &CancelToken,
) -> Result<String, PipelineError> {
    let prompt = prompts::expand_chapter_prompt(chapter, prior, elements, is_last);
    let output = generation
        .generate(prompts::PROSE_SYSTEM, &prompt, model, cancel)
        .await?;
    let text = output.text.trim().to_string();
    if text.is_empty() {
        return Err(PipelineError::Generation {
            model: output.model_used,
            attempts: output.attempts,
            message: "expansion produced empty prose".to_string(),
        });
    }
    Ok(text)
}

pub async fn run_expand_more(
    generation: &GenerationClient,
    model: &str,
    chapter: &Chapter,
    elements: &StoryElements,
    cancel: &CancelToken,
) -> Result<String, PipelineError> {
    let prompt = prompts::expand_more_prompt(chapter, elements);
    let output = generation
        .generate(prompts::PROSE_SYSTEM, &prompt, model, cancel)
        .await?;
    let text = output.text.trim().to_string();
    if text.is_empty() {
        return Err(PipelineError::Generation {
            model: output.model_used,
            attempts: output.attempts,
            message: "supplementary expansion produced empty prose".to_string(),
        });
    }
    Ok(text)
}

/// Outcome of the best-effort illustration stage. `url == None` is a valid
/// completed result, not a failure.
#[derive(Debug, Clone)]
pub struct Illustration {
    pub prompt: String,
    pub url: Option<String>,
}

/// Generates one chapter illustration. Safety rejections get one retry with a
/// sanitized generic prompt; any remaining failure resolves to "no image" so
/// illustration never blocks narrative progress.
pub async fn run_illustrate(
    generation: &GenerationClient,
    image_client: &dyn ImageClient,
    image_config: &ImageConfig,
    model: &str,
    chapter: &Chapter,
    cancel: &CancelToken,
) -> Result<Illustration, PipelineError> {
    let style = image_config.style.as_deref();

    let description = match generation
        .generate(
            prompts::PROSE_SYSTEM,
            &prompts::illustration_description_prompt(chapter, style),
            model,
            cancel,
        )
        .await
    {
        Ok(output) => output.text.trim().to_string(),
        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
        Err(e) => {
            log::warn!("illustration prompt generation failed ({}); using generic prompt", e);
            prompts::sanitized_image_prompt(&chapter.title, style)
        }
    };

    match synthesize(image_client, &description).await {
        Some(url) => {
            return Ok(Illustration {
                prompt: description,
                url: Some(url),
            })
        }
        None => {
            log::warn!(
                "illustration for \"{}\" rejected or failed; retrying with sanitized prompt",
                chapter.title
            );
        }
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let sanitized = prompts::sanitized_image_prompt(&chapter.title, style);
    let url = synthesize(image_client, &sanitized).await;
    if url.is_none() {
        log::warn!("illustration for \"{}\" unavailable; continuing without image", chapter.title);
    }
    Ok(Illustration {
        prompt: sanitized,
        url,
    })
}

pub async fn run_cover(
    image_client: &dyn ImageClient,
    image_config: &ImageConfig,
    elements: &StoryElements,
) -> Option<String> {
    let prompt = prompts::cover_prompt(elements, image_config.style.as_deref());
    synthesize(image_client, &prompt).await
}

async fn synthesize(image_client: &dyn ImageClient, prompt: &str) -> Option<String> {
    match image_client.generate(prompt).await {
        Ok(ImageOutcome::Url(url)) => Some(url),
        Ok(ImageOutcome::Rejected(reason)) => {
            log::warn!("image request rejected by safety filter: {}", reason);
            None
        }
        Err(e) => {
            log::warn!("image request failed: {}", e);
            None
        }
    }
}
