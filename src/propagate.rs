use crate::error::PipelineError;
use crate::generation::{CancelToken, GenerationClient};
use crate::prompts;
use crate::stages;
use crate::state::{PipelineState, Stage};

/// Applies an edited per-chapter instruction and regenerates downstream
/// outline entries so they stay consistent with it.
///
/// Chapters before `index` are held byte-identical. Chapters at and after
/// `index` get regenerated outline content, keep their user-authored
/// instructions, and lose their expanded prose (it must be re-expanded).
/// Before regenerating, an auxiliary extraction pass union-merges any newly
/// introduced persistent entities into StoryElements. All artifacts are
/// computed up front and committed only when every call succeeded, so a
/// failure leaves the state untouched.
pub async fn propagate_chapter_edit(
    generation: &GenerationClient,
    model: &str,
    condensed_prefix: &str,
    state: &mut PipelineState,
    index: usize,
    new_instruction: Option<String>,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let total = state.chapters.len();
    if index >= total {
        return Err(PipelineError::validation(format!(
            "chapter index {} out of range (0..{})",
            index, total
        )));
    }

    let new_instruction = new_instruction.filter(|s| !s.trim().is_empty());

    let mut elements = state
        .elements
        .clone()
        .ok_or_else(|| PipelineError::validation("story elements missing; run extraction first"))?;

    if let Some(instruction) = &new_instruction {
        let introduced = stages::run_instruction_elements(
            generation,
            model,
            &state.chapters[index],
            instruction,
            cancel,
        )
        .await?;
        elements.merge(introduced);
    }

    let tail = stages::run_outline_tail(
        generation,
        model,
        condensed_prefix,
        &elements,
        &state.chapters[..index],
        index,
        total,
        new_instruction.as_deref(),
        state.steering_instruction.as_deref(),
        cancel,
    )
    .await?;

    // Commit point: everything below is infallible.
    state.elements = Some(elements);
    for (offset, mut regenerated) in tail.into_iter().enumerate() {
        let i = index + offset;
        regenerated.instruction = if i == index {
            new_instruction.clone()
        } else {
            state.chapters[i].instruction.clone()
        };
        state.chapters[i] = regenerated;
    }
    rewind_expansion(state, index);
    Ok(())
}

/// Applies a changed outline-level instruction: the entire chapter range is
/// regenerated, then every chapter carrying its own instruction gets one
/// focused refinement pass naming that instruction as the primary directive,
/// so a global change does not erase chapter-specific overrides.
pub async fn propagate_global_edit(
    generation: &GenerationClient,
    model: &str,
    condensed_prefix: &str,
    state: &mut PipelineState,
    new_steering: Option<String>,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let total = state.chapters.len();
    if total == 0 {
        return Err(PipelineError::validation(
            "no chapters exist; nothing to propagate",
        ));
    }

    let elements = state
        .elements
        .clone()
        .ok_or_else(|| PipelineError::validation("story elements missing; run extraction first"))?;

    let new_steering = new_steering.filter(|s| !s.trim().is_empty());

    let mut regenerated = stages::run_outline_tail(
        generation,
        model,
        condensed_prefix,
        &elements,
        &[],
        0,
        total,
        None,
        new_steering.as_deref(),
        cancel,
    )
    .await?;

    // Secondary pass: re-plan each instruction-bearing chapter around its own
    // directive, splicing only that chapter's result back in.
    for i in 0..total {
        let Some(instruction) = state.chapters[i].instruction.clone() else {
            continue;
        };
        let digest = prompts::neighbors_digest(&regenerated, i);
        let refined = stages::run_refine_chapter(
            generation,
            model,
            &regenerated[i],
            i,
            total,
            &digest,
            &instruction,
            cancel,
        )
        .await?;
        regenerated[i] = refined;
    }

    // Commit point.
    for (i, mut chapter) in regenerated.into_iter().enumerate() {
        chapter.instruction = state.chapters[i].instruction.clone();
        state.chapters[i] = chapter;
    }
    state.steering_instruction = new_steering;
    rewind_expansion(state, 0);
    Ok(())
}

/// Clears expansion artifacts from `index` on and moves the stage pointer
/// back so those chapters get re-expanded. Earlier chapters keep their prose.
fn rewind_expansion(state: &mut PipelineState, index: usize) {
    for chapter in state.chapters.iter_mut().skip(index) {
        chapter.clear_expansion();
    }
    if matches!(state.stage, Stage::Expanding | Stage::Complete) {
        state.stage = Stage::Expanding;
        state.current_chapter = state.current_chapter.min(index);
    }
}
