use anyhow::{Context, Result};
use draft2novel::config::Config;
use draft2novel::pipeline::PipelineManager;
use draft2novel::state::Stage;
use draft2novel::storage::NativeStorage;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let draft_path = std::env::args()
        .nth(1)
        .context("Usage: draft2novel <draft.txt>")?;
    let draft = std::fs::read_to_string(&draft_path)
        .with_context(|| format!("Failed to read draft from {}", draft_path))?;

    let unattended = config.unattended;
    let illustration_enabled = config.image.is_some();

    let storage = Arc::new(NativeStorage::new());
    let mut manager = PipelineManager::from_config(config, storage)?;
    if let Err(e) = manager.start(&draft, None).await {
        if matches!(e, draft2novel::PipelineError::StaleDraft { .. }) && !unattended {
            eprintln!("{}", e);
            let discard = inquire::Confirm::new("Discard saved progress and start over?")
                .with_default(false)
                .prompt()
                .unwrap_or(false);
            if !discard {
                return Err(e.into());
            }
            manager.reset().await?;
            manager.start(&draft, None).await?;
        } else {
            return Err(e.into());
        }
    }

    println!("Starting at stage {:?}", manager.state().stage);

    let mut expansion_bar: Option<ProgressBar> = None;
    loop {
        let stage = match manager.advance().await {
            Ok(stage) => stage,
            Err(e) => {
                eprintln!("Stage failed: {}", e);
                if let Some(last) = manager.last_error() {
                    if let Some(raw) = &last.raw {
                        eprintln!("Offending model output:\n{}", raw);
                    }
                }
                if unattended {
                    return Err(e.into());
                }
                let retry = inquire::Confirm::new("Retry this stage?")
                    .with_default(true)
                    .prompt()
                    .unwrap_or(false);
                if retry {
                    continue;
                }
                return Err(e.into());
            }
        };

        match stage {
            Stage::Expanding | Stage::Complete => {
                let total = manager.state().chapters.len() as u64;
                let bar = expansion_bar.get_or_insert_with(|| {
                    let bar = ProgressBar::new(total);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "Expanding chapters {bar:30} {pos}/{len}",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                    bar
                });
                bar.set_position(manager.state().current_chapter as u64);
            }
            other => {
                println!("Stage complete: {:?}", other);
                if !unattended {
                    let go_on = inquire::Confirm::new("Continue to next stage?")
                        .with_default(true)
                        .prompt()
                        .unwrap_or(false);
                    if !go_on {
                        println!("Stopping; progress is saved and resumes next run.");
                        return Ok(());
                    }
                }
            }
        }

        if stage == Stage::Complete {
            break;
        }
    }
    if let Some(bar) = expansion_bar {
        bar.finish();
    }
    println!("All chapters expanded.");

    if illustration_enabled {
        let illustrate = unattended
            || inquire::Confirm::new("Generate illustrations and a cover?")
                .with_default(true)
                .prompt()
                .unwrap_or(false);
        if illustrate {
            manager.illustrate_all().await?;
            let with_images = manager
                .state()
                .chapters
                .iter()
                .filter(|c| c.image_url.is_some())
                .count();
            println!(
                "Illustrated {}/{} chapters.",
                with_images,
                manager.state().chapters.len()
            );
        }
    }

    if let Some(warning) = manager.last_persist_error() {
        eprintln!("Warning: progress may not be fully saved: {}", warning);
    }
    println!("Done.");
    Ok(())
}
